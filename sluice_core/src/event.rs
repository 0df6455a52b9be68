//! Buffered change events and the denormalized rows projected from them.

use crate::channel::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The opaque body of a change notification.
pub type Payload = Map<String, Value>;

/// A decoded change notification waiting in a channel buffer.
///
/// Events are never mutated once buffered; they leave the buffer only through
/// an atomic drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    /// The channel the notification arrived on.
    pub channel: Channel,
    /// Primary key of the changed source row.
    pub id: String,
    /// The full notification body.
    pub payload: Payload,
    /// When the notification was received.
    pub received_at: DateTime<Utc>,
}

impl BufferedEvent {
    /// Creates an event received now.
    pub fn new(channel: Channel, id: impl Into<String>, payload: Payload) -> Self {
        Self {
            channel,
            id: id.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Decodes a raw notification payload received on `channel`.
    ///
    /// The payload must be a JSON object carrying an `id` that is either a
    /// non-empty string or an integer. The whole object is kept as the event
    /// payload.
    pub fn decode(channel: Channel, raw: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(payload) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let id = match payload.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) if id.is_i64() || id.is_u64() => id.to_string(),
            _ => return Err(DecodeError::MissingId),
        };

        Ok(Self::new(channel, id, payload))
    }
}

/// Reasons a notification could not be turned into a [`BufferedEvent`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The notification arrived on a channel that is not bound to a table.
    #[error("notification on unknown channel '{0}'")]
    UnknownChannel(String),
    /// The payload is not valid JSON.
    #[error("malformed notification payload: {0}")]
    Json(#[from] serde_json::Error),
    /// The payload is JSON but not an object.
    #[error("notification payload is not a JSON object")]
    NotAnObject,
    /// The payload has no usable `id` field.
    #[error("notification payload has no string or integer `id`")]
    MissingId,
}

/// A denormalized row ready to be written to the analytical store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Creates a row from its columns.
    pub fn new(columns: Map<String, Value>) -> Self {
        Self(columns)
    }

    /// Builds a row from a JSON value, returning `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(columns) => Some(Self(columns)),
            _ => None,
        }
    }

    /// Returns the value of a column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// All columns of the row.
    pub fn columns(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consumes the row, returning its columns.
    pub fn into_columns(self) -> Map<String, Value> {
        self.0
    }

    /// The workspace identifier stored in `field`, rendered as a string.
    pub fn workspace_id(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

impl From<Map<String, Value>> for Row {
    fn from(columns: Map<String, Value>) -> Self {
        Self(columns)
    }
}
