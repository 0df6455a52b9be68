//! Durable record of events the live path could not deliver.
//!
//! A dead letter moves through a one-way state machine:
//!
//! ```text
//! pending --replay ok--> replayed            (terminal)
//! pending --replay failed, budget left--> pending (next_retry_at advanced)
//! pending --replay failed, budget spent--> exhausted (terminal)
//! exhausted --reset_exhausted--> pending     (administrative)
//! ```
//!
//! `retry_count < max_retries` holds exactly while a dead letter is pending.

use crate::adapter::BoxError;
use crate::channel::Channel;
use crate::event::BufferedEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Waiting for its next replay attempt.
    Pending,
    /// Replayed successfully.
    Replayed,
    /// Replay budget spent; needs operator attention.
    Exhausted,
}

impl DeadLetterStatus {
    /// The stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Replayed => "replayed",
            DeadLetterStatus::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid dead letter status: '{0}'")]
pub struct ParseDeadLetterStatusError(pub String);

impl FromStr for DeadLetterStatus {
    type Err = ParseDeadLetterStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeadLetterStatus::Pending),
            "replayed" => Ok(DeadLetterStatus::Replayed),
            "exhausted" => Ok(DeadLetterStatus::Exhausted),
            _ => Err(ParseDeadLetterStatusError(s.to_string())),
        }
    }
}

/// A persisted dead letter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    /// Unique identifier of the dead letter.
    pub id: Uuid,
    /// Channel of the original event.
    pub channel: Channel,
    /// The original [`BufferedEvent`], serialized.
    pub event_payload: serde_json::Value,
    /// Message of the most recent failure.
    pub error_reason: String,
    /// Failed replay attempts so far.
    pub retry_count: u32,
    /// Replay attempts allowed before the entry is exhausted.
    pub max_retries: u32,
    /// Current lifecycle state.
    pub status: DeadLetterStatus,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// Earliest time the next replay attempt may run.
    pub next_retry_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    /// Decodes the original buffered event.
    pub fn decode_event(&self) -> Result<BufferedEvent, serde_json::Error> {
        serde_json::from_value(self.event_payload.clone())
    }

    /// Whether the entry is pending and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeadLetterStatus::Pending && self.next_retry_at <= now
    }
}

/// The data needed to create a dead letter.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    /// Channel of the original event.
    pub channel: Channel,
    /// The original event, serialized.
    pub event_payload: serde_json::Value,
    /// Message of the failure that dead-lettered the event.
    pub error_reason: String,
    /// Replay attempts allowed.
    pub max_retries: u32,
}

impl NewDeadLetter {
    /// Captures `event` with the failure that exhausted its live retries.
    pub fn from_event(
        event: &BufferedEvent,
        error_reason: impl Into<String>,
        max_retries: u32,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            channel: event.channel.clone(),
            event_payload: serde_json::to_value(event)?,
            error_reason: error_reason.into(),
            max_retries,
        })
    }

    /// Materializes the pending entry stored at `now`.
    pub fn into_pending(self, id: Uuid, now: DateTime<Utc>) -> DeadLetterEvent {
        DeadLetterEvent {
            id,
            channel: self.channel,
            event_payload: self.event_payload,
            error_reason: self.error_reason,
            retry_count: 0,
            max_retries: self.max_retries,
            status: DeadLetterStatus::Pending,
            created_at: now,
            next_retry_at: now,
        }
    }
}

/// Errors returned by a [`DeadLetterStore`].
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    /// No dead letter exists with this id.
    #[error("dead letter {0} not found")]
    NotFound(Uuid),
    /// The dead letter is not pending, so it cannot transition.
    #[error("dead letter {id} is {status}, expected pending")]
    NotPending {
        /// The dead letter id.
        id: Uuid,
        /// Its current status.
        status: DeadLetterStatus,
    },
    /// The event payload could not be serialized.
    #[error("dead letter payload error: {0}")]
    Payload(#[from] serde_json::Error),
    /// The storage backend failed.
    #[error("dead letter store error: {0}")]
    Backend(#[from] BoxError),
}

/// Durable storage for dead letters.
///
/// The live path only creates entries; the replay loop only transitions the
/// entries it fetched itself, so the two never race on one row.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Persists a new entry as pending with `retry_count = 0` and
    /// `next_retry_at = created_at = now`.
    async fn insert(
        &self,
        entry: NewDeadLetter,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterEvent, DeadLetterError>;

    /// Fetches one entry by id.
    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEvent>, DeadLetterError>;

    /// Up to `limit` pending entries with `next_retry_at <= now`, oldest
    /// created first.
    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEvent>, DeadLetterError>;

    /// Transitions a pending entry to replayed.
    async fn mark_replayed(&self, id: Uuid) -> Result<(), DeadLetterError>;

    /// Records a failed replay on a pending entry: increments `retry_count`,
    /// stores `error_reason` and reschedules it at `next_retry_at`.
    async fn increment_retry(
        &self,
        id: Uuid,
        error_reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), DeadLetterError>;

    /// Records the final failed replay on a pending entry: increments
    /// `retry_count` (raising it to at least `max_retries`), stores
    /// `error_reason` and marks it exhausted.
    async fn mark_exhausted(&self, id: Uuid, error_reason: &str) -> Result<(), DeadLetterError>;

    /// Moves every exhausted entry back to pending with `retry_count = 0` and
    /// `next_retry_at = now`. Returns the number of entries reset.
    async fn reset_exhausted(&self, now: DateTime<Utc>) -> Result<u64, DeadLetterError>;

    /// Lists entries newest first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DeadLetterEvent>, DeadLetterError>;

    /// Counts entries, optionally filtered by status.
    async fn count(&self, status: Option<DeadLetterStatus>) -> Result<u64, DeadLetterError>;
}
