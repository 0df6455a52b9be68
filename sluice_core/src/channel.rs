//! Channels and the analytical tables they feed.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// A named notification topic.
///
/// Every channel the service listens on is bound to exactly one analytical
/// table through a [`ChannelBinding`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    /// Creates a channel from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The channel name as used on the notification transport.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Channel {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Channel {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Binds a channel to the analytical table its rows are written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    /// The channel notifications arrive on.
    pub channel: Channel,
    /// The destination table in the analytical store.
    pub table: String,
}

impl ChannelBinding {
    /// Creates a new binding.
    pub fn new(channel: impl Into<Channel>, table: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            table: table.into(),
        }
    }
}
