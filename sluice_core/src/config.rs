//! Configuration types for replication and dead letter replay.

use crate::channel::{Channel, ChannelBinding};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Errors produced when a configuration is rejected.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// No channel is bound to a table.
    #[error("at least one channel binding is required")]
    NoChannels,
    /// The same channel name appears twice.
    #[error("channel '{0}' is bound more than once")]
    DuplicateChannel(Channel),
    /// A setting that must be positive is zero.
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),
}

/// Configuration for the live replication path.
///
/// Immutable for the lifetime of a [`ReplicationService`](crate::ReplicationService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Channels to listen on and the tables they feed.
    pub channels: Vec<ChannelBinding>,

    /// Combined number of buffered events, across all channels, that triggers
    /// an immediate flush.
    pub batch_size: usize,

    /// Period of the flush timer, in milliseconds.
    pub flush_interval_ms: u64,

    /// Number of write attempts for one batch before it is dead-lettered.
    pub max_retries: u32,

    /// Delay before each retry, in milliseconds. `retry_backoff_ms[i]` is waited
    /// between attempt `i + 1` and attempt `i + 2`.
    pub retry_backoff_ms: Vec<u64>,

    /// Delay used once `retry_backoff_ms` runs out, in milliseconds.
    pub fallback_backoff_ms: u64,

    /// Row column holding the workspace identifier used for cache invalidation.
    pub workspace_field: String,

    /// Dead letter replay settings.
    pub replay: ReplayConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            batch_size: 100,
            flush_interval_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: vec![1_000, 5_000],
            fallback_backoff_ms: 5_000,
            workspace_field: "workspace_id".to_string(),
            replay: ReplayConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Creates a default configuration bound to the given channels.
    pub fn with_channels(channels: impl IntoIterator<Item = ChannelBinding>) -> Self {
        Self {
            channels: channels.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        let mut seen = HashSet::new();
        for binding in &self.channels {
            if !seen.insert(&binding.channel) {
                return Err(ConfigError::DuplicateChannel(binding.channel.clone()));
            }
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Zero("flush_interval_ms"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Zero("max_retries"));
        }
        self.replay.validate()
    }

    /// Period of the flush timer.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// The bounded retry budget used by the live flush path.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::scheduled(
            self.max_retries,
            self.retry_backoff_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            Duration::from_millis(self.fallback_backoff_ms),
        )
    }
}

/// Configuration for the dead letter replay loop.
///
/// Independent of the live retry schedule. Replay delays grow exponentially
/// and are persisted on each dead letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Period of the replay timer, in milliseconds.
    pub interval_ms: u64,

    /// Maximum number of dead letters fetched per pass.
    pub batch_size: u32,

    /// Replay attempts before a dead letter is marked exhausted. Stored on each
    /// dead letter row when it is created.
    pub max_retries: u32,

    /// Base of the exponential replay backoff, in milliseconds. After the
    /// `n`-th failure the next attempt is scheduled `base * 2^(n-1)` later.
    pub base_backoff_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            batch_size: 50,
            max_retries: 5,
            base_backoff_ms: 60_000,
        }
    }
}

impl ReplayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Zero("replay.interval_ms"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("replay.batch_size"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Zero("replay.max_retries"));
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Zero("replay.base_backoff_ms"));
        }
        Ok(())
    }

    /// Period of the replay timer.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// The exponential retry budget used by dead letter replay.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_retries,
            Duration::from_millis(self.base_backoff_ms),
        )
    }
}
