//! Live replication counters.

use crate::channel::Channel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const NEVER: i64 = i64::MIN;

/// Cumulative counters shared by the flusher and the replay loop.
///
/// Counters live only in memory and restart from zero each time the service
/// starts.
#[derive(Debug)]
pub struct Counters {
    total_flushed: AtomicU64,
    total_failed: AtomicU64,
    total_replayed: AtomicU64,
    last_flush_at_ms: AtomicI64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            total_flushed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
            last_flush_at_ms: AtomicI64::new(NEVER),
        }
    }
}

impl Counters {
    /// Records a successful batch write of `rows` rows at `at`.
    pub fn record_flush(&self, rows: u64, at: DateTime<Utc>) {
        self.total_flushed.fetch_add(rows, Ordering::Relaxed);
        self.last_flush_at_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Records `events` buffered events routed to the dead letter store.
    pub fn record_failed(&self, events: u64) {
        self.total_failed.fetch_add(events, Ordering::Relaxed);
    }

    /// Records one dead letter replayed successfully.
    pub fn record_replayed(&self) {
        self.total_replayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Zeroes every counter and forgets the last flush time.
    pub fn reset(&self) {
        self.total_flushed.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        self.total_replayed.store(0, Ordering::Relaxed);
        self.last_flush_at_ms.store(NEVER, Ordering::Relaxed);
    }

    /// Rows written by the live path.
    pub fn total_flushed(&self) -> u64 {
        self.total_flushed.load(Ordering::Relaxed)
    }

    /// Buffered events routed to the dead letter store.
    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    /// Dead letters replayed successfully.
    pub fn total_replayed(&self) -> u64 {
        self.total_replayed.load(Ordering::Relaxed)
    }

    /// When the last successful live write happened.
    pub fn last_flush_at(&self) -> Option<DateTime<Utc>> {
        match self.last_flush_at_ms.load(Ordering::Relaxed) {
            NEVER => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

/// A point-in-time view of the replication service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationStats {
    /// Events currently buffered across all channels.
    pub buffered_events: usize,
    /// Events currently buffered, per channel.
    pub buffered_by_channel: BTreeMap<Channel, usize>,
    /// Rows written by the live path since start.
    pub total_flushed: u64,
    /// Buffered events dead-lettered since start.
    pub total_failed: u64,
    /// Dead letters replayed since start.
    pub total_replayed: u64,
    /// When the last successful live write happened.
    pub last_flush_at: Option<DateTime<Utc>>,
    /// Dead letters currently pending.
    pub dlq_pending: u64,
}
