//! Drains channel buffers into the analytical store.

use crate::adapter::{Collaborators, ResultCache};
use crate::buffer::{ChannelBuffer, ChannelBuffers};
use crate::channel::Channel;
use crate::config::ReplicationConfig;
use crate::dead_letter::NewDeadLetter;
use crate::event::{BufferedEvent, Row};
use crate::retry::RetryPolicy;
use crate::stats::Counters;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What happened to one channel during a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The fetched rows were written.
    Written,
    /// The source returned no rows, so nothing was written.
    NothingToWrite,
    /// The batch failed and its events were routed to the dead letter store.
    DeadLettered {
        /// The failure shared by every dead letter of the batch.
        reason: String,
        /// How many dead letters were persisted.
        persisted: usize,
    },
}

/// Result of flushing one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFlush {
    /// The flushed channel.
    pub channel: Channel,
    /// Buffered events drained.
    pub events: usize,
    /// Rows fetched from the source.
    pub rows: usize,
    /// What happened to the batch.
    pub outcome: FlushOutcome,
}

/// Result of one [`BatchFlusher::flush_all`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Another flush was already running, so this call did nothing.
    pub skipped: bool,
    /// One entry per non-empty channel.
    pub channels: Vec<ChannelFlush>,
}

impl FlushReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            channels: Vec::new(),
        }
    }

    /// Rows written across all channels.
    pub fn rows_written(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.outcome == FlushOutcome::Written)
            .map(|c| c.rows)
            .sum()
    }

    /// Buffered events routed to the dead letter store across all channels.
    pub fn events_dead_lettered(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| matches!(c.outcome, FlushOutcome::DeadLettered { .. }))
            .map(|c| c.events)
            .sum()
    }

    /// Combines this report with a later one.
    pub fn and_then(mut self, later: FlushReport) -> FlushReport {
        self.skipped &= later.skipped;
        self.channels.extend(later.channels);
        self
    }
}

/// Moves buffered events to the analytical store.
///
/// At most one flush runs at a time. A flush requested while one is in flight
/// returns immediately; whatever accumulated meanwhile is picked up by the next
/// timer tick or threshold trigger.
pub struct BatchFlusher {
    buffers: Arc<ChannelBuffers>,
    collaborators: Collaborators,
    retry: RetryPolicy,
    dead_letter_max_retries: u32,
    workspace_field: String,
    counters: Arc<Counters>,
    in_flight: Mutex<()>,
}

impl BatchFlusher {
    /// Creates a flusher over `buffers`.
    pub fn new(
        config: &ReplicationConfig,
        buffers: Arc<ChannelBuffers>,
        collaborators: Collaborators,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            buffers,
            collaborators,
            retry: config.retry_policy(),
            dead_letter_max_retries: config.replay.max_retries,
            workspace_field: config.workspace_field.clone(),
            counters,
            in_flight: Mutex::new(()),
        }
    }

    /// Flushes every non-empty channel, unless a flush is already running.
    pub async fn flush_all(&self) -> FlushReport {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Flush already in flight, skipping");
            return FlushReport::skipped();
        };
        self.flush_buffers().await
    }

    /// Waits for any in-flight flush to finish, then flushes every non-empty
    /// channel. Used on shutdown so no buffered event is left behind.
    pub async fn flush_remaining(&self) -> FlushReport {
        let _guard = self.in_flight.lock().await;
        self.flush_buffers().await
    }

    async fn flush_buffers(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for buffer in self.buffers.iter() {
            let events = buffer.drain().await;
            if events.is_empty() {
                continue;
            }
            report.channels.push(self.flush_channel(buffer, events).await);
        }
        report
    }

    async fn flush_channel(
        &self,
        buffer: &ChannelBuffer,
        events: Vec<BufferedEvent>,
    ) -> ChannelFlush {
        let channel = buffer.channel();
        let table = buffer.table();
        let ids = unique_ids(&events);

        let rows = match self
            .collaborators
            .source
            .fetch_denormalized_rows(channel, &ids)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(
                    "Channel '{}': fetching {} ids from source failed: {}",
                    channel,
                    ids.len(),
                    e
                );
                let reason = format!("source fetch failed: {}", e);
                return self.dead_letter(channel, events, 0, reason).await;
            }
        };

        if rows.len() < ids.len() {
            warn!(
                "Channel '{}': source returned {} rows for {} ids, missing rows are skipped",
                channel,
                rows.len(),
                ids.len()
            );
        }

        if rows.is_empty() {
            return ChannelFlush {
                channel: channel.clone(),
                events: events.len(),
                rows: 0,
                outcome: FlushOutcome::NothingToWrite,
            };
        }

        let sink = &self.collaborators.sink;
        let batch = rows.as_slice();
        let label = format!("Insert of {} rows into '{}'", rows.len(), table);
        match self
            .retry
            .run(&label, move |_| sink.insert(table, batch))
            .await
        {
            Ok(()) => {
                self.counters.record_flush(rows.len() as u64, Utc::now());
                info!(
                    "Channel '{}': flushed {} events as {} rows into '{}'",
                    channel,
                    events.len(),
                    rows.len(),
                    table
                );
                invalidate_workspaces(
                    self.collaborators.cache.as_ref(),
                    &rows,
                    &self.workspace_field,
                )
                .await;
                ChannelFlush {
                    channel: channel.clone(),
                    events: events.len(),
                    rows: rows.len(),
                    outcome: FlushOutcome::Written,
                }
            }
            Err(e) => {
                let rows = rows.len();
                self.dead_letter(channel, events, rows, e.to_string()).await
            }
        }
    }

    async fn dead_letter(
        &self,
        channel: &Channel,
        events: Vec<BufferedEvent>,
        rows: usize,
        reason: String,
    ) -> ChannelFlush {
        self.counters.record_failed(events.len() as u64);

        let mut persisted = 0;
        for event in &events {
            let entry =
                match NewDeadLetter::from_event(event, reason.clone(), self.dead_letter_max_retries)
                {
                    Ok(entry) => entry,
                    Err(e) => {
                        error!(
                            "Channel '{}': cannot serialize event {} as a dead letter: {}",
                            channel, event.id, e
                        );
                        continue;
                    }
                };
            match self
                .collaborators
                .dead_letters
                .insert(entry, Utc::now())
                .await
            {
                Ok(_) => persisted += 1,
                Err(e) => error!(
                    "Channel '{}': failed to persist event {} to the dead letter store: {}",
                    channel, event.id, e
                ),
            }
        }

        error!(
            "Channel '{}': {} events sent to the dead letter store ({} persisted): {}",
            channel,
            events.len(),
            persisted,
            reason
        );

        ChannelFlush {
            channel: channel.clone(),
            events: events.len(),
            rows,
            outcome: FlushOutcome::DeadLettered { reason, persisted },
        }
    }
}

/// The distinct event ids of a batch, in first-seen order.
fn unique_ids(events: &[BufferedEvent]) -> Vec<String> {
    let mut seen = HashSet::new();
    events
        .iter()
        .filter(|event| seen.insert(event.id.as_str()))
        .map(|event| event.id.clone())
        .collect()
}

/// Invalidates the cache once per distinct workspace found in `rows`.
///
/// Cache failures are logged and swallowed.
pub(crate) async fn invalidate_workspaces(cache: &dyn ResultCache, rows: &[Row], field: &str) {
    let workspaces: BTreeSet<String> = rows
        .iter()
        .filter_map(|row| row.workspace_id(field))
        .collect();
    for workspace in workspaces {
        if let Err(e) = cache.invalidate_workspace(&workspace).await {
            warn!(
                "Cache invalidation for workspace '{}' failed: {}",
                workspace, e
            );
        }
    }
}
