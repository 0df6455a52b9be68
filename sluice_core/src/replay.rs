//! Replays dead letters that are due, independently of the live path.

use crate::adapter::Collaborators;
use crate::channel::Channel;
use crate::config::ReplicationConfig;
use crate::dead_letter::{DeadLetterError, DeadLetterEvent};
use crate::flusher::invalidate_workspaces;
use crate::retry::RetryPolicy;
use crate::stats::Counters;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Result of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Another pass was already running, so this call did nothing.
    pub skipped: bool,
    /// Due entries fetched from the store.
    pub fetched: usize,
    /// Entries replayed successfully.
    pub replayed: usize,
    /// Entries that failed and were rescheduled.
    pub rescheduled: usize,
    /// Entries that failed for the last time.
    pub exhausted: usize,
}

enum Attempt {
    Replayed,
    Failed(String),
    Fatal(String),
}

/// Drives due dead letters back through the source and sink.
pub struct DeadLetterReplayer {
    tables: BTreeMap<Channel, String>,
    collaborators: Collaborators,
    batch_size: u32,
    policy: RetryPolicy,
    workspace_field: String,
    counters: Arc<Counters>,
    in_flight: Mutex<()>,
}

impl DeadLetterReplayer {
    /// Creates a replayer for the channels bound in `config`.
    pub fn new(
        config: &ReplicationConfig,
        collaborators: Collaborators,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            tables: config
                .channels
                .iter()
                .map(|binding| (binding.channel.clone(), binding.table.clone()))
                .collect(),
            collaborators,
            batch_size: config.replay.batch_size,
            policy: config.replay.retry_policy(),
            workspace_field: config.workspace_field.clone(),
            counters,
            in_flight: Mutex::new(()),
        }
    }

    /// Replays the entries due now.
    pub async fn replay_due(&self) -> Result<ReplayReport, DeadLetterError> {
        self.replay_at(Utc::now()).await
    }

    /// Replays up to one batch of entries due at `now`, oldest first.
    ///
    /// Only a failure to fetch the batch is returned as an error; failures of
    /// individual entries are recorded on the entries themselves.
    pub async fn replay_at(&self, now: DateTime<Utc>) -> Result<ReplayReport, DeadLetterError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Replay already in flight, skipping");
            return Ok(ReplayReport {
                skipped: true,
                ..ReplayReport::default()
            });
        };

        let due = self
            .collaborators
            .dead_letters
            .get_pending(now, self.batch_size)
            .await?;

        let mut report = ReplayReport {
            fetched: due.len(),
            ..ReplayReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        debug!("Replaying {} dead letters", due.len());

        for entry in &due {
            match self.attempt(entry).await {
                Attempt::Replayed => {
                    match self.collaborators.dead_letters.mark_replayed(entry.id).await {
                        Ok(()) => {
                            self.counters.record_replayed();
                            report.replayed += 1;
                            info!("Dead letter {} on '{}' replayed", entry.id, entry.channel);
                        }
                        Err(e) => error!(
                            "Dead letter {} replayed but could not be marked: {}",
                            entry.id, e
                        ),
                    }
                }
                Attempt::Failed(reason) => {
                    if entry.retry_count + 1 >= entry.max_retries {
                        self.exhaust(entry, &reason, &mut report).await;
                    } else {
                        self.reschedule(entry, &reason, now, &mut report).await;
                    }
                }
                Attempt::Fatal(reason) => self.exhaust(entry, &reason, &mut report).await,
            }
        }

        if report.replayed + report.rescheduled + report.exhausted > 0 {
            info!(
                "Replay pass: {} replayed, {} rescheduled, {} exhausted",
                report.replayed, report.rescheduled, report.exhausted
            );
        }
        Ok(report)
    }

    async fn attempt(&self, entry: &DeadLetterEvent) -> Attempt {
        let event = match entry.decode_event() {
            Ok(event) => event,
            Err(e) => return Attempt::Fatal(format!("undecodable event payload: {}", e)),
        };
        let Some(table) = self.tables.get(&event.channel) else {
            return Attempt::Fatal(format!("channel '{}' is not bound", event.channel));
        };

        let ids = [event.id.clone()];
        let rows = match self
            .collaborators
            .source
            .fetch_denormalized_rows(&event.channel, &ids)
            .await
        {
            Ok(rows) => rows,
            Err(e) => return Attempt::Failed(format!("source fetch failed: {}", e)),
        };

        // The source row is gone; there is nothing left to deliver.
        if rows.is_empty() {
            debug!(
                "Dead letter {}: source row '{}' no longer exists",
                entry.id, event.id
            );
            return Attempt::Replayed;
        }

        if let Err(e) = self.collaborators.sink.insert(table, &rows).await {
            return Attempt::Failed(e.to_string());
        }
        invalidate_workspaces(
            self.collaborators.cache.as_ref(),
            &rows,
            &self.workspace_field,
        )
        .await;
        Attempt::Replayed
    }

    async fn reschedule(
        &self,
        entry: &DeadLetterEvent,
        reason: &str,
        now: DateTime<Utc>,
        report: &mut ReplayReport,
    ) {
        let next = next_retry_at(now, self.policy.delay_for(entry.retry_count));
        match self
            .collaborators
            .dead_letters
            .increment_retry(entry.id, reason, next)
            .await
        {
            Ok(()) => {
                report.rescheduled += 1;
                warn!(
                    "Dead letter {} replay failed (attempt {}/{}), next attempt at {}: {}",
                    entry.id,
                    entry.retry_count + 1,
                    entry.max_retries,
                    next,
                    reason
                );
            }
            Err(e) => error!("Dead letter {} could not be rescheduled: {}", entry.id, e),
        }
    }

    async fn exhaust(&self, entry: &DeadLetterEvent, reason: &str, report: &mut ReplayReport) {
        match self
            .collaborators
            .dead_letters
            .mark_exhausted(entry.id, reason)
            .await
        {
            Ok(()) => {
                report.exhausted += 1;
                error!(
                    "Dead letter {} on '{}' exhausted after {} attempts: {}",
                    entry.id,
                    entry.channel,
                    entry.retry_count + 1,
                    reason
                );
            }
            Err(e) => error!("Dead letter {} could not be exhausted: {}", entry.id, e),
        }
    }
}

/// `now + delay`, saturating at the largest representable instant.
fn next_retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
