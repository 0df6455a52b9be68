//! The replication service lifecycle.

use crate::adapter::Collaborators;
use crate::buffer::ChannelBuffers;
use crate::config::{ConfigError, ReplicationConfig};
use crate::dead_letter::{DeadLetterError, DeadLetterEvent, DeadLetterStatus, DeadLetterStore};
use crate::flusher::{BatchFlusher, FlushReport};
use crate::listener::{ListenerError, NotificationListener, NotificationSource};
use crate::replay::{DeadLetterReplayer, ReplayReport};
use crate::stats::{Counters, ReplicationStats};
use chrono::Utc;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Errors returned by [`ReplicationService`].
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Subscribing to change notifications failed.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// The dead letter store failed.
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    /// [`ReplicationService::start`] was called on a running service.
    #[error("replication service already started")]
    AlreadyStarted,
    /// [`ReplicationService::stop`] was called on a service that is not running.
    #[error("replication service not started")]
    NotStarted,
}

struct Running {
    timers_tx: watch::Sender<bool>,
    listener_tx: watch::Sender<bool>,
    flush_timer: JoinHandle<()>,
    replay_timer: JoinHandle<()>,
    listener: JoinHandle<()>,
}

/// Streams change notifications into an analytical store.
///
/// ```text
/// notifications -> listener -> channel buffers -> flusher -> sink
///                                                    |
///                                                    v
///                              replayer <- dead letter store
/// ```
pub struct ReplicationService {
    config: ReplicationConfig,
    buffers: Arc<ChannelBuffers>,
    flusher: Arc<BatchFlusher>,
    replayer: Arc<DeadLetterReplayer>,
    counters: Arc<Counters>,
    dead_letters: Arc<dyn DeadLetterStore>,
    running: Mutex<Option<Running>>,
}

impl ReplicationService {
    /// Validates `config` and wires the service to its collaborators.
    pub fn new(
        config: ReplicationConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let buffers = Arc::new(ChannelBuffers::new(&config.channels));
        let counters = Arc::new(Counters::default());
        let flusher = Arc::new(BatchFlusher::new(
            &config,
            buffers.clone(),
            collaborators.clone(),
            counters.clone(),
        ));
        let replayer = Arc::new(DeadLetterReplayer::new(
            &config,
            collaborators.clone(),
            counters.clone(),
        ));

        Ok(Self {
            config,
            buffers,
            flusher,
            replayer,
            counters,
            dead_letters: collaborators.dead_letters,
            running: Mutex::new(None),
        })
    }

    /// Subscribes to every bound channel and starts the flush and replay
    /// timers. One replay pass runs before this returns.
    ///
    /// Counters in [`ReplicationService::stats`] restart from zero.
    pub async fn start<N: NotificationSource>(&self, source: N) -> Result<(), ReplicationError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ReplicationError::AlreadyStarted);
        }

        let channels = self.buffers.channels();
        let stream = source.listen(channels.clone()).await?;
        self.counters.reset();
        info!(
            "Listening on {} channels: {}",
            channels.len(),
            channels
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let (listener_tx, listener_rx) = watch::channel(false);
        let listener = NotificationListener::new(
            self.buffers.clone(),
            self.flusher.clone(),
            self.config.batch_size,
        );
        let listener = tokio::spawn(listener.run(stream, listener_rx));

        let (timers_tx, timers_rx) = watch::channel(false);
        let flusher = self.flusher.clone();
        let flush_timer = spawn_timer(self.config.flush_interval(), timers_rx.clone(), move || {
            let flusher = flusher.clone();
            async move {
                flusher.flush_all().await;
            }
        });
        let replayer = self.replayer.clone();
        let replay_timer = spawn_timer(self.config.replay.interval(), timers_rx, move || {
            let replayer = replayer.clone();
            async move {
                if let Err(e) = replayer.replay_due().await {
                    error!("Dead letter replay failed: {}", e);
                }
            }
        });

        *running = Some(Running {
            timers_tx,
            listener_tx,
            flush_timer,
            replay_timer,
            listener,
        });
        drop(running);

        if let Err(e) = self.replayer.replay_due().await {
            error!("Initial dead letter replay failed: {}", e);
        }
        info!("Replication service started");
        Ok(())
    }

    /// Stops the service, flushing every buffered event before returning.
    ///
    /// Timers stop first, then buffers are flushed, then the notification
    /// subscription is released. Anything the listener buffered in between is
    /// flushed again.
    pub async fn stop(&self) -> Result<FlushReport, ReplicationError> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(ReplicationError::NotStarted);
        };

        let _ = running.timers_tx.send(true);
        for (name, handle) in [
            ("flush timer", running.flush_timer),
            ("replay timer", running.replay_timer),
        ] {
            if let Err(e) = handle.await {
                error!("Replication {} task failed: {}", name, e);
            }
        }

        let mut report = self.flusher.flush_remaining().await;

        let _ = running.listener_tx.send(true);
        if let Err(e) = running.listener.await {
            error!("Notification listener task failed: {}", e);
        }

        if self.buffers.total_len().await > 0 {
            report = report.and_then(self.flusher.flush_remaining().await);
        }

        info!(
            "Replication service stopped: {} rows written, {} events dead-lettered on shutdown",
            report.rows_written(),
            report.events_dead_lettered()
        );
        Ok(report)
    }

    /// Whether the service is running.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// A snapshot of buffers, counters and the dead letter backlog.
    pub async fn stats(&self) -> Result<ReplicationStats, ReplicationError> {
        let buffered_by_channel = self.buffers.lens().await;
        let dlq_pending = self
            .dead_letters
            .count(Some(DeadLetterStatus::Pending))
            .await?;
        Ok(ReplicationStats {
            buffered_events: buffered_by_channel.values().sum(),
            buffered_by_channel,
            total_flushed: self.counters.total_flushed(),
            total_failed: self.counters.total_failed(),
            total_replayed: self.counters.total_replayed(),
            last_flush_at: self.counters.last_flush_at(),
            dlq_pending,
        })
    }

    /// Flushes now, unless a flush is already in flight.
    pub async fn flush_now(&self) -> FlushReport {
        self.flusher.flush_all().await
    }

    /// Runs a replay pass now, unless one is already in flight.
    pub async fn replay_now(&self) -> Result<ReplayReport, ReplicationError> {
        Ok(self.replayer.replay_due().await?)
    }

    /// Lists dead letters newest first, optionally filtered by status.
    pub async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DeadLetterEvent>, ReplicationError> {
        Ok(self.dead_letters.list(status, offset, limit).await?)
    }

    /// Counts dead letters, optionally filtered by status.
    pub async fn count_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<u64, ReplicationError> {
        Ok(self.dead_letters.count(status).await?)
    }

    /// Moves every exhausted dead letter back to pending, due immediately.
    pub async fn reset_exhausted(&self) -> Result<u64, ReplicationError> {
        let reset = self.dead_letters.reset_exhausted(Utc::now()).await?;
        if reset > 0 {
            info!("Reset {} exhausted dead letters to pending", reset);
        }
        Ok(reset)
    }

    /// The validated configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }
}

fn spawn_timer<F, Fut>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => tick().await,
            }
        }
    })
}
