//! Change notification intake.

use crate::adapter::BoxError;
use crate::buffer::ChannelBuffers;
use crate::event::{BufferedEvent, DecodeError};
use crate::flusher::BatchFlusher;
use crate::Channel;
use async_trait::async_trait;
use futures_core::Stream;
use log::{debug, error, info, warn};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::StreamExt;

/// A raw change notification as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The channel the notification arrived on.
    pub channel: String,
    /// The undecoded payload text.
    pub payload: String,
}

impl Notification {
    /// Creates a notification.
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Errors raised by a [`NotificationSource`].
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Subscribing to the channels failed.
    #[error("failed to subscribe to notifications: {0}")]
    Connect(#[source] BoxError),
    /// The transport reported an error while receiving.
    #[error("notification transport error: {0}")]
    Transport(#[source] BoxError),
    /// The connection was closed by the remote end.
    #[error("notification connection closed")]
    ConnectionClosed,
}

/// The stream of notifications produced by a [`NotificationSource`].
pub type NotificationStream =
    Pin<Box<dyn Stream<Item = Result<Notification, ListenerError>> + Send + 'static>>;

/// A transport delivering change notifications.
#[async_trait]
pub trait NotificationSource: Send + 'static {
    /// Subscribes to `channels` and returns the notification stream.
    ///
    /// Dropping the stream unsubscribes.
    async fn listen(self, channels: Vec<Channel>) -> Result<NotificationStream, ListenerError>;
}

/// Moves notifications from a stream into the channel buffers.
pub(crate) struct NotificationListener {
    buffers: Arc<ChannelBuffers>,
    flusher: Arc<BatchFlusher>,
    batch_size: usize,
}

impl NotificationListener {
    pub(crate) fn new(
        buffers: Arc<ChannelBuffers>,
        flusher: Arc<BatchFlusher>,
        batch_size: usize,
    ) -> Self {
        Self {
            buffers,
            flusher,
            batch_size,
        }
    }

    /// Buffers one notification. Returns whether the combined buffers reached
    /// the batch threshold.
    pub(crate) async fn handle(&self, notification: Notification) -> bool {
        let Some(buffer) = self.buffers.get(&notification.channel) else {
            warn!(
                "Discarding {}",
                DecodeError::UnknownChannel(notification.channel)
            );
            return false;
        };

        match BufferedEvent::decode(buffer.channel().clone(), &notification.payload) {
            Ok(event) => {
                debug!("Buffered event {} on '{}'", event.id, event.channel);
                buffer.append(event).await;
            }
            Err(e) => {
                error!(
                    "Dropping undecodable notification on '{}': {}",
                    notification.channel, e
                );
                return false;
            }
        }

        self.buffers.total_len().await >= self.batch_size
    }

    /// Consumes `stream` until it ends or `shutdown` fires.
    pub(crate) async fn run(
        self,
        mut stream: NotificationStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Notification listener started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Notification listener shutting down");
                    break;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(notification)) => {
                            if self.handle(notification).await {
                                let flusher = self.flusher.clone();
                                tokio::spawn(async move {
                                    flusher.flush_all().await;
                                });
                            }
                        }
                        Some(Err(ListenerError::ConnectionClosed)) => {
                            error!("Notification connection closed, listener stopping");
                            break;
                        }
                        Some(Err(e)) => error!("Notification listener error: {}", e),
                        None => {
                            warn!("Notification stream ended");
                            break;
                        }
                    }
                }
            }
        }
    }
}
