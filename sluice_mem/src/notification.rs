use crate::InjectedFailure;
use async_trait::async_trait;
use sluice_core::prelude::*;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

type Item = Result<Notification, ListenerError>;

/// An in-memory notification transport.
///
/// Created in pairs with [`NotificationSender`] by [`InMemoryNotificationSource::channel`].
/// The stream ends once every sender is dropped.
#[derive(Debug)]
pub struct InMemoryNotificationSource {
    receiver: mpsc::UnboundedReceiver<Item>,
    subscribed: Arc<Mutex<Vec<Channel>>>,
    refuse: Option<String>,
}

/// The publishing half of an [`InMemoryNotificationSource`].
#[derive(Clone, Debug)]
pub struct NotificationSender {
    sender: mpsc::UnboundedSender<Item>,
    subscribed: Arc<Mutex<Vec<Channel>>>,
}

impl InMemoryNotificationSource {
    /// Creates a connected source and sender.
    pub fn channel() -> (Self, NotificationSender) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscribed = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                receiver,
                subscribed: subscribed.clone(),
                refuse: None,
            },
            NotificationSender { sender, subscribed },
        )
    }

    /// A source whose subscription always fails with `message`.
    pub fn refusing(message: impl Into<String>) -> Self {
        let (source, _) = Self::channel();
        Self {
            refuse: Some(message.into()),
            ..source
        }
    }
}

#[async_trait]
impl NotificationSource for InMemoryNotificationSource {
    async fn listen(self, channels: Vec<Channel>) -> Result<NotificationStream, ListenerError> {
        if let Some(message) = self.refuse {
            return Err(ListenerError::Connect(Box::new(InjectedFailure(message))));
        }
        log::debug!("In-memory source subscribed to {:?}", channels);
        *self.subscribed.lock().await = channels;
        let stream: NotificationStream = Box::pin(UnboundedReceiverStream::new(self.receiver));
        Ok(stream)
    }
}

impl NotificationSender {
    /// Publishes `payload` on `channel`. Returns `false` once the listener is gone.
    pub fn notify(&self, channel: &str, payload: impl Into<String>) -> bool {
        self.sender
            .send(Ok(Notification::new(channel, payload)))
            .is_ok()
    }

    /// Delivers a transport error to the listener.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let error = ListenerError::Transport(Box::new(InjectedFailure(message.into())));
        self.sender.send(Err(error)).is_ok()
    }

    /// Tells the listener the connection was closed.
    pub fn close(&self) -> bool {
        self.sender.send(Err(ListenerError::ConnectionClosed)).is_ok()
    }

    /// The channels the listener subscribed to.
    pub async fn subscribed(&self) -> Vec<Channel> {
        self.subscribed.lock().await.clone()
    }
}
