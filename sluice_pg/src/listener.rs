use async_trait::async_trait;
use log::{error, info};
use sluice_core::prelude::*;
use sqlx::postgres::{PgListener, PgPool};

/// Receives change notifications through PostgreSQL `LISTEN`.
///
/// Each subscription holds one dedicated connection for its whole lifetime.
/// When that connection drops, the stream reports
/// [`ListenerError::ConnectionClosed`] and ends; it does not reconnect, since
/// notifications sent in the gap would be lost without anyone noticing.
#[derive(Debug, Clone)]
pub struct PgNotificationSource {
    pool: PgPool,
}

impl PgNotificationSource {
    /// Creates a source that opens its connection with the settings of `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn listen(self, channels: Vec<Channel>) -> Result<NotificationStream, ListenerError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ListenerError::Connect(Box::new(e)))?;
        listener
            .listen_all(channels.iter().map(Channel::as_str))
            .await
            .map_err(|e| ListenerError::Connect(Box::new(e)))?;
        info!("LISTEN issued on {} channels", channels.len());

        let stream: NotificationStream = Box::pin(async_stream::stream! {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        yield Ok(Notification::new(
                            notification.channel(),
                            notification.payload(),
                        ));
                    }
                    Ok(None) => {
                        error!("PostgreSQL listener connection lost");
                        yield Err(ListenerError::ConnectionClosed);
                        break;
                    }
                    Err(e) => {
                        yield Err(ListenerError::Transport(Box::new(e)));
                        break;
                    }
                }
            }
        });
        Ok(stream)
    }
}
