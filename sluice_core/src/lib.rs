//! # Sluice core
//!
//! Change-data-capture replication engine. Change notifications are decoded into
//! [`BufferedEvent`]s, staged per channel, and periodically projected into an
//! analytical store through a [`SourceStore`] / [`AnalyticalSink`] pair. Writes
//! that keep failing are persisted to a [`DeadLetterStore`] and replayed with
//! exponential backoff by an independent loop.
//!
//! The engine performs no I/O of its own: every external system sits behind one
//! of the collaborator traits, so the same [`ReplicationService`] runs against
//! PostgreSQL (`sluice_pg`) or in-memory doubles (`sluice_mem`).

#![deny(missing_docs)]

pub mod adapter;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod dead_letter;
pub mod event;
pub mod flusher;
pub mod listener;
pub mod replay;
pub mod retry;
pub mod service;
pub mod stats;

pub use adapter::{AnalyticalSink, BoxError, Collaborators, ResultCache, SourceStore};
pub use buffer::{ChannelBuffer, ChannelBuffers};
pub use channel::{Channel, ChannelBinding};
pub use config::{ConfigError, ReplayConfig, ReplicationConfig};
pub use dead_letter::{
    DeadLetterError, DeadLetterEvent, DeadLetterStatus, DeadLetterStore, NewDeadLetter,
    ParseDeadLetterStatusError,
};
pub use event::{BufferedEvent, DecodeError, Payload, Row};
pub use flusher::{BatchFlusher, ChannelFlush, FlushOutcome, FlushReport};
pub use listener::{ListenerError, Notification, NotificationSource, NotificationStream};
pub use replay::{DeadLetterReplayer, ReplayReport};
pub use retry::{Backoff, RetryPolicy};
pub use service::{ReplicationError, ReplicationService};
pub use stats::{Counters, ReplicationStats};

pub mod prelude {
    //! The prelude module for the `sluice_core` crate.
    pub use super::{
        AnalyticalSink, BoxError, BufferedEvent, Channel, ChannelBinding, Collaborators,
        DeadLetterError, DeadLetterEvent, DeadLetterStatus, DeadLetterStore, FlushReport,
        ListenerError, NewDeadLetter, Notification, NotificationSource, NotificationStream,
        ReplayConfig, ReplayReport, ReplicationConfig, ReplicationError, ReplicationService,
        ReplicationStats, ResultCache, RetryPolicy, Row, SourceStore,
    };
}
