//! Contracts for the external systems the replication engine talks to.

use crate::channel::Channel;
use crate::dead_letter::DeadLetterStore;
use crate::event::Row;
use async_trait::async_trait;
use std::sync::Arc;

/// Boxed error returned across collaborator boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reads full, denormalized rows from the transactional store.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetches the rows for `ids` on `channel`.
    ///
    /// Must be a pure read. Duplicate ids and ids whose source row no longer
    /// exists are tolerated; one id may map to zero or several rows.
    async fn fetch_denormalized_rows(
        &self,
        channel: &Channel,
        ids: &[String],
    ) -> Result<Vec<Row>, BoxError>;
}

/// Accepts batched row inserts into the analytical store.
#[async_trait]
pub trait AnalyticalSink: Send + Sync {
    /// Inserts `rows` into `table`. Either the whole batch is written or an
    /// error is returned; partial success is not modeled.
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), BoxError>;
}

/// A cache of query results keyed by workspace.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Drops cached results for `workspace_id`. Best-effort: failures are
    /// logged by the caller and never abort replication.
    async fn invalidate_workspace(&self, workspace_id: &str) -> Result<(), BoxError>;
}

/// The collaborators a [`ReplicationService`](crate::ReplicationService) is wired to.
#[derive(Clone)]
pub struct Collaborators {
    /// Source of denormalized rows.
    pub source: Arc<dyn SourceStore>,
    /// Destination for batched inserts.
    pub sink: Arc<dyn AnalyticalSink>,
    /// Cache invalidated after successful writes.
    pub cache: Arc<dyn ResultCache>,
    /// Durable store for failed events.
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl Collaborators {
    /// Bundles the collaborators.
    pub fn new(
        source: Arc<dyn SourceStore>,
        sink: Arc<dyn AnalyticalSink>,
        cache: Arc<dyn ResultCache>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            source,
            sink,
            cache,
            dead_letters,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
