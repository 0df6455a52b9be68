use async_trait::async_trait;
use sluice_core::prelude::*;
use sqlx::PgPool;
use std::collections::HashMap;

/// Errors raised by [`PgSourceStore`].
#[derive(Debug, thiserror::Error)]
pub enum PgSourceError {
    /// No query is registered for the channel.
    #[error("no source query registered for channel '{0}'")]
    UnmappedChannel(Channel),
    /// The query returned a value that is not a JSON object.
    #[error("source query for channel '{0}' returned a non-object row")]
    NotAnObject(Channel),
}

/// Reads denormalized rows with one SQL query per channel.
///
/// Each query takes the id array as `$1::text[]` and returns a single JSON
/// object column, one row per analytical row:
///
/// ```sql
/// SELECT json_build_object(
///     'id', i.id::text,
///     'workspace_id', i.workspace_id::text,
///     'title', i.title,
///     'assignee', u.name
/// )
/// FROM issues i LEFT JOIN users u ON u.id = i.assignee_id
/// WHERE i.id::text = ANY($1::text[])
/// ```
#[derive(Debug, Clone)]
pub struct PgSourceStore {
    pool: PgPool,
    queries: HashMap<Channel, String>,
}

impl PgSourceStore {
    /// Creates a store with no registered queries.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            queries: HashMap::new(),
        }
    }

    /// Registers the query used for `channel`.
    pub fn with_query(mut self, channel: impl Into<Channel>, sql: impl Into<String>) -> Self {
        self.queries.insert(channel.into(), sql.into());
        self
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn fetch_denormalized_rows(
        &self,
        channel: &Channel,
        ids: &[String],
    ) -> Result<Vec<Row>, BoxError> {
        let sql = self
            .queries
            .get(channel)
            .ok_or_else(|| PgSourceError::UnmappedChannel(channel.clone()))?;

        let values: Vec<serde_json::Value> = sqlx::query_scalar(sql.as_str())
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        log::debug!(
            "Fetched {} rows for {} ids on channel '{}'",
            values.len(),
            ids.len(),
            channel
        );

        values
            .into_iter()
            .map(|value| {
                Row::from_value(value)
                    .ok_or_else(|| PgSourceError::NotAnObject(channel.clone()).into())
            })
            .collect()
    }
}
