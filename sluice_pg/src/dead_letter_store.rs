use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::prelude::*;
use sqlx::PgPool;
use uuid::Uuid;

const COLUMNS: &str = "id, channel, event_payload, error_reason, retry_count, max_retries, \
                       status, created_at, next_retry_at";

/// Dead letter store backed by the `sluice_dead_letters` table.
///
/// Run the [`Migrator`](crate::Migrator) before using it. Transitions only
/// touch rows that are still pending, so a row can never leave a terminal
/// state except through [`DeadLetterStore::reset_exhausted`].
#[derive(Debug, Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    /// Creates a store on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explains why a pending-only update touched no row.
    async fn transition_failed(&self, id: Uuid) -> DeadLetterError {
        match self.get(id).await {
            Ok(Some(entry)) => DeadLetterError::NotPending {
                id,
                status: entry.status,
            },
            Ok(None) => DeadLetterError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    channel: String,
    event_payload: serde_json::Value,
    error_reason: String,
    retry_count: i32,
    max_retries: i32,
    status: String,
    created_at: DateTime<Utc>,
    next_retry_at: DateTime<Utc>,
}

impl DeadLetterRow {
    fn into_event(self) -> Result<DeadLetterEvent, DeadLetterError> {
        Ok(DeadLetterEvent {
            id: self.id,
            channel: Channel::new(self.channel),
            event_payload: self.event_payload,
            error_reason: self.error_reason,
            retry_count: u32::try_from(self.retry_count).map_err(boxed)?,
            max_retries: u32::try_from(self.max_retries).map_err(boxed)?,
            status: self.status.parse().map_err(boxed)?,
            created_at: self.created_at,
            next_retry_at: self.next_retry_at,
        })
    }
}

fn boxed<E: std::error::Error + Send + Sync + 'static>(e: E) -> DeadLetterError {
    DeadLetterError::Backend(Box::new(e))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn into_events(rows: Vec<DeadLetterRow>) -> Result<Vec<DeadLetterEvent>, DeadLetterError> {
    rows.into_iter().map(DeadLetterRow::into_event).collect()
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn insert(
        &self,
        entry: NewDeadLetter,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterEvent, DeadLetterError> {
        let row: DeadLetterRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO sluice_dead_letters
                (id, channel, event_payload, error_reason, retry_count, max_retries,
                 status, created_at, next_retry_at)
            VALUES ($1, $2, $3, $4, 0, $5, 'pending', $6, $6)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(entry.channel.as_str())
        .bind(&entry.event_payload)
        .bind(&entry.error_reason)
        .bind(to_i32(entry.max_retries))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(boxed)?;

        log::debug!(
            "Stored dead letter {} for channel '{}'",
            row.id,
            row.channel
        );
        row.into_event()
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEvent>, DeadLetterError> {
        let row: Option<DeadLetterRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM sluice_dead_letters WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(boxed)?;

        row.map(DeadLetterRow::into_event).transpose()
    }

    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEvent>, DeadLetterError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sluice_dead_letters
            WHERE status = 'pending' AND next_retry_at <= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(boxed)?;

        into_events(rows)
    }

    async fn mark_replayed(&self, id: Uuid) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r#"
            UPDATE sluice_dead_letters
            SET status = 'replayed'
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(boxed)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_failed(id).await);
        }
        Ok(())
    }

    async fn increment_retry(
        &self,
        id: Uuid,
        error_reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r#"
            UPDATE sluice_dead_letters
            SET retry_count = retry_count + 1,
                error_reason = $2,
                next_retry_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(error_reason)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .map_err(boxed)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_failed(id).await);
        }
        Ok(())
    }

    async fn mark_exhausted(&self, id: Uuid, error_reason: &str) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r#"
            UPDATE sluice_dead_letters
            SET retry_count = GREATEST(retry_count + 1, max_retries),
                error_reason = $2,
                status = 'exhausted'
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(error_reason)
        .execute(&self.pool)
        .await
        .map_err(boxed)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_failed(id).await);
        }
        Ok(())
    }

    async fn reset_exhausted(&self, now: DateTime<Utc>) -> Result<u64, DeadLetterError> {
        let result = sqlx::query(
            r#"
            UPDATE sluice_dead_letters
            SET status = 'pending', retry_count = 0, next_retry_at = $1
            WHERE status = 'exhausted'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(boxed)?;

        Ok(result.rows_affected())
    }

    async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DeadLetterEvent>, DeadLetterError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sluice_dead_letters
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            OFFSET $2
            LIMIT $3
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(to_i64(offset))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(boxed)?;

        into_events(rows)
    }

    async fn count(&self, status: Option<DeadLetterStatus>) -> Result<u64, DeadLetterError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM sluice_dead_letters
            WHERE ($1::text IS NULL OR status = $1)
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await
        .map_err(boxed)?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
