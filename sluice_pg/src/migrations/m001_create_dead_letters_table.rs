//! Migration 001: the dead letter table.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates `sluice_dead_letters` and its replay index.
pub struct CreateDeadLettersTable;

#[async_trait]
impl Migration for CreateDeadLettersTable {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_dead_letters_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sluice_dead_letters (
                id UUID PRIMARY KEY,
                channel VARCHAR(255) NOT NULL,
                event_payload JSONB NOT NULL,
                error_reason TEXT NOT NULL,
                retry_count INT NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
                max_retries INT NOT NULL CHECK (max_retries > 0),
                status VARCHAR(16) NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'replayed', 'exhausted')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                next_retry_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        // Serves the due-entry scan of the replay loop
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sluice_dead_letters_due
            ON sluice_dead_letters(status, next_retry_at, created_at)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sluice_dead_letters_created_at
            ON sluice_dead_letters(created_at DESC)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
