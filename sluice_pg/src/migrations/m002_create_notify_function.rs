//! Migration 002: the change notification trigger function.
//!
//! Triggers installed with [`install_notify_trigger`](crate::install_notify_trigger)
//! pass their channel as the first trigger argument. The payload carries only
//! the row id, the operation and the table; rows are re-read at flush time.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates `sluice_notify_change()`.
pub struct CreateNotifyFunction;

#[async_trait]
impl Migration for CreateNotifyFunction {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "create_notify_function"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE OR REPLACE FUNCTION sluice_notify_change()
            RETURNS TRIGGER AS $$
            DECLARE
                changed RECORD;
            BEGIN
                IF TG_OP = 'DELETE' THEN
                    changed := OLD;
                ELSE
                    changed := NEW;
                END IF;
                PERFORM pg_notify(
                    TG_ARGV[0],
                    json_build_object(
                        'id', changed.id,
                        'op', TG_OP,
                        'table', TG_TABLE_NAME
                    )::text
                );
                RETURN NULL;
            END;
            $$ LANGUAGE plpgsql
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
