//! Embedded schema migrations for sluice_pg.
//!
//! Migrations are versioned Rust values, applied in order inside one
//! transaction each, and recorded in `_sluice_migrations` together with a
//! SHA-256 checksum. A recorded checksum that no longer matches the code
//! stops the run before anything new is applied.
//!
//! ```rust,ignore
//! use sluice_pg::Migrator;
//!
//! let migrator = Migrator::new(pool.clone());
//! let applied = migrator.run().await?;
//! log::info!("Applied {} migrations, now at {}", applied, migrator.current_version().await?);
//! ```
//!
//! New migrations go in a new `mXXX_description.rs` file and are appended to
//! [`MIGRATIONS`]. Migrations are forward-only.

mod m001_create_dead_letters_table;
mod m002_create_notify_function;

use m001_create_dead_letters_table::CreateDeadLettersTable;
use m002_create_notify_function::CreateNotifyFunction;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;

/// All migrations in order. Append only.
const MIGRATIONS: &[&dyn Migration] = &[&CreateDeadLettersTable, &CreateNotifyFunction];

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An applied migration's recorded checksum differs from the code.
    #[error("Migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// The version of the migration.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The checksum recorded in the database.
        expected: String,
        /// The checksum computed from the code.
        found: String,
    },

    /// A migration failed to execute.
    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        /// The version of the migration that failed.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The database error message.
        reason: String,
    },
}

/// A single schema migration.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, increasing version number.
    fn version(&self) -> i64;

    /// Human-readable name, e.g. `"create_dead_letters_table"`.
    fn name(&self) -> &'static str;

    /// Applies the migration inside `tx`. The migrator commits.
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError>;

    /// SHA-256 of version and name, recorded when the migration is applied.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_le_bytes());
        hasher.update(self.name().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A migration recorded in `_sluice_migrations`.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    /// The version number of the migration.
    pub version: i64,
    /// The name of the migration.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// The checksum recorded when the migration was applied.
    pub checksum: String,
}

/// Applies the sluice_pg schema.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a migrator on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sluice_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Applies every pending migration. Returns how many were applied.
    ///
    /// A failing migration rolls back its own transaction only; earlier
    /// migrations stay applied.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        let applied = self.applied().await?;
        for record in &applied {
            let Some(migration) = MIGRATIONS.iter().find(|m| m.version() == record.version) else {
                continue;
            };
            let found = migration.checksum();
            if found != record.checksum {
                return Err(MigrationError::ChecksumMismatch {
                    version: record.version,
                    name: record.name.clone(),
                    expected: record.checksum.clone(),
                    found,
                });
            }
        }

        let applied_versions: HashSet<i64> = applied.iter().map(|m| m.version).collect();
        let mut count = 0;
        for migration in MIGRATIONS {
            if applied_versions.contains(&migration.version()) {
                log::debug!(
                    "Skipping migration {} ({}): already applied",
                    migration.version(),
                    migration.name()
                );
                continue;
            }

            log::info!(
                "Running migration {} ({})",
                migration.version(),
                migration.name()
            );
            let mut tx = self.pool.begin().await?;
            migration.up(&mut tx).await.map_err(|e| match e {
                MigrationError::Database(db_err) => MigrationError::MigrationFailed {
                    version: migration.version(),
                    name: migration.name().to_string(),
                    reason: db_err.to_string(),
                },
                other => other,
            })?;

            sqlx::query(
                r#"
                INSERT INTO _sluice_migrations (version, name, checksum)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(migration.version())
            .bind(migration.name())
            .bind(migration.checksum())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            count += 1;
        }

        if count > 0 {
            log::info!("Applied {} migrations", count);
        }
        Ok(count)
    }

    /// The highest applied version, or 0 on a fresh database.
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_tracking_table().await?;

        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM _sluice_migrations")
                .fetch_one(&self.pool)
                .await?;

        Ok(version.unwrap_or(0))
    }

    /// Migrations not applied yet, in order.
    pub async fn pending(&self) -> Result<Vec<&'static dyn Migration>, MigrationError> {
        let applied_versions: HashSet<i64> =
            self.applied().await?.iter().map(|m| m.version).collect();

        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied_versions.contains(&m.version()))
            .copied()
            .collect())
    }

    /// Migrations already applied, in version order.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;

        let rows = sqlx::query(
            r#"
            SELECT version, name, applied_at, checksum
            FROM _sluice_migrations
            ORDER BY version ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AppliedMigration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: row.get("applied_at"),
                checksum: row.get("checksum"),
            })
            .collect())
    }
}
