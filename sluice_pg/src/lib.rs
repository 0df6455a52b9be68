//! # Sluice postgres backends

#![deny(missing_docs)]

/// Dead letter persistence in the `sluice_dead_letters` table
pub mod dead_letter_store;

/// LISTEN/NOTIFY change notification source
pub mod listener;

/// Database migrations for sluice_pg schema management
pub mod migrations;

/// Query-driven source of denormalized rows
pub mod source_store;

/// Installs the change notification trigger on source tables
pub mod trigger;

pub use dead_letter_store::PgDeadLetterStore;
pub use listener::PgNotificationSource;
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
pub use source_store::{PgSourceError, PgSourceStore};
pub use trigger::{TriggerError, install_notify_trigger};
