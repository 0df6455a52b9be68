//! # Sluice
//!
//! Streams row changes from a transactional database into an analytical
//! store. Enable `in-memory` for test doubles of every collaborator and
//! `postgres` for the LISTEN/NOTIFY source and the durable dead letter table.

#![deny(missing_docs)]

pub use sluice_core::*;

#[cfg(feature = "in-memory")]
/// In-memory collaborators.
pub mod mem {
    //! Contains the in-memory collaborators of the `sluice` crate.
    pub use sluice_mem::*;
}

#[cfg(feature = "postgres")]
/// PostgreSQL collaborators and migrations.
pub mod pg {
    //! Contains the PostgreSQL collaborators of the `sluice` crate.
    pub use sluice_pg::*;
}

pub mod prelude {
    //! The prelude module for the `sluice` crate.
    pub use sluice_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::*;
    #[cfg(feature = "postgres")]
    pub use super::pg::{
        Migrator, PgDeadLetterStore, PgNotificationSource, PgSourceStore, install_notify_trigger,
    };
}
