//! # Sluice memory backends
//!
//! In-memory implementations of sluice's collaborators, primarily for testing.
//!
//! Every backend is cheap to clone and shares its state between clones, so a
//! test can hand one clone to the [`ReplicationService`](sluice_core::ReplicationService)
//! and keep another to inject failures and inspect what was written:
//!
//! ```ignore
//! let sink = InMemorySink::new();
//! let collaborators = Collaborators::new(
//!     Arc::new(source.clone()),
//!     Arc::new(sink.clone()),
//!     Arc::new(InMemoryResultCache::new()),
//!     Arc::new(InMemoryDeadLetterStore::new()),
//! );
//!
//! sink.fail_next(2).await;
//! // ... drive the service ...
//! assert_eq!(sink.rows("issues").await.len(), 3);
//! ```

#![deny(missing_docs)]

mod cache;
mod dead_letter_store;
mod error;
mod notification;
mod sink;
mod source_store;

pub use cache::*;
pub use dead_letter_store::*;
pub use error::*;
pub use notification::*;
pub use sink::*;
pub use source_store::*;
