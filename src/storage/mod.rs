//! Contact repositories.
//!
//! [`ContactStore`] is the only dependency of the reconciliation engine.
//! The in-memory backend is always available; the durable backend lives
//! behind the `persistent` feature.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{
    CommitBatch, CommitJournal, ContactTable, InMemoryContactStore, DEFAULT_COMMIT_HISTORY,
};
pub use traits::{ContactStore, ContactTransaction, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, PersistentConfig, PersistentContactStore};
