//! Durable storage for the contact table.
//!
//! A database is a directory:
//!
//! ```text
//! contacts.db/
//!   .lock           advisory lock, holder's pid
//!   contacts.snap   table image as of some commit sequence
//!   contacts.wal    batches committed after that sequence
//! ```
//!
//! Every frame carries a CRC32. A WAL frame torn by a crash is cut off on
//! open; any other corruption fails the open instead of silently dropping
//! committed contacts.

mod codec;
mod file_lock;
mod snapshot;
mod stores;
mod wal;

pub use file_lock::{DirectoryLock, LOCK_FILE};
pub use snapshot::{Snapshot, SnapshotFile, SNAPSHOT_FILE};
pub use stores::{CompactionResult, PersistentContactStore, WAL_FILE};
pub use wal::{WalEntry, WalRecovery, WriteAheadLog};

use std::path::Path;

use crate::storage::StorageError;

/// Settings for a persistent store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    /// WAL size in bytes past which compaction is due.
    pub max_wal_size: u64,
    /// fsync after every commit.
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    /// Smallest accepted `max_wal_size`.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Checks the settings.
    ///
    /// # Errors
    /// `BackendError` when `max_wal_size` is below [`Self::MIN_WAL_SIZE`].
    pub fn validate(self) -> Result<Self, StorageError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(StorageError::BackendError(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }
        Ok(self)
    }
}

/// Opens or creates a contact database at `path`.
///
/// # Errors
/// Invalid configuration, an unusable directory, a directory held by another
/// process, or a corrupt snapshot or WAL.
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use contact_reconcile::storage::persistent::open_database;
/// use contact_reconcile::ReconcileEngine;
///
/// let store = open_database("./contacts.db", None)?;
/// let engine = ReconcileEngine::new(Arc::new(store));
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentContactStore, StorageError> {
    let config = config.unwrap_or_default().validate()?;
    PersistentContactStore::open(path.as_ref(), config)
}
