//! Durable contact store: the in-memory table journaled to disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::contact::{Contact, ContactId};
use crate::storage::{
    CommitJournal, ContactStore, ContactTransaction, InMemoryContactStore, StorageError,
};

use super::file_lock::DirectoryLock;
use super::snapshot::SnapshotFile;
use super::wal::WriteAheadLog;
use super::PersistentConfig;

/// Name of the write-ahead log inside the database directory.
pub const WAL_FILE: &str = "contacts.wal";

fn backend(context: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

/// A [`ContactStore`] that survives restarts.
///
/// Reads and transactions run against [`InMemoryContactStore`]; every commit
/// is appended to the WAL before it becomes visible. Opening the directory
/// loads the snapshot and replays the WAL on top of it.
pub struct PersistentContactStore {
    dir: PathBuf,
    _lock: DirectoryLock,
    wal: Arc<WriteAheadLog>,
    snapshot: SnapshotFile,
    contacts: InMemoryContactStore,
    config: PersistentConfig,
}

impl std::fmt::Debug for PersistentContactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentContactStore")
            .field("dir", &self.dir)
            .field("contacts", &self.contacts)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentContactStore {
    /// Opens or creates the database in `dir` using the system clock.
    ///
    /// # Errors
    /// Fails when the directory cannot be created, another process holds it,
    /// or the snapshot or WAL is corrupt.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        Self::open_with_clock(dir, config, Arc::new(SystemClock))
    }

    /// Opens the database with an injected clock for commit timestamps.
    ///
    /// # Errors
    /// Same as [`open`](Self::open).
    pub fn open_with_clock(
        dir: &Path,
        config: PersistentConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| backend("failed to create database directory", e))?;
        let lock = DirectoryLock::acquire(dir).map_err(|e| backend("failed to acquire lock", e))?;

        let snapshot = SnapshotFile::new(dir);
        let stale = snapshot
            .remove_stale_temps()
            .map_err(|e| backend("failed to clean snapshot temps", e))?;
        if stale > 0 {
            tracing::warn!(stale, "removed interrupted snapshot files");
        }

        let mut contacts = InMemoryContactStore::with_clock(clock);
        let base_sequence = match snapshot.load().map_err(|e| backend("failed to load snapshot", e))? {
            Some(image) => {
                let sequence = image.sequence;
                let rows = image.contacts.len();
                contacts.load(sequence, image.contacts)?;
                tracing::debug!(sequence, rows, "loaded snapshot");
                sequence
            }
            None => 0,
        };

        let (wal, recovery) = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| backend("failed to open WAL", e))?;

        let mut replayed = 0usize;
        let mut expected = base_sequence + 1;
        for entry in recovery.entries {
            if entry.sequence < expected {
                continue;
            }
            if entry.sequence != expected {
                return Err(StorageError::BackendError(format!(
                    "WAL gap: expected sequence {expected}, found {}",
                    entry.sequence
                )));
            }
            contacts.replay(entry.batch)?;
            expected += 1;
            replayed += 1;
        }
        if replayed > 0 {
            tracing::info!(replayed, sequence = expected - 1, "replayed WAL");
        }

        let wal = Arc::new(wal);
        contacts.attach_journal(Arc::clone(&wal) as Arc<dyn CommitJournal>);

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            snapshot,
            contacts,
            config,
        })
    }

    /// Writes a fresh snapshot and empties the WAL.
    ///
    /// Commits are held off for the duration. A crash between the two steps
    /// is harmless: replay skips WAL entries the snapshot already covers.
    ///
    /// # Errors
    /// Any I/O failure while writing the snapshot or resetting the WAL.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let wal_size_before = self.wal_size()?;
        let outcome = self.contacts.quiesced(|table, sequence| {
            let empty = self.wal.is_empty().map_err(|e| backend("failed to stat WAL", e))?;
            if empty {
                return Ok((sequence, table.len(), false));
            }
            self.snapshot
                .write(sequence, table.contacts())
                .map_err(|e| backend("failed to write snapshot", e))?;
            self.wal.reset().map_err(|e| backend("failed to reset WAL", e))?;
            Ok::<_, StorageError>((sequence, table.len(), true))
        })??;

        let (sequence, contacts, snapshot_written) = outcome;
        let result = CompactionResult {
            sequence,
            contacts,
            snapshot_written,
            wal_size_before,
            wal_size_after: self.wal_size()?,
        };
        if snapshot_written {
            tracing::info!(
                sequence,
                contacts,
                wal_size_before,
                "compacted contact database"
            );
        }
        Ok(result)
    }

    /// Whether the WAL has outgrown the configured limit.
    ///
    /// # Errors
    /// Fails if the WAL lock is poisoned.
    pub fn needs_compaction(&self) -> Result<bool, StorageError> {
        Ok(self.wal_size()? > self.config.max_wal_size)
    }

    /// Current WAL size in bytes.
    ///
    /// # Errors
    /// Fails if the WAL lock is poisoned.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal.size_bytes().map_err(|e| backend("failed to stat WAL", e))
    }

    /// Sequence of the last committed batch.
    ///
    /// # Errors
    /// Fails if the table lock is poisoned.
    pub fn sequence(&self) -> Result<u64, StorageError> {
        self.contacts.sequence()
    }

    /// The database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Settings the store was opened with.
    #[must_use]
    pub fn config(&self) -> &PersistentConfig {
        &self.config
    }
}

impl ContactStore for PersistentContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        self.contacts.begin()
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        self.contacts.get(id)
    }

    fn count(&self) -> Result<usize, StorageError> {
        self.contacts.count()
    }

    fn import(&self, contacts: Vec<Contact>) -> Result<(), StorageError> {
        self.contacts.import(contacts)
    }
}

/// Result of a compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Commit sequence captured by the snapshot.
    pub sequence: u64,
    /// Rows in the snapshot.
    pub contacts: usize,
    /// False when the WAL was already empty and nothing was written.
    pub snapshot_written: bool,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::NewContact;
    use tempfile::tempdir;

    fn config() -> PersistentConfig {
        PersistentConfig {
            sync_on_write: false,
            ..PersistentConfig::default()
        }
    }

    fn create(store: &PersistentContactStore, email: &str) -> Contact {
        let mut tx = store.begin().unwrap();
        let created = tx.create(NewContact::primary(Some(email.into()), None)).unwrap();
        tx.commit().unwrap();
        created
    }

    #[test]
    fn test_commits_survive_reopen() {
        let dir = tempdir().unwrap();
        let first = {
            let store = PersistentContactStore::open(dir.path(), config()).unwrap();
            let first = create(&store, "doc@hillvalley.edu");
            create(&store, "marty@hillvalley.edu");
            first
        };

        let store = PersistentContactStore::open(dir.path(), config()).unwrap();
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.get(first.id).unwrap(), Some(first));
        assert_eq!(store.sequence().unwrap(), 2);

        let third = create(&store, "biff@hillvalley.edu");
        assert_eq!(third.id.get(), 3);
    }

    #[test]
    fn test_compaction_moves_rows_into_snapshot() {
        let dir = tempdir().unwrap();
        {
            let store = PersistentContactStore::open(dir.path(), config()).unwrap();
            create(&store, "a@x.com");
            create(&store, "b@x.com");

            let result = store.compact().unwrap();
            assert!(result.snapshot_written);
            assert_eq!(result.contacts, 2);
            assert_eq!(result.sequence, 2);
            assert!(result.wal_size_after < result.wal_size_before);

            let again = store.compact().unwrap();
            assert!(!again.snapshot_written);

            create(&store, "c@x.com");
        }

        let store = PersistentContactStore::open(dir.path(), config()).unwrap();
        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(store.sequence().unwrap(), 3);
    }

    #[test]
    fn test_needs_compaction_tracks_wal_size() {
        let dir = tempdir().unwrap();
        let store = PersistentContactStore::open(
            dir.path(),
            PersistentConfig {
                max_wal_size: 4096,
                sync_on_write: false,
            },
        )
        .unwrap();
        assert!(!store.needs_compaction().unwrap());
        for i in 0..64 {
            create(&store, &format!("user{i}@example.com"));
        }
        assert!(store.needs_compaction().unwrap());
        store.compact().unwrap();
        assert!(!store.needs_compaction().unwrap());
    }
}
