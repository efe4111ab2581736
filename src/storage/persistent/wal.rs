//! Write-ahead log of committed contact batches.
//!
//! Every commit is appended here before it becomes visible in memory. On
//! open, the log is scanned: intact entries are handed back for replay, a
//! frame torn by a crash mid-append is cut off, and any other defect (CRC
//! mismatch, garbage) fails the open.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{CommitBatch, CommitJournal, StorageError};

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Commit sequence of the batch.
    pub sequence: u64,
    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,
    /// The committed rows.
    pub batch: CommitBatch,
}

// Serializes identically to `WalEntry` without cloning the batch.
#[derive(Serialize)]
struct WalEntryRef<'a> {
    sequence: u64,
    timestamp: DateTime<Utc>,
    batch: &'a CommitBatch,
}

/// What a log scan found on open.
#[derive(Debug, Default)]
pub struct WalRecovery {
    /// Intact entries in file order.
    pub entries: Vec<WalEntry>,
    /// Bytes of torn tail that were cut off.
    pub discarded_bytes: u64,
}

struct WalFile {
    file: File,
    len: u64,
}

/// Append-only commit log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalFile>,
    last_sequence: AtomicU64,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Opens or creates the log, returning the recoverable entries.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<(Self, WalRecovery)> {
        let existing_len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        let recovery = if existing_len < codec::HEADER_LEN {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            WalRecovery::default()
        } else {
            let (entries, valid_len) = scan(path)?;
            let discarded_bytes = existing_len - valid_len;
            if discarded_bytes > 0 {
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
                tracing::warn!(
                    path = %path.display(),
                    discarded_bytes,
                    recovered = entries.len(),
                    "cut torn tail from WAL"
                );
            }
            WalRecovery {
                entries,
                discarded_bytes,
            }
        };

        let last_sequence = recovery.entries.last().map_or(0, |e| e.sequence);
        let file = OpenOptions::new().append(true).open(path)?;
        let len = file.metadata()?.len();

        Ok((
            Self {
                path: path.to_path_buf(),
                inner: Mutex::new(WalFile { file, len }),
                last_sequence: AtomicU64::new(last_sequence),
                sync_on_write,
            },
            recovery,
        ))
    }

    fn lock(&self) -> IoResult<std::sync::MutexGuard<'_, WalFile>> {
        self.inner
            .lock()
            .map_err(|_| IoError::new(ErrorKind::Other, "poisoned WAL lock"))
    }

    /// Appends a committed batch.
    ///
    /// A failed append is rolled back to the previous end of file so later
    /// entries are not written after a partial frame.
    pub fn append(&self, batch: &CommitBatch) -> IoResult<()> {
        let encoded = codec::encode(&WalEntryRef {
            sequence: batch.sequence,
            timestamp: Utc::now(),
            batch,
        })?;

        let mut wal = self.lock()?;
        let result = wal.file.write_all(&encoded).and_then(|()| {
            if self.sync_on_write {
                wal.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(err) = result {
            let _ = wal.file.set_len(wal.len);
            return Err(err);
        }

        wal.len += encoded.len() as u64;
        self.last_sequence.store(batch.sequence, Ordering::SeqCst);
        Ok(())
    }

    /// Sequence of the last appended batch, 0 for an empty log.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Current file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(self.lock()?.len)
    }

    /// Returns true when the log holds no entries.
    pub fn is_empty(&self) -> IoResult<bool> {
        Ok(self.size_bytes()? <= codec::HEADER_LEN)
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drops every entry, leaving only the header.
    ///
    /// Only call this once the entries are covered by a durable snapshot.
    pub fn reset(&self) -> IoResult<()> {
        let mut wal = self.lock()?;
        wal.file.set_len(0)?;
        codec::write_header(&mut wal.file)?;
        wal.file.sync_all()?;
        wal.len = codec::HEADER_LEN;
        Ok(())
    }
}

impl CommitJournal for WriteAheadLog {
    fn record(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        self.append(batch)
            .map_err(|e| StorageError::BackendError(format!("WAL append failed: {e}")))
    }
}

// Returns the intact entries and the byte length they span.
fn scan(path: &Path) -> IoResult<(Vec<WalEntry>, u64)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader)?;

    let mut entries = Vec::new();
    let mut valid_len = reader.stream_position()?;
    while valid_len < file_len {
        match codec::decode::<WalEntry>(&mut reader) {
            Ok(entry) => {
                valid_len = reader.stream_position()?;
                entries.push(entry);
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => {
                let after = entries.last().map_or(0, |entry: &WalEntry| entry.sequence);
                return Err(IoError::new(
                    e.kind(),
                    format!("corrupted WAL entry after sequence {after}: {e}"),
                ));
            }
        }
    }
    Ok((entries, valid_len))
}
