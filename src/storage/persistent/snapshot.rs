//! Point-in-time image of the contact table.
//!
//! `contacts.snap` holds every row as of one commit sequence:
//!
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [codec-encoded SnapshotHeader]
//! [codec-encoded Vec<Contact>]
//! ```
//!
//! A new snapshot is written to a uniquely named temp file, synced, and
//! renamed over the old one, so readers only ever see a complete file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contact::Contact;

use super::codec;

/// Name of the snapshot file inside the database directory.
pub const SNAPSHOT_FILE: &str = "contacts.snap";

const TEMP_MARKER: &str = ".tmp.";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotHeader {
    sequence: u64,
    contact_count: u64,
    created_at: DateTime<Utc>,
}

/// Contents of a loaded snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Commit sequence the snapshot reflects.
    pub sequence: u64,
    /// Every row, deleted ones included.
    pub contacts: Vec<Contact>,
}

/// Reads and writes the snapshot file of one directory.
#[derive(Debug)]
pub struct SnapshotFile {
    dir: PathBuf,
}

impl SnapshotFile {
    /// Snapshot handle for `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Path of the live snapshot.
    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Loads the snapshot, or `None` when none has been written yet.
    pub fn load(&self) -> IoResult<Option<Snapshot>> {
        let file = match File::open(self.path()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        let header: SnapshotHeader = codec::decode(&mut reader)?;
        let contacts: Vec<Contact> = codec::decode(&mut reader)?;

        if contacts.len() as u64 != header.contact_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "snapshot header promises {} contacts, found {}",
                    header.contact_count,
                    contacts.len()
                ),
            ));
        }

        Ok(Some(Snapshot {
            sequence: header.sequence,
            contacts,
        }))
    }

    /// Atomically replaces the snapshot with `contacts` at `sequence`.
    pub fn write<'a>(
        &self,
        sequence: u64,
        contacts: impl IntoIterator<Item = &'a Contact>,
    ) -> IoResult<()> {
        let rows: Vec<&Contact> = contacts.into_iter().collect();
        let final_path = self.path();
        let temp_path = self
            .dir
            .join(format!("{SNAPSHOT_FILE}{TEMP_MARKER}{}", Uuid::new_v4()));

        let result = write_to(&temp_path, sequence, &rows)
            .and_then(|()| fs::rename(&temp_path, &final_path));
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result?;
        sync_dir(&self.dir)
    }

    /// Removes temp files left behind by an interrupted write.
    pub fn remove_stale_temps(&self) -> IoResult<usize> {
        let prefix = format!("{SNAPSHOT_FILE}{TEMP_MARKER}");
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn write_to(path: &Path, sequence: u64, rows: &[&Contact]) -> IoResult<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);

    let header = SnapshotHeader {
        sequence,
        contact_count: rows.len() as u64,
        created_at: Utc::now(),
    };

    codec::write_header(&mut writer)?;
    writer.write_all(&codec::encode(&header)?)?;
    writer.write_all(&codec::encode(&rows)?)?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> IoResult<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> IoResult<()> {
    Ok(())
}
