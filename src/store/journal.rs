//! Write-ahead journal for index inserts.
//!
//! An insert rewrites the tail of the index in place, so a crash can leave the
//! header ahead of the shifted records. Before touching the index, the insert
//! records everything needed to finish it:
//!
//! ```text
//! [magic: "TCJ1"][old_count: u32][insert_at: u32][new record]
//! [snapshot of records insert_at..old_count][seal: "TCJS"]
//! ```
//!
//! The body is fsynced before the seal is written. A sealed journal is replayed
//! from the snapshot (never from the half-shifted index), so replay can run
//! any number of times. An unsealed journal means the index was never touched
//! and is simply discarded.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::store::format::RECORD_SIZE;
use crate::store::index::{IndexFile, MAX_SHIFT_BATCH};
use crate::store::io::read_exact_at;

const MAGIC: [u8; 4] = *b"TCJ1";
const SEAL: [u8; 4] = *b"TCJS";
const PREAMBLE: u64 = 4 + 4 + 4 + RECORD_SIZE as u64;

/// Outcome of checking for a leftover journal at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// No journal present
    Clean,
    /// An unsealed journal was removed; the index was untouched
    Discarded,
    /// A sealed journal was applied; the index now holds `count` records
    Applied { count: u32 },
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    /// Journal living next to `index_path` as `<index>.journal`.
    pub fn for_index(index_path: &Path) -> Self {
        let mut name = index_path.as_os_str().to_owned();
        name.push(".journal");
        Self {
            path: PathBuf::from(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a new journal entry, replacing any previous one.
    pub fn begin(&self, old_count: u32, insert_at: u32, record: &[u8]) -> Result<JournalEntry<'_>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| CacheError::io("creating", &self.path, e))?;

        let mut preamble = Vec::with_capacity(PREAMBLE as usize);
        preamble.extend_from_slice(&MAGIC);
        preamble.extend_from_slice(&old_count.to_be_bytes());
        preamble.extend_from_slice(&insert_at.to_be_bytes());
        preamble.extend_from_slice(&record[..RECORD_SIZE]);
        file.write_all(&preamble)
            .map_err(|e| CacheError::io("writing", &self.path, e))?;

        Ok(JournalEntry {
            file,
            path: &self.path,
        })
    }

    /// Removes the journal once its insert is durable in the index.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io("removing", &self.path, e)),
        }
    }

    /// Finishes or discards a leftover journal.
    pub fn replay(&self, index: &mut IndexFile) -> Result<Replay> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::Clean),
            Err(e) => return Err(CacheError::io("opening", &self.path, e)),
        };
        let len = file
            .metadata()
            .map_err(|e| CacheError::io("inspecting", &self.path, e))?
            .len();

        let Some((old_count, insert_at)) = self.read_sealed(&file, len)? else {
            self.clear()?;
            return Ok(Replay::Discarded);
        };

        // tail snapshot back into its shifted position
        let mut chunk = vec![0u8; MAX_SHIFT_BATCH as usize * RECORD_SIZE];
        let mut start = insert_at;
        while start < old_count {
            let n = (old_count - start).min(MAX_SHIFT_BATCH);
            let bytes = &mut chunk[..n as usize * RECORD_SIZE];
            let at = PREAMBLE + u64::from(start - insert_at) * RECORD_SIZE as u64;
            read_exact_at(&file, bytes, at)
                .map_err(|e| CacheError::io("reading", &self.path, e))?;
            index.write_records(start + 1, bytes)?;
            start += n;
        }

        let mut record = [0u8; RECORD_SIZE];
        read_exact_at(&file, &mut record, PREAMBLE - RECORD_SIZE as u64)
            .map_err(|e| CacheError::io("reading", &self.path, e))?;
        index.write_records(insert_at, &record)?;

        let count = old_count + 1;
        index.write_count(count)?;
        index.sync()?;
        index.set_count(count);

        drop(file);
        self.clear()?;
        Ok(Replay::Applied { count })
    }

    /// Returns `(old_count, insert_at)` when the journal is complete and sealed.
    fn read_sealed(&self, file: &File, len: u64) -> Result<Option<(u32, u32)>> {
        if len < PREAMBLE + SEAL.len() as u64 {
            return Ok(None);
        }

        let mut head = [0u8; 12];
        read_exact_at(file, &mut head, 0).map_err(|e| CacheError::io("reading", &self.path, e))?;
        if head[..4] != MAGIC {
            return Ok(None);
        }
        let old_count = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        let insert_at = u32::from_be_bytes([head[8], head[9], head[10], head[11]]);
        if insert_at > old_count {
            return Err(CacheError::Corrupted(format!(
                "{} inserts at {} past record count {}",
                self.path.display(),
                insert_at,
                old_count
            )));
        }

        let expected =
            PREAMBLE + u64::from(old_count - insert_at) * RECORD_SIZE as u64 + SEAL.len() as u64;
        if len != expected {
            return Ok(None);
        }

        let mut seal = [0u8; 4];
        read_exact_at(file, &mut seal, len - SEAL.len() as u64)
            .map_err(|e| CacheError::io("reading", &self.path, e))?;
        Ok((seal == SEAL).then_some((old_count, insert_at)))
    }
}

/// A journal being written for one insert.
pub struct JournalEntry<'a> {
    file: File,
    path: &'a Path,
}

impl JournalEntry<'_> {
    /// Appends snapshot records.
    pub fn append(&mut self, records: &[u8]) -> Result<()> {
        self.file
            .write_all(records)
            .map_err(|e| CacheError::io("writing", self.path, e))
    }

    /// Makes the entry durable, then marks it complete.
    pub fn seal(mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| CacheError::io("syncing", self.path, e))?;
        self.file
            .write_all(&SEAL)
            .map_err(|e| CacheError::io("sealing", self.path, e))?;
        self.file
            .sync_data()
            .map_err(|e| CacheError::io("syncing", self.path, e))
    }
}
