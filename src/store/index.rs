//! Sorted index file.
//!
//! Records are kept in strictly ascending key order at all times, so every
//! lookup is a binary search over fixed-width slots. Inserting shifts the tail
//! of the file one slot to the right, from the back, in power-of-two batches.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::error::{CacheError, Result};
use crate::store::format::{self, record_position, RecordRef, HEADER_SIZE, RECORD_SIZE};
use crate::store::io::{read_exact_at, write_all_at};
use crate::store::journal::Journal;

/// Largest number of records moved by one shift step
pub const MAX_SHIFT_BATCH: u32 = 32;

/// Batch size for the next shift step: the largest power of two, capped at
/// [`MAX_SHIFT_BATCH`], that evenly divides `remaining`.
pub fn shift_batch(remaining: u32) -> u32 {
    debug_assert!(remaining > 0);
    (1u32 << remaining.trailing_zeros()).min(MAX_SHIFT_BATCH)
}

// == Shift Buffers ==
/// One pre-sized scratch buffer per batch size (1, 2, 4, 8, 16, 32 records).
struct ShiftBuffers([Vec<u8>; 6]);

impl ShiftBuffers {
    fn new() -> Self {
        Self(std::array::from_fn(|i| vec![0u8; (1usize << i) * RECORD_SIZE]))
    }

    fn for_batch(&mut self, batch: u32) -> &mut [u8] {
        &mut self.0[batch.trailing_zeros() as usize]
    }

    fn largest(&mut self) -> &mut [u8] {
        &mut self.0[5]
    }
}

impl fmt::Debug for ShiftBuffers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter().map(Vec::len)).finish()
    }
}

// == Index File ==
#[derive(Debug)]
pub struct IndexFile {
    file: File,
    path: PathBuf,
    /// Mirror of the on-disk header, updated once an insert is durable
    count: u32,
    /// Set when an insert failed and its journal could not be replayed
    poisoned: bool,
    shift_buffers: ShiftBuffers,
}

impl IndexFile {
    /// Opens (or creates) the index file and reads its record-count header.
    ///
    /// The file length is not checked here: a pending journal may still have
    /// to be replayed. Call [`IndexFile::verify_length`] afterwards.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CacheError::io("opening", path, e))?;
        let len = file
            .metadata()
            .map_err(|e| CacheError::io("inspecting", path, e))?
            .len();

        let count = if len < HEADER_SIZE {
            write_all_at(&file, &format::encode_count(0), 0)
                .map_err(|e| CacheError::io("initializing", path, e))?;
            0
        } else {
            let mut header = [0u8; HEADER_SIZE as usize];
            read_exact_at(&file, &mut header, 0)
                .map_err(|e| CacheError::io("reading header of", path, e))?;
            format::decode_count(header)
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            count,
            poisoned: false,
            shift_buffers: ShiftBuffers::new(),
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails once an unrecovered insert left the file out of step with
    /// `count`. Reopening replays the sealed journal.
    fn ensure_consistent(&self) -> Result<()> {
        if self.poisoned {
            return Err(CacheError::Corrupted(format!(
                "{} has an unfinished insert; reopen the store to recover it",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Checks the file holds every record its header promises and drops any
    /// trailing partial slot.
    pub fn verify_length(&mut self) -> Result<()> {
        let expected = record_position(self.count);
        let actual = self
            .file
            .metadata()
            .map_err(|e| CacheError::io("inspecting", &self.path, e))?
            .len();

        if actual < expected {
            return Err(CacheError::Corrupted(format!(
                "{} holds {} bytes but its header declares {} records ({} bytes)",
                self.path.display(),
                actual,
                self.count,
                expected
            )));
        }
        if actual > expected {
            warn!(
                "Trimming {} trailing bytes from {}",
                actual - expected,
                self.path.display()
            );
            self.file
                .set_len(expected)
                .map_err(|e| CacheError::io("truncating", &self.path, e))?;
        }
        Ok(())
    }

    // == Lookup ==
    pub fn read_record<'b>(
        &self,
        index: u32,
        buf: &'b mut [u8; RECORD_SIZE],
    ) -> Result<RecordRef<'b>> {
        read_exact_at(&self.file, buf, record_position(index))
            .map_err(|e| CacheError::io("reading", &self.path, e))?;
        RecordRef::decode(buf)
    }

    /// Binary search for `key`.
    ///
    /// Returns `Ok(data_offset)` when the key is present, otherwise
    /// `Err(insertion_index)`: the slot that keeps the index sorted.
    pub fn index_of(&self, key: &[u8]) -> Result<std::result::Result<u64, u32>> {
        self.ensure_consistent()?;
        let mut buf = [0u8; RECORD_SIZE];
        let mut low = 0u32;
        let mut high = self.count;

        while low < high {
            let mid = low + (high - low) / 2;
            let record = self.read_record(mid, &mut buf)?;
            match record.key.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(record.data_offset)),
            }
        }

        Ok(Err(low))
    }

    /// All keys in file order.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.ensure_consistent()?;
        let mut keys = Vec::with_capacity(self.count as usize);
        let mut chunk = vec![0u8; MAX_SHIFT_BATCH as usize * RECORD_SIZE];
        let mut start = 0u32;

        while start < self.count {
            let n = (self.count - start).min(MAX_SHIFT_BATCH);
            let bytes = &mut chunk[..n as usize * RECORD_SIZE];
            read_exact_at(&self.file, bytes, record_position(start))
                .map_err(|e| CacheError::io("reading", &self.path, e))?;
            for raw in bytes.chunks_exact(RECORD_SIZE) {
                keys.push(RecordRef::decode(raw)?.key_str()?.to_owned());
            }
            start += n;
        }

        Ok(keys)
    }

    // == Insert ==
    /// Inserts a new record at `insert_at`, journaling the change first.
    ///
    /// `insert_at` must come from [`IndexFile::index_of`] under the same
    /// exclusive lock.
    pub fn insert(
        &mut self,
        insert_at: u32,
        key: &[u8],
        data_offset: u64,
        journal: &Journal,
    ) -> Result<()> {
        self.ensure_consistent()?;
        let old_count = self.count;
        debug_assert!(insert_at <= old_count);

        let mut record = [0u8; RECORD_SIZE];
        RecordRef::encode(key, data_offset, &mut record);

        self.journal_insert(old_count, insert_at, &record, journal)?;

        if let Err(err) = self.apply_insert(old_count, insert_at, &record) {
            warn!(
                "Insert into {} failed ({}), replaying journal",
                self.path.display(),
                err
            );
            return match journal.replay(self) {
                Ok(_) => Ok(()),
                Err(replay_err) => {
                    // the sealed journal stays on disk for the next open
                    error!(
                        "Replaying {} failed ({}), refusing further access",
                        journal.path().display(),
                        replay_err
                    );
                    self.poisoned = true;
                    Err(err)
                }
            };
        }

        journal.clear()
    }

    fn journal_insert(
        &mut self,
        old_count: u32,
        insert_at: u32,
        record: &[u8],
        journal: &Journal,
    ) -> Result<()> {
        let mut entry = journal.begin(old_count, insert_at, record)?;

        let mut start = insert_at;
        while start < old_count {
            let n = (old_count - start).min(MAX_SHIFT_BATCH);
            let buf = &mut self.shift_buffers.largest()[..n as usize * RECORD_SIZE];
            read_exact_at(&self.file, buf, record_position(start))
                .map_err(|e| CacheError::io("reading", &self.path, e))?;
            entry.append(buf)?;
            start += n;
        }

        entry.seal()
    }

    fn apply_insert(&mut self, old_count: u32, insert_at: u32, record: &[u8]) -> Result<()> {
        self.write_count(old_count + 1)?;

        // one fresh slot at the tail
        self.file
            .set_len(record_position(old_count + 1))
            .map_err(|e| CacheError::io("extending", &self.path, e))?;

        self.shift_right(insert_at, old_count)?;
        self.write_records(insert_at, record)?;
        self.sync()?;
        self.count = old_count + 1;
        Ok(())
    }

    /// Moves records `[from, old_count)` one slot to the right, tail first.
    fn shift_right(&mut self, from: u32, old_count: u32) -> Result<()> {
        let mut end = old_count;
        while end > from {
            let batch = shift_batch(end - from);
            let start = end - batch;
            let buf = self.shift_buffers.for_batch(batch);

            read_exact_at(&self.file, buf, record_position(start))
                .map_err(|e| CacheError::io("shifting", &self.path, e))?;
            write_all_at(&self.file, buf, record_position(start + 1))
                .map_err(|e| CacheError::io("shifting", &self.path, e))?;

            end = start;
        }
        debug!(shifted = old_count - from, "Index tail shifted");
        Ok(())
    }

    // == Raw access for journal replay ==
    pub(crate) fn write_count(&mut self, count: u32) -> Result<()> {
        write_all_at(&self.file, &format::encode_count(count), 0)
            .map_err(|e| CacheError::io("writing header of", &self.path, e))
    }

    pub(crate) fn write_records(&self, first: u32, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len() % RECORD_SIZE, 0);
        write_all_at(&self.file, bytes, record_position(first))
            .map_err(|e| CacheError::io("writing", &self.path, e))
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.count = count;
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| CacheError::io("syncing", &self.path, e))
    }
}
