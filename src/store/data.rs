//! Append-only value log.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::store::format::{self, LENGTH_PREFIX};
use crate::store::io::{read_exact_at, write_all_at};

/// The data file: length-prefixed values in write order.
///
/// Offsets handed out by [`DataFile::append`] stay valid for the life of the
/// file; nothing is ever rewritten.
#[derive(Debug)]
pub struct DataFile {
    file: File,
    path: PathBuf,
    /// Next append position
    end: u64,
}

impl DataFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CacheError::io("opening", path, e))?;
        let end = file
            .metadata()
            .map_err(|e| CacheError::io("inspecting", path, e))?
            .len();

        Ok(Self {
            file,
            path: path.to_path_buf(),
            end,
        })
    }

    /// Appends `value` and returns the offset of its record.
    pub fn append(&mut self, value: &[u8]) -> Result<u64> {
        let offset = self.end;
        let record = format::encode_value(value);
        write_all_at(&self.file, &record, offset)
            .map_err(|e| CacheError::io("appending to", &self.path, e))?;
        self.end += record.len() as u64;
        Ok(offset)
    }

    /// Reads the value whose record starts at `offset`.
    pub fn read(&self, offset: u64) -> Result<String> {
        let mut len_buf = [0u8; LENGTH_PREFIX];
        read_exact_at(&self.file, &mut len_buf, offset)
            .map_err(|e| CacheError::io("reading", &self.path, e))?;
        let len = format::decode_value_len(len_buf)?;

        let mut value = vec![0u8; len];
        read_exact_at(&self.file, &mut value, offset + LENGTH_PREFIX as u64)
            .map_err(|e| CacheError::io("reading", &self.path, e))?;

        String::from_utf8(value).map_err(|e| {
            CacheError::Corrupted(format!("value at offset {} is not UTF-8: {}", offset, e))
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| CacheError::io("syncing", &self.path, e))
    }

    pub fn len(&self) -> u64 {
        self.end
    }
}
