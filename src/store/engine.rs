//! Blocking engine of the persistent tier.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashSet;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cache::matches_pattern;
use crate::error::{CacheError, Result};
use crate::store::data::DataFile;
use crate::store::format;
use crate::store::index::IndexFile;
use crate::store::journal::{Journal, Replay};
use crate::store::StorePaths;

type KeyDigest = [u8; 32];

fn digest(key: &str) -> KeyDigest {
    Sha256::digest(key.as_bytes()).into()
}

#[derive(Debug)]
struct StoreFiles {
    index: IndexFile,
    data: DataFile,
    journal: Journal,
}

/// The file pair behind one reader/writer lock, plus the existence digests.
///
/// Writers are exclusive with each other and with readers because an insert
/// moves records that other keys' lookups depend on.
#[derive(Debug)]
pub(crate) struct StoreEngine {
    paths: StorePaths,
    files: RwLock<Option<StoreFiles>>,
    /// SHA-256 of every key present in the index
    digests: DashSet<KeyDigest>,
    /// Mirror of the index count, readable without the file lock
    records: AtomicUsize,
}

impl StoreEngine {
    pub fn new(paths: StorePaths) -> Self {
        Self {
            paths,
            files: RwLock::new(None),
            digests: DashSet::new(),
            records: AtomicUsize::new(0),
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    // == Lifecycle ==
    /// Opens the file pair, finishing any interrupted insert, and rebuilds the
    /// digest set from the index.
    pub fn init(&self) -> Result<()> {
        let mut files = self.files.write();
        if files.is_some() {
            return Ok(());
        }

        for path in [&self.paths.index, &self.paths.data] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .map_err(|e| CacheError::io("creating directory", parent, e))?;
            }
        }

        let mut index = IndexFile::open(&self.paths.index)?;
        let data = DataFile::open(&self.paths.data)?;
        let journal = Journal::for_index(&self.paths.index);

        match journal.replay(&mut index)? {
            Replay::Clean => {}
            Replay::Discarded => warn!(
                "Discarded incomplete journal {}",
                journal.path().display()
            ),
            Replay::Applied { count } => warn!(
                "Recovered interrupted insert from {} ({} records)",
                journal.path().display(),
                count
            ),
        }
        index.verify_length()?;

        self.digests.clear();
        for key in index.keys()? {
            self.digests.insert(digest(&key));
        }

        self.records.store(index.count() as usize, Ordering::Release);

        info!(
            "Persistent store opened: {} records in {}, {} data bytes",
            index.count(),
            index.path().display(),
            data.len()
        );
        *files = Some(StoreFiles {
            index,
            data,
            journal,
        });
        Ok(())
    }

    /// Flushes and releases both files. Idempotent.
    pub fn destroy(&self) -> Result<()> {
        let Some(files) = self.files.write().take() else {
            return Ok(());
        };
        self.digests.clear();
        self.records.store(0, Ordering::Release);
        files.data.sync()?;
        files.index.sync()?;
        info!("Persistent store closed: {}", self.paths.index.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.load(Ordering::Acquire)
    }

    /// Whether `key` is persisted, from the digest set alone.
    pub fn contains(&self, key: &str) -> bool {
        self.digests.contains(&digest(key))
    }

    // == Reads ==
    pub fn load(&self, key: &str) -> Result<Option<String>> {
        let guard = self.files.read();
        let files = guard.as_ref().ok_or(CacheError::Closed)?;
        Self::lookup(files, &self.digests, key)
    }

    /// Looks up every key under a single read lock.
    pub fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let guard = self.files.read();
        let files = guard.as_ref().ok_or(CacheError::Closed)?;

        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if found.contains_key(key) {
                continue;
            }
            if let Some(value) = Self::lookup(files, &self.digests, key)? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    fn lookup(
        files: &StoreFiles,
        digests: &DashSet<KeyDigest>,
        key: &str,
    ) -> Result<Option<String>> {
        if !digests.contains(&digest(key)) {
            return Ok(None);
        }
        match files.index.index_of(key.as_bytes())? {
            Ok(offset) => files.data.read(offset).map(Some),
            Err(_) => {
                debug!("Digest present but key {:?} missing from index", key);
                Ok(None)
            }
        }
    }

    pub fn keys(&self, pattern: &str) -> Result<HashSet<String>> {
        let guard = self.files.read();
        let files = guard.as_ref().ok_or(CacheError::Closed)?;
        Ok(files
            .index
            .keys()?
            .into_iter()
            .filter(|key| matches_pattern(key, pattern))
            .collect())
    }

    // == Writes ==
    /// Persists `value` under `key` unless the key already has a value.
    ///
    /// Returns whether a new record was written. Keys or values over the
    /// 512-byte format limit are skipped without error.
    pub fn save(&self, key: &str, value: &str) -> Result<bool> {
        let mut guard = self.files.write();
        let files = guard.as_mut().ok_or(CacheError::Closed)?;
        self.insert(files, key, value)
    }

    /// Persists every pair under a single write lock; returns how many were new.
    pub fn save_batch<'a, I>(&self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut guard = self.files.write();
        let files = guard.as_mut().ok_or(CacheError::Closed)?;

        let mut written = 0;
        for (key, value) in entries {
            if self.insert(files, key, value)? {
                written += 1;
            }
        }
        Ok(written)
    }

    fn insert(&self, files: &mut StoreFiles, key: &str, value: &str) -> Result<bool> {
        if !format::fits(key, value) {
            debug!(
                "Skipping oversized entry (key {} bytes, value {} bytes)",
                key.len(),
                value.len()
            );
            return Ok(false);
        }

        let key_digest = digest(key);
        if self.digests.contains(&key_digest) {
            return Ok(false);
        }

        let insert_at = match files.index.index_of(key.as_bytes())? {
            Ok(_) => return Ok(false),
            Err(at) => at,
        };

        let offset = files.data.append(value.as_bytes())?;
        files.data.sync()?;
        files
            .index
            .insert(insert_at, key.as_bytes(), offset, &files.journal)?;

        // only once the record is on disk
        self.digests.insert(key_digest);
        self.records.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }
}
