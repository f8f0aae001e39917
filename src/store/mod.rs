//! Persistent Tier
//!
//! A durable string store split into a sorted index file and an append-only
//! data file. See [`format`] for the byte layout.

mod engine;
mod data;
pub mod format;
mod index;
mod io;
mod journal;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheFacade;
use crate::error::{CacheError, Result};

use self::engine::StoreEngine;

pub use format::{MAX_KEY_BYTES, MAX_VALUE_BYTES};

// == Store Paths ==
/// Locations of the index and data files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub index: PathBuf,
    pub data: PathBuf,
}

impl StorePaths {
    pub fn new(index: impl Into<PathBuf>, data: impl Into<PathBuf>) -> Self {
        Self {
            index: index.into(),
            data: data.into(),
        }
    }

    /// `<base>.idx` and `<base>.dat`.
    pub fn from_base(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().as_os_str();
        let mut index = base.to_owned();
        index.push(".idx");
        let mut data = base.to_owned();
        data.push(".dat");
        Self::new(index, data)
    }
}

// == File Store ==
/// The persistent tier. Cloning yields another handle to the same files.
///
/// Values are written once per key and never change afterwards. File work
/// runs on Tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct FileStore {
    engine: Arc<StoreEngine>,
}

impl FileStore {
    /// Creates a closed store; call [`CacheFacade::init`] before use.
    pub fn new(paths: StorePaths) -> Self {
        Self {
            engine: Arc::new(StoreEngine::new(paths)),
        }
    }

    /// Creates and initializes a store.
    pub async fn open(paths: StorePaths) -> Result<Self> {
        let store = Self::new(paths);
        CacheFacade::<String>::init(&store).await?;
        Ok(store)
    }

    pub fn paths(&self) -> &StorePaths {
        self.engine.paths()
    }

    /// Number of persisted records; zero while closed. Never blocks.
    pub fn len(&self) -> usize {
        self.engine.len()
    }

    /// Whether `key` already has a persisted value. Never blocks.
    pub fn contains(&self, key: &str) -> bool {
        self.engine.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists one entry; returns whether a new record was written.
    pub async fn persist(&self, key: String, value: String) -> Result<bool> {
        self.blocking(move |engine| engine.save(&key, &value)).await
    }

    /// Persists many entries under one lock; returns how many were new.
    pub async fn persist_batch(&self, entries: HashMap<String, String>) -> Result<usize> {
        self.blocking(move |engine| {
            engine.save_batch(entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&StoreEngine) -> Result<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || f(&engine)).await?
    }
}

impl CacheFacade<String> for FileStore {
    async fn init(&self) -> Result<()> {
        self.blocking(|engine| engine.init()).await
    }

    async fn destroy(&self) -> Result<()> {
        self.blocking(|engine| engine.destroy()).await
    }

    async fn keys(&self, pattern: &str) -> Result<HashSet<String>> {
        let pattern = pattern.to_owned();
        self.blocking(move |engine| engine.keys(&pattern)).await
    }

    /// The TTL is ignored: persisted values never expire.
    async fn save(&self, key: &str, value: String, _ttl: Duration) -> Result<()> {
        self.persist(key.to_owned(), value).await.map(|_| ())
    }

    async fn save_batch(&self, entries: HashMap<String, String>, _ttl: Duration) -> Result<()> {
        self.persist_batch(entries).await.map(|_| ())
    }

    async fn load(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_owned();
        self.blocking(move |engine| engine.load(&key)).await
    }

    async fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let keys = keys.to_vec();
        self.blocking(move |engine| engine.load_batch(&keys)).await
    }

    async fn invalidate(&self, _key: &str) -> Result<()> {
        Err(CacheError::Unsupported(
            "the persistent tier cannot delete records",
        ))
    }

    async fn invalidate_batch(&self, _keys: &[String]) -> Result<()> {
        Err(CacheError::Unsupported(
            "the persistent tier cannot delete records",
        ))
    }
}
