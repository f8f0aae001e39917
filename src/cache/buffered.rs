//! Cache Coordinator
//!
//! Layers the memory tier over the persistent tier behind [`CacheFacade`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::stats::StatsRecorder;
use crate::cache::{CacheFacade, CacheStats, MemoryCache};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::store::{FileStore, StorePaths};
use crate::tasks::{WriteBehind, WriteJob};

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedConfig {
    /// How long a value fetched from the persistent tier stays in memory
    pub buffer_ttl: Duration,
    /// Propagate writes through background workers instead of inline
    pub async_upstream: bool,
    pub write_workers: usize,
    pub write_queue: usize,
}

impl Default for BufferedConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BufferedConfig {
    fn from(config: &Config) -> Self {
        Self {
            buffer_ttl: config.buffer_ttl(),
            async_upstream: config.async_upstream,
            write_workers: config.write_workers,
            write_queue: config.write_queue,
        }
    }
}

// == Buffered Cache ==
/// Memory tier in front of the persistent tier.
///
/// Reads try memory first and fall back to the file store, keeping what they
/// fetch in memory for [`BufferedConfig::buffer_ttl`]. Writes always land in
/// memory before this returns; the file store is updated inline or, in async
/// upstream mode, by the write-behind workers.
///
/// A write to a key the file store already holds cannot replace the stored
/// value, so memory keeps the new value for at most the buffering TTL.
/// Every facade call fails with [`CacheError::Closed`] outside
/// `init`..`destroy`.
#[derive(Debug)]
pub struct BufferedCache {
    memory: MemoryCache<String>,
    upstream: FileStore,
    config: BufferedConfig,
    write_behind: Mutex<Option<Arc<WriteBehind>>>,
    stats: Arc<StatsRecorder>,
    open: AtomicBool,
}

impl BufferedCache {
    // == Constructor ==
    pub fn new(memory: MemoryCache<String>, upstream: FileStore, config: BufferedConfig) -> Self {
        Self {
            memory,
            upstream,
            config,
            write_behind: Mutex::new(None),
            stats: Arc::default(),
            open: AtomicBool::new(false),
        }
    }

    /// Builds both tiers from `config`. Nothing is opened until `init`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            MemoryCache::with_sweep_interval(config.sweep_interval()),
            FileStore::new(StorePaths::from_base(&config.cache_file)),
            BufferedConfig::from(config),
        )
    }

    pub fn memory(&self) -> &MemoryCache<String> {
        &self.memory
    }

    pub fn store(&self) -> &FileStore {
        &self.upstream
    }

    pub fn config(&self) -> &BufferedConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::Closed)
        }
    }

    /// Memory TTL for a write of `key`: persisted keys are only buffered.
    fn memory_ttl(&self, key: &str, ttl: Duration) -> Duration {
        let buffer_ttl = self.config.buffer_ttl;
        let within_buffer = buffer_ttl.is_zero() || (!ttl.is_zero() && ttl <= buffer_ttl);
        if !within_buffer && self.upstream.contains(key) {
            buffer_ttl
        } else {
            ttl
        }
    }

    /// Sends a write to the persistent tier the configured way.
    async fn propagate(&self, job: WriteJob) -> Result<()> {
        let write_behind = self.write_behind.lock().clone();
        match write_behind {
            Some(write_behind) => {
                write_behind.submit(job).await?;
                self.stats.record_queued();
                Ok(())
            }
            None => job.apply(&self.upstream).await,
        }
    }
}

impl CacheFacade<String> for BufferedCache {
    async fn init(&self) -> Result<()> {
        self.upstream.init().await?;
        self.memory.start_sweeper()?;

        if self.config.async_upstream {
            let mut write_behind = self.write_behind.lock();
            if write_behind.is_none() {
                *write_behind = Some(Arc::new(WriteBehind::spawn(
                    self.upstream.clone(),
                    self.config.write_workers,
                    self.config.write_queue,
                    Arc::clone(&self.stats),
                )));
            }
        }

        info!(
            "Buffered cache ready ({} upstream writes, {:?} buffer TTL)",
            if self.config.async_upstream { "async" } else { "sync" },
            self.config.buffer_ttl
        );
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    /// Drains pending writes, then closes both tiers.
    async fn destroy(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        let write_behind = self.write_behind.lock().take();
        if let Some(write_behind) = write_behind {
            write_behind.shutdown().await;
        }
        self.memory.stop_sweeper();
        self.upstream.destroy().await
    }

    async fn keys(&self, pattern: &str) -> Result<HashSet<String>> {
        self.ensure_open()?;
        let mut keys = self.memory.keys_matching(pattern);
        keys.extend(self.upstream.keys(pattern).await?);
        Ok(keys)
    }

    async fn save(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        self.memory.set(key, value.clone(), self.memory_ttl(key, ttl));
        self.propagate(WriteJob::Save {
            key: key.to_owned(),
            value,
        })
        .await
    }

    async fn save_batch(&self, entries: HashMap<String, String>, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }
        let (persisted, fresh): (HashMap<_, _>, HashMap<_, _>) = entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .partition(|(key, _)| self.memory_ttl(key, ttl) != ttl);
        self.memory.set_batch(fresh, ttl);
        if !persisted.is_empty() {
            self.memory.set_batch(persisted, self.config.buffer_ttl);
        }
        self.propagate(WriteJob::Batch(entries)).await
    }

    async fn load(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        if let Some(value) = self.memory.get(key) {
            self.stats.record_memory_hits(1);
            return Ok(Some(value));
        }

        match self.upstream.load(key).await? {
            Some(value) => {
                self.stats.record_store_hits(1);
                self.memory.set(key, value.clone(), self.config.buffer_ttl);
                Ok(Some(value))
            }
            None => {
                self.stats.record_misses(1);
                debug!("Cache miss for {:?}", key);
                Ok(None)
            }
        }
    }

    /// Memory hits are served directly; every miss goes to the persistent
    /// tier in a single batch.
    async fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        self.ensure_open()?;
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        let mut seen = HashSet::with_capacity(keys.len());

        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            match self.memory.get(key) {
                Some(value) => {
                    found.insert(key.clone(), value);
                }
                None => missing.push(key.clone()),
            }
        }
        self.stats.record_memory_hits(found.len() as u64);

        if !missing.is_empty() {
            let fetched = self.upstream.load_batch(&missing).await?;
            self.stats.record_store_hits(fetched.len() as u64);
            self.stats
                .record_misses((missing.len() - fetched.len()) as u64);

            for (key, value) in fetched {
                self.memory.set(&key, value.clone(), self.config.buffer_ttl);
                // memory wins if both tiers hold the key
                found.entry(key).or_insert(value);
            }
        }
        Ok(found)
    }

    /// Clears memory, then reports the persistent tier's refusal.
    async fn invalidate(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.memory.remove(key);
        self.upstream.invalidate(key).await
    }

    async fn invalidate_batch(&self, keys: &[String]) -> Result<()> {
        self.ensure_open()?;
        self.memory.remove_batch(keys);
        self.upstream.invalidate_batch(keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;

    fn sync_config() -> BufferedConfig {
        BufferedConfig {
            async_upstream: false,
            ..BufferedConfig::default()
        }
    }

    async fn open_cache(dir: &tempfile::TempDir, config: BufferedConfig) -> BufferedCache {
        let cache = BufferedCache::new(
            MemoryCache::new(),
            FileStore::new(StorePaths::from_base(dir.path().join("buffered"))),
            config,
        );
        cache.init().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_sync_save_reaches_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, sync_config()).await;

        cache.save_persist("hello", "hallo".to_string()).await.unwrap();
        assert_eq!(cache.memory().get("hello").as_deref(), Some("hallo"));
        assert_eq!(
            cache.store().load("hello").await.unwrap().as_deref(),
            Some("hallo")
        );
        cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_repopulates_memory_with_buffer_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let config = BufferedConfig {
            buffer_ttl: Duration::from_millis(50),
            ..sync_config()
        };
        let cache = open_cache(&dir, config).await;
        cache.store().persist("k".into(), "v".into()).await.unwrap();

        assert_eq!(cache.load("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.memory().get("k").as_deref(), Some("v"));
        assert_eq!(cache.load("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.memory().get("k").is_none());
        assert_eq!(cache.load("k").await.unwrap().as_deref(), Some("v"));

        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.store_hits, 2);
        assert!(cache.load("absent").await.unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
        cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_batch_merges_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, sync_config()).await;
        cache.memory().set("mem", "m".to_string(), Duration::ZERO);
        cache.store().persist("disk".into(), "d".into()).await.unwrap();
        cache.store().persist("mem".into(), "stale".into()).await.unwrap();

        let keys: Vec<String> = ["mem", "disk", "none", "disk"]
            .iter()
            .map(|k| k.to_string())
            .collect();
        let found = cache.load_batch(&keys).await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found["mem"], "m");
        assert_eq!(found["disk"], "d");
        assert_eq!(cache.memory().get("disk").as_deref(), Some("d"));
        cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_union_of_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, sync_config()).await;
        cache.memory().set("abc", "1".to_string(), Duration::ZERO);
        cache.store().persist("aXc".into(), "2".into()).await.unwrap();
        cache.store().persist("cab".into(), "3".into()).await.unwrap();

        let keys = cache.keys("a*c").await.unwrap();
        assert_eq!(keys, HashSet::from(["abc".to_string(), "aXc".to_string()]));
        cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_clears_memory_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, sync_config()).await;
        cache.memory().set("k", "v".to_string(), Duration::ZERO);

        let result = cache.invalidate("k").await;
        assert!(matches!(result, Err(CacheError::Unsupported(_))));
        assert!(cache.memory().get("k").is_none());
        cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_or_save_persists_supplied_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, sync_config()).await;

        let value = cache
            .load_or_save_persist("word", || async { Some("mot".to_string()) })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("mot"));
        assert_eq!(
            cache.store().load("word").await.unwrap().as_deref(),
            Some("mot")
        );

        let nothing = cache
            .load_or_save_persist("blank", || async { None })
            .await
            .unwrap();
        assert!(nothing.is_none());
        assert!(cache.store().load("blank").await.unwrap().is_none());
        cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_coordinator_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BufferedCache::new(
            MemoryCache::new(),
            FileStore::new(StorePaths::from_base(dir.path().join("buffered"))),
            sync_config(),
        );

        let result = cache.save_persist("k", "v".to_string()).await;
        assert!(matches!(result, Err(CacheError::Closed)));
        assert!(cache.memory().is_empty());
        assert!(matches!(cache.load("k").await, Err(CacheError::Closed)));

        cache.init().await.unwrap();
        cache.save_persist("k", "v".to_string()).await.unwrap();
        cache.destroy().await.unwrap();
        assert!(matches!(cache.keys("*").await, Err(CacheError::Closed)));
        assert!(matches!(
            cache.save_batch_persist(HashMap::from([("a".into(), "b".into())])).await,
            Err(CacheError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_write_to_persisted_key_is_only_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let config = BufferedConfig {
            buffer_ttl: Duration::from_millis(50),
            ..sync_config()
        };
        let cache = open_cache(&dir, config).await;
        cache.save_persist("k", "v1".to_string()).await.unwrap();
        cache.save_persist("k", "v2".to_string()).await.unwrap();
        cache
            .save_batch_persist(HashMap::from([
                ("k".to_string(), "v3".to_string()),
                ("fresh".to_string(), "f".to_string()),
            ]))
            .await
            .unwrap();

        assert_eq!(cache.load("k").await.unwrap().as_deref(), Some("v3"));
        tokio::time::sleep(Duration::from_millis(80)).await;

        // memory agrees with the file store again
        assert_eq!(cache.load("k").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(cache.memory().get("fresh").as_deref(), Some("f"));
        cache.destroy().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_mode_drains_on_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let config = BufferedConfig {
            async_upstream: true,
            write_workers: 2,
            write_queue: 8,
            ..BufferedConfig::default()
        };
        let cache = open_cache(&dir, config).await;

        for i in 0..40 {
            cache
                .save_persist(&format!("k{:02}", i), i.to_string())
                .await
                .unwrap();
        }
        assert_eq!(cache.stats().writes_queued, 40);
        cache.destroy().await.unwrap();

        let store = FileStore::open(StorePaths::from_base(dir.path().join("buffered")))
            .await
            .unwrap();
        assert_eq!(store.len(), 40);
        assert_eq!(store.load("k17").await.unwrap().as_deref(), Some("17"));
    }
}
