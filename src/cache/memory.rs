//! Memory Tier
//!
//! Concurrent in-process cache with per-entry TTL and a background sweeper.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::entry::{current_timestamp_ms, expires_at_for, CacheEntry};
use crate::cache::{matches_pattern, CacheFacade};
use crate::error::{CacheError, Result};
use crate::tasks::spawn_sweeper_task;

/// Default interval between expiry sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

// == Memory Cache ==
/// In-memory tier. Cloning yields another handle to the same entries.
///
/// Every key maps to its own [`CacheEntry`], so operations on different keys
/// never wait for each other. A map slot is never locked while an entry lock
/// is being acquired; the entry `Arc` is cloned out first.
pub struct MemoryCache<V> {
    inner: Arc<Inner<V>>,
}

struct Inner<V> {
    entries: DashMap<String, Arc<CacheEntry<V>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweep_interval: Duration,
}

impl<V> Clone for MemoryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.inner.entries.len())
            .field("sweep_interval", &self.inner.sweep_interval)
            .finish()
    }
}

impl<V> Default for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    // == Constructor ==
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Creates an empty cache whose sweeper runs every `sweep_interval`.
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                sweeper: Mutex::new(None),
                sweep_interval,
            }),
        }
    }

    fn entry(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        self.inner.entries.get(key).map(|slot| Arc::clone(slot.value()))
    }

    /// Drops the map slot for `key` if it still holds `entry`.
    fn unlink(&self, key: &str, entry: &Arc<CacheEntry<V>>) {
        self.inner
            .entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry));
    }

    // == Get ==
    /// Returns the value if present and not expired.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entry(key)?.read(current_timestamp_ms())
    }

    // == Set ==
    /// Stores `value` under `key`; a zero `ttl` never expires.
    ///
    /// A live entry is updated in place. A retired one is replaced by a fresh
    /// entry, never revived.
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let expires_at = expires_at_for(ttl);
        loop {
            let entry = match self.inner.entries.entry(key.to_owned()) {
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(CacheEntry::new(value, expires_at)));
                    return;
                }
                Entry::Occupied(slot) => Arc::clone(slot.get()),
            };

            let mut writer = entry.write();
            if !writer.is_tombstoned() {
                writer.replace(value, expires_at);
                return;
            }
            drop(writer);
            // retired under us; clear the stale slot and retry
            self.unlink(key, &entry);
        }
    }

    pub fn set_batch<I>(&self, entries: I, ttl: Duration)
    where
        I: IntoIterator<Item = (String, V)>,
    {
        for (key, value) in entries {
            self.set(&key, value, ttl);
        }
    }

    // == Load Or Insert ==
    /// Returns the live value for `key`, or stores what `supplier` produces.
    ///
    /// When an expired entry is found the supplier runs under that entry's
    /// write lock, so concurrent callers for the same expired entry compute
    /// once. A `None` from the supplier retires the expired entry.
    pub fn get_or_insert_with<F>(&self, key: &str, ttl: Duration, supplier: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        let Some(entry) = self.entry(key) else {
            let value = supplier()?;
            self.set(key, value.clone(), ttl);
            return Some(value);
        };

        if let Some(value) = entry.read(current_timestamp_ms()) {
            return Some(value);
        }

        let mut writer = entry.write();
        if writer.is_tombstoned() {
            drop(writer);
            let value = supplier()?;
            self.set(key, value.clone(), ttl);
            return Some(value);
        }
        if let Some(value) = writer.value_if_live(current_timestamp_ms()) {
            return Some(value);
        }

        match supplier() {
            Some(value) => {
                writer.replace(value.clone(), expires_at_for(ttl));
                Some(value)
            }
            None => {
                writer.retire();
                self.unlink(key, &entry);
                None
            }
        }
    }

    // == Remove ==
    /// Retires and unlinks `key`. Missing keys are ignored.
    pub fn remove(&self, key: &str) {
        let Some(entry) = self.entry(key) else {
            return;
        };
        let mut writer = entry.write();
        if !writer.is_tombstoned() {
            writer.retire();
        }
        self.unlink(key, &entry);
    }

    pub fn remove_batch(&self, keys: &[String]) {
        for key in keys {
            self.remove(key);
        }
    }

    // == Keys ==
    /// Live keys matching `pattern`.
    pub fn keys_matching(&self, pattern: &str) -> HashSet<String> {
        let now = current_timestamp_ms();
        if !pattern.contains('*') {
            return self
                .entry(pattern)
                .filter(|entry| entry.is_live(now))
                .map(|_| HashSet::from([pattern.to_owned()]))
                .unwrap_or_default();
        }

        self.inner
            .entries
            .iter()
            .filter(|slot| slot.value().is_live(now) && matches_pattern(slot.key(), pattern))
            .map(|slot| slot.key().clone())
            .collect()
    }

    // == Sweep ==
    /// Retires and unlinks every expired entry; returns how many were removed.
    ///
    /// Expired entries are collected first and then locked one at a time,
    /// so no map shard stays locked while waiting on an entry.
    pub fn sweep_expired(&self) -> usize {
        let now = current_timestamp_ms();
        let expired: Vec<(String, Arc<CacheEntry<V>>)> = self
            .inner
            .entries
            .iter()
            .filter(|slot| slot.value().is_expired(now))
            .map(|slot| (slot.key().clone(), Arc::clone(slot.value())))
            .collect();

        let mut removed = 0;
        for (key, entry) in expired {
            let mut writer = entry.write();
            // may have been refreshed since the scan
            if writer.is_expired(now) {
                writer.retire();
                self.unlink(&key, &entry);
                removed += 1;
            }
        }
        removed
    }

    // == Length ==
    /// Number of entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    // == Sweeper Lifecycle ==
    /// Starts the periodic sweeper on the current Tokio runtime. Idempotent.
    pub fn start_sweeper(&self) -> Result<()> {
        Handle::try_current().map_err(|_| CacheError::NoRuntime)?;

        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(spawn_sweeper_task(self.clone(), self.inner.sweep_interval));
            info!(
                "Memory tier sweeper started (every {:?})",
                self.inner.sweep_interval
            );
        }
        Ok(())
    }

    /// Aborts the sweeper if it is running.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
            debug!("Memory tier sweeper stopped");
        }
    }
}

impl<V> CacheFacade<V> for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn init(&self) -> Result<()> {
        self.start_sweeper()
    }

    async fn destroy(&self) -> Result<()> {
        self.stop_sweeper();
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<HashSet<String>> {
        Ok(self.keys_matching(pattern))
    }

    async fn save(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        self.set(key, value, ttl);
        Ok(())
    }

    async fn save_batch(&self, entries: HashMap<String, V>, ttl: Duration) -> Result<()> {
        self.set_batch(entries, ttl);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<V>> {
        Ok(self.get(key))
    }

    async fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, V>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.get(key).map(|value| (key.clone(), value)))
            .collect())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    async fn invalidate_batch(&self, keys: &[String]) -> Result<()> {
        self.remove_batch(keys);
        Ok(())
    }
}
