//! Cache Facade
//!
//! The interface shared by the memory tier, the persistent tier and the
//! coordinator, so callers never depend on how the cache is layered.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use crate::error::Result;

// == Cache Facade Trait ==
/// Async key/value cache operations.
///
/// A `ttl` of [`Duration::ZERO`] means the entry never expires. Missing keys
/// are `Ok(None)`, never an error.
pub trait CacheFacade<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Acquires resources and starts background work.
    fn init(&self) -> impl Future<Output = Result<()>> + Send;

    /// Stops background work and releases resources.
    fn destroy(&self) -> impl Future<Output = Result<()>> + Send;

    /// Keys matching a glob `pattern` (see [`matches_pattern`](crate::cache::matches_pattern)).
    fn keys(&self, pattern: &str) -> impl Future<Output = Result<HashSet<String>>> + Send;

    fn save(&self, key: &str, value: V, ttl: Duration) -> impl Future<Output = Result<()>> + Send;

    fn save_persist(&self, key: &str, value: V) -> impl Future<Output = Result<()>> + Send {
        self.save(key, value, Duration::ZERO)
    }

    fn save_batch(
        &self,
        entries: HashMap<String, V>,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    fn save_batch_persist(
        &self,
        entries: HashMap<String, V>,
    ) -> impl Future<Output = Result<()>> + Send {
        self.save_batch(entries, Duration::ZERO)
    }

    fn load(&self, key: &str) -> impl Future<Output = Result<Option<V>>> + Send;

    /// Values for every present key; absent keys are left out of the map.
    fn load_batch(&self, keys: &[String]) -> impl Future<Output = Result<HashMap<String, V>>> + Send;

    /// Loads `key`, or computes it with `supplier` and saves the result.
    ///
    /// Concurrent callers missing the same key may all run their supplier;
    /// the last save wins. A `None` from the supplier saves nothing.
    fn load_or_save<F, Fut>(
        &self,
        key: &str,
        supplier: F,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<V>>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Option<V>> + Send,
    {
        async move {
            if let Some(value) = self.load(key).await? {
                return Ok(Some(value));
            }
            match supplier().await {
                Some(value) => {
                    self.save(key, value.clone(), ttl).await?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        }
    }

    fn load_or_save_persist<F, Fut>(
        &self,
        key: &str,
        supplier: F,
    ) -> impl Future<Output = Result<Option<V>>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Option<V>> + Send,
    {
        self.load_or_save(key, supplier, Duration::ZERO)
    }

    /// Removes `key`. Missing keys are ignored.
    fn invalidate(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    fn invalidate_batch(&self, keys: &[String]) -> impl Future<Output = Result<()>> + Send;
}

// == Null Cache ==
/// A cache that stores nothing, for running with caching switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl<V> CacheFacade<V> for NullCache
where
    V: Clone + Send + Sync + 'static,
{
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn keys(&self, _pattern: &str) -> Result<HashSet<String>> {
        Ok(HashSet::new())
    }

    async fn save(&self, _key: &str, _value: V, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn save_batch(&self, _entries: HashMap<String, V>, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn load(&self, _key: &str) -> Result<Option<V>> {
        Ok(None)
    }

    async fn load_batch(&self, _keys: &[String]) -> Result<HashMap<String, V>> {
        Ok(HashMap::new())
    }

    async fn invalidate(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn invalidate_batch(&self, _keys: &[String]) -> Result<()> {
        Ok(())
    }
}
