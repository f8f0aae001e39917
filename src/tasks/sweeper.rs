//! TTL Sweeper Task
//!
//! Background task that periodically removes expired memory-tier entries.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::MemoryCache;

/// Spawns a background task that sweeps `cache` every `interval`.
///
/// Each pass runs on the blocking pool since it may briefly wait on entry
/// locks held by foreground writers.
///
/// # Arguments
/// * `cache` - Handle to the memory tier being swept
/// * `interval` - Time between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, aborted by the owner on shutdown.
pub fn spawn_sweeper_task<V>(cache: MemoryCache<V>, interval: Duration) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!("Starting TTL sweeper with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            let pass = cache.clone();
            let removed = match tokio::task::spawn_blocking(move || pass.sweep_expired()).await {
                Ok(removed) => removed,
                Err(err) => {
                    debug!("TTL sweep pass did not finish: {}", err);
                    continue;
                }
            };

            if removed > 0 {
                info!("TTL sweep: removed {} expired entries", removed);
            } else {
                debug!("TTL sweep: no expired entries found");
            }
        }
    })
}
