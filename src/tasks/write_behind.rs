//! Write-Behind Workers
//!
//! Bounded per-worker queues of persistent-tier writes, routed by key.
//! Used by the coordinator in async upstream mode.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cache::StatsRecorder;
use crate::error::{CacheError, Result};
use crate::store::FileStore;

// == Write Job ==
/// One deferred write to the persistent tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteJob {
    Save { key: String, value: String },
    Batch(HashMap<String, String>),
}

impl WriteJob {
    /// Runs the write against `store`.
    pub async fn apply(self, store: &FileStore) -> Result<()> {
        match self {
            WriteJob::Save { key, value } => store.persist(key, value).await.map(|_| ()),
            WriteJob::Batch(entries) => store.persist_batch(entries).await.map(|_| ()),
        }
    }

    fn describe(&self) -> String {
        match self {
            WriteJob::Save { key, .. } => format!("save of {:?}", key),
            WriteJob::Batch(entries) => format!("batch of {} entries", entries.len()),
        }
    }
}

// == Write Behind ==
/// Handle to the queues and their workers.
///
/// Every key belongs to exactly one worker, so writes to the same key are
/// applied in the order they were submitted.
#[derive(Debug)]
pub struct WriteBehind {
    senders: Mutex<Option<Vec<mpsc::Sender<WriteJob>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteBehind {
    /// Starts `workers` tasks draining about `capacity` queued jobs into `store`.
    ///
    /// Both values are raised to at least one. Must be called inside a Tokio
    /// runtime.
    pub(crate) fn spawn(
        store: FileStore,
        workers: usize,
        capacity: usize,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        let workers = workers.max(1);
        let per_worker = capacity.max(1).div_ceil(workers);

        let (senders, handles): (Vec<_>, Vec<_>) = (0..workers)
            .map(|id| {
                let (sender, receiver) = mpsc::channel(per_worker);
                let handle = tokio::spawn(run_worker(
                    id,
                    store.clone(),
                    receiver,
                    Arc::clone(&stats),
                ));
                (sender, handle)
            })
            .unzip();
        info!(
            "Write-behind started: {} workers, {} queued jobs each",
            workers, per_worker
        );

        Self {
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(handles),
        }
    }

    /// Queues `job` on the worker owning its keys, waiting for room when that
    /// queue is full. A batch spanning several workers is split between them.
    ///
    /// Fails with [`CacheError::Closed`] once [`WriteBehind::shutdown`] ran.
    pub async fn submit(&self, job: WriteJob) -> Result<()> {
        let senders = self.senders.lock().clone().ok_or(CacheError::Closed)?;

        match job {
            WriteJob::Save { key, value } => {
                let sender = &senders[worker_for(&key, senders.len())];
                sender
                    .send(WriteJob::Save { key, value })
                    .await
                    .map_err(|_| CacheError::Closed)
            }
            WriteJob::Batch(entries) => {
                let mut parts: Vec<HashMap<String, String>> =
                    vec![HashMap::new(); senders.len()];
                for (key, value) in entries {
                    parts[worker_for(&key, senders.len())].insert(key, value);
                }
                for (sender, part) in senders.iter().zip(parts) {
                    if part.is_empty() {
                        continue;
                    }
                    sender
                        .send(WriteJob::Batch(part))
                        .await
                        .map_err(|_| CacheError::Closed)?;
                }
                Ok(())
            }
        }
    }

    /// Closes the queues and waits until every queued job has been applied.
    pub async fn shutdown(&self) {
        drop(self.senders.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(err) = handle.await {
                error!("Write-behind worker ended abnormally: {}", err);
            }
        }
        info!("Write-behind drained");
    }
}

/// Index of the worker that owns `key`.
fn worker_for(key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn run_worker(
    id: usize,
    store: FileStore,
    mut receiver: mpsc::Receiver<WriteJob>,
    stats: Arc<StatsRecorder>,
) {
    while let Some(job) = receiver.recv().await {
        let label = job.describe();
        if let Err(err) = job.apply(&store).await {
            stats.record_write_failure();
            error!(worker = id, "Write-behind {} failed: {}", label, err);
        }
    }
    debug!(worker = id, "Write-behind worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheFacade;
    use crate::store::StorePaths;

    async fn open_store(dir: &tempfile::TempDir) -> FileStore {
        FileStore::open(StorePaths::from_base(dir.path().join("wb")))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let stats = Arc::new(StatsRecorder::default());
        let writer = WriteBehind::spawn(store.clone(), 3, 4, Arc::clone(&stats));

        for i in 0..50 {
            writer
                .submit(WriteJob::Save {
                    key: format!("key-{:02}", i),
                    value: i.to_string(),
                })
                .await
                .unwrap();
        }
        writer
            .submit(WriteJob::Batch(HashMap::from([(
                "batch".to_string(),
                "yes".to_string(),
            )])))
            .await
            .unwrap();
        writer.shutdown().await;

        assert_eq!(store.len(), 51);
        assert_eq!(store.load("key-42").await.unwrap().as_deref(), Some("42"));
        assert_eq!(stats.snapshot().write_failures, 0);
    }

    #[test]
    fn test_worker_for_is_stable_and_in_range() {
        for key in ["a", "bonjour", "привет", ""] {
            let worker = worker_for(key, 4);
            assert!(worker < 4);
            assert_eq!(worker_for(key, 4), worker);
            assert_eq!(worker_for(key, 1), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_queued_value_for_a_key_wins() {
        for round in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let store = open_store(&dir).await;
            let writer = WriteBehind::spawn(store.clone(), 4, 8, Arc::default());

            for i in 0..8 {
                writer
                    .submit(WriteJob::Save {
                        key: format!("filler-{}", i),
                        value: "f".into(),
                    })
                    .await
                    .unwrap();
            }
            for value in ["first", "second"] {
                writer
                    .submit(WriteJob::Save {
                        key: "k".into(),
                        value: value.into(),
                    })
                    .await
                    .unwrap();
            }
            writer
                .submit(WriteJob::Batch(HashMap::from([
                    ("k".to_string(), "batched".to_string()),
                    ("other".to_string(), "o".to_string()),
                ])))
                .await
                .unwrap();
            writer.shutdown().await;

            assert_eq!(
                store.load("k").await.unwrap().as_deref(),
                Some("first"),
                "round {}",
                round
            );
            assert_eq!(store.len(), 10);
        }
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let writer = WriteBehind::spawn(store, 1, 1, Arc::default());
        writer.shutdown().await;

        let job = WriteJob::Save {
            key: "late".into(),
            value: "v".into(),
        };
        assert!(matches!(writer.submit(job).await, Err(CacheError::Closed)));
    }

    #[tokio::test]
    async fn test_failures_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        // never initialized, so every write fails with Closed
        let store = FileStore::new(StorePaths::from_base(dir.path().join("wb")));
        let stats = Arc::new(StatsRecorder::default());
        let writer = WriteBehind::spawn(store, 2, 8, Arc::clone(&stats));

        for key in ["a", "b", "c"] {
            writer
                .submit(WriteJob::Save {
                    key: key.into(),
                    value: "v".into(),
                })
                .await
                .unwrap();
        }
        writer.shutdown().await;
        assert_eq!(stats.snapshot().write_failures, 3);
    }
}
