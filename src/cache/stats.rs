//! Cache Statistics Module
//!
//! Tracks where coordinator reads were served from and how writes fared.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Point-in-time snapshot of coordinator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads answered by the memory tier
    pub memory_hits: u64,
    /// Reads answered by the persistent tier after a memory miss
    pub store_hits: u64,
    /// Reads neither tier could answer
    pub misses: u64,
    /// Writes handed to the write-behind workers
    pub writes_queued: u64,
    /// Write-behind jobs that failed in the background
    pub write_failures: u64,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the overall hit rate.
    ///
    /// Returns hits / (hits + misses) across both tiers, or 0.0 if nothing
    /// has been read yet.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.store_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// == Stats Recorder ==
/// Lock-free counters shared between the coordinator and its workers.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    memory_hits: AtomicU64,
    store_hits: AtomicU64,
    misses: AtomicU64,
    writes_queued: AtomicU64,
    write_failures: AtomicU64,
}

impl StatsRecorder {
    pub fn record_memory_hits(&self, n: u64) {
        self.memory_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_store_hits(&self, n: u64) {
        self.store_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_misses(&self, n: u64) {
        self.misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.writes_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes_queued: self.writes_queued.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_no_requests() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_counts_both_tiers() {
        let stats = CacheStats {
            memory_hits: 2,
            store_hits: 1,
            misses: 1,
            ..CacheStats::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_recorder_snapshot() {
        let recorder = StatsRecorder::default();
        recorder.record_memory_hits(3);
        recorder.record_store_hits(1);
        recorder.record_misses(2);
        recorder.record_queued();
        recorder.record_queued();
        recorder.record_write_failure();

        let stats = recorder.snapshot();
        assert_eq!(stats.memory_hits, 3);
        assert_eq!(stats.store_hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.writes_queued, 2);
        assert_eq!(stats.write_failures, 1);
    }

    #[test]
    fn test_stats_serialize() {
        let json = serde_json::to_value(CacheStats::default()).unwrap();
        assert_eq!(json["memory_hits"], 0);
        assert_eq!(json["write_failures"], 0);
    }
}
