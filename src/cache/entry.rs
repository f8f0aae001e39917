//! Cache Entry Module
//!
//! A single memory-tier slot: the value behind a reader/writer lock, an
//! expiry state word, and a version stamp for optimistic reads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, RwLockWriteGuard};

/// `expires_at` value for entries without a TTL
pub const NEVER_EXPIRES: i64 = 0;
/// `expires_at` value of a retired entry; it is never written again
pub const TOMBSTONE: i64 = -1;

// == Cache Entry ==
/// One memory-tier slot.
///
/// `expires_at` holds [`NEVER_EXPIRES`], [`TOMBSTONE`], or a Unix timestamp
/// in milliseconds. It only changes while the value's write lock is held,
/// bracketed by two `version` increments, so an even unchanged version
/// observed around a read proves the read saw one consistent state.
#[derive(Debug)]
pub struct CacheEntry<V> {
    version: AtomicU64,
    expires_at: AtomicI64,
    value: RwLock<V>,
}

impl<V: Clone> CacheEntry<V> {
    pub fn new(value: V, expires_at: i64) -> Self {
        Self {
            version: AtomicU64::new(0),
            expires_at: AtomicI64::new(expires_at),
            value: RwLock::new(value),
        }
    }

    // == Read ==
    /// Returns a clone of the value if the entry is live at `now`.
    ///
    /// Tries an optimistic read first and falls back to a blocking shared
    /// lock when a writer is active or finished mid-read.
    pub fn read(&self, now: i64) -> Option<V> {
        let stamp = self.version.load(Ordering::Acquire);
        if stamp % 2 == 0 {
            let state = self.expires_at.load(Ordering::Acquire);
            if let Some(guard) = self.value.try_read() {
                let value = is_live(state, now).then(|| guard.clone());
                drop(guard);
                if self.version.load(Ordering::Acquire) == stamp {
                    return value;
                }
            }
        }

        let guard = self.value.read();
        let state = self.expires_at.load(Ordering::Acquire);
        is_live(state, now).then(|| guard.clone())
    }

    /// Lock-free expiry check used when scanning the map.
    pub fn is_expired(&self, now: i64) -> bool {
        is_expired(self.expires_at.load(Ordering::Acquire), now)
    }

    /// Lock-free liveness check used when listing keys.
    pub fn is_live(&self, now: i64) -> bool {
        is_live(self.expires_at.load(Ordering::Acquire), now)
    }

    // == Write ==
    /// Takes the entry's exclusive lock.
    pub fn write(&self) -> EntryWriter<'_, V> {
        EntryWriter {
            entry: self,
            value: self.value.write(),
        }
    }
}

/// Exclusive access to one entry.
pub struct EntryWriter<'a, V> {
    entry: &'a CacheEntry<V>,
    value: RwLockWriteGuard<'a, V>,
}

impl<V: Clone> EntryWriter<'_, V> {
    fn state(&self) -> i64 {
        self.entry.expires_at.load(Ordering::Acquire)
    }

    pub fn is_tombstoned(&self) -> bool {
        self.state() < 0
    }

    pub fn is_expired(&self, now: i64) -> bool {
        is_expired(self.state(), now)
    }

    pub fn value_if_live(&self, now: i64) -> Option<V> {
        is_live(self.state(), now).then(|| self.value.clone())
    }

    /// Stores a new value and expiry. Must not be called on a tombstone.
    pub fn replace(&mut self, value: V, expires_at: i64) {
        debug_assert!(!self.is_tombstoned());
        self.entry.version.fetch_add(1, Ordering::AcqRel);
        *self.value = value;
        self.entry.expires_at.store(expires_at, Ordering::Release);
        self.entry.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks the entry as removed for good.
    pub fn retire(&mut self) {
        self.entry.version.fetch_add(1, Ordering::AcqRel);
        self.entry.expires_at.store(TOMBSTONE, Ordering::Release);
        self.entry.version.fetch_add(1, Ordering::AcqRel);
    }
}

fn is_live(state: i64, now: i64) -> bool {
    state == NEVER_EXPIRES || state > now
}

fn is_expired(state: i64, now: i64) -> bool {
    state > NEVER_EXPIRES && state <= now
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Expiry state for an entry written now with `ttl`.
///
/// A zero TTL never expires; anything shorter than a millisecond is rounded
/// up so it still expires.
pub fn expires_at_for(ttl: Duration) -> i64 {
    if ttl.is_zero() {
        return NEVER_EXPIRES;
    }
    let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
    current_timestamp_ms().saturating_add(millis)
}
