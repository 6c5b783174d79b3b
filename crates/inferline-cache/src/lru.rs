//! Least-recently-used result cache.
//!
//! A single mutex guards both the entry map and the recency index, so a
//! concurrent `get` and `put` on the same key can never leave the two out
//! of step.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use inferline_core::config::CacheWeigher;
use inferline_core::{Fingerprint, Prediction};

struct Entry {
    value: Prediction,
    size: u64,
    inserted_at: Instant,
    last_access: Instant,
    /// Position in the recency index.
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Fingerprint, Entry>,
    /// tick → fingerprint; the first key is the least recently used.
    recency: BTreeMap<u64, Fingerprint>,
    next_tick: u64,
    used: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Entry> {
        let entry = self.entries.remove(fingerprint)?;
        self.recency.remove(&entry.tick);
        self.used -= entry.size;
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<Fingerprint> {
        let (_, fingerprint) = self.recency.pop_first()?;
        if let Some(entry) = self.entries.remove(&fingerprint) {
            self.used -= entry.size;
        }
        Some(fingerprint)
    }
}

/// Counters and occupancy of a [`ResultCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub used: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Used capacity as a fraction of configured capacity.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64
    }
}

/// Bounded, fingerprint-keyed LRU cache of predictions.
pub struct ResultCache {
    inner: Mutex<Inner>,
    capacity: u64,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResultCache {
    /// Create a cache holding at most `capacity` size units.
    pub fn new(capacity: u64, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No critical section panics between paired map/index updates.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a prediction, refreshing its recency on a hit.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Prediction> {
        self.get_at(fingerprint, Instant::now())
    }

    pub fn get_at(&self, fingerprint: &Fingerprint, now: Instant) -> Option<Prediction> {
        let mut inner = self.lock();

        let stale = match inner.entries.get(fingerprint) {
            Some(entry) => self
                .ttl
                .is_some_and(|ttl| now.saturating_duration_since(entry.inserted_at) >= ttl),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if stale {
            inner.remove(fingerprint);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(%fingerprint, "cache entry expired");
            return None;
        }

        let tick = inner.bump();
        let entry = inner.entries.get_mut(fingerprint)?;
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        entry.last_access = now;
        let value = entry.value.clone();
        inner.recency.remove(&old_tick);
        inner.recency.insert(tick, *fingerprint);

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Store a prediction, evicting least-recently-used entries until the
    /// cache is back within capacity.
    ///
    /// Returns `false` if the entry alone exceeds capacity and was not stored.
    pub fn put(&self, fingerprint: Fingerprint, value: Prediction, size: u64) -> bool {
        self.put_at(fingerprint, value, size, Instant::now())
    }

    pub fn put_at(&self, fingerprint: Fingerprint, value: Prediction, size: u64, now: Instant) -> bool {
        if size > self.capacity {
            debug!(%fingerprint, size, capacity = self.capacity, "entry larger than cache, not stored");
            return false;
        }

        let mut inner = self.lock();
        inner.remove(&fingerprint);

        let tick = inner.bump();
        inner.entries.insert(
            fingerprint,
            Entry {
                value,
                size,
                inserted_at: now,
                last_access: now,
                tick,
            },
        );
        inner.recency.insert(tick, fingerprint);
        inner.used += size;

        while inner.used > self.capacity {
            match inner.evict_lru() {
                Some(evicted) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(fingerprint = %evicted, "evicted least-recently-used entry");
                }
                None => break,
            }
        }

        true
    }

    /// Whether a fingerprint is present, without touching recency or counters.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().entries.contains_key(fingerprint)
    }

    /// Time of the last hit (or insertion) for an entry.
    #[cfg(test)]
    pub(crate) fn last_access(&self, fingerprint: &Fingerprint) -> Option<Instant> {
        self.lock().entries.get(fingerprint).map(|e| e.last_access)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len() as u64,
            used: inner.used,
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Size estimate for a prediction under the configured weigher.
pub fn weigh(prediction: &Prediction, weigher: CacheWeigher) -> u64 {
    match weigher {
        CacheWeigher::Entries => 1,
        CacheWeigher::Bytes => serde_json::to_vec(prediction)
            .map(|b| b.len() as u64)
            .unwrap_or(u64::MAX),
    }
}
