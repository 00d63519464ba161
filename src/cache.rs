//! Bounded key/value cache with least-recently-used eviction and a per-cache TTL.
//!
//! Recency is kept in a [`LinkedHashMap`]: the front is the least recently used entry,
//! the back the most recently used one. Expiry is lazy, an entry older than the TTL is
//! dropped the next time somebody asks for it.

use std::borrow::Borrow;
use std::hash::Hash;
use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

/// Point-in-time counters of a single cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries currently stored, expired ones included until they are touched.
    pub size: usize,
    /// Configured capacity, 0 when unbounded.
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// `hits / (hits + misses)`, zero before the first access.
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct Inner<K, V> {
    entries: LinkedHashMap<K, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Thread-safe LRU cache with time-based expiry.
///
/// A capacity of 0 disables the size bound, a TTL of zero disables expiry. Every call
/// runs inside a single short critical section.
pub struct LruCache<K, V> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Hash + Eq, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            inner: Mutex::new(Inner {
                entries: LinkedHashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up `key`, refreshing its recency on a hit.
    ///
    /// An entry older than the TTL is removed and reported as a miss.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.inner.lock();

        let Some((key, entry)) = inner.entries.remove_entry(key) else {
            inner.misses += 1;
            return None;
        };

        if self.is_expired(&entry) {
            inner.misses += 1;
            return None;
        }

        let value = entry.value.clone();
        inner.entries.insert(key, entry);
        inner.hits += 1;
        Some(value)
    }

    /// Insert or overwrite `key`, making it the most recently used entry.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        inner.entries.remove(&key);
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );

        if self.capacity == 0 {
            return;
        }
        while inner.entries.len() > self.capacity {
            if inner.entries.pop_front().is_none() {
                break;
            }
            inner.evictions += 1;
            trace!(capacity = self.capacity, "evicted least recently used entry");
        }
    }

    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().entries.remove(key);
    }

    /// Drop every entry whose key matches `pred`. Returns how many were removed.
    pub fn delete_matching(&self, pred: impl Fn(&K) -> bool) -> usize
    where
        K: Clone,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<K> = inner.entries.keys().filter(|k| pred(k)).cloned().collect();
        for key in &doomed {
            inner.entries.remove(key);
        }
        doomed.len()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            inner.hits as f64 / total as f64
        };

        CacheStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate,
        }
    }

    fn is_expired(&self, entry: &Entry<V>) -> bool {
        !self.ttl.is_zero() && entry.inserted_at.elapsed() > self.ttl
    }
}
