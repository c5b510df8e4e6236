//! Bounded LRU map.
//!
//! Entries carry the tick of their last use; a `BTreeMap` ordered by tick
//! gives the least-recently-used key in O(log n). Everything sits behind a
//! single mutex so recency updates never interleave.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::{hit_rate, CacheLayer, CacheStats};

struct LruState<K, V> {
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Hash + Eq + Clone, V> LruState<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some((owned, &(_, old))) = self.entries.get_key_value(key) else {
            return false;
        };
        let owned = owned.clone();
        let tick = self.next_tick();
        self.recency.remove(&old);
        self.recency.insert(tick, owned);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.1 = tick;
        }
        true
    }
}

/// Thread-safe LRU cache holding at most `max_size` entries.
///
/// `max_size == 0` stores nothing.
pub struct TieredCache<K, V> {
    name: String,
    max_size: usize,
    state: Mutex<LruState<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Hash + Eq + Clone, V: Clone> TieredCache<K, V> {
    pub fn new(max_size: usize) -> Self {
        Self::named("tiered", max_size)
    }

    pub fn named(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            max_size,
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Insert or replace. Returns the key evicted to make room, if any.
    pub fn put(&self, key: K, value: V) -> Option<K> {
        if self.max_size == 0 {
            return None;
        }
        let mut state = self.state.lock();

        if state.entries.contains_key(&key) {
            let tick = state.next_tick();
            if let Some((_, old)) = state.entries.insert(key.clone(), (value, tick)) {
                state.recency.remove(&old);
            }
            state.recency.insert(tick, key);
            return None;
        }

        let mut evicted = None;
        if state.entries.len() >= self.max_size {
            if let Some((_, lru)) = state.recency.pop_first() {
                state.entries.remove(&lru);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted = Some(lru);
            }
        }

        let tick = state.next_tick();
        state.recency.insert(tick, key.clone());
        state.entries.insert(key, (value, tick));
        if evicted.is_some() {
            trace!(cache = %self.name, "Evicted least-recently-used entry");
        }
        evicted
    }

    /// Lookup, refreshing recency on a hit.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut state = self.state.lock();
        if state.touch(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            state.entries.get(key).map(|(v, _)| v.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state.lock().entries.contains_key(key)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut state = self.state.lock();
        let (value, tick) = state.entries.remove(key)?;
        state.recency.remove(&tick);
        Some(value)
    }

    /// Keys from least to most recently used
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.state.lock().recency.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.recency.clear();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
            hit_rate: hit_rate(hits, misses),
        }
    }
}

impl<V: Clone + Send + Sync> CacheLayer<V> for TieredCache<String, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<V> {
        TieredCache::get(self, key)
    }

    fn put(&self, key: &str, value: V) {
        TieredCache::put(self, key.to_string(), value);
    }

    fn contains(&self, key: &str) -> bool {
        TieredCache::contains(self, key)
    }

    fn remove(&self, key: &str) -> Option<V> {
        TieredCache::remove(self, key)
    }

    fn len(&self) -> usize {
        TieredCache::len(self)
    }

    fn clear(&self) {
        TieredCache::clear(self);
    }
}
