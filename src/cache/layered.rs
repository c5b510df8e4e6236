//! Ordered chain of cache layers with promotion on hit.
//!
//! Layer 0 is the fastest/smallest. A hit at layer *i* copies the value into
//! layers `0..i`; the slower layer keeps its own copy.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{hit_rate, CacheError, CacheLayer, CacheStats, TieredCache};

#[derive(Debug, Default)]
struct LookupStats {
    hits: u64,
    misses: u64,
}

pub struct LayeredCache<V> {
    name: String,
    layers: Vec<Arc<dyn CacheLayer<V>>>,
    /// Held across probe + promotion; also guards the counters so the
    /// hit ratio is exact.
    stats: Mutex<LookupStats>,
}

impl<V: Clone + Send + Sync + 'static> LayeredCache<V> {
    pub fn new(name: impl Into<String>, layers: Vec<Arc<dyn CacheLayer<V>>>) -> Self {
        Self {
            name: name.into(),
            layers,
            stats: Mutex::new(LookupStats::default()),
        }
    }

    /// Build from LRU layer sizes, fastest first (`L1`, `L2`, ...).
    pub fn with_sizes(name: impl Into<String>, sizes: &[usize]) -> Self {
        let layers = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                Arc::new(TieredCache::<String, V>::named(format!("L{}", i + 1), size))
                    as Arc<dyn CacheLayer<V>>
            })
            .collect();
        Self::new(name, layers)
    }

    #[must_use]
    pub fn layers(&self) -> &[Arc<dyn CacheLayer<V>>] {
        &self.layers
    }

    #[must_use]
    pub fn layer(&self, index: usize) -> Option<&Arc<dyn CacheLayer<V>>> {
        self.layers.get(index)
    }

    /// Probe layers in order, promoting a hit into every faster layer.
    pub fn get(&self, key: &str) -> Result<V, CacheError> {
        let mut stats = self.stats.lock();

        for (depth, layer) in self.layers.iter().enumerate() {
            if let Some(value) = layer.get(key) {
                for faster in &self.layers[..depth] {
                    faster.put(key, value.clone());
                }
                stats.hits += 1;
                if depth > 0 {
                    trace!(cache = %self.name, key, from = layer.name(), "Promoted entry");
                }
                crate::metrics::record_cache_lookup(&self.name, true);
                return Ok(value);
            }
        }

        stats.misses += 1;
        crate::metrics::record_cache_lookup(&self.name, false);
        Err(CacheError::NotFound { key: key.to_string() })
    }

    /// Write layer 0 only.
    pub fn set(&self, key: &str, value: V) {
        let _guard = self.stats.lock();
        if let Some(first) = self.layers.first() {
            first.put(key, value);
        }
    }

    /// Write every layer.
    pub fn set_through(&self, key: &str, value: V) {
        let _guard = self.stats.lock();
        for layer in &self.layers {
            layer.put(key, value.clone());
        }
    }

    /// Remove `key` from every layer. Returns whether any layer held it.
    pub fn invalidate(&self, key: &str) -> bool {
        let _guard = self.stats.lock();
        let mut removed = false;
        for layer in &self.layers {
            removed |= layer.remove(key).is_some();
        }
        removed
    }

    /// Presence in any layer, without counting a lookup.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.layers.iter().any(|layer| layer.contains(key))
    }

    /// `hits / (hits + misses)` since creation or the last reset; `0.0` before any lookup.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let stats = self.stats.lock();
        hit_rate(stats.hits, stats.misses)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let stats = self.stats.lock();
        CacheStats {
            hits: stats.hits,
            misses: stats.misses,
            evictions: 0,
            entries: self.layers.iter().map(|layer| layer.len()).sum(),
            hit_rate: hit_rate(stats.hits, stats.misses),
        }
    }

    pub fn reset_stats(&self) {
        let mut stats = self.stats.lock();
        *stats = LookupStats::default();
    }

    /// Empty every layer. Stats are kept.
    pub fn clear(&self) {
        let _guard = self.stats.lock();
        for layer in &self.layers {
            layer.clear();
        }
        debug!(cache = %self.name, "Cleared all layers");
    }
}
