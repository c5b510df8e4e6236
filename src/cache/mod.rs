//! In-process caching in front of the stores.
//!
//! ```text
//! get(key)
//!    │
//!    ▼
//! ┌──────────┐  miss  ┌──────────┐  miss  ┌──────────┐  miss
//! │ layer 0  │ ─────▶ │ layer 1  │ ─────▶ │ layer n  │ ─────▶ NotFound
//! └──────────┘        └──────────┘        └──────────┘
//!      ▲                    │ hit
//!      └──── promote ───────┘
//! ```
//!
//! - [`tiered`]: one bounded LRU map ([`TieredCache`])
//! - [`layered`]: ordered chain of layers with promotion ([`LayeredCache`])

pub mod layered;
pub mod tiered;

pub use layered::LayeredCache;
pub use tiered::TieredCache;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Key '{key}' not present in any cache layer")]
    NotFound { key: String },
}

/// One level of a [`LayeredCache`].
///
/// Implementations own their entries and must be internally synchronized.
pub trait CacheLayer<V>: Send + Sync {
    fn name(&self) -> &str;

    /// Lookup. Counts toward recency where the layer tracks it.
    fn get(&self, key: &str) -> Option<V>;

    fn put(&self, key: &str, value: V);

    /// Presence check that does not touch recency.
    fn contains(&self, key: &str) -> bool;

    fn remove(&self, key: &str) -> Option<V>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Current number of entries
    pub entries: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
