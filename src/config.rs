//! Configuration for the memory subsystem.
//!
//! # Example
//!
//! ```
//! use memory_sync::MemoryConfig;
//!
//! // Minimal config (uses defaults)
//! let config = MemoryConfig::default();
//! assert_eq!(config.cache_layer_sizes, vec![128, 1024]);
//!
//! // Loaded from JSON, per-store overrides on top of the defaults
//! let config = MemoryConfig::from_json_str(r#"{
//!     "store_order": ["document", "vector"],
//!     "circuits": { "vector": { "failure_threshold": 2 } },
//!     "retry": { "max_retries": 1, "jitter": false }
//! }"#).unwrap();
//! assert_eq!(config.circuit_for("vector").failure_threshold, 2);
//! assert_eq!(config.circuit_for("document").failure_threshold, 5);
//! assert_eq!(config.retry_for("document").max_retries, 1);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::MemoryError;
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;

/// Configuration for the memory manager.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// LRU capacity per cache layer, fastest first
    #[serde(default = "default_cache_layer_sizes")]
    pub cache_layer_sizes: Vec<usize>,

    /// Cross-store query result cache capacity
    #[serde(default = "default_query_cache_size")]
    pub query_cache_size: usize,

    /// Store priority for reads and write order. Stores not listed follow
    /// in registration order.
    #[serde(default)]
    pub store_order: Vec<String>,

    /// Breaker settings for every store without an override
    #[serde(default)]
    pub circuit: CircuitSettings,
    #[serde(default)]
    pub circuits: HashMap<String, CircuitSettings>,

    /// Retry settings for every store without an override
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub retries: HashMap<String, RetrySettings>,

    /// Dimension of the fallback text embedding
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    /// Default delay before a scheduled background flush
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

/// Circuit breaker parameters, as loaded from config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

/// Retry parameters, as loaded from config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_cache_layer_sizes() -> Vec<usize> { vec![128, 1024] }
fn default_query_cache_size() -> usize { 256 }
fn default_embedding_dimension() -> usize { 5 }
fn default_flush_delay_ms() -> u64 { 100 }
fn default_failure_threshold() -> u32 { 5 }
fn default_reset_timeout_ms() -> u64 { 60_000 }
fn default_max_retries() -> usize { 3 }
fn default_initial_delay_ms() -> u64 { 100 }
fn default_max_delay_ms() -> u64 { 2_000 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_jitter() -> bool { true }

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            cache_layer_sizes: default_cache_layer_sizes(),
            query_cache_size: default_query_cache_size(),
            store_order: Vec::new(),
            circuit: CircuitSettings::default(),
            circuits: HashMap::new(),
            retry: RetrySettings::default(),
            retries: HashMap::new(),
            embedding_dimension: default_embedding_dimension(),
            flush_delay_ms: default_flush_delay_ms(),
        }
    }
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl From<&CircuitSettings> for CircuitConfig {
    fn from(settings: &CircuitSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: settings.backoff_factor,
            jitter: settings.jitter,
        }
    }
}

impl MemoryConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, MemoryError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MemoryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.embedding_dimension == 0 {
            return Err(MemoryError::Config("embedding_dimension must be > 0".into()));
        }
        let circuits = std::iter::once(("default", &self.circuit))
            .chain(self.circuits.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, circuit) in circuits {
            if circuit.failure_threshold == 0 {
                return Err(MemoryError::Config(format!(
                    "circuit '{}': failure_threshold must be >= 1",
                    name
                )));
            }
        }
        let retries = std::iter::once(("default", &self.retry))
            .chain(self.retries.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, retry) in retries {
            if !(retry.backoff_factor.is_finite() && retry.backoff_factor >= 1.0) {
                return Err(MemoryError::Config(format!(
                    "retry '{}': backoff_factor must be >= 1.0",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Breaker config for `store`, falling back to the default section
    #[must_use]
    pub fn circuit_for(&self, store: &str) -> CircuitConfig {
        self.circuits.get(store).unwrap_or(&self.circuit).into()
    }

    /// Retry config for `store`, falling back to the default section
    #[must_use]
    pub fn retry_for(&self, store: &str) -> RetryConfig {
        self.retries.get(store).unwrap_or(&self.retry).into()
    }

    #[must_use]
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}
