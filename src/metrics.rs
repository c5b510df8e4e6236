// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for memory-sync.
//!
//! Two surfaces:
//!
//! - Free functions that emit through the `metrics` crate facade. The host
//!   process chooses the exporter (Prometheus, OTEL, etc.).
//! - [`Counters`], an explicitly constructed, readable counter registry used
//!   for retry accounting and circuit-breaker transition counts. Unlike the
//!   facade it can be inspected and reset, which tests and dashboards need.
//!
//! # Metric Naming Convention
//! - `memory_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: registered store name
//! - `operation`: write, read, restore, search
//! - `status`: success, error, rejected

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};

/// Named monotonic counters with explicit reset.
///
/// Shared through an `Arc` handle; all mutation goes through the map's
/// shard locks so concurrent increments are never lost.
#[derive(Debug, Default)]
pub struct Counters {
    values: DashMap<String, u64>,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&self, key: &str, n: u64) {
        *self.values.entry(key.to_string()).or_insert(0) += n;
    }

    /// Current value (0 if never incremented)
    #[must_use]
    pub fn get(&self, key: &str) -> u64 {
        self.values.get(key).map_or(0, |v| *v)
    }

    /// Point-in-time copy, ordered by key
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn reset(&self) {
        self.values.clear();
    }
}

/// Record a store operation outcome
pub fn record_operation(store: &str, operation: &str, status: &str) {
    counter!(
        "memory_sync_operations_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "memory_sync_operation_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry-policy event (attempt, failure, success, retry, predicate)
pub fn record_retry_event(policy: &str, event: &str) {
    counter!(
        "memory_sync_retry_events_total",
        "policy" => policy.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "memory_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "memory_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record a transaction outcome (committed, rolled_back, rollback_failed)
pub fn record_transaction(outcome: &str) {
    counter!(
        "memory_sync_transactions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a conflict resolved during update propagation
pub fn record_conflict(store: &str) {
    counter!(
        "memory_sync_conflicts_total",
        "store" => store.to_string()
    )
    .increment(1);
}

/// Record a cache lookup
pub fn record_cache_lookup(cache: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "memory_sync_cache_lookups_total",
        "cache" => cache.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Set cache hit ratio gauge (0.0 - 1.0)
pub fn set_cache_hit_ratio(cache: &str, ratio: f64) {
    gauge!(
        "memory_sync_cache_hit_ratio",
        "cache" => cache.to_string()
    )
    .set(ratio);
}

/// Set deferred update queue depth
pub fn set_update_queue_depth(depth: usize) {
    gauge!("memory_sync_update_queue_depth").set(depth as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    store: String,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(store: impl Into<String>, operation: &'static str) -> Self {
        Self {
            store: store.into(),
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(&self.store, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Facade calls without an installed recorder must be no-ops, not panics.

    #[test]
    fn test_facade_functions_do_not_panic() {
        record_operation("lmdb", "write", "success");
        record_latency("lmdb", "read", Duration::from_micros(100));
        record_retry_event("lmdb.write", "attempt");
        record_circuit_breaker_call("lmdb", "rejected");
        set_circuit_state("lmdb", 2);
        record_transaction("rolled_back");
        record_conflict("kuzu");
        record_cache_lookup("layered", true);
        set_cache_hit_ratio("layered", 0.5);
        set_update_queue_depth(3);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("faiss", "search");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }

    #[test]
    fn test_counters_increment_and_read() {
        let counters = Counters::new();
        counters.increment("a");
        counters.increment("a");
        counters.add("b", 5);

        assert_eq!(counters.get("a"), 2);
        assert_eq!(counters.get("b"), 5);
        assert_eq!(counters.get("missing"), 0);
    }

    #[test]
    fn test_counters_snapshot_is_ordered() {
        let counters = Counters::new();
        counters.increment("z");
        counters.increment("a");

        let keys: Vec<String> = counters.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["a".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_counters_reset() {
        let counters = Counters::new();
        counters.increment("a");
        counters.reset();

        assert_eq!(counters.get("a"), 0);
        assert!(counters.snapshot().is_empty());
    }

    #[test]
    fn test_counters_concurrent_increments() {
        let counters = Arc::new(Counters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        c.increment("shared");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counters.get("shared"), 8000);
    }
}
