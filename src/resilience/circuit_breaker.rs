// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker pattern.
//!
//! Protects callers from cascading failures when a backing store is
//! unhealthy. Wraps async operations, counts consecutive failures and
//! "trips" once the threshold is reached so further calls fail fast.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Store unhealthy, requests fail-fast without attempting
//! - HalfOpen: Exactly one trial request probes recovery
//!
//! The OPEN → HALF_OPEN transition is evaluated lazily at call time: no
//! timer runs in the background, the elapsed time since the last failure is
//! compared against `reset_timeout` when the next call arrives.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::metrics::Counters;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker '{circuit}' open, request rejected (retry in {retry_after:?})")]
    Rejected { circuit: String, retry_after: Duration },

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Aggressive config for critical stores (trips faster, waits longer)
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(120),
        }
    }

    /// Lenient config for cache-like stores (tolerates more failures)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(50),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,
    transitions: Option<Arc<Counters>>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

/// Clears the half-open trial slot if the trial future is dropped before
/// it completes, so the next caller can probe instead of being locked out.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
            }
            debug!(circuit = %self.breaker.name, "Trial call cancelled before completion");
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            transitions: None,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Count state transitions into `counters` under `"<name>:<state>"`.
    #[must_use]
    pub fn with_transition_counters(mut self, counters: Arc<Counters>) -> Self {
        self.transitions = Some(counters);
        self
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Get current circuit state (as last recorded; an expired OPEN circuit
    /// reports OPEN until the next call probes it)
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures since the last success
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, so nothing runs when the
    /// circuit rejects the call.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = match self.admit() {
            Ok(trial) => trial,
            Err(retry_after) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, ?retry_after, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
                return Err(CircuitError::Rejected {
                    circuit: self.name.clone(),
                    retry_after,
                });
            }
        };

        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let mut guard = TrialGuard { breaker: self, armed: trial };
        let result = f().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, trial, "Circuit call succeeded");
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                self.on_success(trial);
                Ok(value)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, trial, "Circuit call failed");
                crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                self.on_failure(trial);
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Decide whether a call may proceed. `Ok(true)` marks the half-open trial;
    /// `Err` carries the remaining open time.
    fn admit(&self) -> Result<bool, Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(self.config.reset_timeout, |at| at.elapsed());
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.config.reset_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial && inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
            inner.consecutive_failures = 0;
            self.transition(&mut inner, CircuitState::Closed);
            info!(circuit = %self.name, "Circuit recovered");
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        if trial && inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
            self.transition(&mut inner, CircuitState::Open);
            warn!(circuit = %self.name, "Trial call failed, circuit re-opened");
        } else if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            self.transition(&mut inner, CircuitState::Open);
            warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                "Circuit breaker tripped"
            );
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        if inner.state == to {
            return;
        }
        debug!(circuit = %self.name, from = %inner.state, to = %to, "Circuit state transition");
        inner.state = to;
        crate::metrics::set_circuit_state(&self.name, to as u8);
        if let Some(ref counters) = self.transitions {
            counters.increment(&format!("{}:{}", self.name, to));
        }
    }

    /// Force the breaker back to CLOSED with a clean failure count
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Get total number of admitted calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate over admitted calls (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    /// Reset all metrics
    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}

/// Process-scoped registry of named breakers.
///
/// Repeated lookups of the same name return the same shared instance, so
/// every caller touching one store sees one failure history. Construct it
/// explicitly and pass the handle around; [`reset`](Self::reset) tears it
/// down between tests.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitConfig,
    transitions: Arc<Counters>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            transitions: Arc::new(Counters::new()),
        }
    }

    /// Breaker for `name`, created with the registry defaults on first use
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.defaults.clone())
    }

    /// Breaker for `name`; `config` only applies if it does not exist yet
    pub fn get_or_create(&self, name: &str, config: CircuitConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(circuit = %name, ?config, "Registering circuit breaker");
                Arc::new(
                    CircuitBreaker::new(name, config)
                        .with_transition_counters(self.transitions.clone()),
                )
            })
            .clone()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.breakers.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Current state of every registered breaker
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    /// Transition counts keyed by `"<resource>:<state>"`
    #[must_use]
    pub fn transition_counts(&self) -> BTreeMap<String, u64> {
        self.transitions.snapshot()
    }

    #[must_use]
    pub fn transition_counters(&self) -> Arc<Counters> {
        self.transitions.clone()
    }

    /// Drop every breaker and zero the transition counters
    pub fn reset(&self) {
        self.breakers.clear();
        self.transitions.reset();
    }
}
