// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for transient failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use memory_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Query: several quick retries with a gentle backoff
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, 5);
//!
//! // Persistent: keep trying for a long time
//! let persistent = RetryConfig::persistent();
//! assert_eq!(persistent.max_retries, 10);
//! assert_eq!(persistent.max_delay, Duration::from_secs(300));
//! ```
//!
//! A [`RetryPolicy`] layers behavior on top of a config: which errors are
//! retryable, named predicates that retry on an unsatisfactory `Ok`, an
//! optional circuit breaker, counters and a deadline.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::metrics::Counters;

/// Configuration for operation retry behavior.
///
/// `max_retries` counts *additional* attempts, so an operation runs at most
/// `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Add up to 25% random extra delay to each backoff
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Quick retry for individual queries.
    /// Short first delay, gentle growth, capped at 5 seconds.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
            jitter: true,
        }
    }

    /// Persistent retry for operations that must eventually land.
    /// Many attempts, backoff capped at 5 minutes.
    #[must_use]
    pub fn persistent() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    /// Retry for remote backends reached over the network.
    #[must_use]
    pub fn network() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    /// Fast retry for tests (minimal delays, deterministic)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    /// Backoff before retry number `attempt + 1` (without jitter).
    #[must_use]
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

/// Error returned by [`RetryPolicy::run`]
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The last attempt's error, or a non-retryable one
    #[error("{0}")]
    Inner(E),

    /// The wrapped circuit breaker rejected the call; no attempts were spent waiting
    #[error("circuit '{circuit}' open, retry in {retry_after:?}")]
    CircuitOpen { circuit: String, retry_after: Duration },

    /// The next attempt could not start before the deadline
    #[error("deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: usize },
}

impl<E> RetryError<E> {
    /// The operation's own error, if that is what ended the sequence.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

type ErrorFilter<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type ResultPredicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type RetryHook = Box<dyn Fn(usize, Duration) + Send + Sync>;

/// A named retry policy for operations producing `Result<T, E>`.
///
/// Counters are recorded under `"<name>:attempts"`, `"<name>:failures"`,
/// `"<name>:successes"`, `"<name>:retries"`, `"<name>:circuit_open"` and
/// `"<name>:predicate:<predicate>"`.
pub struct RetryPolicy<T, E> {
    name: String,
    config: RetryConfig,
    retryable: Option<ErrorFilter<E>>,
    conditions: Vec<String>,
    predicates: Vec<(String, ResultPredicate<T>)>,
    breaker: Option<Arc<CircuitBreaker>>,
    counters: Option<Arc<Counters>>,
    deadline: Option<Instant>,
    on_retry: Option<RetryHook>,
}

impl<T, E> RetryPolicy<T, E> {
    /// New policy; every error is retryable until narrowed with [`retry_if`](Self::retry_if).
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            retryable: None,
            conditions: Vec::new(),
            predicates: Vec::new(),
            breaker: None,
            counters: None,
            deadline: None,
            on_retry: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Only errors matching `filter` (or a substring condition) are retried.
    #[must_use]
    pub fn retry_if(mut self, filter: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retryable = Some(Box::new(filter));
        self
    }

    /// Errors whose message contains any of `conditions` are retryable.
    #[must_use]
    pub fn retry_on_conditions<I, S>(mut self, conditions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.extend(conditions.into_iter().map(Into::into));
        self
    }

    /// Retry when `predicate` holds for a successful result.
    #[must_use]
    pub fn retry_when(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicates.push((name.into(), Box::new(predicate)));
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn with_counters(mut self, counters: Arc<Counters>) -> Self {
        self.counters = Some(counters);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Called before each backoff sleep with the upcoming retry number and delay.
    #[must_use]
    pub fn on_retry(mut self, hook: impl Fn(usize, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    fn count(&self, event: &str) {
        if let Some(ref counters) = self.counters {
            counters.increment(&format!("{}:{}", self.name, event));
        }
        crate::metrics::record_retry_event(&self.name, event);
    }

    fn triggered_predicate(&self, value: &T) -> Option<&str> {
        self.predicates
            .iter()
            .find(|(_, predicate)| predicate(value))
            .map(|(name, _)| name.as_str())
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.config.base_delay(attempt);
        if self.config.jitter && !base.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=0.25);
            base + base.mul_f64(extra)
        } else {
            base
        }
    }

    fn deadline_passed(&self, at: Instant) -> bool {
        self.deadline.is_some_and(|deadline| at >= deadline)
    }
}

impl<T, E: Display> RetryPolicy<T, E> {
    fn is_retryable(&self, err: &E) -> bool {
        match self.retryable {
            None => true,
            Some(ref filter) => filter(err) || self.matches_condition(err),
        }
    }

    fn matches_condition(&self, err: &E) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        let message = err.to_string();
        self.conditions.iter().any(|c| message.contains(c.as_str()))
    }

    /// Run `operation` under this policy.
    ///
    /// The last attempt's outcome is returned as-is: an `Ok` that still
    /// trips a predicate after the budget is spent is returned as `Ok`.
    pub async fn run<F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0usize;

        loop {
            if self.deadline_passed(Instant::now()) {
                warn!(policy = %self.name, attempts = attempt, "Retry deadline exceeded");
                return Err(RetryError::DeadlineExceeded { attempts: attempt });
            }

            self.count("attempts");
            let outcome = match self.breaker {
                Some(ref breaker) => match breaker.execute(|| operation()).await {
                    Ok(value) => Ok(value),
                    Err(CircuitError::Inner(e)) => Err(e),
                    Err(CircuitError::Rejected { circuit, retry_after }) => {
                        self.count("circuit_open");
                        return Err(RetryError::CircuitOpen { circuit, retry_after });
                    }
                },
                None => operation().await,
            };
            let exhausted = attempt >= self.config.max_retries;

            match outcome {
                Ok(value) => {
                    let trigger = self.triggered_predicate(&value).map(str::to_string);
                    match trigger {
                        Some(predicate) if !exhausted => {
                            self.count(&format!("predicate:{}", predicate));
                            debug!(
                                policy = %self.name,
                                predicate = %predicate,
                                attempt = attempt + 1,
                                "Result predicate requested retry"
                            );
                        }
                        trigger => {
                            if let Some(predicate) = trigger {
                                self.count(&format!("predicate:{}", predicate));
                            }
                            self.count("successes");
                            if attempt > 0 {
                                info!(policy = %self.name, retries = attempt, "Operation succeeded after retries");
                            }
                            return Ok(value);
                        }
                    }
                }
                Err(err) => {
                    self.count("failures");
                    if !self.is_retryable(&err) {
                        debug!(policy = %self.name, error = %err, "Non-retryable error");
                        return Err(RetryError::Inner(err));
                    }
                    if exhausted {
                        warn!(
                            policy = %self.name,
                            attempts = attempt + 1,
                            error = %err,
                            "Retries exhausted"
                        );
                        return Err(RetryError::Inner(err));
                    }
                    warn!(
                        policy = %self.name,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        error = %err,
                        "Operation failed, retrying"
                    );
                }
            }

            let delay = self.delay_for(attempt);
            let wake_at = Instant::now() + delay;
            if self.deadline_passed(wake_at) {
                warn!(policy = %self.name, attempts = attempt + 1, ?delay, "Next retry would miss the deadline");
                return Err(RetryError::DeadlineExceeded { attempts: attempt + 1 });
            }

            self.count("retries");
            if let Some(ref hook) = self.on_retry {
                hook(attempt + 1, delay);
            }
            sleep_until(wake_at).await;
            attempt += 1;
        }
    }
}

/// Run `operation` with a plain policy built from `config`.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    RetryPolicy::new(operation_name, config.clone())
        .run(operation)
        .await
}
