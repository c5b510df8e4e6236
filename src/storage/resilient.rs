// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker + retry decorator for any [`Store`].
//!
//! Only transient failures ([`StorageError::is_transient`]) count against the
//! breaker and get retried. A `NotFound` or a dimension mismatch passes
//! straight through: the backend answered, it just said no.
//!
//! `restore` retries but never goes through the breaker. It is the rollback
//! path, and rejecting it would turn a recoverable write failure into an
//! inconsistent state.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::traits::{MemoryQuery, Snapshot, StorageError, Store};
use crate::memory_item::{MemoryRecord, RecordKind};
use crate::metrics::{self, Counters, LatencyTimer};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::{RetryConfig, RetryError, RetryPolicy};

pub struct ResilientStore<S> {
    name: String,
    inner: S,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    counters: Arc<Counters>,
}

impl<S: Store> ResilientStore<S> {
    pub fn new(
        name: impl Into<String>,
        inner: S,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            name: name.into(),
            inner,
            breaker,
            retry,
            counters,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn policy<T>(&self, operation: &str) -> RetryPolicy<T, StorageError> {
        RetryPolicy::new(format!("{}.{}", self.name, operation), self.retry.clone())
            .with_counters(self.counters.clone())
    }

    /// Run one store call under retry, optionally behind the breaker.
    async fn guarded<T, F, Fut>(
        &self,
        operation: &'static str,
        use_breaker: bool,
        mut call: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
        T: Send,
    {
        let _timer = LatencyTimer::new(self.name.clone(), operation);
        let mut policy = self.policy::<Result<T, StorageError>>(operation);
        if use_breaker {
            policy = policy.with_circuit_breaker(self.breaker.clone());
        }

        // Permanent errors ride inside Ok so neither the breaker nor the
        // retry loop treats them as backend failures.
        let outcome = policy
            .run(|| {
                let fut = call();
                async move {
                    match fut.await {
                        Err(e) if e.is_transient() => Err(e),
                        answered => Ok(answered),
                    }
                }
            })
            .await;

        let result = match outcome {
            Ok(answered) => answered,
            Err(RetryError::Inner(e)) => Err(e),
            Err(RetryError::CircuitOpen { circuit, retry_after }) => {
                Err(StorageError::CircuitOpen { circuit, retry_after })
            }
            Err(RetryError::DeadlineExceeded { attempts }) => Err(StorageError::Timeout { attempts }),
        };

        let status = match &result {
            Ok(_) => "success",
            Err(StorageError::NotFound) => "not_found",
            Err(StorageError::CircuitOpen { .. }) => "rejected",
            Err(_) => "error",
        };
        debug!(store = %self.name, operation, status, "Store call finished");
        metrics::record_operation(&self.name, operation, status);
        result
    }
}

#[async_trait]
impl<S: Store> Store for ResilientStore<S> {
    async fn write(&self, key: &str, record: MemoryRecord) -> Result<(), StorageError> {
        self.guarded("write", true, || self.inner.write(key, record.clone()))
            .await
    }

    async fn read(&self, key: &str) -> Result<MemoryRecord, StorageError> {
        self.guarded("read", true, || self.inner.read(key)).await
    }

    fn snapshot(&self) -> Result<Snapshot, StorageError> {
        self.inner.snapshot()
    }

    async fn restore(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.guarded("restore", false, || self.inner.restore(snapshot.clone()))
            .await
    }

    async fn search(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>, StorageError> {
        self.guarded("search", true, || self.inner.search(query)).await
    }

    fn supports(&self, kind: RecordKind) -> bool {
        self.inner.supports(kind)
    }

    async fn len(&self) -> Result<usize, StorageError> {
        self.guarded("len", true, || self.inner.len()).await
    }
}
