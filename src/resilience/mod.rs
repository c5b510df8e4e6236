//! Failure isolation for store calls.
//!
//! - [`circuit_breaker`]: fail fast on stores that keep failing
//! - [`retry`]: exponential backoff with predicates and deadlines

pub mod circuit_breaker;
pub mod retry;
