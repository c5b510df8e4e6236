//! # Memory Sync
//!
//! A resilient memory layer that keeps several heterogeneous stores in step.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      MemoryManager                          │
//! │  • write / retrieve / search / EDRR-phase helpers          │
//! │  • Write-through into the layered cache                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 LayeredCache (L1 → L2 → ...)                │
//! │  • Strict LRU per layer                                    │
//! │  • Promotion on hit, exact hit ratio                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SyncManager                           │
//! │  • Snapshot/restore transactions across every store        │
//! │  • Fallback reads, parallel cross-store queries            │
//! │  • Update propagation with newest-wins conflicts           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ResilientStore (one per backend)               │
//! │  • Circuit breaker from a shared registry                  │
//! │  • Retry with exponential backoff and jitter               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                 Store adapters (document, vector, ...)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use memory_sync::{InMemoryStore, MemoryItem, MemoryManager, MemoryType};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), memory_sync::MemoryError> {
//!     let manager = MemoryManager::builder()
//!         .store("document", InMemoryStore::items_only())
//!         .store("vector", InMemoryStore::vectors_only(5))
//!         .build()?;
//!
//!     let id = manager
//!         .store_item(MemoryItem::new("", json!({"task": "plan"}), MemoryType::Working))
//!         .await?;
//!
//!     let record = manager.retrieve(&id).await?;
//!     assert_eq!(record.id(), id);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`manager`]: The [`MemoryManager`] façade
//! - [`sync`]: [`SyncManager`] and [`Transaction`]
//! - [`storage`]: The [`Store`] contract, in-memory adapter, resilient decorator
//! - [`resilience`]: Circuit breakers and retry policies
//! - [`cache`]: LRU and layered caches
//! - [`config`]: Serde-loadable [`MemoryConfig`]
//! - [`metrics`]: Counter registry and `metrics` facade helpers

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory_item;
pub mod metrics;
pub mod resilience;
pub mod storage;
pub mod sync;

pub use cache::{CacheError, CacheLayer, CacheStats, LayeredCache, TieredCache};
pub use config::{CircuitSettings, MemoryConfig, RetrySettings};
pub use error::MemoryError;
pub use manager::{embed_text, MemoryManager, MemoryManagerBuilder};
pub use memory_item::{EdrrPhase, MemoryItem, MemoryRecord, MemoryType, MemoryVector, RecordKind};
pub use metrics::{Counters, LatencyTimer};
pub use resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, CircuitError, CircuitState,
};
pub use resilience::retry::{retry, RetryConfig, RetryError, RetryPolicy};
pub use storage::memory::InMemoryStore;
pub use storage::resilient::ResilientStore;
pub use storage::traits::{MemoryQuery, Snapshot, StorageError, Store};
pub use sync::{
    ConflictRecord, PendingWrite, QueryResults, SyncManager, SyncStats, Transaction,
    TransactionState,
};
