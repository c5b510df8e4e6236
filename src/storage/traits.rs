use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::memory_item::{MemoryRecord, MemoryType, RecordKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Snapshot was not produced by this store")]
    SnapshotMismatch,
    #[error("Record kind '{0}' not supported by this store")]
    Unsupported(RecordKind),
    #[error("Circuit '{circuit}' open, retry in {retry_after:?}")]
    CircuitOpen { circuit: String, retry_after: Duration },
    #[error("Deadline exceeded after {attempts} attempts")]
    Timeout { attempts: usize },
}

impl StorageError {
    /// Whether retrying the same call might succeed.
    ///
    /// Only backend failures are transient. A missing key, a malformed
    /// record or an open circuit will not change on a retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Opaque capture of a store's full state.
///
/// Produced by [`Store::snapshot`] and only meaningful to the store that
/// produced it. Cloning is cheap (shared pointer).
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<dyn Any + Send + Sync>,
}

impl Snapshot {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self { inner: Arc::new(state) }
    }

    /// Borrow the captured state as the concrete type the store expects.
    pub fn downcast_ref<T: Any>(&self) -> Result<&T, StorageError> {
        self.inner
            .downcast_ref::<T>()
            .ok_or(StorageError::SnapshotMismatch)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").finish_non_exhaustive()
    }
}

/// Query issued to every store by cross-store search.
///
/// All filters are conjunctive; an empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryQuery {
    /// Case-insensitive substring matched against item content / vector text
    pub text: Option<String>,
    pub memory_type: Option<MemoryType>,
    /// Exact-match metadata filters
    pub metadata: Map<String, Value>,
    /// Query embedding for similarity ranking of vectors
    pub embedding: Option<Vec<f32>>,
    /// Maximum results per store (0 = unlimited)
    pub limit: usize,
}

impl MemoryQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn similar_to(embedding: Vec<f32>, top_k: usize) -> Self {
        Self {
            embedding: Some(embedding),
            limit: top_k,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Stable key for result caching.
    pub(crate) fn cache_key(&self) -> String {
        format!(
            "text={:?}|type={:?}|meta={}|emb={:?}|limit={}",
            self.text,
            self.memory_type,
            Value::Object(self.metadata.clone()),
            self.embedding,
            self.limit
        )
    }
}

/// Capability contract every backend adapter implements.
///
/// The four required methods are the whole contract the sync layer relies
/// on. `search`, `supports` and `len` have permissive defaults so minimal
/// adapters stay minimal.
#[async_trait]
pub trait Store: Send + Sync {
    async fn write(&self, key: &str, record: MemoryRecord) -> Result<(), StorageError>;

    /// Returns [`StorageError::NotFound`] when the key is absent.
    async fn read(&self, key: &str) -> Result<MemoryRecord, StorageError>;

    /// Cheap, synchronous capture of the current state.
    fn snapshot(&self) -> Result<Snapshot, StorageError>;

    /// Replace the current state with `snapshot`. Idempotent, never partial.
    async fn restore(&self, snapshot: Snapshot) -> Result<(), StorageError>;

    /// Stores without a query engine contribute nothing to searches.
    async fn search(&self, _query: &MemoryQuery) -> Result<Vec<MemoryRecord>, StorageError> {
        Ok(Vec::new())
    }

    fn supports(&self, _kind: RecordKind) -> bool {
        true
    }

    /// Number of records held.
    async fn len(&self) -> Result<usize, StorageError> {
        Ok(0)
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn write(&self, key: &str, record: MemoryRecord) -> Result<(), StorageError> {
        (**self).write(key, record).await
    }

    async fn read(&self, key: &str) -> Result<MemoryRecord, StorageError> {
        (**self).read(key).await
    }

    fn snapshot(&self) -> Result<Snapshot, StorageError> {
        (**self).snapshot()
    }

    async fn restore(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        (**self).restore(snapshot).await
    }

    async fn search(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>, StorageError> {
        (**self).search(query).await
    }

    fn supports(&self, kind: RecordKind) -> bool {
        (**self).supports(kind)
    }

    async fn len(&self) -> Result<usize, StorageError> {
        (**self).len().await
    }
}
