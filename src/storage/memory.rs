use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::memory_item::{MemoryRecord, RecordKind};
use super::traits::{MemoryQuery, Snapshot, StorageError, Store};

type Records = HashMap<String, MemoryRecord>;

/// In-process reference store.
///
/// The whole map sits behind one `RwLock` so that [`Store::restore`] swaps
/// state in a single step and readers never observe a half-restored map.
/// Snapshots share the captured map through an `Arc`, so taking one costs a
/// clone of the map and restoring it costs another.
pub struct InMemoryStore {
    data: RwLock<Records>,
    dimension: Option<usize>,
    kinds: Option<RecordKind>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            dimension: None,
            kinds: None,
        }
    }

    /// Store that enforces a fixed embedding length for vectors.
    #[must_use]
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            ..Self::new()
        }
    }

    /// Store that only accepts structured items.
    #[must_use]
    pub fn items_only() -> Self {
        Self {
            kinds: Some(RecordKind::Item),
            ..Self::new()
        }
    }

    /// Vector-only store with a fixed embedding length.
    #[must_use]
    pub fn vectors_only(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            kinds: Some(RecordKind::Vector),
            ..Self::new()
        }
    }

    /// Get current record count
    #[must_use]
    pub fn count(&self) -> usize {
        self.data.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Clear all records
    pub fn clear(&self) {
        self.data.write().clear();
    }

    fn validate(&self, record: &MemoryRecord) -> Result<(), StorageError> {
        if !self.supports(record.kind()) {
            return Err(StorageError::Unsupported(record.kind()));
        }
        if let (Some(expected), MemoryRecord::Vector(vector)) = (self.dimension, record) {
            if vector.dimension() != expected {
                return Err(StorageError::DimensionMismatch {
                    expected,
                    actual: vector.dimension(),
                });
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cosine similarity; zero when either side has no magnitude.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for i in 0..len {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn matches_query(record: &MemoryRecord, query: &MemoryQuery) -> bool {
    if let Some(ref wanted) = query.memory_type {
        match record {
            MemoryRecord::Item(item) if &item.memory_type == wanted => {}
            _ => return false,
        }
    }
    if let Some(ref text) = query.text {
        let needle = text.to_lowercase();
        let haystack = match record {
            MemoryRecord::Item(item) => item.text(),
            MemoryRecord::Vector(vector) => vector.content.clone(),
        };
        if !haystack.to_lowercase().contains(&needle) {
            return false;
        }
    }
    let metadata = record.metadata();
    query
        .metadata
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn write(&self, key: &str, record: MemoryRecord) -> Result<(), StorageError> {
        self.validate(&record)?;
        self.data.write().insert(key.to_string(), record);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<MemoryRecord, StorageError> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn snapshot(&self) -> Result<Snapshot, StorageError> {
        Ok(Snapshot::new(Arc::new(self.data.read().clone())))
    }

    async fn restore(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        let state = snapshot.downcast_ref::<Arc<Records>>()?;
        *self.data.write() = (**state).clone();
        Ok(())
    }

    async fn search(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>, StorageError> {
        let data = self.data.read();
        let mut hits: Vec<MemoryRecord> = data
            .values()
            .filter(|record| matches_query(record, query))
            .cloned()
            .collect();

        match query.embedding {
            Some(ref embedding) => {
                // Similarity ranking only applies to vectors
                let mut scored: Vec<(f32, MemoryRecord)> = hits
                    .into_iter()
                    .filter_map(|record| {
                        let score = record
                            .as_vector()
                            .map(|v| cosine_similarity(&v.embedding, embedding))?;
                        Some((score, record))
                    })
                    .collect();
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                hits = scored.into_iter().map(|(_, record)| record).collect();
            }
            None => hits.sort_by(|a, b| a.id().cmp(b.id())),
        }

        if query.limit > 0 {
            hits.truncate(query.limit);
        }
        Ok(hits)
    }

    fn supports(&self, kind: RecordKind) -> bool {
        self.kinds.map_or(true, |only| only == kind)
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.count())
    }
}
