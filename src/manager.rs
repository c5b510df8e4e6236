// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-level façade.
//!
//! # Data Flow
//!
//! ```text
//! write ──▶ SyncManager transaction ──▶ ResilientStore ×N ──▶ Store ×N
//!             (commit or restore all)      (breaker + retry)
//!   └──────▶ LayeredCache::set_through (after commit)
//!
//! retrieve ──▶ LayeredCache ──hit──▶ value
//!                  │ miss
//!                  ▼
//!              SyncManager::read (priority order) ──▶ promote into layer 0
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::LayeredCache;
use crate::config::MemoryConfig;
use crate::error::MemoryError;
use crate::memory_item::{
    EdrrPhase, MemoryItem, MemoryRecord, MemoryType, MemoryVector, EDRR_PHASE_KEY,
};
use crate::metrics::Counters;
use crate::resilience::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::storage::memory::cosine_similarity;
use crate::storage::resilient::ResilientStore;
use crate::storage::traits::{MemoryQuery, Store};
use crate::sync::{QueryResults, SyncManager, SyncStats, Transaction};

/// Deterministic fallback embedding.
///
/// Character codes are summed into `dimension` buckets round-robin and the
/// result is divided by the text length. Empty text embeds to all zeros.
#[must_use]
pub fn embed_text(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];
    if dimension == 0 {
        return vector;
    }
    let mut length = 0usize;
    for (i, ch) in text.chars().enumerate() {
        vector[i % dimension] += ch as u32 as f32;
        length += 1;
    }
    if length > 0 {
        for v in &mut vector {
            *v /= length as f32;
        }
    }
    vector
}

/// Builder for [`MemoryManager`].
#[derive(Default)]
pub struct MemoryManagerBuilder {
    config: MemoryConfig,
    stores: Vec<(String, Arc<dyn Store>)>,
    registry: Option<Arc<CircuitBreakerRegistry>>,
    retry_counters: Option<Arc<Counters>>,
    cache: Option<LayeredCache<MemoryRecord>>,
}

impl MemoryManagerBuilder {
    #[must_use]
    pub fn config(mut self, config: MemoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a store. Registration order is the default priority order.
    #[must_use]
    pub fn store(self, name: impl Into<String>, store: impl Store + 'static) -> Self {
        self.shared_store(name, Arc::new(store))
    }

    /// Register a store the caller keeps a handle to.
    #[must_use]
    pub fn shared_store(mut self, name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        self.stores.push((name.into(), store));
        self
    }

    /// Share a breaker registry across managers (one is created otherwise).
    #[must_use]
    pub fn circuit_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn retry_counters(mut self, counters: Arc<Counters>) -> Self {
        self.retry_counters = Some(counters);
        self
    }

    /// Use a prebuilt cache instead of one sized from config.
    #[must_use]
    pub fn cache(mut self, cache: LayeredCache<MemoryRecord>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<MemoryManager, MemoryError> {
        self.config.validate()?;
        if self.stores.is_empty() {
            return Err(MemoryError::NoStores);
        }

        let mut seen = HashSet::new();
        for (name, _) in &self.stores {
            if !seen.insert(name.as_str()) {
                return Err(MemoryError::Config(format!("duplicate store '{}'", name)));
            }
        }
        for name in &self.config.store_order {
            if !seen.contains(name.as_str()) {
                return Err(MemoryError::Config(format!(
                    "store_order names unregistered store '{}'",
                    name
                )));
            }
        }

        // Listed stores first, in listed order; the rest keep registration order
        let mut ordered = Vec::with_capacity(self.stores.len());
        let mut remaining = self.stores;
        for name in &self.config.store_order {
            if let Some(pos) = remaining.iter().position(|(n, _)| n == name) {
                ordered.push(remaining.remove(pos));
            }
        }
        ordered.extend(remaining);

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(CircuitBreakerRegistry::default()));
        let retry_counters = self.retry_counters.unwrap_or_default();

        let wrapped: Vec<(String, Arc<dyn Store>)> = ordered
            .into_iter()
            .map(|(name, store)| {
                let breaker = registry.get_or_create(&name, self.config.circuit_for(&name));
                let resilient = ResilientStore::new(
                    name.clone(),
                    store,
                    breaker,
                    self.config.retry_for(&name),
                    retry_counters.clone(),
                );
                (name, Arc::new(resilient) as Arc<dyn Store>)
            })
            .collect();

        let cache = Arc::new(
            self.cache
                .unwrap_or_else(|| LayeredCache::with_sizes("memory", &self.config.cache_layer_sizes)),
        );
        let sync = Arc::new(SyncManager::new(wrapped, self.config.query_cache_size));
        // Direct, flushed and background updates all drop the cached copy
        let invalidated = Arc::clone(&cache);
        sync.on_item_updated(move |id| {
            invalidated.invalidate(id);
        });

        info!(stores = ?sync.store_names(), "Memory manager ready");
        Ok(MemoryManager {
            config: self.config,
            sync,
            cache,
            registry,
            retry_counters,
        })
    }
}

/// Resilient multi-store memory façade.
pub struct MemoryManager {
    config: MemoryConfig,
    sync: Arc<SyncManager>,
    cache: Arc<LayeredCache<MemoryRecord>>,
    registry: Arc<CircuitBreakerRegistry>,
    retry_counters: Arc<Counters>,
}

impl MemoryManager {
    #[must_use]
    pub fn builder() -> MemoryManagerBuilder {
        MemoryManagerBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[must_use]
    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    #[must_use]
    pub fn cache(&self) -> &LayeredCache<MemoryRecord> {
        &self.cache
    }

    #[must_use]
    pub fn circuit_registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Store names in priority order
    #[must_use]
    pub fn store_names(&self) -> Vec<&str> {
        self.sync.store_names()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Write to every store supporting the record kind, then to every cache layer.
    ///
    /// An empty id is replaced with a fresh UUID. Returns the id.
    pub async fn write(&self, mut record: MemoryRecord) -> Result<String, MemoryError> {
        if record.id().is_empty() {
            record.set_id(Uuid::new_v4().to_string());
        }
        let id = record.id().to_string();

        self.sync.write_record(record.clone()).await?;
        self.cache.set_through(&id, record);
        debug!(id = %id, "Record stored");
        Ok(id)
    }

    pub async fn store_item(&self, item: MemoryItem) -> Result<String, MemoryError> {
        self.write(item.into()).await
    }

    pub async fn store_vector(&self, vector: MemoryVector) -> Result<String, MemoryError> {
        self.write(vector.into()).await
    }

    /// Store `content` tagged with an EDRR phase.
    pub async fn store_with_edrr_phase(
        &self,
        content: Value,
        memory_type: MemoryType,
        phase: EdrrPhase,
        metadata: Option<Map<String, Value>>,
    ) -> Result<String, MemoryError> {
        let mut item = MemoryItem::new("", content, memory_type);
        item.metadata = metadata.unwrap_or_default();
        item.metadata
            .insert(EDRR_PHASE_KEY.to_string(), Value::String(phase.as_str().to_string()));
        self.store_item(item).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cache first, then stores in priority order. A store hit is promoted
    /// into the fastest cache layer.
    pub async fn retrieve(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
        if let Ok(record) = self.cache.get(id) {
            return Ok(record);
        }
        let record = self.sync.read(id).await?;
        self.cache.set(id, record.clone());
        Ok(record)
    }

    /// [`retrieve`](Self::retrieve) narrowed to structured items.
    pub async fn retrieve_item(&self, id: &str) -> Result<MemoryItem, MemoryError> {
        self.retrieve(id)
            .await?
            .into_item()
            .ok_or_else(|| MemoryError::NotFound { key: id.to_string() })
    }

    /// First item of `memory_type` tagged with `phase`.
    pub async fn retrieve_with_edrr_phase(
        &self,
        memory_type: MemoryType,
        phase: EdrrPhase,
    ) -> Result<MemoryItem, MemoryError> {
        let query = MemoryQuery::default()
            .with_type(memory_type.clone())
            .with_metadata(EDRR_PHASE_KEY, Value::String(phase.as_str().to_string()));
        self.search(query)
            .await
            .into_iter()
            .find_map(MemoryRecord::into_item)
            .ok_or_else(|| MemoryError::NotFound {
                key: format!("{}@{}", memory_type, phase),
            })
    }

    /// Every item tagged with `phase`.
    pub async fn query_by_edrr_phase(&self, phase: EdrrPhase) -> Vec<MemoryItem> {
        let query = MemoryQuery::default()
            .with_metadata(EDRR_PHASE_KEY, Value::String(phase.as_str().to_string()));
        self.search(query)
            .await
            .into_iter()
            .filter_map(MemoryRecord::into_item)
            .collect()
    }

    /// Query every store, merge in priority order, dedupe by id.
    ///
    /// With an embedding, vectors are re-ranked by similarity across stores.
    /// `limit` (if non-zero) applies to the merged list.
    pub async fn search(&self, query: MemoryQuery) -> Vec<MemoryRecord> {
        let mut by_store = self.sync.cross_store_query(&query).await;

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for name in self.sync.store_names() {
            for record in by_store.remove(name).unwrap_or_default() {
                if seen.insert(record.id().to_string()) {
                    merged.push(record);
                }
            }
        }

        if let Some(ref embedding) = query.embedding {
            let score = |record: &MemoryRecord| {
                record
                    .as_vector()
                    .map_or(f32::NEG_INFINITY, |v| cosine_similarity(&v.embedding, embedding))
            };
            merged.sort_by(|a, b| score(b).total_cmp(&score(a)));
        }
        if query.limit > 0 {
            merged.truncate(query.limit);
        }
        merged
    }

    /// Similarity search with the fallback text embedding.
    pub async fn similarity_search(&self, text: &str, top_k: usize) -> Vec<MemoryRecord> {
        let embedding = self.embed_text(text);
        self.similarity_search_embedding(embedding, top_k).await
    }

    pub async fn similarity_search_embedding(
        &self,
        embedding: Vec<f32>,
        top_k: usize,
    ) -> Vec<MemoryRecord> {
        self.search(MemoryQuery::similar_to(embedding, top_k)).await
    }

    pub async fn query_by_type(&self, memory_type: MemoryType) -> Vec<MemoryItem> {
        self.search(MemoryQuery::default().with_type(memory_type))
            .await
            .into_iter()
            .filter_map(MemoryRecord::into_item)
            .collect()
    }

    pub async fn query_by_metadata(&self, metadata: Map<String, Value>) -> Vec<MemoryRecord> {
        let query = MemoryQuery {
            metadata,
            ..MemoryQuery::default()
        };
        self.search(query).await
    }

    /// Fallback embedding at the configured dimension
    #[must_use]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        embed_text(text, self.config.embedding_dimension)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Synchronization
    // ═══════════════════════════════════════════════════════════════════════════

    /// Update `item` in `store` and propagate it. Cached copies are dropped.
    pub async fn update_item(&self, store: &str, item: MemoryItem) -> Result<(), MemoryError> {
        self.sync.update_item(store, item).await
    }

    pub async fn cross_store_query(&self, query: &MemoryQuery) -> QueryResults {
        self.sync.cross_store_query(query).await
    }

    pub fn queue_update(&self, store: &str, item: MemoryItem) -> Result<(), MemoryError> {
        // Stale as soon as queued
        self.cache.invalidate(&item.id);
        self.sync.queue_update(store, item)
    }

    /// Apply queued updates. Each applied id is dropped from the cache.
    pub async fn flush_updates(&self) -> Result<usize, MemoryError> {
        self.sync.flush_updates().await
    }

    /// Background flush after `delay` (config default if `None`).
    pub fn schedule_flush(&self, delay: Option<Duration>) {
        self.sync
            .schedule_flush(delay.unwrap_or_else(|| self.config.flush_delay()));
    }

    pub async fn wait_for_sync(&self) {
        self.sync.wait_for_sync().await;
    }

    /// Raw transaction over every store. Cache is not updated by its writes.
    pub fn begin_transaction(&self) -> Result<Transaction, MemoryError> {
        self.sync.begin()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Observability
    // ═══════════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn sync_stats(&self) -> SyncStats {
        self.sync.sync_stats()
    }

    /// Record count per store
    pub async fn store_sizes(&self) -> BTreeMap<String, usize> {
        self.sync.store_sizes().await
    }

    #[must_use]
    pub fn cache_hit_ratio(&self) -> f64 {
        let ratio = self.cache.hit_ratio();
        crate::metrics::set_cache_hit_ratio("memory", ratio);
        ratio
    }

    /// Breaker state per store
    #[must_use]
    pub fn circuit_states(&self) -> BTreeMap<String, CircuitState> {
        self.registry.states()
    }

    /// Transition counts keyed by `"<store>:<state>"`
    #[must_use]
    pub fn circuit_transitions(&self) -> BTreeMap<String, u64> {
        self.registry.transition_counts()
    }

    /// Retry counters keyed by `"<store>.<operation>:<event>"`
    #[must_use]
    pub fn retry_counters(&self) -> BTreeMap<String, u64> {
        self.retry_counters.snapshot()
    }

    /// Zero retry counters, transition counts, cache and sync stats.
    /// Breaker states are left alone.
    pub fn reset_metrics(&self) {
        self.retry_counters.reset();
        self.registry.transition_counters().reset();
        self.cache.reset_stats();
        self.sync.reset_stats();
    }
}
