// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-store synchronization.
//!
//! The [`SyncManager`] owns the ordered list of registered stores and
//! provides:
//!
//! - Transactions ([`Transaction`], [`SyncManager::transaction`]) with
//!   snapshot-based rollback across every store
//! - First-success fallback reads
//! - Parallel cross-store queries with a result cache
//! - Update propagation with newest-wins conflict resolution
//! - A deferred update queue with background flushing
//!
//! # Write Path
//!
//! ```text
//! transaction(|tx| ...)
//!    │
//!    ├─ snapshot every store (registration order)
//!    ├─ tx.write(key, record) ─▶ store 0 ─▶ store 1 ─▶ ... (sequential)
//!    │
//!    ├─ Ok  ─▶ commit
//!    └─ Err ─▶ restore every store ─▶ original error
//!                  │
//!                  └─ restore failed ─▶ RollbackFailed
//! ```

pub mod transaction;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::TieredCache;
use crate::error::MemoryError;
use crate::memory_item::{now_millis, MemoryItem, MemoryRecord, RecordKind};
use crate::storage::traits::{MemoryQuery, StorageError, Store};

pub use transaction::{PendingWrite, Transaction, TransactionState};

/// Per-store results of a cross-store query, keyed by store name.
pub type QueryResults = BTreeMap<String, Vec<MemoryRecord>>;

/// Synchronization statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Records confirmed written to every store that supports them
    pub synchronized: u64,
    /// Conflicts resolved during update propagation
    pub conflicts: u64,
    /// Updates waiting in the deferred queue
    pub queued: usize,
}

/// One resolved disagreement between stores.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub id: String,
    /// Store holding the `existing` version
    pub store: String,
    pub existing: MemoryItem,
    pub incoming: MemoryItem,
    pub chosen: MemoryItem,
    /// Resolution time (epoch millis)
    pub resolved_at: i64,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    store: String,
    item: MemoryItem,
}

/// Called with the id of every item `update_item` commits.
pub type UpdateHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Default)]
struct Counts {
    synchronized: u64,
    conflicts: u64,
}

pub struct SyncManager {
    stores: Vec<(String, Arc<dyn Store>)>,
    query_cache: Arc<TieredCache<String, QueryResults>>,
    counts: Mutex<Counts>,
    conflict_log: Mutex<Vec<ConflictRecord>>,
    queue: Mutex<VecDeque<QueuedUpdate>>,
    /// Serializes flushes so queued updates apply in order
    flush_lock: tokio::sync::Mutex<()>,
    pending_flushes: Mutex<Vec<JoinHandle<()>>>,
    update_hooks: Mutex<Vec<UpdateHook>>,
}

impl SyncManager {
    /// Stores are consulted and written in the order given.
    pub fn new(stores: Vec<(String, Arc<dyn Store>)>, query_cache_size: usize) -> Self {
        Self {
            stores,
            query_cache: Arc::new(TieredCache::named("query", query_cache_size)),
            counts: Mutex::new(Counts::default()),
            conflict_log: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            pending_flushes: Mutex::new(Vec::new()),
            update_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Register `hook` to run after each committed [`update_item`](Self::update_item),
    /// including the ones applied by a flush.
    pub fn on_item_updated(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.update_hooks.lock().push(Arc::new(hook));
    }

    /// Registered store names in priority order
    #[must_use]
    pub fn store_names(&self) -> Vec<&str> {
        self.stores.iter().map(|(name, _)| name.as_str()).collect()
    }

    #[must_use]
    pub fn store(&self, name: &str) -> Option<&Arc<dyn Store>> {
        self.stores
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, store)| store)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Transactions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open a transaction over every registered store.
    pub fn begin(&self) -> Result<Transaction, MemoryError> {
        Transaction::begin(self.stores.clone(), Some(self.query_cache.clone()))
    }

    /// Open a transaction over the named stores (kept in registration order).
    pub fn begin_on(&self, names: &[&str]) -> Result<Transaction, MemoryError> {
        if let Some(unknown) = names.iter().find(|n| self.store(n).is_none()) {
            return Err(MemoryError::UnknownStore((*unknown).to_string()));
        }
        let selected = self
            .stores
            .iter()
            .filter(|(name, _)| names.contains(&name.as_str()))
            .cloned()
            .collect();
        Transaction::begin(selected, Some(self.query_cache.clone()))
    }

    /// Run `f` inside a transaction over every store.
    ///
    /// `Ok` commits. `Err` restores every store and returns the original
    /// error, or [`MemoryError::RollbackFailed`] if a restore failed.
    ///
    /// ```no_run
    /// # use memory_sync::{SyncManager, MemoryItem, MemoryType};
    /// # async fn demo(sync: &SyncManager) -> Result<(), memory_sync::MemoryError> {
    /// let item = MemoryItem::new("x", serde_json::json!("v"), MemoryType::Working);
    /// sync.transaction(move |tx| {
    ///     Box::pin(async move { tx.write("x", item.into()).await })
    /// })
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, MemoryError>>,
    {
        let tx = self.begin()?;
        Self::run_scoped(tx, f).await
    }

    /// [`transaction`](Self::transaction) restricted to the named stores.
    pub async fn transaction_on<T, F>(&self, names: &[&str], f: F) -> Result<T, MemoryError>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, MemoryError>>,
    {
        let tx = self.begin_on(names)?;
        Self::run_scoped(tx, f).await
    }

    async fn run_scoped<T, F>(mut tx: Transaction, f: F) -> Result<T, MemoryError>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, MemoryError>>,
    {
        let outcome = f(&mut tx).await;
        match outcome {
            Ok(value) if tx.is_open() => {
                tx.commit()?;
                Ok(value)
            }
            Ok(_) => {
                // A write failed but the closure swallowed the error
                let closed = MemoryError::TransactionClosed(tx.id());
                Err(tx.abort(closed).await)
            }
            Err(e) => Err(tx.abort(e).await),
        }
    }

    /// Write `record` to every store that supports its kind, atomically.
    pub async fn write_record(&self, record: MemoryRecord) -> Result<(), MemoryError> {
        let key = record.id().to_string();
        self.transaction(move |tx| Box::pin(async move { tx.write(&key, record).await }))
            .await?;
        self.counts.lock().synchronized += 1;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// First successful read in priority order.
    ///
    /// Misses and store failures are logged and skipped; only if every store
    /// fails to produce the key is `NotFound` returned.
    pub async fn read(&self, key: &str) -> Result<MemoryRecord, MemoryError> {
        if self.stores.is_empty() {
            return Err(MemoryError::NoStores);
        }
        for (name, store) in &self.stores {
            match store.read(key).await {
                Ok(record) => {
                    debug!(store = %name, key, "Read hit");
                    return Ok(record);
                }
                Err(StorageError::NotFound) => {
                    debug!(store = %name, key, "Read miss");
                }
                Err(e) => {
                    warn!(store = %name, key, error = %e, "Store read failed, trying next");
                }
            }
        }
        Err(MemoryError::NotFound { key: key.to_string() })
    }

    /// Query every store in parallel.
    ///
    /// A store that errors (or whose task panics) contributes an empty list.
    /// Complete results are cached until the next write through this manager;
    /// a result missing any store is not cached.
    pub async fn cross_store_query(&self, query: &MemoryQuery) -> QueryResults {
        let cache_key = query.cache_key();
        if let Some(cached) = self.query_cache.get(&cache_key) {
            debug!("Cross-store query served from cache");
            return cached;
        }

        let mut results: QueryResults = self
            .stores
            .iter()
            .map(|(name, _)| (name.clone(), Vec::new()))
            .collect();

        let mut tasks = JoinSet::new();
        for (name, store) in &self.stores {
            let name = name.clone();
            let store = store.clone();
            let query = query.clone();
            tasks.spawn(async move {
                let outcome = store.search(&query).await;
                (name, outcome)
            });
        }

        let mut degraded = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(records))) => {
                    results.insert(name, records);
                }
                Ok((name, Err(e))) => {
                    degraded = true;
                    warn!(store = %name, error = %e, "Store query failed, contributing no results");
                }
                Err(e) => {
                    degraded = true;
                    warn!(error = %e, "Store query task failed");
                }
            }
        }

        if !degraded {
            self.query_cache.put(cache_key, results.clone());
        }
        results
    }

    pub fn clear_query_cache(&self) {
        self.query_cache.clear();
    }

    #[must_use]
    pub fn query_cache_len(&self) -> usize {
        self.query_cache.len()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Update propagation
    // ═══════════════════════════════════════════════════════════════════════════

    /// Write `item` to `store` and propagate it to every other item store.
    ///
    /// Each other store is compared against the incoming item on its own. A
    /// store without the key receives the incoming item. A store holding a
    /// differing version keeps whichever is newer by `updated_at` (ties go to
    /// the incoming item), and when its copy wins it is also written back to
    /// `store`. Stores are not reconciled with each other. All of it happens
    /// in one transaction.
    pub async fn update_item(&self, store: &str, item: MemoryItem) -> Result<(), MemoryError> {
        if self.store(store).is_none() {
            return Err(MemoryError::UnknownStore(store.to_string()));
        }
        let others: Vec<String> = self
            .stores
            .iter()
            .filter(|(name, s)| name != store && s.supports(RecordKind::Item))
            .map(|(name, _)| name.clone())
            .collect();
        let source = store.to_string();
        let id = item.id.clone();

        let conflicts = self
            .transaction(move |tx| {
                Box::pin(async move {
                    let key = item.id.clone();
                    let mut conflicts = Vec::new();
                    tx.write_to(&source, &key, item.clone().into()).await?;

                    for other in &others {
                        let existing = match tx.read_from(other, &key).await {
                            Ok(record) => record.into_item(),
                            Err(MemoryError::NotFound { .. }) => None,
                            Err(e) => return Err(e),
                        };

                        let chosen = match existing {
                            Some(existing) if existing.conflicts_with(&item) => {
                                let chosen = if item.updated_at >= existing.updated_at {
                                    item.clone()
                                } else {
                                    existing.clone()
                                };
                                if chosen == existing {
                                    tx.write_to(&source, &key, existing.clone().into()).await?;
                                }
                                conflicts.push(ConflictRecord {
                                    id: key.clone(),
                                    store: other.clone(),
                                    existing,
                                    incoming: item.clone(),
                                    chosen: chosen.clone(),
                                    resolved_at: now_millis(),
                                });
                                chosen
                            }
                            _ => item.clone(),
                        };
                        tx.write_to(other, &key, chosen.into()).await?;
                    }
                    Ok(conflicts)
                })
            })
            .await?;

        for conflict in &conflicts {
            info!(
                id = %conflict.id,
                store = %conflict.store,
                kept_existing = conflict.chosen == conflict.existing,
                "Resolved update conflict"
            );
            crate::metrics::record_conflict(&conflict.store);
        }
        {
            let mut counts = self.counts.lock();
            counts.synchronized += 1;
            counts.conflicts += conflicts.len() as u64;
        }
        self.conflict_log.lock().extend(conflicts);

        let hooks = self.update_hooks.lock().clone();
        for hook in &hooks {
            hook(&id);
        }
        Ok(())
    }

    /// Conflicts resolved so far, oldest first
    #[must_use]
    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        self.conflict_log.lock().clone()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Deferred updates
    // ═══════════════════════════════════════════════════════════════════════════

    /// Queue an update for a later [`flush_updates`](Self::flush_updates).
    pub fn queue_update(&self, store: &str, item: MemoryItem) -> Result<(), MemoryError> {
        if self.store(store).is_none() {
            return Err(MemoryError::UnknownStore(store.to_string()));
        }
        let depth = {
            let mut queue = self.queue.lock();
            queue.push_back(QueuedUpdate {
                store: store.to_string(),
                item,
            });
            queue.len()
        };
        crate::metrics::set_update_queue_depth(depth);
        debug!(store, depth, "Update queued");
        Ok(())
    }

    /// Apply queued updates in FIFO order. Returns how many were applied.
    ///
    /// On failure the failed update goes back to the front of the queue and
    /// the error is returned; later updates stay queued.
    pub async fn flush_updates(&self) -> Result<usize, MemoryError> {
        let _flushing = self.flush_lock.lock().await;
        let mut applied = 0;

        loop {
            let next = self.queue.lock().pop_front();
            let Some(update) = next else { break };

            if let Err(e) = self.update_item(&update.store, update.item.clone()).await {
                let depth = {
                    let mut queue = self.queue.lock();
                    queue.push_front(update);
                    queue.len()
                };
                crate::metrics::set_update_queue_depth(depth);
                warn!(error = %e, applied, remaining = depth, "Flush stopped on failed update");
                return Err(e);
            }
            applied += 1;
        }

        crate::metrics::set_update_queue_depth(0);
        self.query_cache.clear();
        if applied > 0 {
            info!(applied, "Flushed queued updates");
        }
        Ok(applied)
    }

    /// Flush in the background after `delay`.
    pub fn schedule_flush(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.flush_updates().await {
                warn!(error = %e, "Background flush failed");
            }
        });
        let mut pending = self.pending_flushes.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for every scheduled flush, including ones scheduled meanwhile.
    pub async fn wait_for_sync(&self) {
        loop {
            let handles = std::mem::take(&mut *self.pending_flushes.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background flush task panicked");
                }
            }
        }
    }

    #[must_use]
    pub fn sync_stats(&self) -> SyncStats {
        let queued = self.queue.lock().len();
        let counts = self.counts.lock();
        SyncStats {
            synchronized: counts.synchronized,
            conflicts: counts.conflicts,
            queued,
        }
    }

    /// Record count per store. Stores that fail to answer are left out.
    pub async fn store_sizes(&self) -> BTreeMap<String, usize> {
        let mut sizes = BTreeMap::new();
        for (name, store) in &self.stores {
            match store.len().await {
                Ok(n) => {
                    sizes.insert(name.clone(), n);
                }
                Err(e) => warn!(store = %name, error = %e, "Store size unavailable"),
            }
        }
        sizes
    }

    /// Zero the counters and drop the conflict log. Queued updates stay.
    pub fn reset_stats(&self) {
        *self.counts.lock() = Counts::default();
        self.conflict_log.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_item::{MemoryType, MemoryVector};
    use crate::storage::memory::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn manager(n: usize) -> (Vec<Arc<InMemoryStore>>, Arc<SyncManager>) {
        let raw: Vec<Arc<InMemoryStore>> = (0..n).map(|_| Arc::new(InMemoryStore::new())).collect();
        let named = raw
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("s{}", i), s.clone() as Arc<dyn Store>))
            .collect();
        (raw, Arc::new(SyncManager::new(named, 16)))
    }

    fn item(id: &str, v: &str) -> MemoryItem {
        MemoryItem::new(id, json!(v), MemoryType::Knowledge)
    }

    /// Search always fails; reads and writes delegate.
    struct BrokenSearch(InMemoryStore);

    #[async_trait]
    impl Store for BrokenSearch {
        async fn write(&self, key: &str, record: MemoryRecord) -> Result<(), StorageError> {
            self.0.write(key, record).await
        }
        async fn read(&self, key: &str) -> Result<MemoryRecord, StorageError> {
            self.0.read(key).await
        }
        fn snapshot(&self) -> Result<crate::storage::traits::Snapshot, StorageError> {
            self.0.snapshot()
        }
        async fn restore(&self, s: crate::storage::traits::Snapshot) -> Result<(), StorageError> {
            self.0.restore(s).await
        }
        async fn search(&self, _q: &MemoryQuery) -> Result<Vec<MemoryRecord>, StorageError> {
            Err(StorageError::Backend("index offline".into()))
        }
    }

    #[tokio::test]
    async fn test_scoped_transaction_commits() {
        let (raw, sync) = manager(3);
        let record: MemoryRecord = item("x", "v").into();

        sync.transaction(move |tx| Box::pin(async move { tx.write("x", record).await }))
            .await
            .unwrap();

        assert!(raw.iter().all(|s| s.contains("x")));
    }

    #[tokio::test]
    async fn test_scoped_transaction_error_restores_all() {
        let (raw, sync) = manager(3);
        let record: MemoryRecord = item("x", "v").into();

        let result: Result<(), MemoryError> = sync
            .transaction(move |tx| {
                Box::pin(async move {
                    tx.write("x", record).await?;
                    Err(MemoryError::Config("caller bailed".into()))
                })
            })
            .await;

        assert!(matches!(result, Err(MemoryError::Config(_))));
        assert!(raw.iter().all(|s| !s.contains("x")));
    }

    #[tokio::test]
    async fn test_begin_on_unknown_store() {
        let (_, sync) = manager(1);
        assert!(matches!(sync.begin_on(&["s0", "ghost"]), Err(MemoryError::UnknownStore(ref n)) if n == "ghost"));
    }

    #[tokio::test]
    async fn test_begin_on_keeps_registration_order() {
        let (_, sync) = manager(3);
        let tx = sync.begin_on(&["s2", "s0"]).unwrap();

        assert_eq!(tx.participants(), vec!["s0", "s2"]);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_read_falls_back_in_priority_order() {
        let (raw, sync) = manager(3);
        raw[2].write("k", item("k", "from-2").into()).await.unwrap();
        raw[1].write("k", item("k", "from-1").into()).await.unwrap();

        let record = sync.read("k").await.unwrap();
        assert_eq!(record.as_item().unwrap().content, json!("from-1"));
    }

    #[tokio::test]
    async fn test_read_missing_everywhere() {
        let (_, sync) = manager(2);
        assert!(sync.read("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cross_store_query_tolerates_failing_store() {
        let good = Arc::new(InMemoryStore::new());
        good.write("a", item("a", "alpha").into()).await.unwrap();
        let stores: Vec<(String, Arc<dyn Store>)> = vec![
            ("good".into(), good.clone()),
            ("bad".into(), Arc::new(BrokenSearch(InMemoryStore::new()))),
        ];
        let sync = SyncManager::new(stores, 8);

        let results = sync.cross_store_query(&MemoryQuery::text("alpha")).await;

        assert_eq!(results["good"].len(), 1);
        assert!(results["bad"].is_empty());
    }

    #[tokio::test]
    async fn test_cross_store_query_degraded_result_not_cached() {
        /// Search fails while `down` is set.
        struct FlakySearch {
            inner: InMemoryStore,
            down: AtomicBool,
        }

        #[async_trait]
        impl Store for FlakySearch {
            async fn write(&self, key: &str, record: MemoryRecord) -> Result<(), StorageError> {
                self.inner.write(key, record).await
            }
            async fn read(&self, key: &str) -> Result<MemoryRecord, StorageError> {
                self.inner.read(key).await
            }
            fn snapshot(&self) -> Result<crate::storage::traits::Snapshot, StorageError> {
                self.inner.snapshot()
            }
            async fn restore(&self, s: crate::storage::traits::Snapshot) -> Result<(), StorageError> {
                self.inner.restore(s).await
            }
            async fn search(&self, q: &MemoryQuery) -> Result<Vec<MemoryRecord>, StorageError> {
                if self.down.load(Ordering::SeqCst) {
                    return Err(StorageError::Backend("index offline".into()));
                }
                self.inner.search(q).await
            }
        }

        let flaky = Arc::new(FlakySearch {
            inner: InMemoryStore::new(),
            down: AtomicBool::new(true),
        });
        flaky.inner.write("a", item("a", "alpha").into()).await.unwrap();
        let stores: Vec<(String, Arc<dyn Store>)> = vec![("flaky".into(), flaky.clone())];
        let sync = SyncManager::new(stores, 8);
        let query = MemoryQuery::text("alpha");

        assert!(sync.cross_store_query(&query).await["flaky"].is_empty());
        assert_eq!(sync.query_cache_len(), 0);

        flaky.down.store(false, Ordering::SeqCst);
        assert_eq!(sync.cross_store_query(&query).await["flaky"].len(), 1);
        assert_eq!(sync.query_cache_len(), 1);
    }

    #[tokio::test]
    async fn test_cross_store_query_cached_until_write() {
        let (raw, sync) = manager(1);
        raw[0].write("a", item("a", "alpha").into()).await.unwrap();
        let query = MemoryQuery::text("alpha");

        assert_eq!(sync.cross_store_query(&query).await["s0"].len(), 1);
        assert_eq!(sync.query_cache_len(), 1);

        // Bypass the manager: the cached answer is still served
        raw[0].write("b", item("b", "alpha two").into()).await.unwrap();
        assert_eq!(sync.cross_store_query(&query).await["s0"].len(), 1);

        // Writing through the manager invalidates
        sync.write_record(item("c", "alpha three").into()).await.unwrap();
        assert_eq!(sync.cross_store_query(&query).await["s0"].len(), 3);
    }

    #[tokio::test]
    async fn test_update_item_propagates() {
        let (raw, sync) = manager(3);

        sync.update_item("s1", item("u", "v1")).await.unwrap();

        for store in &raw {
            let record = store.read("u").await.unwrap();
            assert_eq!(record.as_item().unwrap().content, json!("v1"));
        }
        assert_eq!(sync.sync_stats().synchronized, 1);
        assert_eq!(sync.sync_stats().conflicts, 0);
    }

    #[tokio::test]
    async fn test_update_item_newer_existing_wins() {
        let (raw, sync) = manager(2);
        let mut newer = item("u", "newer");
        newer.updated_at = 2_000;
        raw[1].write("u", newer.clone().into()).await.unwrap();

        let mut stale = item("u", "stale");
        stale.updated_at = 1_000;
        sync.update_item("s0", stale).await.unwrap();

        for store in &raw {
            let record = store.read("u").await.unwrap();
            assert_eq!(record.as_item().unwrap().content, json!("newer"));
        }
        let log = sync.conflict_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].chosen, newer);
        assert_eq!(sync.sync_stats().conflicts, 1);
    }

    #[tokio::test]
    async fn test_update_item_incoming_wins_ties() {
        let (raw, sync) = manager(2);
        let mut existing = item("u", "old");
        existing.updated_at = 5;
        raw[1].write("u", existing.into()).await.unwrap();

        let mut incoming = item("u", "new");
        incoming.updated_at = 5;
        sync.update_item("s0", incoming).await.unwrap();

        let record = raw[1].read("u").await.unwrap();
        assert_eq!(record.as_item().unwrap().content, json!("new"));
    }

    #[tokio::test]
    async fn test_update_item_compares_each_store_with_incoming() {
        let (raw, sync) = manager(3);
        let mut newer = item("u", "newer");
        newer.updated_at = 2_000;
        raw[1].write("u", newer.clone().into()).await.unwrap();

        let mut stale = item("u", "stale");
        stale.updated_at = 1_000;
        sync.update_item("s0", stale).await.unwrap();

        // The holder of the newer copy keeps it and the source gets it back.
        // A store without the key only sees the incoming item.
        let expected = ["newer", "newer", "stale"];
        for (store, want) in raw.iter().zip(expected) {
            let record = store.read("u").await.unwrap();
            assert_eq!(record.as_item().unwrap().content, json!(want));
        }
    }

    #[tokio::test]
    async fn test_update_hook_sees_direct_and_flushed_updates() {
        let (_, sync) = manager(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sync.on_item_updated(move |id| sink.lock().push(id.to_string()));

        sync.update_item("s0", item("a", "1")).await.unwrap();
        sync.queue_update("s1", item("b", "2")).unwrap();
        sync.flush_updates().await.unwrap();

        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_update_item_skips_vector_only_stores() {
        let items = Arc::new(InMemoryStore::new());
        let vectors = Arc::new(InMemoryStore::vectors_only(2));
        let stores: Vec<(String, Arc<dyn Store>)> =
            vec![("doc".into(), items.clone()), ("vec".into(), vectors.clone())];
        let sync = SyncManager::new(stores, 4);

        sync.update_item("doc", item("u", "v")).await.unwrap();

        assert!(items.contains("u"));
        assert!(!vectors.contains("u"));
        sync.write_record(MemoryVector::new("v", "t", vec![0.0, 1.0]).into())
            .await
            .unwrap();
        assert!(vectors.contains("v"));
    }

    #[tokio::test]
    async fn test_queue_and_flush() {
        let (raw, sync) = manager(2);
        sync.queue_update("s0", item("a", "1")).unwrap();
        sync.queue_update("s1", item("b", "2")).unwrap();
        assert_eq!(sync.sync_stats().queued, 2);

        assert_eq!(sync.flush_updates().await.unwrap(), 2);

        assert_eq!(sync.sync_stats().queued, 0);
        assert!(raw.iter().all(|s| s.contains("a") && s.contains("b")));
    }

    #[tokio::test]
    async fn test_queue_update_unknown_store() {
        let (_, sync) = manager(1);
        assert_eq!(
            sync.queue_update("ghost", item("a", "1")).unwrap_err().code(),
            "UNKNOWN_STORE"
        );
    }

    #[tokio::test]
    async fn test_schedule_flush_and_wait() {
        let (raw, sync) = manager(2);
        sync.queue_update("s0", item("a", "1")).unwrap();

        sync.schedule_flush(Duration::from_millis(5));
        sync.wait_for_sync().await;

        assert_eq!(sync.sync_stats().queued, 0);
        assert!(raw.iter().all(|s| s.contains("a")));
    }

    #[tokio::test]
    async fn test_schedule_flush_prunes_finished_handles() {
        let (_, sync) = manager(1);
        for _ in 0..5 {
            sync.schedule_flush(Duration::ZERO);
        }
        // Let every spawned flush run to completion
        while sync.pending_flushes.lock().iter().any(|h| !h.is_finished()) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        sync.schedule_flush(Duration::from_secs(60));
        assert_eq!(sync.pending_flushes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_requeues_failed_update() {
        /// Rejects every write.
        struct ReadOnly {
            inner: InMemoryStore,
            attempts: AtomicUsize,
        }

        #[async_trait]
        impl Store for ReadOnly {
            async fn write(&self, _key: &str, _record: MemoryRecord) -> Result<(), StorageError> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Backend("read-only".into()))
            }
            async fn read(&self, key: &str) -> Result<MemoryRecord, StorageError> {
                self.inner.read(key).await
            }
            fn snapshot(&self) -> Result<crate::storage::traits::Snapshot, StorageError> {
                self.inner.snapshot()
            }
            async fn restore(&self, s: crate::storage::traits::Snapshot) -> Result<(), StorageError> {
                self.inner.restore(s).await
            }
        }

        let good = Arc::new(InMemoryStore::new());
        let stores: Vec<(String, Arc<dyn Store>)> = vec![
            ("good".into(), good.clone()),
            (
                "ro".into(),
                Arc::new(ReadOnly {
                    inner: InMemoryStore::new(),
                    attempts: AtomicUsize::new(0),
                }),
            ),
        ];
        let sync = SyncManager::new(stores, 4);
        sync.queue_update("good", item("a", "1")).unwrap();
        sync.queue_update("good", item("b", "2")).unwrap();

        assert!(sync.flush_updates().await.is_err());

        assert_eq!(sync.sync_stats().queued, 2);
        // Rolled back: the good store does not keep the partial update
        assert!(!good.contains("a"));
    }
}
