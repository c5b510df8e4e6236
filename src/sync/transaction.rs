//! Multi-store transactions backed by snapshot/restore.
//!
//! Every participant is snapshotted when the transaction opens. Writes go
//! to participants in registration order; rollback restores every
//! participant from its snapshot. No store needs native transactions.
//!
//! # Lifecycle
//!
//! ```text
//!            write ok
//!          ┌─────────┐
//!          ▼         │
//!  begin ─▶ Open ────┘──── commit ───▶ Committed
//!          │    │
//!          │    └─ write err ─▶ Failed ─┐
//!          │                           ├─ rollback / drop ─▶ RolledBack
//!          └───────────────────────────┘
//! ```

use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::TieredCache;
use crate::error::MemoryError;
use crate::memory_item::MemoryRecord;
use crate::storage::traits::{Snapshot, StorageError, Store};

use super::QueryResults;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
    /// A write failed; only rollback is possible
    Failed,
}

/// A write applied to one store inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub store: String,
    pub key: String,
    pub record: MemoryRecord,
}

struct Participant {
    name: String,
    store: Arc<dyn Store>,
    snapshot: Snapshot,
}

pub struct Transaction {
    id: Uuid,
    participants: Vec<Participant>,
    writes: Vec<PendingWrite>,
    state: TransactionState,
    query_cache: Option<Arc<TieredCache<String, QueryResults>>>,
}

impl Transaction {
    /// Open a transaction over `stores`, snapshotting each one.
    pub(crate) fn begin(
        stores: Vec<(String, Arc<dyn Store>)>,
        query_cache: Option<Arc<TieredCache<String, QueryResults>>>,
    ) -> Result<Self, MemoryError> {
        if stores.is_empty() {
            return Err(MemoryError::NoStores);
        }

        let mut participants = Vec::with_capacity(stores.len());
        for (name, store) in stores {
            let snapshot = store.snapshot().map_err(|source| MemoryError::Store {
                store: name.clone(),
                source,
            })?;
            participants.push(Participant { name, store, snapshot });
        }

        let id = Uuid::new_v4();
        debug!(transaction = %id, participants = participants.len(), "Transaction opened");
        Ok(Self {
            id,
            participants,
            writes: Vec::new(),
            state: TransactionState::Open,
            query_cache,
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Participant names in registration order
    #[must_use]
    pub fn participants(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.name.as_str()).collect()
    }

    /// Writes applied so far
    #[must_use]
    pub fn writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    fn ensure_open(&self) -> Result<(), MemoryError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MemoryError::TransactionClosed(self.id))
        }
    }

    fn participant_index(&self, store: &str) -> Result<usize, MemoryError> {
        self.participants
            .iter()
            .position(|p| p.name == store)
            .ok_or_else(|| MemoryError::UnknownStore(store.to_string()))
    }

    /// Write `record` under `key` to every participant that supports its kind.
    ///
    /// If the write fails on one store, the stores already written by this
    /// call are restored before the error is returned and the transaction
    /// moves to [`TransactionState::Failed`].
    pub async fn write(&mut self, key: &str, record: MemoryRecord) -> Result<(), MemoryError> {
        self.ensure_open()?;

        let kind = record.kind();
        let targets: Vec<usize> = self
            .participants
            .iter()
            .enumerate()
            .filter(|(_, p)| p.store.supports(kind))
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return Err(MemoryError::Store {
                store: "*".to_string(),
                source: StorageError::Unsupported(kind),
            });
        }

        for (done, &index) in targets.iter().enumerate() {
            self.write_at(index, key, record.clone(), &targets[..done]).await?;
        }
        self.invalidate_queries();
        Ok(())
    }

    /// Write to a single participant.
    pub async fn write_to(
        &mut self,
        store: &str,
        key: &str,
        record: MemoryRecord,
    ) -> Result<(), MemoryError> {
        self.ensure_open()?;
        let index = self.participant_index(store)?;
        self.write_at(index, key, record, &[]).await?;
        self.invalidate_queries();
        Ok(())
    }

    /// Read from a single participant, seeing this transaction's writes.
    pub async fn read_from(&self, store: &str, key: &str) -> Result<MemoryRecord, MemoryError> {
        self.ensure_open()?;
        let index = self.participant_index(store)?;
        self.participants[index]
            .store
            .read(key)
            .await
            .map_err(|e| MemoryError::from_storage(store, key, e))
    }

    async fn write_at(
        &mut self,
        index: usize,
        key: &str,
        record: MemoryRecord,
        written: &[usize],
    ) -> Result<(), MemoryError> {
        let participant = &self.participants[index];
        match participant.store.write(key, record.clone()).await {
            Ok(()) => {
                self.writes.push(PendingWrite {
                    store: participant.name.clone(),
                    key: key.to_string(),
                    record,
                });
                Ok(())
            }
            Err(e) => {
                let trigger = MemoryError::from_storage(&participant.name, key, e);
                warn!(
                    transaction = %self.id,
                    store = %participant.name,
                    key,
                    error = %trigger,
                    "Transactional write failed"
                );
                self.state = TransactionState::Failed;
                let failures = self.restore(written).await;
                Err(escalate(trigger, failures))
            }
        }
    }

    /// Restore the given participants in order, collecting failures.
    async fn restore(&self, indices: &[usize]) -> Vec<(String, StorageError)> {
        let mut failures = Vec::new();
        for &index in indices {
            let participant = &self.participants[index];
            if let Err(e) = participant.store.restore(participant.snapshot.clone()).await {
                error!(
                    transaction = %self.id,
                    store = %participant.name,
                    error = %e,
                    "Restore failed during rollback"
                );
                failures.push((participant.name.clone(), e));
            }
        }
        failures
    }

    fn invalidate_queries(&self) {
        if let Some(ref cache) = self.query_cache {
            cache.clear();
        }
    }

    /// Make the writes permanent.
    pub fn commit(mut self) -> Result<(), MemoryError> {
        self.ensure_open()?;
        self.state = TransactionState::Committed;
        self.invalidate_queries();
        crate::metrics::record_transaction("committed");
        debug!(transaction = %self.id, writes = self.writes.len(), "Transaction committed");
        Ok(())
    }

    /// Restore every participant to its state at `begin`.
    pub async fn rollback(mut self) -> Result<(), MemoryError> {
        match self.rollback_all().await {
            failures if failures.is_empty() => Ok(()),
            failures => Err(MemoryError::RollbackFailed {
                trigger: Box::new(MemoryError::TransactionClosed(self.id)),
                failures,
            }),
        }
    }

    /// Roll back because of `trigger`; returns the error to surface.
    pub(crate) async fn abort(mut self, trigger: MemoryError) -> MemoryError {
        let failures = self.rollback_all().await;
        escalate(trigger, failures)
    }

    async fn rollback_all(&mut self) -> Vec<(String, StorageError)> {
        if matches!(
            self.state,
            TransactionState::Committed | TransactionState::RolledBack
        ) {
            return Vec::new();
        }
        let all: Vec<usize> = (0..self.participants.len()).collect();
        let failures = self.restore(&all).await;
        self.state = TransactionState::RolledBack;
        self.writes.clear();
        self.invalidate_queries();

        if failures.is_empty() {
            crate::metrics::record_transaction("rolled_back");
            warn!(transaction = %self.id, "Transaction rolled back");
        } else {
            crate::metrics::record_transaction("rollback_failed");
        }
        failures
    }
}

/// Attach restore failures to the error that caused the rollback.
fn escalate(trigger: MemoryError, failures: Vec<(String, StorageError)>) -> MemoryError {
    if failures.is_empty() {
        return trigger;
    }
    match trigger {
        MemoryError::RollbackFailed {
            trigger,
            failures: mut prior,
        } => {
            prior.extend(failures);
            MemoryError::RollbackFailed {
                trigger,
                failures: prior,
            }
        }
        other => MemoryError::RollbackFailed {
            trigger: Box::new(other),
            failures,
        },
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !matches!(self.state, TransactionState::Open | TransactionState::Failed) {
            return;
        }
        warn!(transaction = %self.id, "Transaction dropped while open, rolling back");
        self.invalidate_queries();

        let id = self.id;
        let participants = std::mem::take(&mut self.participants);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for participant in participants {
                        if let Err(e) = participant.store.restore(participant.snapshot).await {
                            error!(
                                transaction = %id,
                                store = %participant.name,
                                error = %e,
                                "Restore failed during drop rollback"
                            );
                        }
                    }
                });
            }
            Err(_) => {
                error!(transaction = %id, "No runtime to roll back dropped transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_item::{MemoryItem, MemoryType, MemoryVector};
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;

    fn stores(n: usize) -> (Vec<Arc<InMemoryStore>>, Vec<(String, Arc<dyn Store>)>) {
        let raw: Vec<Arc<InMemoryStore>> = (0..n).map(|_| Arc::new(InMemoryStore::new())).collect();
        let named = raw
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("s{}", i), s.clone() as Arc<dyn Store>))
            .collect();
        (raw, named)
    }

    fn item(id: &str, v: &str) -> MemoryRecord {
        MemoryItem::new(id, json!(v), MemoryType::Working).into()
    }

    #[tokio::test]
    async fn test_commit_keeps_writes() {
        let (raw, named) = stores(2);
        let mut tx = Transaction::begin(named, None).unwrap();

        tx.write("x", item("x", "v")).await.unwrap();
        assert_eq!(tx.writes().len(), 2);
        tx.commit().unwrap();

        assert!(raw.iter().all(|s| s.contains("x")));
    }

    #[tokio::test]
    async fn test_rollback_restores_every_participant() {
        let (raw, named) = stores(3);
        raw[0].write("keep", item("keep", "old")).await.unwrap();

        let mut tx = Transaction::begin(named, None).unwrap();
        tx.write("x", item("x", "v")).await.unwrap();
        tx.write("keep", item("keep", "new")).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(raw.iter().all(|s| !s.contains("x")));
        let kept = raw[0].read("keep").await.unwrap();
        assert_eq!(kept.as_item().unwrap().content, json!("old"));
    }

    #[tokio::test]
    async fn test_write_after_commit_is_rejected() {
        let (_, named) = stores(1);
        let mut tx = Transaction::begin(named.clone(), None).unwrap();
        tx.state = TransactionState::Committed;

        let err = tx.write("x", item("x", "v")).await.unwrap_err();
        assert_eq!(err.code(), "TRANSACTION_CLOSED");
    }

    #[tokio::test]
    async fn test_vectors_skip_item_only_stores() {
        let items = Arc::new(InMemoryStore::items_only());
        let vectors = Arc::new(InMemoryStore::vectors_only(2));
        let named: Vec<(String, Arc<dyn Store>)> = vec![
            ("doc".into(), items.clone()),
            ("vec".into(), vectors.clone()),
        ];

        let mut tx = Transaction::begin(named, None).unwrap();
        tx.write("v1", MemoryVector::new("v1", "t", vec![1.0, 0.0]).into())
            .await
            .unwrap();
        tx.commit().unwrap();

        assert!(!items.contains("v1"));
        assert!(vectors.contains("v1"));
    }

    #[tokio::test]
    async fn test_write_to_and_read_from_single_store() {
        let (raw, named) = stores(2);
        let mut tx = Transaction::begin(named, None).unwrap();

        tx.write_to("s1", "k", item("k", "v")).await.unwrap();
        assert!(tx.read_from("s1", "k").await.is_ok());
        assert!(tx.read_from("s0", "k").await.unwrap_err().is_not_found());
        assert_eq!(
            tx.write_to("nope", "k", item("k", "v")).await.unwrap_err().code(),
            "UNKNOWN_STORE"
        );
        tx.commit().unwrap();

        assert!(!raw[0].contains("k"));
        assert!(raw[1].contains("k"));
    }

    #[tokio::test]
    async fn test_drop_rolls_back_in_background() {
        let (raw, named) = stores(2);
        {
            let mut tx = Transaction::begin(named, None).unwrap();
            tx.write("x", item("x", "v")).await.unwrap();
        }

        // Give the spawned rollback a chance to run
        for _ in 0..50 {
            if raw.iter().all(|s| !s.contains("x")) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(raw.iter().all(|s| !s.contains("x")));
    }

    #[tokio::test]
    async fn test_begin_without_stores_fails() {
        assert!(matches!(
            Transaction::begin(Vec::new(), None),
            Err(MemoryError::NoStores)
        ));
    }

    #[tokio::test]
    async fn test_write_clears_query_cache() {
        let (_, named) = stores(1);
        let cache: Arc<TieredCache<String, QueryResults>> = Arc::new(TieredCache::new(4));
        cache.put("q".into(), QueryResults::new());

        let mut tx = Transaction::begin(named, Some(cache.clone())).unwrap();
        tx.write("x", item("x", "v")).await.unwrap();

        assert!(cache.is_empty());
        tx.commit().unwrap();
    }

    #[test]
    fn test_escalate_keeps_rollback_failed() {
        let inner = MemoryError::RollbackFailed {
            trigger: Box::new(MemoryError::NotFound { key: "k".into() }),
            failures: vec![("a".into(), StorageError::Backend("x".into()))],
        };
        let escalated = escalate(inner, vec![("b".into(), StorageError::Backend("y".into()))]);

        match escalated {
            MemoryError::RollbackFailed { failures, .. } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
