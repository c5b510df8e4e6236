//! Property-based tests (fuzzing) for the memory layer.
//!
//! Uses proptest to generate random write sequences, failure positions and
//! cache workloads, and checks the invariants hold for every one of them.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{json, Value};

use memory_sync::{
    embed_text, CacheLayer, InMemoryStore, LayeredCache, MemoryConfig, MemoryItem, MemoryRecord,
    MemoryType, Snapshot, StorageError, Store, SyncManager, TieredCache,
};

// =============================================================================
// Helpers
// =============================================================================

/// Fails the n-th write (1-indexed) and nothing else.
struct FailOnWrite {
    inner: InMemoryStore,
    calls: AtomicU64,
    fail_on: Option<u64>,
}

#[async_trait]
impl Store for FailOnWrite {
    async fn write(&self, key: &str, record: MemoryRecord) -> Result<(), StorageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(call) {
            return Err(StorageError::Backend("injected".into()));
        }
        self.inner.write(key, record).await
    }

    async fn read(&self, key: &str) -> Result<MemoryRecord, StorageError> {
        self.inner.read(key).await
    }

    fn snapshot(&self) -> Result<Snapshot, StorageError> {
        self.inner.snapshot()
    }

    async fn restore(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.inner.restore(snapshot).await
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn record(id: &str, n: i64) -> MemoryRecord {
    MemoryItem::new(id, json!(n), MemoryType::Working).into()
}

async fn dump(store: &impl Store, keys: &BTreeSet<String>) -> BTreeMap<String, MemoryRecord> {
    let mut state = BTreeMap::new();
    for key in keys {
        if let Ok(record) = store.read(key).await {
            state.insert(key.clone(), record);
        }
    }
    state
}

// =============================================================================
// Strategies
// =============================================================================

fn key_strategy() -> impl Strategy<Value = String> {
    "[a-e]{1,2}"
}

/// (key, value) pairs
fn writes_strategy(max: usize) -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec((key_strategy(), any::<i64>()), 1..max)
}

fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::hash_map("[a-z_]{1,20}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

// =============================================================================
// Transaction atomicity
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whichever write fails, on whichever store, every store ends exactly
    /// where it started.
    #[test]
    fn prop_failed_transaction_restores_every_store(
        store_count in 2usize..5,
        seed in writes_strategy(6),
        writes in writes_strategy(8),
        failing_store in 0usize..4,
        failing_write in 0usize..8,
    ) {
        let failing_store = failing_store % store_count;
        let failing_write = failing_write % writes.len();

        runtime().block_on(async {
            // Each store sees one call per seed write, then one per transactional write
            let fail_call = (seed.len() + failing_write + 1) as u64;
            let stores: Vec<Arc<FailOnWrite>> = (0..store_count)
                .map(|i| Arc::new(FailOnWrite {
                    inner: InMemoryStore::new(),
                    calls: AtomicU64::new(0),
                    fail_on: (i == failing_store).then_some(fail_call),
                }))
                .collect();
            let sync = SyncManager::new(
                stores
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (format!("s{}", i), s.clone() as Arc<dyn Store>))
                    .collect(),
                4,
            );

            for (key, n) in &seed {
                sync.write_record(record(key, *n)).await.unwrap();
            }

            let keys: BTreeSet<String> = seed.iter().chain(writes.iter()).map(|(k, _)| k.clone()).collect();
            let mut before = Vec::new();
            for store in &stores {
                before.push(dump(store.as_ref(), &keys).await);
            }

            let result = sync
                .transaction(move |tx| {
                    Box::pin(async move {
                        for (key, n) in &writes {
                            tx.write(key, record(key, *n)).await?;
                        }
                        Ok(())
                    })
                })
                .await;

            prop_assert!(result.is_err());
            for (store, expected) in stores.iter().zip(&before) {
                let after = dump(store.as_ref(), &keys).await;
                prop_assert_eq!(&after, expected);
            }
            Ok(())
        })?;
    }

    /// restore(snapshot()) undoes any later mutation.
    #[test]
    fn prop_snapshot_restore_round_trip(
        initial in writes_strategy(10),
        later in writes_strategy(10),
    ) {
        runtime().block_on(async {
            let store = InMemoryStore::new();
            for (key, n) in &initial {
                store.write(key, record(key, *n)).await.unwrap();
            }
            let keys: BTreeSet<String> = initial.iter().chain(later.iter()).map(|(k, _)| k.clone()).collect();
            let before = dump(&store, &keys).await;

            let snapshot = store.snapshot().unwrap();
            for (key, n) in &later {
                store.write(key, record(key, n.wrapping_add(1))).await.unwrap();
            }
            store.restore(snapshot.clone()).await.unwrap();
            // Restoring twice is harmless
            store.restore(snapshot).await.unwrap();

            prop_assert_eq!(dump(&store, &keys).await, before);
            Ok(())
        })?;
    }
}

// =============================================================================
// Cache invariants
// =============================================================================

proptest! {
    /// The LRU never holds more than its bound, and holds exactly the bound
    /// once that many distinct keys went in.
    #[test]
    fn prop_tiered_cache_respects_bound(
        max_size in 1usize..16,
        keys in prop::collection::vec("[a-z]{1,3}", 0..64),
    ) {
        let cache = TieredCache::<String, usize>::new(max_size);
        for (i, key) in keys.iter().enumerate() {
            cache.put(key.clone(), i);
            prop_assert!(cache.len() <= max_size);
        }

        let distinct: BTreeSet<&String> = keys.iter().collect();
        prop_assert_eq!(cache.keys().len(), distinct.len().min(max_size));
    }

    /// With puts only, the survivors are the most recently written keys.
    #[test]
    fn prop_tiered_cache_keeps_most_recent(
        max_size in 1usize..8,
        keys in prop::collection::vec("[a-j]", 1..40),
    ) {
        let cache = TieredCache::<String, ()>::new(max_size);
        for key in &keys {
            cache.put(key.clone(), ());
        }

        let mut expected: Vec<String> = Vec::new();
        for key in keys.iter().rev() {
            if expected.len() == max_size {
                break;
            }
            if !expected.contains(key) {
                expected.push(key.clone());
            }
        }
        expected.reverse();
        prop_assert_eq!(cache.keys(), expected);
    }

    /// k hits and m misses give exactly k / (k + m).
    #[test]
    fn prop_hit_ratio_is_exact(hits in 0u32..50, misses in 0u32..50) {
        let cache: LayeredCache<u32> = LayeredCache::with_sizes("ratio", &[4, 8]);
        cache.set("present", 1);

        for _ in 0..hits {
            prop_assert!(cache.get("present").is_ok());
        }
        for i in 0..misses {
            let absent_key = format!("absent-{}", i);
            prop_assert!(cache.get(&absent_key).is_err());
        }

        let total = hits + misses;
        let expected = if total == 0 { 0.0 } else { f64::from(hits) / f64::from(total) };
        prop_assert_eq!(cache.hit_ratio(), expected);
    }

    /// A hit anywhere lands the key in layer 0.
    #[test]
    fn prop_promotion_reaches_layer_zero(depth in 0usize..3, key in key_strategy()) {
        let cache: LayeredCache<u8> = LayeredCache::with_sizes("promo", &[2, 4, 8]);
        cache.layer(depth).unwrap().put(&key, 7);

        prop_assert_eq!(cache.get(&key).unwrap(), 7);
        prop_assert!(cache.layer(0).unwrap().contains(&key));
    }
}

// =============================================================================
// Inputs that must never panic
// =============================================================================

proptest! {
    /// Config parsing either succeeds or returns a clean error
    #[test]
    fn fuzz_config_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let text = serde_json::to_string(&json).unwrap();
        if let Err(e) = MemoryConfig::from_json_str(&text) {
            prop_assert_eq!(e.code(), "CONFIG_ERROR");
        }
    }

    #[test]
    fn fuzz_embed_text_is_stable(text in ".*", dimension in 1usize..16) {
        let a = embed_text(&text, dimension);
        prop_assert_eq!(a.len(), dimension);
        prop_assert!(a.iter().all(|v| v.is_finite()));
        prop_assert_eq!(a, embed_text(&text, dimension));
    }

    #[test]
    fn fuzz_record_from_arbitrary_json(json in arbitrary_json_strategy()) {
        // Either parses or fails cleanly
        let _ = serde_json::from_value::<MemoryRecord>(json);
    }
}
