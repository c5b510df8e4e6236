// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic memory-sync usage example.
//!
//! Demonstrates:
//! 1. Building a manager over a document store and a vector store
//! 2. Writing items, vectors and EDRR-tagged entries
//! 3. Cached reads and cross-store search
//! 4. A transaction that fails and rolls back
//! 5. Update propagation and the deferred update queue
//! 6. Displaying metrics (breaker transitions, retries, cache, `metrics` facade)
//!
//! Everything runs in-process.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use memory_sync::{
    EdrrPhase, InMemoryStore, MemoryConfig, MemoryItem, MemoryManager, MemoryQuery, MemoryType,
    MemoryVector,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the crate emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           memory-sync: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and build the manager
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring memory-sync...");

    let config = MemoryConfig::from_json_str(
        r#"{
            "cache_layer_sizes": [16, 256],
            "store_order": ["document", "vector"],
            "circuits": { "vector": { "failure_threshold": 3, "reset_timeout_ms": 5000 } },
            "retry": { "max_retries": 2, "initial_delay_ms": 10, "jitter": true }
        }"#,
    )?;

    let document = Arc::new(InMemoryStore::items_only());
    let vector = Arc::new(InMemoryStore::vectors_only(config.embedding_dimension));
    let manager = MemoryManager::builder()
        .config(config)
        .shared_store("document", document.clone())
        .shared_store("vector", vector.clone())
        .build()?;

    println!("   ✅ Stores (priority order): {:?}", manager.store_names());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write a few entries
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing entries...");

    let notes = vec![
        ("Refactor the parser", MemoryType::Knowledge),
        ("Parser refactor must keep error spans", MemoryType::Requirement),
        ("Split lexer into its own module", MemoryType::Solution),
    ];
    let mut ids = Vec::new();
    for (text, memory_type) in notes {
        let id = manager
            .store_item(MemoryItem::new("", json!(text), memory_type.clone()))
            .await?;
        println!("   └─ {} ({}) → {}", text, memory_type, id);
        ids.push(id);
    }

    let embedding = manager.embed_text("parser refactor");
    let vector_id = manager
        .store_vector(MemoryVector::new("", "parser refactor", embedding))
        .await?;
    println!("   └─ vector → {}", vector_id);

    let phase_id = manager
        .store_with_edrr_phase(
            json!({"decision": "keep recursive descent"}),
            MemoryType::Solution,
            EdrrPhase::Refine,
            None,
        )
        .await?;
    println!("   └─ EDRR {} → {}", EdrrPhase::Refine, phase_id);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Read back and search
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Reading back...");
    for id in &ids {
        let record = manager.retrieve(id).await?;
        println!("   └─ {} = {:?}", id, record.as_item().map(|i| &i.content));
    }

    let hits = manager.search(MemoryQuery::text("parser")).await;
    println!("   Text search 'parser': {} hit(s)", hits.len());

    let similar = manager.similarity_search("parser refactor", 1).await;
    println!("   Similarity search: {:?}", similar.first().map(|r| r.id()));

    let refined = manager
        .retrieve_with_edrr_phase(MemoryType::Solution, EdrrPhase::Refine)
        .await?;
    println!("   EDRR lookup: {}", refined.content);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. A transaction that fails rolls back every store
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n↩️  Failing transaction...");
    let before = document.count();
    let outcome = manager
        .sync()
        .transaction(|tx| {
            Box::pin(async move {
                tx.write(
                    "doomed",
                    MemoryItem::new("doomed", json!("never visible"), MemoryType::Working).into(),
                )
                .await?;
                // Wrong dimension for the vector store
                tx.write("bad-vector", MemoryVector::new("bad-vector", "", vec![1.0]).into())
                    .await
            })
        })
        .await;
    println!("   └─ Result: {}", outcome.map_or_else(|e| e.code(), |_| "OK"));
    println!("   └─ Document count before/after: {}/{}", before, document.count());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Update propagation and the deferred queue
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔄 Updating...");
    let first = ids[0].clone();
    manager
        .update_item(
            "document",
            MemoryItem::new(&first, json!("Refactor the parser (approved)"), MemoryType::Knowledge),
        )
        .await?;

    manager.queue_update(
        "document",
        MemoryItem::new(&ids[1], json!("Keep error spans and line numbers"), MemoryType::Requirement),
    )?;
    println!("   └─ Queued: {}", manager.sync_stats().queued);
    manager.schedule_flush(Some(Duration::from_millis(20)));
    manager.wait_for_sync().await;

    let stats = manager.sync_stats();
    println!(
        "   └─ Synchronized: {}, conflicts: {}, queued: {}",
        stats.synchronized, stats.conflicts, stats.queued
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Resilience state:");
    for (store, state) in manager.circuit_states() {
        println!("   └─ circuit {}: {}", store, state);
    }
    println!("   Cache hit ratio: {:.2}", manager.cache_hit_ratio());
    println!("   Retry counters:");
    for (key, value) in manager.retry_counters() {
        println!("   └─ {} = {}", key, value);
    }

    println!("\n📈 Raw metrics:");
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    gauges.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (latency seconds)");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("      └─ {}{} count={} avg={:.6}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
