//! Integration tests for hybrid retrieval through the engine

use std::sync::Arc;

use chrono::Duration;

use memtier::audit::InMemoryAuditLog;
use memtier::collab::{HashEmbedder, HeuristicIntelligence, LocalStore, StorageIndex};
use memtier::config::Config;
use memtier::testing::{FixedEmbedder, fixture_item};
use memtier::{MemoryEngine, MemoryFilter, MemtierError, StoreRequest, Tier};

fn engine_with(store: Arc<LocalStore>, embedder: Arc<dyn memtier::collab::Embedder>) -> MemoryEngine {
    let mut config = Config::default();
    config.scheduler.light_interval_secs = 0;
    config.scheduler.deep_interval_secs = 0;
    config.scheduler.full_interval_secs = 0;
    MemoryEngine::new(
        config,
        store,
        Arc::new(HeuristicIntelligence::new()),
        embedder,
        Arc::new(InMemoryAuditLog::new()),
    )
}

#[tokio::test]
async fn test_ranking_is_deterministic_across_calls() {
    // cos(query, x) = 0.92, cos(query, y) = 0.93
    let x_vec = vec![0.92, (1.0f32 - 0.92 * 0.92).sqrt()];
    let y_vec = vec![0.93, (1.0f32 - 0.93 * 0.93).sqrt()];
    let embedder = Arc::new(FixedEmbedder::new(vec![0.0, 1.0]).with("database optimization", vec![1.0, 0.0]));

    let store = Arc::new(LocalStore::in_memory());
    let mut x = fixture_item("Database optimization checklist", Duration::days(9));
    x.embedding = x_vec;
    x.set_importance(0.8);
    let mut y = fixture_item("Lunch order for friday", Duration::days(81));
    y.embedding = y_vec;
    y.set_importance(0.1);
    store.upsert(x.clone()).await.unwrap();
    store.upsert(y.clone()).await.unwrap();

    let engine = engine_with(store, embedder);
    let mut orders = Vec::new();
    for _ in 0..3 {
        let results = engine
            .retrieve("database optimization", Some(2), &MemoryFilter::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        orders.push(results.iter().map(|r| r.item.id).collect::<Vec<_>>());
    }

    assert_eq!(orders[0], vec![x.id, y.id]);
    assert!(orders.iter().all(|o| o == &orders[0]));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_stored_item_is_retrievable_and_counted() {
    let engine = engine_with(
        Arc::new(LocalStore::in_memory()),
        Arc::new(HashEmbedder::default()),
    );
    let outcome = engine
        .store(
            StoreRequest::new("Remember to use vector indexing")
                .with_importance(0.9)
                .with_tags(["search"]),
        )
        .await
        .unwrap();

    let results = engine
        .retrieve("use vector indexing", None, &MemoryFilter::new())
        .await
        .unwrap();
    assert_eq!(results[0].item.id, outcome.id);
    assert_eq!(results[0].item.access_count, 1);

    // the access is visible to later reads, including cached ones
    let item = engine.get(outcome.id).await.unwrap().unwrap();
    assert_eq!(item.access_count, 1);
    assert_eq!(item.tier, Tier::Working);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_filters_narrow_results() {
    let engine = engine_with(
        Arc::new(LocalStore::in_memory()),
        Arc::new(HashEmbedder::default()),
    );
    let ops = engine
        .store(
            StoreRequest::new("Postgres vacuum runs nightly")
                .with_tags(["ops"])
                .with_category("runbook"),
        )
        .await
        .unwrap();
    engine
        .store(StoreRequest::new("Postgres vacuum settings debate"))
        .await
        .unwrap();

    let results = engine
        .retrieve(
            "postgres vacuum",
            None,
            &MemoryFilter::new().with_tags(["ops"]).with_category("Runbook"),
        )
        .await
        .unwrap();
    let ids: Vec<_> = results.iter().map(|r| r.item.id).collect();
    assert_eq!(ids, vec![ops.id]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_top_k_bounds() {
    let engine = engine_with(
        Arc::new(LocalStore::in_memory()),
        Arc::new(HashEmbedder::default()),
    );
    for i in 0..5 {
        engine
            .store(StoreRequest::new(format!("release checklist step {i}")))
            .await
            .unwrap();
    }

    let two = engine
        .retrieve("release checklist step", Some(2), &MemoryFilter::new())
        .await
        .unwrap();
    assert_eq!(two.len(), 2);

    let none = engine
        .retrieve("release checklist step", Some(0), &MemoryFilter::new())
        .await
        .unwrap();
    assert!(none.is_empty());

    let max = engine.config().retrieval.max_top_k;
    let err = engine
        .retrieve("release checklist step", Some(max + 1), &MemoryFilter::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MemtierError::Validation(_)));

    let err = engine
        .retrieve("   ", None, &MemoryFilter::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MemtierError::Validation(_)));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_empty_corpus_returns_nothing() {
    let engine = engine_with(
        Arc::new(LocalStore::in_memory()),
        Arc::new(HashEmbedder::default()),
    );
    let results = engine
        .retrieve("anything at all", None, &MemoryFilter::new())
        .await
        .unwrap();
    assert!(results.is_empty());
    engine.shutdown().await;
}
