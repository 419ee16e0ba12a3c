//! Integration tests for the item lifecycle through the engine
//!
//! Covers tier promotion, consolidation merges, retry and dead-letter handling, and
//! cache consistency while consolidation rewrites items underneath callers.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use memtier::audit::{AuditAction, InMemoryAuditLog};
use memtier::collab::{HashEmbedder, HeuristicIntelligence, LocalStore, StorageIndex};
use memtier::config::Config;
use memtier::memory::{ArchiveReason, TierDecision, TierManager};
use memtier::scheduler::JobStatus;
use memtier::testing::{FlakyStorage, fixture_item};
use memtier::{ConsolidationMode, MemoryEngine, MemoryItem, StoreRequest, Tier};

// =============================================================================
// Fixtures
// =============================================================================

fn test_config() -> Config {
    let mut config = Config::default();
    config.scheduler.workers = 2;
    config.scheduler.partitions = 2;
    config.scheduler.initial_backoff_ms = 1;
    config.scheduler.max_backoff_ms = 5;
    config.scheduler.light_interval_secs = 0;
    config.scheduler.deep_interval_secs = 0;
    config.scheduler.full_interval_secs = 0;
    config
}

fn engine_over(storage: Arc<dyn StorageIndex>, config: Config) -> MemoryEngine {
    MemoryEngine::new(
        config,
        storage,
        Arc::new(HeuristicIntelligence::new()),
        Arc::new(HashEmbedder::default()),
        Arc::new(InMemoryAuditLog::new()),
    )
}

async fn active_items(store: &LocalStore) -> Vec<MemoryItem> {
    store
        .scan(None, 1000)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| !i.is_archived)
        .collect()
}

// =============================================================================
// Tiers
// =============================================================================

mod tier_tests {
    use super::*;

    #[tokio::test]
    async fn test_new_items_start_in_working_memory() {
        let engine = MemoryEngine::in_memory(test_config());
        let outcome = engine
            .store(StoreRequest::new("Remember to use vector indexing").with_importance(0.9))
            .await
            .unwrap();

        let item = engine.get(outcome.id).await.unwrap().unwrap();
        assert_eq!(item.tier, Tier::Working);
        assert_eq!(item.access_count, 0);
        engine.shutdown().await;
    }

    #[test]
    fn test_accessed_working_item_earns_promotion() {
        let mut item = fixture_item("Remember to use vector indexing", Duration::hours(1));
        item.set_importance(0.9);
        item.access_count = 6;

        let tiers = TierManager::default();
        let now = Utc::now();
        assert!(tiers.should_promote(&item, now));
        assert_eq!(tiers.evaluate(&item, now), TierDecision::Promote(Tier::ShortTerm));
    }

    #[tokio::test]
    async fn test_light_pass_promotes_and_archives() {
        let store = Arc::new(LocalStore::in_memory());

        let mut busy = fixture_item("Remember to use vector indexing", Duration::hours(1));
        busy.set_importance(0.9);
        busy.access_count = 6;

        // outside the light window, so only a deep pass looks at it
        let mut stale = fixture_item("Old scratch note", Duration::days(120));
        stale.set_importance(0.1);

        store.upsert(busy.clone()).await.unwrap();
        store.upsert(stale.clone()).await.unwrap();

        let engine = engine_over(store.clone(), test_config());
        let light = engine.consolidate(ConsolidationMode::Light).await.unwrap();
        assert_eq!(light.promoted, 1);
        assert_eq!(light.archived, 0);
        assert_eq!(
            store.get(busy.id).await.unwrap().unwrap().tier,
            Tier::ShortTerm
        );

        let deep = engine.consolidate(ConsolidationMode::Deep).await.unwrap();
        assert_eq!(deep.archived, 1);
        let stale = store.get(stale.id).await.unwrap().unwrap();
        assert!(stale.is_archived);
        assert_eq!(stale.archive_reason, Some(ArchiveReason::Stale));

        // lifecycle never deletes
        assert_eq!(store.stats().await.unwrap().total, 2);
        engine.shutdown().await;
    }
}

// =============================================================================
// Consolidation merges
// =============================================================================

mod merge_tests {
    use super::*;

    #[tokio::test]
    async fn test_light_pass_merges_hash_collisions() {
        let store = Arc::new(LocalStore::in_memory());
        let mut a = fixture_item("Deploy with blue green", Duration::hours(3));
        let mut b = fixture_item("Blue green deploys only", Duration::hours(2));
        a.content_hash = "abc123".into();
        b.content_hash = "abc123".into();
        a.set_importance(0.4);
        b.set_importance(0.7);
        store.upsert(a.clone()).await.unwrap();
        store.upsert(b.clone()).await.unwrap();

        let engine = engine_over(store.clone(), test_config());
        let summary = engine.consolidate(ConsolidationMode::Light).await.unwrap();
        assert_eq!(summary.merged, 1);
        assert!(summary.failed_jobs.is_empty());

        let survivors = active_items(&store).await;
        assert_eq!(survivors.len(), 1);
        let survivor = &survivors[0];
        assert_eq!(survivor.importance, 0.7);
        let mut sources = survivor.merged_from.clone();
        sources.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(sources, expected);

        for id in [a.id, b.id] {
            let original = store.get(id).await.unwrap().unwrap();
            assert!(original.is_archived);
            assert_eq!(original.archive_reason, Some(ArchiveReason::Merged));
            assert_eq!(original.merged_into, Some(survivor.id));
        }

        let history = engine.history(a.id).await.unwrap();
        assert!(history.iter().any(|e| e.action == AuditAction::Archived));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_passes_are_idempotent() {
        let store = Arc::new(LocalStore::in_memory());
        for age in [3, 2, 1] {
            let mut item = fixture_item(&format!("cache warmup note {age}"), Duration::hours(age));
            item.content_hash = "same-note".into();
            store.upsert(item).await.unwrap();
        }

        let engine = engine_over(store.clone(), test_config());
        let first = engine.consolidate(ConsolidationMode::Deep).await.unwrap();
        assert_eq!(first.merged, 1);
        let after_first = store.stats().await.unwrap();

        let second = engine.consolidate(ConsolidationMode::Deep).await.unwrap();
        assert_eq!(second.merged, 0);
        assert_eq!(second.archived, 0);
        assert_eq!(store.stats().await.unwrap(), after_first);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cached_reads_see_merge_results() {
        let store = Arc::new(LocalStore::in_memory());
        let engine = engine_over(store.clone(), test_config());

        let stored = engine
            .store(StoreRequest::new("Rotate credentials every quarter"))
            .await
            .unwrap();
        // warm every cache level
        assert!(!engine.get(stored.id).await.unwrap().unwrap().is_archived);

        // a second copy written behind the engine's back
        let twin = fixture_item("rotate credentials every QUARTER", Duration::zero());
        store.upsert(twin.clone()).await.unwrap();

        let summary = engine.consolidate(ConsolidationMode::Light).await.unwrap();
        assert_eq!(summary.merged, 1);

        let cached = engine.get(stored.id).await.unwrap().unwrap();
        assert!(cached.is_archived);
        assert!(cached.merged_into.is_some());
        engine.shutdown().await;
    }
}

// =============================================================================
// Retries and dead letters
// =============================================================================

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(LocalStore::in_memory());
        store
            .upsert(fixture_item("Keep retries bounded", Duration::hours(1)))
            .await
            .unwrap();
        let flaky = Arc::new(FlakyStorage::new(store.clone(), 2));

        let mut config = test_config();
        config.scheduler.partitions = 1;
        let engine = engine_over(flaky.clone(), config);

        let summary = engine.consolidate(ConsolidationMode::Light).await.unwrap();
        assert!(summary.failed_jobs.is_empty());
        assert_eq!(flaky.tripped(), 2);
        assert!(engine.dead_letter_jobs().await.is_empty());

        let retried = futures::future::join_all(
            summary.job_ids.iter().map(|id| engine.get_job_status(*id)),
        )
        .await
        .into_iter()
        .map(|job| job.unwrap())
        .filter(|job| job.retry_count > 0)
        .count();
        assert!(retried >= 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let store = Arc::new(LocalStore::in_memory());
        let flaky = Arc::new(FlakyStorage::new(store, u32::MAX));

        let mut config = test_config();
        config.scheduler.partitions = 1;
        config.scheduler.max_retries = 2;
        let engine = engine_over(flaky, config);

        let summary = engine.consolidate(ConsolidationMode::Light).await.unwrap();
        assert_eq!(summary.failed_jobs.len(), 3);

        let dead = engine.dead_letter_jobs().await;
        assert_eq!(dead.len(), 3);
        for job in &dead {
            assert_eq!(job.status, JobStatus::Dead);
            assert_eq!(job.retry_count, 2);
            assert!(job.last_error.as_deref().unwrap().contains("injected"));
        }

        let status = engine.get_job_status(summary.failed_jobs[0]).await.unwrap();
        assert_eq!(status.status, JobStatus::Dead);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let engine = MemoryEngine::in_memory(test_config());
        let err = engine.get_job_status(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, memtier::MemtierError::NotFound(_)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_consolidate_after_shutdown_is_rejected() {
        let engine = MemoryEngine::in_memory(test_config());
        engine.shutdown().await;
        engine.shutdown().await;

        let err = engine
            .consolidate(ConsolidationMode::Light)
            .await
            .unwrap_err();
        assert!(matches!(err, memtier::MemtierError::Shutdown));
    }
}

// =============================================================================
// Triggers
// =============================================================================

#[tokio::test]
async fn test_light_trigger_runs_on_its_cadence() {
    let store = Arc::new(LocalStore::in_memory());
    let mut a = fixture_item("Pin dependency versions", Duration::hours(2));
    let mut b = fixture_item("Pin the dependency versions", Duration::hours(1));
    a.content_hash = "pin-deps".into();
    b.content_hash = "pin-deps".into();
    store.upsert(a).await.unwrap();
    store.upsert(b).await.unwrap();

    let mut config = test_config();
    config.scheduler.light_interval_secs = 1;
    let engine = engine_over(store.clone(), config);
    let triggers = engine.spawn_triggers();
    assert_eq!(triggers.len(), 1);

    let mut merged = false;
    for _ in 0..50 {
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        if active_items(&store).await.len() == 1 {
            merged = true;
            break;
        }
    }
    assert!(merged, "light trigger never merged the duplicates");

    engine.shutdown().await;
    for trigger in triggers {
        trigger.abort();
    }
}
