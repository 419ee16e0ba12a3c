//! Consolidation job handlers
//!
//! Every job walks its scope in id order, one page of `batch_size` items at a time, and
//! checkpoints after each processed item. A retried job resumes after its checkpoint with the
//! counters it had accumulated, so re-running a partially completed job never double counts.
//!
//! Each per-item step re-reads the item under its advisory lock and writes only when something
//! changed, which keeps every handler idempotent. Access bookkeeping does not take item locks, so
//! writes are conditional on the version that was read: if an access lands in between, the step
//! is recomputed from the fresh item instead of overwriting the access.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::cache::CacheManager;
use crate::collab::{Embedder, IntelligenceService};
use crate::dedup::DedupEngine;
use crate::error::{MemtierError, Result};
use crate::memory::decay::DecayEngine;
use crate::memory::tiers::{TierDecision, TierManager};
use crate::memory::types::{MemoryItem, Tier, content_hash};
use crate::scheduler::job::{ConsolidationJob, JobReport, JobType};
use crate::scheduler::locks::ItemLocks;
use crate::scheduler::worker::{JobContext, JobHandler};

/// Versioned write attempts per item before giving up with a conflict
const UPDATE_ATTEMPTS: u32 = 5;

/// Runs decay, dedup, merge, archive and reindex jobs against the shared stores
pub struct ConsolidationHandler {
    cache: Arc<CacheManager>,
    locks: ItemLocks,
    tiers: TierManager,
    decay: DecayEngine,
    dedup: Arc<DedupEngine>,
    embedder: Arc<dyn Embedder>,
    intelligence: Arc<dyn IntelligenceService>,
    audit: Arc<dyn AuditSink>,
}

impl ConsolidationHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<CacheManager>,
        locks: ItemLocks,
        tiers: TierManager,
        decay: DecayEngine,
        dedup: Arc<DedupEngine>,
        embedder: Arc<dyn Embedder>,
        intelligence: Arc<dyn IntelligenceService>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            cache,
            locks,
            tiers,
            decay,
            dedup,
            embedder,
            intelligence,
            audit,
        }
    }

    async fn process(
        &self,
        job_type: JobType,
        id: Uuid,
        now: DateTime<Utc>,
        report: &mut JobReport,
    ) -> Result<()> {
        match job_type {
            JobType::Decay => {
                if self.decay_item(id, now).await? {
                    report.decayed += 1;
                }
            }
            JobType::Archive => match self.enforce_tier(id, now).await? {
                TierDecision::Promote(_) => report.promoted += 1,
                TierDecision::Archive(_) => report.archived += 1,
                TierDecision::Stay => {}
            },
            JobType::Dedup => {
                if let Some(outcome) = self.dedup.dedup_exact(id, now).await? {
                    report.merged += 1;
                    report.archived += outcome.sources.len() as u64;
                }
            }
            JobType::Merge => {
                if let Some(outcome) = self.dedup.dedup_semantic(id, now).await? {
                    report.merged += 1;
                    report.archived += outcome.sources.len() as u64;
                }
            }
            JobType::Reindex => {
                if self.reindex_item(id, now).await? {
                    report.reindexed += 1;
                }
            }
        }
        Ok(())
    }

    /// Authoritative read of an active item. Caller holds the item lock.
    async fn read_active(&self, id: Uuid) -> Result<Option<MemoryItem>> {
        Ok(self
            .cache
            .storage()
            .get(id)
            .await?
            .filter(|item| !item.is_archived))
    }

    /// Apply `change` to the current active item and write it back, unless an access or other
    /// write landed since the read, in which case the change is recomputed on the fresh item.
    /// `change` returns false when there is nothing to write. Caller holds the item lock.
    async fn update_active<F>(&self, id: Uuid, mut change: F) -> Result<Option<MemoryItem>>
    where
        F: FnMut(&mut MemoryItem) -> Result<bool> + Send,
    {
        for attempt in 0..UPDATE_ATTEMPTS {
            let Some(mut item) = self.read_active(id).await? else {
                return Ok(None);
            };
            let expected = item.version;
            if !change(&mut item)? {
                return Ok(None);
            }
            if self.cache.put_if_version(item.clone(), expected).await? {
                item.version = expected + 1;
                return Ok(Some(item));
            }
            debug!(item_id = %id, attempt, "Item changed during update, recomputing");
        }
        Err(MemtierError::ConcurrencyConflict(id))
    }

    async fn decay_item(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.locks.acquire(&[id]).await?;

        let mut before = 0.0;
        let updated = self
            .update_active(id, |item| {
                before = item.decay_score;
                if !self.decay.refresh(item, now)? {
                    return Ok(false);
                }
                item.updated_at = now;
                Ok(true)
            })
            .await?;
        let Some(item) = updated else {
            return Ok(false);
        };

        let reason = format!("decay {before:.4} -> {:.4}", item.decay_score);
        self.audit
            .append(
                AuditEvent::new(id, AuditAction::DecayUpdated, "consolidation:decay", reason)
                    .with_snapshot(&item),
            )
            .await?;
        Ok(true)
    }

    async fn enforce_tier(&self, id: Uuid, now: DateTime<Utc>) -> Result<TierDecision> {
        let _guard = self.locks.acquire(&[id]).await?;

        let mut from = Tier::Working;
        let mut decision = TierDecision::Stay;
        let updated = self
            .update_active(id, |item| {
                from = item.tier;
                decision = self.tiers.evaluate(item, now);
                Ok(self.tiers.apply(item, decision, now))
            })
            .await?;
        let Some(item) = updated else {
            return Ok(TierDecision::Stay);
        };

        let (action, reason) = match decision {
            TierDecision::Promote(to) => {
                debug!(item_id = %id, from = %from, to = %to, "Promoted item");
                (AuditAction::Promoted, format!("promoted {from} -> {to}"))
            }
            TierDecision::Archive(reason) => {
                debug!(item_id = %id, reason = ?reason, "Archived item");
                (AuditAction::Archived, format!("archived from {from}: {reason:?}"))
            }
            TierDecision::Stay => return Ok(TierDecision::Stay),
        };

        self.audit
            .append(AuditEvent::new(id, action, "consolidation:tier", reason).with_snapshot(&item))
            .await?;
        Ok(decision)
    }

    async fn reindex_item(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.locks.acquire(&[id]).await?;
        let Some(current) = self.read_active(id).await? else {
            return Ok(false);
        };

        // content only changes under the item lock, so these stay valid across retries
        let hash = content_hash(&current.content);
        let embedding = self.embedder.embed(&current.content).await?;
        let entities = self.intelligence.extract_entities(&current.content).await?;

        let updated = self
            .update_active(id, |item| {
                let mut changed = false;
                if hash != item.content_hash {
                    item.content_hash = hash.clone();
                    changed = true;
                }
                if embedding != item.embedding {
                    item.embedding = embedding.clone();
                    changed = true;
                }
                for entity in &entities {
                    if !item.entities.iter().any(|e| e.eq_ignore_ascii_case(entity)) {
                        item.entities.push(entity.clone());
                        changed = true;
                    }
                }
                if changed {
                    item.updated_at = now;
                }
                Ok(changed)
            })
            .await?;
        let Some(item) = updated else {
            return Ok(false);
        };

        self.audit
            .append(
                AuditEvent::new(id, AuditAction::Reindexed, "consolidation:reindex", "recomputed hash and embedding")
                    .with_snapshot(&item),
            )
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl JobHandler for ConsolidationHandler {
    async fn handle(&self, job: &ConsolidationJob, ctx: &JobContext) -> Result<JobReport> {
        let now = Utc::now();
        let batch_size = job.payload.batch_size.max(1);
        let scope = job.payload.scope;
        let mut report = job.progress;
        let mut cursor = job.checkpoint;

        if let Some(checkpoint) = cursor {
            debug!(job_id = %job.id, checkpoint = %checkpoint, "Resuming job from checkpoint");
        }

        loop {
            let page = self.cache.storage().scan(cursor, batch_size).await?;
            let exhausted = page.len() < batch_size;

            for item in page {
                cursor = Some(item.id);
                if item.is_archived || !scope.includes(&item.id, item.created_at) {
                    continue;
                }
                self.process(job.job_type, item.id, now, &mut report).await?;
                report.processed += 1;
                ctx.checkpoint(item.id, report).await;
            }

            if exhausted {
                break;
            }
        }

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            partition = scope.partition.index,
            processed = report.processed,
            merged = report.merged,
            archived = report.archived,
            promoted = report.promoted,
            decayed = report.decayed,
            reindexed = report.reindexed,
            "Consolidation job finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditQuery, InMemoryAuditLog};
    use crate::collab::{HashEmbedder, HeuristicIntelligence, LocalStore, StorageIndex};
    use crate::config::{CacheConfig, DedupConfig, MergePolicy};
    use crate::dedup::MergeResolver;
    use crate::memory::types::Tier;
    use crate::scheduler::job::{JobPayload, JobPriority, JobScope};
    use crate::scheduler::queue::JobQueue;
    use crate::testing::{DelayedStorage, fixture_item};
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    struct Fixture {
        store: Arc<LocalStore>,
        audit: Arc<InMemoryAuditLog>,
        cache: Arc<CacheManager>,
        queue: Arc<JobQueue>,
        handler: ConsolidationHandler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LocalStore::in_memory());
        fixture_over(store.clone(), store)
    }

    /// Handler whose cache talks to `storage`, which wraps `store`
    fn fixture_over(store: Arc<LocalStore>, storage: Arc<dyn StorageIndex>) -> Fixture {
        let audit = Arc::new(InMemoryAuditLog::new());
        let cache = Arc::new(CacheManager::new(storage, &CacheConfig::default()));
        let intelligence: Arc<dyn IntelligenceService> = Arc::new(HeuristicIntelligence::new());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
        let locks = ItemLocks::default();
        let dedup = Arc::new(DedupEngine::new(
            cache.clone(),
            locks.clone(),
            MergeResolver::new(
                intelligence.clone(),
                embedder.clone(),
                DecayEngine::default(),
                MergePolicy::Max,
            ),
            audit.clone(),
            DedupConfig::default(),
        ));
        let handler = ConsolidationHandler::new(
            cache.clone(),
            locks,
            TierManager::default(),
            DecayEngine::default(),
            dedup,
            embedder,
            intelligence,
            audit.clone(),
        );
        Fixture {
            store,
            audit,
            cache,
            queue: Arc::new(JobQueue::new()),
            handler,
        }
    }

    fn job(job_type: JobType, batch_size: usize) -> ConsolidationJob {
        ConsolidationJob::new(
            job_type,
            JobPriority::High,
            JobPayload {
                scope: JobScope::default(),
                batch_size,
            },
        )
    }

    async fn run(f: &Fixture, job: ConsolidationJob) -> JobReport {
        let id = f.queue.enqueue(job).await;
        let running = f.queue.next().await.unwrap();
        let ctx = JobContext::new(f.queue.clone(), id);
        f.handler.handle(&running, &ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_decay_job_updates_and_is_idempotent() {
        let f = fixture();
        let item = fixture_item("Old note about backups", Duration::days(30));
        f.store.upsert(item.clone()).await.unwrap();

        let report = run(&f, job(JobType::Decay, 10)).await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.decayed, 1);

        let stored = f.store.get(item.id).await.unwrap().unwrap();
        assert!(stored.decay_score < stored.importance);

        let events = f.audit.query(&AuditQuery::for_item(item.id)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::DecayUpdated);
    }

    #[tokio::test]
    async fn test_archive_job_promotes_and_archives() {
        let f = fixture();
        let mut hot = fixture_item("Remember to use vector indexing", Duration::hours(1));
        hot.set_importance(0.9);
        hot.access_count = 6;
        let mut stale = fixture_item("Ancient scratch note", Duration::days(120));
        stale.set_importance(0.1);
        stale.move_to_tier(Tier::LongTerm, stale.created_at);
        f.store.upsert(hot.clone()).await.unwrap();
        f.store.upsert(stale.clone()).await.unwrap();

        let report = run(&f, job(JobType::Archive, 10)).await;
        assert_eq!(report.promoted, 1);
        assert_eq!(report.archived, 1);

        assert_eq!(f.store.get(hot.id).await.unwrap().unwrap().tier, Tier::ShortTerm);
        assert!(f.store.get(stale.id).await.unwrap().unwrap().is_archived);
    }

    #[tokio::test]
    async fn test_dedup_job_merges_hash_collisions() {
        let f = fixture();
        let mut a = fixture_item("Deploy with blue green", Duration::hours(2));
        let mut b = fixture_item("deploy with  BLUE green", Duration::hours(1));
        a.content_hash = "abc123".into();
        b.content_hash = "abc123".into();
        f.store.upsert(a.clone()).await.unwrap();
        f.store.upsert(b.clone()).await.unwrap();

        let report = run(&f, job(JobType::Dedup, 1)).await;
        assert_eq!(report.merged, 1);
        assert_eq!(report.archived, 2);
        assert_eq!(f.store.stats().await.unwrap().active, 1);

        // second pass finds nothing
        let again = run(&f, job(JobType::Dedup, 1)).await;
        assert_eq!(again.merged, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_resumes_after_last_item() {
        let f = fixture();
        let mut ids = Vec::new();
        for i in 0..4 {
            let item = fixture_item(&format!("note number {i}"), Duration::days(10));
            ids.push(item.id);
            f.store.upsert(item).await.unwrap();
        }
        ids.sort();

        let mut resumed = job(JobType::Decay, 2);
        resumed.checkpoint = Some(ids[1]);
        resumed.progress = JobReport {
            processed: 2,
            decayed: 2,
            ..JobReport::default()
        };

        let report = run(&f, resumed).await;
        assert_eq!(report.processed, 4);
        assert_eq!(report.decayed, 4);

        // items before the checkpoint were not touched by this run
        let untouched = f.store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(untouched.decay_score, untouched.importance);
    }

    #[tokio::test]
    async fn test_reindex_repairs_stale_hash() {
        let f = fixture();
        let mut item = fixture_item("Kafka retention is seven days", Duration::hours(3));
        item.content_hash = "stale".into();
        f.store.upsert(item.clone()).await.unwrap();

        let report = run(&f, job(JobType::Reindex, 10)).await;
        assert_eq!(report.reindexed, 1);

        let stored = f.store.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.content_hash, content_hash("Kafka retention is seven days"));
        assert!(!stored.embedding.is_empty());
    }

    #[tokio::test]
    async fn test_access_during_decay_is_kept() {
        let store = Arc::new(LocalStore::in_memory());
        let slow = DelayedStorage::new(store.clone()).with_read_delay(StdDuration::from_millis(40));
        let f = fixture_over(store.clone(), Arc::new(slow));
        let item = fixture_item("Quarterly capacity review notes", Duration::days(20));
        store.upsert(item.clone()).await.unwrap();

        // the access commits while the decay step is still waiting on its read
        let (report, accessed) = tokio::join!(run(&f, job(JobType::Decay, 10)), async {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            f.cache.record_access(item.id, Utc::now()).await.unwrap()
        });
        assert_eq!(report.decayed, 1);
        assert_eq!(accessed.access_count, 1);

        let stored = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.access_count, 1);
        assert!(stored.decay_score < stored.importance);
    }

    #[tokio::test]
    async fn test_access_during_promotion_is_kept() {
        let store = Arc::new(LocalStore::in_memory());
        let slow = DelayedStorage::new(store.clone()).with_read_delay(StdDuration::from_millis(40));
        let f = fixture_over(store.clone(), Arc::new(slow));
        let mut item = fixture_item("Runbook for failing over the primary", Duration::hours(2));
        item.set_importance(0.95);
        store.upsert(item.clone()).await.unwrap();

        let (report, _) = tokio::join!(run(&f, job(JobType::Archive, 10)), async {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            f.cache.record_access(item.id, Utc::now()).await.unwrap()
        });
        assert_eq!(report.promoted, 1);

        let stored = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.tier, Tier::ShortTerm);
        assert_eq!(stored.access_count, 1);
        let cached = f.cache.get(item.id).await.unwrap().unwrap();
        assert_eq!(cached.access_count, 1);
        assert_eq!(cached.tier, Tier::ShortTerm);
    }
}
