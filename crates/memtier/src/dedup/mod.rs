//! Two-stage deduplication
//!
//! 1. Exact stage: O(1) content-hash lookup. Every active item sharing the hash is merged.
//! 2. Semantic stage: nearest neighbours above a strict similarity threshold are merged
//!    through the [`MergeResolver`], which asks the intelligence collaborator for the text.
//!
//! Both stages lock every item they touch (sorted order), re-read the items under the lock and
//! commit through the storage collaborator's atomic `commit_merge`. Originals are archived with
//! `merged_into` pointing at the new item, never deleted. Re-running either stage over a merged
//! set finds nothing to merge because archived items are excluded from every lookup.

pub mod resolver;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::cache::CacheManager;
use crate::config::DedupConfig;
use crate::error::Result;
use crate::memory::types::MemoryItem;
use crate::scheduler::locks::ItemLocks;

pub use resolver::{MergeKind, MergeResolver, merged_importance};

/// A committed merge
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged_id: Uuid,
    pub sources: Vec<Uuid>,
}

pub struct DedupEngine {
    cache: Arc<CacheManager>,
    locks: ItemLocks,
    resolver: MergeResolver,
    audit: Arc<dyn AuditSink>,
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(
        cache: Arc<CacheManager>,
        locks: ItemLocks,
        resolver: MergeResolver,
        audit: Arc<dyn AuditSink>,
        config: DedupConfig,
    ) -> Self {
        Self {
            cache,
            locks,
            resolver,
            audit,
            config,
        }
    }

    pub fn resolver(&self) -> &MergeResolver {
        &self.resolver
    }

    /// Merge every active item sharing `item_id`'s content hash
    pub async fn dedup_exact(&self, item_id: Uuid, now: DateTime<Utc>) -> Result<Option<MergeOutcome>> {
        let Some(item) = self.cache.get(item_id).await? else {
            return Ok(None);
        };
        if item.is_archived {
            return Ok(None);
        }

        let storage = self.cache.storage();
        let group = storage.find_by_hash(&item.content_hash).await?;
        if group.len() < 2 {
            return Ok(None);
        }

        let ids: Vec<Uuid> = group.iter().map(|i| i.id).collect();
        let _guard = self.locks.acquire(&ids).await?;

        // re-read under the lock; another pass may have merged some of them already
        let sources: Vec<MemoryItem> = storage
            .find_by_hash(&item.content_hash)
            .await?
            .into_iter()
            .filter(|i| ids.contains(&i.id))
            .collect();
        if sources.len() < 2 {
            return Ok(None);
        }

        self.merge(&sources, MergeKind::Exact, now).await.map(Some)
    }

    /// Merge `item_id` with its near-duplicate neighbours
    pub async fn dedup_semantic(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<MergeOutcome>> {
        let Some(item) = self.cache.get(item_id).await? else {
            return Ok(None);
        };
        if item.is_archived || item.embedding.is_empty() {
            return Ok(None);
        }

        let storage = self.cache.storage();
        let neighbours: Vec<Uuid> = storage
            .vector_search(
                &item.embedding,
                self.config.neighbor_limit + 1,
                self.config.similarity_threshold,
            )
            .await?
            .into_iter()
            .filter(|n| n.id != item_id)
            .map(|n| n.id)
            .collect();
        if neighbours.is_empty() {
            return Ok(None);
        }

        let mut ids = neighbours;
        ids.push(item_id);
        let _guard = self.locks.acquire(&ids).await?;

        let mut sources = Vec::with_capacity(ids.len());
        for id in &ids {
            match storage.get(*id).await? {
                Some(source) if !source.is_archived => sources.push(source),
                _ if *id == item_id => return Ok(None),
                _ => {}
            }
        }
        if sources.len() < 2 {
            return Ok(None);
        }

        self.merge(&sources, MergeKind::Semantic, now).await.map(Some)
    }

    /// Resolve and atomically commit a merge. Caller holds the locks of all sources.
    async fn merge(
        &self,
        sources: &[MemoryItem],
        kind: MergeKind,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let merged = self.resolver.resolve(sources, kind, now).await?;
        let source_ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();
        let merged_id = merged.id;

        self.cache
            .commit_merge(merged.clone(), &source_ids, now)
            .await?;

        info!(
            merged_id = %merged_id,
            sources = source_ids.len(),
            kind = ?kind,
            "Merged duplicates"
        );

        let actor = match kind {
            MergeKind::Exact => "consolidation:dedup",
            MergeKind::Semantic => "consolidation:merge",
        };
        self.audit
            .append(
                AuditEvent::new(
                    merged_id,
                    AuditAction::Merged,
                    actor,
                    format!("merged {} items", source_ids.len()),
                )
                .with_snapshot(&merged),
            )
            .await?;
        for id in &source_ids {
            debug!(item_id = %id, merged_into = %merged_id, "Archived merge source");
            self.audit
                .append(AuditEvent::new(
                    *id,
                    AuditAction::Archived,
                    actor,
                    format!("merged into {merged_id}"),
                ))
                .await?;
        }

        Ok(MergeOutcome {
            merged_id,
            sources: source_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditQuery, InMemoryAuditLog};
    use crate::collab::{HashEmbedder, HeuristicIntelligence, LocalStore, StorageIndex};
    use crate::config::{CacheConfig, MergePolicy};
    use crate::memory::decay::DecayEngine;

    struct Fixture {
        store: Arc<LocalStore>,
        audit: Arc<InMemoryAuditLog>,
        engine: DedupEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LocalStore::in_memory());
        let audit = Arc::new(InMemoryAuditLog::new());
        let cache = Arc::new(CacheManager::new(store.clone(), &CacheConfig::default()));
        let resolver = MergeResolver::new(
            Arc::new(HeuristicIntelligence::new()),
            Arc::new(HashEmbedder::default()),
            DecayEngine::default(),
            MergePolicy::Max,
        );
        let engine = DedupEngine::new(
            cache,
            ItemLocks::default(),
            resolver,
            audit.clone(),
            DedupConfig::default(),
        );
        Fixture {
            store,
            audit,
            engine,
        }
    }

    fn item(content: &str, embedding: Vec<f32>, hash: Option<&str>) -> MemoryItem {
        let mut item = MemoryItem::new(content, embedding, Utc::now());
        if let Some(hash) = hash {
            item.content_hash = hash.to_string();
        }
        item
    }

    #[tokio::test]
    async fn test_exact_duplicates_merge_once() {
        let f = fixture();
        let a = item("Remember the deploy key", vec![1.0, 0.0], Some("abc123"));
        let b = item("Remember the deploy key", vec![1.0, 0.0], Some("abc123"));
        f.store.upsert(a.clone()).await.unwrap();
        f.store.upsert(b.clone()).await.unwrap();

        let outcome = f.engine.dedup_exact(a.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(outcome.sources.len(), 2);

        for id in [a.id, b.id] {
            let original = f.store.get(id).await.unwrap().unwrap();
            assert!(original.is_archived);
            assert_eq!(original.merged_into, Some(outcome.merged_id));
        }

        // idempotent: nothing left to merge
        for id in [outcome.merged_id, a.id, b.id] {
            assert!(f.engine.dedup_exact(id, Utc::now()).await.unwrap().is_none());
            assert!(f.engine.dedup_semantic(id, Utc::now()).await.unwrap().is_none());
        }

        let events = f
            .audit
            .query(&AuditQuery::for_item(outcome.merged_id))
            .await
            .unwrap();
        assert_eq!(events[0].action, AuditAction::Merged);
    }

    #[tokio::test]
    async fn test_semantic_neighbours_merge() {
        let f = fixture();
        let a = item("Postgres vacuum runs nightly", vec![1.0, 0.0, 0.0], None);
        let b = item("Nightly Postgres vacuum job", vec![0.99, 0.05, 0.0], None);
        let c = item("Unrelated note", vec![0.0, 0.0, 1.0], None);
        for i in [&a, &b, &c] {
            f.store.upsert(i.clone()).await.unwrap();
        }

        let outcome = f.engine.dedup_semantic(a.id, Utc::now()).await.unwrap().unwrap();
        let mut sources = outcome.sources.clone();
        sources.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(sources, expected);
        assert!(!f.store.get(c.id).await.unwrap().unwrap().is_archived);

        let merged = f.store.get(outcome.merged_id).await.unwrap().unwrap();
        assert_eq!(merged.merged_from.len(), 2);
    }

    #[tokio::test]
    async fn test_below_threshold_is_left_alone() {
        let f = fixture();
        let a = item("alpha", vec![1.0, 0.0], None);
        let b = item("beta", vec![0.8, 0.6], None);
        f.store.upsert(a.clone()).await.unwrap();
        f.store.upsert(b.clone()).await.unwrap();

        assert!(f.engine.dedup_semantic(a.id, Utc::now()).await.unwrap().is_none());
        assert_eq!(f.store.stats().await.unwrap().active, 2);
    }
}
