//! Memory Ingestion Pipeline
//!
//! Orchestrates the full ingestion flow: validation, entity extraction, embedding generation,
//! initial tier assignment, verification, and the atomic conditional insert.
//!
//! Duplicate detection never reads-then-inserts: the storage collaborator decides atomically
//! whether an active item already carries the content hash. On a collision the incoming
//! request is folded into the existing item and its id is returned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::cache::CacheManager;
use crate::collab::{Embedder, InsertOutcome, IntelligenceService};
use crate::dedup::DedupEngine;
use crate::error::{MemtierError, Result};
use crate::memory::tiers::TierManager;
use crate::memory::types::{ItemKind, MemoryItem};
use crate::scheduler::locks::ItemLocks;

/// Importance used when the caller gives no hint
pub const DEFAULT_IMPORTANCE: f32 = 0.5;

/// Insert attempts before a collision that keeps getting archived underneath us is reported
const MAX_INSERT_ATTEMPTS: u32 = 3;

/// Caller input for `store`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreRequest {
    pub content: String,
    pub tags: Vec<String>,
    pub importance: Option<f32>,
    pub category: Option<String>,
    pub kind: ItemKind,
}

impl StoreRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = kind;
        self
    }

    /// Reject malformed input before any collaborator is called
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(MemtierError::Validation("content must not be empty".into()));
        }
        if let Some(importance) = self.importance {
            if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
                return Err(MemtierError::Validation(format!(
                    "importance must be within [0, 1], got {importance}"
                )));
            }
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(MemtierError::Validation("tags must not be empty".into()));
        }
        if self.category.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(MemtierError::Validation("category must not be empty".into()));
        }
        match &self.kind {
            ItemKind::Memory => {}
            ItemKind::Skill { name } => {
                if name.trim().is_empty() {
                    return Err(MemtierError::Validation("skill name must not be empty".into()));
                }
            }
            ItemKind::Consensus { consensus_score } => {
                if !consensus_score.is_finite() || !(0.0..=1.0).contains(consensus_score) {
                    return Err(MemtierError::Validation(format!(
                        "consensus score must be within [0, 1], got {consensus_score}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// What `store` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    pub id: Uuid,
    /// The content matched an existing active item, which absorbed the request
    pub deduplicated: bool,
}

/// Pipeline for ingesting content into the memory system.
pub struct IngestionPipeline {
    cache: Arc<CacheManager>,
    locks: ItemLocks,
    tiers: TierManager,
    dedup: Arc<DedupEngine>,
    embedder: Arc<dyn Embedder>,
    intelligence: Arc<dyn IntelligenceService>,
    audit: Arc<dyn AuditSink>,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<CacheManager>,
        locks: ItemLocks,
        tiers: TierManager,
        dedup: Arc<DedupEngine>,
        embedder: Arc<dyn Embedder>,
        intelligence: Arc<dyn IntelligenceService>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            cache,
            locks,
            tiers,
            dedup,
            embedder,
            intelligence,
            audit,
        }
    }

    /// Build the item a request would create, without storing it
    pub async fn prepare(&self, request: StoreRequest, now: DateTime<Utc>) -> Result<MemoryItem> {
        request.validate()?;

        let content = request.content.trim().to_string();
        let entities = self.intelligence.extract_entities(&content).await?;
        let embedding = self.embedder.embed(&content).await?;

        let mut item = MemoryItem::new(content, embedding, now);
        item.kind = request.kind;
        item.tags = request.tags.into_iter().map(|t| t.trim().to_string()).collect();
        item.category = request.category;
        item.entities = entities;
        item.set_importance(request.importance.unwrap_or(DEFAULT_IMPORTANCE));
        item.tier = self.tiers.assign_initial_tier(&item);

        let verification = match &item.kind {
            ItemKind::Consensus { .. } => self.intelligence.debate(&item).await?,
            ItemKind::Memory | ItemKind::Skill { .. } => self.intelligence.verify(&item).await?.score,
        };
        item.verification_score = verification.clamp(0.0, 1.0);

        item.validate(now)?;
        Ok(item)
    }

    /// Ingest a request, returning the id of the item that now holds its content
    pub async fn ingest(&self, request: StoreRequest, now: DateTime<Utc>) -> Result<StoreOutcome> {
        let item = self.prepare(request, now).await?;
        let hash = item.content_hash.clone();

        for attempt in 0..MAX_INSERT_ATTEMPTS {
            match self.cache.insert_if_absent(&hash, item.clone()).await? {
                InsertOutcome::Inserted(id) => {
                    info!(item_id = %id, tier = %item.tier, importance = item.importance, "Stored memory");
                    self.audit
                        .append(
                            AuditEvent::new(id, AuditAction::Created, "ingest", "stored")
                                .with_snapshot(&item),
                        )
                        .await?;
                    return Ok(StoreOutcome {
                        id,
                        deduplicated: false,
                    });
                }
                InsertOutcome::Existing(existing) => {
                    let _guard = self.locks.acquire(&[existing.id]).await?;
                    let current = self
                        .cache
                        .storage()
                        .get(existing.id)
                        .await?
                        .filter(|i| !i.is_archived);
                    let Some(current) = current else {
                        // merged or archived since the insert check; try again
                        debug!(item_id = %existing.id, attempt, "Duplicate vanished, retrying insert");
                        continue;
                    };

                    let updated = self.dedup.resolver().absorb(&current, &item, now);
                    if !self.cache.put_if_version(updated.clone(), current.version).await? {
                        // an access landed since the read; fold again from the fresh item
                        debug!(item_id = %current.id, attempt, "Duplicate changed during fold, retrying");
                        continue;
                    }
                    info!(item_id = %updated.id, "Folded duplicate content into existing memory");
                    self.audit
                        .append(
                            AuditEvent::new(
                                updated.id,
                                AuditAction::DedupOnIngest,
                                "ingest",
                                "exact content match",
                            )
                            .with_snapshot(&updated),
                        )
                        .await?;
                    return Ok(StoreOutcome {
                        id: updated.id,
                        deduplicated: true,
                    });
                }
            }
        }

        Err(MemtierError::ConcurrencyConflict(item.id))
    }
}
