//! Merge resolver
//!
//! Builds the surviving item for a set of duplicates. Sources are never modified here; the
//! caller commits the result atomically (archive originals + insert merged).

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::collab::{Embedder, IntelligenceService};
use crate::config::MergePolicy;
use crate::error::{MemtierError, Result};
use crate::memory::decay::DecayEngine;
use crate::memory::types::MemoryItem;

/// Importance of a merged item under `policy`
pub fn merged_importance(sources: &[MemoryItem], policy: MergePolicy) -> f32 {
    match policy {
        MergePolicy::Max => sources
            .iter()
            .map(|s| s.importance)
            .fold(0.0f32, f32::max),
        MergePolicy::WeightedAverage => {
            let (sum, weight) = sources.iter().fold((0.0f64, 0.0f64), |(sum, weight), s| {
                let w = s.access_count as f64 + 1.0;
                (sum + s.importance as f64 * w, weight + w)
            });
            if weight == 0.0 {
                0.0
            } else {
                (sum / weight) as f32
            }
        }
    }
}

/// How the duplicates were detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Same normalized content; the oldest text is kept verbatim
    Exact,
    /// Near-duplicate embeddings; the text is summarized by the intelligence collaborator
    Semantic,
}

pub struct MergeResolver {
    intelligence: Arc<dyn IntelligenceService>,
    embedder: Arc<dyn Embedder>,
    decay: DecayEngine,
    policy: MergePolicy,
}

impl MergeResolver {
    pub fn new(
        intelligence: Arc<dyn IntelligenceService>,
        embedder: Arc<dyn Embedder>,
        decay: DecayEngine,
        policy: MergePolicy,
    ) -> Self {
        Self {
            intelligence,
            embedder,
            decay,
            policy,
        }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Build a new surviving item from `sources` (at least two, all active)
    pub async fn resolve(
        &self,
        sources: &[MemoryItem],
        kind: MergeKind,
        now: DateTime<Utc>,
    ) -> Result<MemoryItem> {
        let mut ordered: Vec<&MemoryItem> = sources.iter().collect();
        ordered.sort_by_key(|s| (s.created_at, s.id));

        let Some(oldest) = ordered.first().copied() else {
            return Err(MemtierError::Validation("merge needs at least one source".into()));
        };

        let (content, embedding) = match kind {
            MergeKind::Exact => (oldest.content.clone(), oldest.embedding.clone()),
            MergeKind::Semantic => {
                let content = self.intelligence.summarize_merge(sources).await?;
                let embedding = self.embedder.embed(&content).await?;
                (content, embedding)
            }
        };

        let mut merged = MemoryItem::new(content, embedding, now);
        merged.kind = oldest.kind.clone();
        merged.created_at = oldest.created_at;
        merged.importance = merged_importance(sources, self.policy).clamp(0.0, 1.0);
        merged.category = ordered.iter().find_map(|s| s.category.clone());
        merged.merged_from = ordered.iter().map(|s| s.id).collect();

        for source in &ordered {
            merged.tags.extend(source.tags.iter().cloned());
            for entity in &source.entities {
                if !merged.entities.iter().any(|e| e.eq_ignore_ascii_case(entity)) {
                    merged.entities.push(entity.clone());
                }
            }
            merged.access_count = merged.access_count.saturating_add(source.access_count);
        }
        merged.accessed_at = ordered
            .iter()
            .map(|s| s.accessed_at)
            .max()
            .unwrap_or(oldest.created_at);

        // most durable tier wins, with the TTL clock of its earliest holder
        if let Some(top) = ordered.iter().max_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| b.tier_entered_at.cmp(&a.tier_entered_at))
        }) {
            merged.tier = top.tier;
            merged.tier_entered_at = top.tier_entered_at;
        }

        merged.decay_score = self
            .decay
            .score(merged.importance, merged.age_days(now));
        merged.verification_score = self.intelligence.debate(&merged).await?.clamp(0.0, 1.0);

        merged.validate(now)?;
        Ok(merged)
    }

    /// Fold an incoming duplicate into an existing item at ingestion time
    pub fn absorb(&self, existing: &MemoryItem, incoming: &MemoryItem, now: DateTime<Utc>) -> MemoryItem {
        let mut updated = existing.clone();
        updated.tags.extend(incoming.tags.iter().cloned());
        for entity in &incoming.entities {
            if !updated.entities.iter().any(|e| e.eq_ignore_ascii_case(entity)) {
                updated.entities.push(entity.clone());
            }
        }
        if updated.category.is_none() {
            updated.category = incoming.category.clone();
        }
        updated.importance = merged_importance(&[existing.clone(), incoming.clone()], self.policy);
        updated.decay_score = self.decay.score(updated.importance, updated.age_days(now));
        updated.updated_at = now;
        updated
    }
}
