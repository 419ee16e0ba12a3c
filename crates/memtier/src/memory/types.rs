//! Memory item types
//!
//! Defines the core `MemoryItem` record, its tier and variant enums,
//! and content hashing used by exact deduplication.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemtierError, Result};

/// Coarse recency/durability bucket. Declaration order is durability order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Freshly ingested, expires after the working TTL unless promoted
    Working,
    /// Survived working memory, expires after the short-term TTL unless promoted
    ShortTerm,
    /// Durable, no TTL
    LongTerm,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Working, Tier::ShortTerm, Tier::LongTerm];

    /// The next more durable tier, if any
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Working => Some(Tier::ShortTerm),
            Tier::ShortTerm => Some(Tier::LongTerm),
            Tier::LongTerm => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Working => "working",
            Tier::ShortTerm => "short_term",
            Tier::LongTerm => "long_term",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s.trim().to_ascii_lowercase().as_str() {
            "working" => Some(Tier::Working),
            "short_term" | "short-term" | "short" => Some(Tier::ShortTerm),
            "long_term" | "long-term" | "long" => Some(Tier::LongTerm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of knowledge an item carries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemKind {
    /// Plain remembered fact or observation
    #[default]
    Memory,
    /// A learned procedure the agent can reuse
    Skill { name: String },
    /// Outcome of a multi-party debate, with its consensus score
    Consensus { consensus_score: f32 },
}

/// Why an item was archived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    /// Folded into a merged item
    Merged,
    /// Outlived its tier TTL without earning promotion
    TtlExpired,
    /// Old, never accessed and unimportant
    Stale,
}

/// A single knowledge item managed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique identifier
    pub id: Uuid,
    /// Text content
    pub content: String,
    /// Embedding vector as resolved by the embedder
    pub embedding: Vec<f32>,
    /// Variant of knowledge this item carries
    #[serde(default)]
    pub kind: ItemKind,
    /// Current tier. Exactly one at any time.
    pub tier: Tier,
    /// Base importance in [0, 1]
    pub importance: f32,
    /// Time-discounted importance, recomputed by consolidation
    pub decay_score: f32,
    /// Free-form tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Optional category
    #[serde(default)]
    pub category: Option<String>,
    /// Entities mentioned in the content
    #[serde(default)]
    pub entities: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    /// When the item entered its current tier
    pub tier_entered_at: DateTime<Utc>,
    pub access_count: u32,
    /// Score from the intelligence collaborator's verification, in [0, 1]
    pub verification_score: f32,
    /// Hash of the normalized content
    pub content_hash: String,
    pub is_archived: bool,
    #[serde(default)]
    pub archive_reason: Option<ArchiveReason>,
    /// Survivor this item was merged into
    #[serde(default)]
    pub merged_into: Option<Uuid>,
    /// Source items this one was merged from
    #[serde(default)]
    pub merged_from: Vec<Uuid>,
    /// Bumped by the store on every committed write
    #[serde(default)]
    pub version: u64,
}

impl MemoryItem {
    /// Create a new working-tier item stamped at `now`
    pub fn new(content: impl Into<String>, embedding: Vec<f32>, now: DateTime<Utc>) -> Self {
        let content = content.into();
        let content_hash = content_hash(&content);
        Self {
            id: Uuid::new_v4(),
            content,
            embedding,
            kind: ItemKind::Memory,
            tier: Tier::Working,
            importance: 0.5,
            decay_score: 0.5,
            tags: BTreeSet::new(),
            category: None,
            entities: Vec::new(),
            created_at: now,
            updated_at: now,
            accessed_at: now,
            tier_entered_at: now,
            access_count: 0,
            verification_score: 1.0,
            content_hash,
            is_archived: false,
            archive_reason: None,
            merged_into: None,
            merged_from: Vec::new(),
            version: 0,
        }
    }

    /// Set base importance. Decay restarts from the new importance.
    pub fn set_importance(&mut self, importance: f32) {
        self.importance = importance.clamp(0.0, 1.0);
        self.decay_score = self.importance;
    }

    /// Record an access event. Does not touch the decay clock.
    pub fn mark_accessed(&mut self, at: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        if at > self.accessed_at {
            self.accessed_at = at;
        }
    }

    /// Move to `tier`, restarting the tier TTL clock
    pub fn move_to_tier(&mut self, tier: Tier, at: DateTime<Utc>) {
        self.tier = tier;
        self.tier_entered_at = at;
        self.updated_at = at;
    }

    /// Flag as archived. Items are never physically removed by the lifecycle.
    pub fn archive(&mut self, reason: ArchiveReason, at: DateTime<Utc>) {
        self.is_archived = true;
        self.archive_reason = Some(reason);
        self.updated_at = at;
    }

    /// Replace the content, keeping the hash in sync
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.content_hash = content_hash(&self.content);
    }

    /// Age since creation in fractional days
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds() as f64 / 86_400_000.0
    }

    /// Time spent in the current tier, in seconds
    pub fn secs_in_tier(&self, now: DateTime<Utc>) -> i64 {
        (now - self.tier_entered_at).num_seconds()
    }

    /// Check the invariants decay and audit rely on.
    ///
    /// Never repairs anything: a broken item is reported, not healed.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        let fail = |reason: String| Err(MemtierError::consistency(self.id, reason));

        if self.created_at > now {
            return fail(format!("created_at {} is in the future", self.created_at));
        }
        if self.updated_at < self.created_at {
            return fail("updated_at precedes created_at".to_string());
        }
        if self.accessed_at < self.created_at {
            return fail("accessed_at precedes created_at".to_string());
        }
        if self.tier_entered_at < self.created_at {
            return fail("tier_entered_at precedes created_at".to_string());
        }
        if !self.importance.is_finite() || !(0.0..=1.0).contains(&self.importance) {
            return fail(format!("importance {} outside [0, 1]", self.importance));
        }
        if !self.decay_score.is_finite() || self.decay_score < 0.0 {
            return fail(format!("decay_score {} is invalid", self.decay_score));
        }
        if self.content_hash.is_empty() {
            return fail("missing content hash".to_string());
        }
        if self.is_archived && self.archive_reason.is_none() {
            return fail("archived without a reason".to_string());
        }
        Ok(())
    }
}

/// Normalize content for hashing: trimmed, lowercased, whitespace collapsed
pub fn normalize_content(content: &str) -> String {
    content
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Content hash used by the exact deduplication stage
pub fn content_hash(content: &str) -> String {
    blake3::hash(normalize_content(content).as_bytes())
        .to_hex()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item() -> MemoryItem {
        MemoryItem::new("Test content", vec![0.1; 8], Utc::now())
    }

    #[test]
    fn test_new_item_defaults() {
        let item = item();
        assert_eq!(item.tier, Tier::Working);
        assert_eq!(item.kind, ItemKind::Memory);
        assert_eq!(item.access_count, 0);
        assert_eq!(item.decay_score, item.importance);
        assert!(!item.is_archived);
        assert!(item.merged_into.is_none());
        assert_eq!(item.content_hash, content_hash("Test content"));
    }

    #[test]
    fn test_content_hash_normalizes_whitespace_and_case() {
        assert_eq!(
            content_hash("  Remember   to use\tVector indexing "),
            content_hash("remember to use vector indexing")
        );
        assert_ne!(content_hash("alpha"), content_hash("beta"));
    }

    #[test]
    fn test_mark_accessed_keeps_decay_clock() {
        let mut item = item();
        let created = item.created_at;
        item.mark_accessed(created + Duration::minutes(5));

        assert_eq!(item.access_count, 1);
        assert_eq!(item.created_at, created);
        assert_eq!(item.accessed_at, created + Duration::minutes(5));
    }

    #[test]
    fn test_set_importance_clamps() {
        let mut item = item();
        item.set_importance(1.5);
        assert_eq!(item.importance, 1.0);
        item.set_importance(-0.5);
        assert_eq!(item.importance, 0.0);
    }

    #[test]
    fn test_validate_rejects_future_creation() {
        let now = Utc::now();
        let mut item = item();
        item.created_at = now + Duration::hours(1);
        item.updated_at = item.created_at;
        item.accessed_at = item.created_at;
        item.tier_entered_at = item.created_at;

        let err = item.validate(now).unwrap_err();
        assert!(matches!(err, MemtierError::ConsistencyViolation { .. }));
    }

    #[test]
    fn test_validate_rejects_access_before_creation() {
        let mut item = item();
        item.accessed_at = item.created_at - Duration::days(1);
        assert!(item.validate(Utc::now()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_importance() {
        let mut item = item();
        item.importance = f32::NAN;
        assert!(item.validate(Utc::now()).is_err());
    }

    #[test]
    fn test_tier_ordering_is_durability() {
        assert!(Tier::Working < Tier::ShortTerm);
        assert!(Tier::ShortTerm < Tier::LongTerm);
        assert_eq!(Tier::Working.next(), Some(Tier::ShortTerm));
        assert_eq!(Tier::LongTerm.next(), None);
        assert_eq!(Tier::parse("short-term"), Some(Tier::ShortTerm));
    }

    #[test]
    fn test_item_kind_serialization() {
        let mut item = item();
        item.kind = ItemKind::Skill {
            name: "deploy".to_string(),
        };

        let json = serde_json::to_string(&item).expect("Failed to serialize item");
        let back: MemoryItem = serde_json::from_str(&json).expect("Failed to deserialize item");
        assert_eq!(back.kind, item.kind);
        assert_eq!(back.id, item.id);
    }
}
