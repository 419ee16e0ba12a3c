//! Significance scoring for retrieval reranking
//!
//! The composite score is a weighted sum of five signals, each in [0, 1]:
//!
//! `score = w_sim * similarity + w_rec * recency + w_freq * frequency + w_imp * importance
//!          + w_kw * keyword`
//!
//! Every function here is pure: the same item, query signals and weights always produce the
//! same score, and [`rank`] breaks ties by creation time and then id.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collab::QueryIntent;
use crate::config::RetrievalConfig;
use crate::memory::types::MemoryItem;

/// Weights of the composite score
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreWeights {
    pub similarity: f32,
    pub recency: f32,
    pub frequency: f32,
    pub importance: f32,
    pub keyword: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            similarity: 0.4,
            recency: 0.2,
            frequency: 0.1,
            importance: 0.2,
            keyword: 0.1,
        }
    }
}

/// How the keyword stage combines with the similarity candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeywordMode {
    /// Keep only candidates that also hit a keyword; falls back to all candidates if none do
    Intersect,
    /// Add keyword hits to the candidates
    Union,
}

/// Stages and weights selected for a classified query
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetrievalPlan {
    pub intent: QueryIntent,
    pub keyword_mode: KeywordMode,
    /// Entity-graph hops; zero disables graph expansion
    pub graph_hops: usize,
    pub weights: ScoreWeights,
}

impl RetrievalPlan {
    pub fn for_intent(intent: QueryIntent, config: &RetrievalConfig) -> Self {
        let (keyword_mode, graph_hops, weights) = match intent {
            QueryIntent::Lookup => (
                KeywordMode::Intersect,
                0,
                ScoreWeights {
                    similarity: 0.55,
                    recency: 0.1,
                    frequency: 0.1,
                    importance: 0.15,
                    keyword: 0.1,
                },
            ),
            QueryIntent::Decision => (
                KeywordMode::Union,
                config.graph_hops.min(1),
                ScoreWeights {
                    similarity: 0.3,
                    recency: 0.1,
                    frequency: 0.05,
                    importance: 0.45,
                    keyword: 0.1,
                },
            ),
            QueryIntent::Pattern => (
                KeywordMode::Union,
                config.graph_hops.max(1),
                ScoreWeights {
                    similarity: 0.4,
                    recency: 0.05,
                    frequency: 0.25,
                    importance: 0.2,
                    keyword: 0.1,
                },
            ),
            QueryIntent::Recent => (
                KeywordMode::Union,
                0,
                ScoreWeights {
                    similarity: 0.3,
                    recency: 0.45,
                    frequency: 0.05,
                    importance: 0.1,
                    keyword: 0.1,
                },
            ),
            QueryIntent::General => (KeywordMode::Union, 0, ScoreWeights::default()),
        };

        Self {
            intent,
            keyword_mode,
            graph_hops,
            weights,
        }
    }
}

/// Per-item inputs to the composite score
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Signals {
    pub similarity: f32,
    pub recency: f32,
    pub frequency: f32,
    pub importance: f32,
    pub keyword: f32,
}

impl Signals {
    /// Derive the item-side signals; similarity and keyword come from the query stages
    pub fn for_item(
        item: &MemoryItem,
        similarity: f32,
        keyword: f32,
        config: &RetrievalConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            similarity: similarity.clamp(0.0, 1.0),
            recency: recency_signal(item.age_days(now), config.recency_horizon_days),
            frequency: frequency_signal(item.access_count, config.frequency_cap),
            importance: item.decay_score.clamp(0.0, 1.0),
            keyword: keyword.clamp(0.0, 1.0),
        }
    }
}

/// `1 - normalized_age`, where age is normalized against `horizon_days` and capped at 1
pub fn recency_signal(age_days: f64, horizon_days: f64) -> f32 {
    if horizon_days <= 0.0 {
        return 0.0;
    }
    let normalized = (age_days.max(0.0) / horizon_days).min(1.0);
    (1.0 - normalized) as f32
}

/// Logarithmic repetition signal, saturating at `cap` accesses
pub fn frequency_signal(access_count: u32, cap: u32) -> f32 {
    if cap == 0 {
        return 0.0;
    }
    let count = access_count.min(cap) as f32;
    (count + 1.0).ln() / (cap as f32 + 1.0).ln()
}

pub fn composite(weights: &ScoreWeights, signals: &Signals) -> f32 {
    weights.similarity * signals.similarity
        + weights.recency * signals.recency
        + weights.frequency * signals.frequency
        + weights.importance * signals.importance
        + weights.keyword * signals.keyword
}

/// Anything [`rank`] can order
pub trait Ranked {
    fn score(&self) -> f32;
    fn item(&self) -> &MemoryItem;
}

/// Sort best first: score, then older items, then id
pub fn rank<T: Ranked>(results: &mut [T]) {
    results.sort_by(|a, b| {
        b.score()
            .total_cmp(&a.score())
            .then_with(|| a.item().created_at.cmp(&b.item().created_at))
            .then_with(|| a.item().id.cmp(&b.item().id))
    });
}

/// Order two scored ids for a stage cut, best first
pub(crate) fn by_score_then_id(a: (f32, uuid::Uuid), b: (f32, uuid::Uuid)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1))
}
