//! Intelligence collaborator
//!
//! Language understanding the engine delegates: entity extraction, verification, intent
//! classification, merge summaries and debate/consensus scoring. [`HeuristicIntelligence`]
//! answers all of these with fast deterministic keyword rules.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collab::tokenize;
use crate::error::Result;
use crate::memory::types::{ItemKind, MemoryItem, normalize_content};

/// What kind of question a retrieval query is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    /// Looking up a specific fact
    Lookup,
    /// Asking about a decision or its rationale
    Decision,
    /// Looking for recurring patterns and related knowledge
    Pattern,
    /// Asking about recent events
    Recent,
    /// Anything else
    General,
}

impl QueryIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryIntent::Lookup => "lookup",
            QueryIntent::Decision => "decision",
            QueryIntent::Pattern => "pattern",
            QueryIntent::Recent => "recent",
            QueryIntent::General => "general",
        }
    }
}

/// Outcome of verifying an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// Confidence in the item, in [0, 1]
    pub score: f32,
    pub issues: Vec<String>,
}

/// Language-understanding operations consumed by the engine
#[async_trait]
pub trait IntelligenceService: Send + Sync {
    async fn extract_entities(&self, text: &str) -> Result<Vec<String>>;

    async fn verify(&self, item: &MemoryItem) -> Result<Verification>;

    async fn classify_intent(&self, query: &str) -> Result<QueryIntent>;

    /// One textual representation of all `candidates`
    async fn summarize_merge(&self, candidates: &[MemoryItem]) -> Result<String>;

    /// Consensus score in [0, 1]
    async fn debate(&self, item: &MemoryItem) -> Result<f32>;
}

const LOOKUP_CUES: &[&str] = &[
    "what is ", "what's ", "define ", "who is ", "where is ", "how many", "how much", "which ",
];
const DECISION_CUES: &[&str] = &[
    "decide", "decision", "decided", "should we", "should i", "choose", "chose", "why did we",
    "tradeoff", "trade-off", "rationale",
];
const PATTERN_CUES: &[&str] = &[
    "pattern", "trend", "recurring", "usually", "always", "often", "related", "similar",
    "common",
];
const RECENT_CUES: &[&str] = &[
    "recent", "recently", "latest", "today", "yesterday", "last week", "this week", "just now",
    "last time",
];
const HEDGES: &[&str] = &["maybe", "might", "probably", "not sure", "unclear", "i think"];

/// Keyword-rule intelligence service
#[derive(Debug, Clone, Default)]
pub struct HeuristicIntelligence;

impl HeuristicIntelligence {
    pub fn new() -> Self {
        Self
    }

    fn classify(query: &str) -> QueryIntent {
        let q = format!("{} ", query.to_lowercase());
        let count = |cues: &[&str]| cues.iter().filter(|c| q.contains(*c)).count();

        let scored = [
            (QueryIntent::Decision, count(DECISION_CUES)),
            (QueryIntent::Pattern, count(PATTERN_CUES)),
            (QueryIntent::Recent, count(RECENT_CUES)),
            (QueryIntent::Lookup, count(LOOKUP_CUES)),
        ];

        // first listed wins ties
        let (intent, hits) = scored
            .iter()
            .copied()
            .fold((QueryIntent::General, 0), |best, cur| {
                if cur.1 > best.1 { cur } else { best }
            });

        if hits == 0 { QueryIntent::General } else { intent }
    }

    fn entities(text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut entities = Vec::new();

        for sentence in split_sentences(text) {
            for (position, raw) in sentence.split_whitespace().enumerate() {
                let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
                let mut chars = word.chars();
                let Some(first) = chars.next() else {
                    continue;
                };
                let capitalized = first.is_uppercase() && word.chars().count() > 1;
                let has_inner_caps = chars.any(|c| c.is_uppercase());
                // sentence-initial capitals are ordinary words unless CamelCase or ACRONYM
                if !capitalized || (position == 0 && !has_inner_caps) {
                    continue;
                }
                if seen.insert(word.to_lowercase()) {
                    entities.push(word.to_string());
                }
            }
        }

        entities
    }

    fn check(item: &MemoryItem) -> Verification {
        let mut score = 1.0f32;
        let mut issues = Vec::new();

        if tokenize(&item.content).len() < 3 {
            score -= 0.3;
            issues.push("content too short to verify".to_string());
        }

        let lower = item.content.to_lowercase();
        if HEDGES.iter().any(|h| lower.contains(h)) {
            score -= 0.2;
            issues.push("content is hedged".to_string());
        }

        Verification {
            score: score.clamp(0.0, 1.0),
            issues,
        }
    }
}

fn split_sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl IntelligenceService for HeuristicIntelligence {
    async fn extract_entities(&self, text: &str) -> Result<Vec<String>> {
        Ok(Self::entities(text))
    }

    async fn verify(&self, item: &MemoryItem) -> Result<Verification> {
        Ok(Self::check(item))
    }

    async fn classify_intent(&self, query: &str) -> Result<QueryIntent> {
        Ok(Self::classify(query))
    }

    async fn summarize_merge(&self, candidates: &[MemoryItem]) -> Result<String> {
        let mut seen = HashSet::new();
        let mut sentences = Vec::new();

        for item in candidates {
            for sentence in split_sentences(&item.content) {
                if seen.insert(normalize_content(sentence)) {
                    sentences.push(sentence);
                }
            }
        }

        Ok(sentences.join(". "))
    }

    async fn debate(&self, item: &MemoryItem) -> Result<f32> {
        let score = match &item.kind {
            ItemKind::Consensus { consensus_score } => *consensus_score,
            ItemKind::Memory | ItemKind::Skill { .. } => Self::check(item).score,
        };
        Ok(score.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(content: &str) -> MemoryItem {
        MemoryItem::new(content, vec![], Utc::now())
    }

    #[tokio::test]
    async fn test_classify_intent() {
        let intel = HeuristicIntelligence::new();
        let cases = [
            ("Why did we decide on Postgres?", QueryIntent::Decision),
            ("recurring deploy failure patterns", QueryIntent::Pattern),
            ("what changed yesterday", QueryIntent::Recent),
            ("what is the staging port", QueryIntent::Lookup),
            ("database optimization", QueryIntent::General),
        ];
        for (query, expected) in cases {
            assert_eq!(intel.classify_intent(query).await.unwrap(), expected, "{query}");
        }
    }

    #[tokio::test]
    async fn test_extract_entities_skips_sentence_starts() {
        let intel = HeuristicIntelligence::new();
        let entities = intel
            .extract_entities("Remember that Alice moved the PostgreSQL cluster to Frankfurt. Alice agreed.")
            .await
            .unwrap();
        assert_eq!(entities, vec!["Alice", "PostgreSQL", "Frankfurt"]);
    }

    #[tokio::test]
    async fn test_summarize_merge_unions_sentences() {
        let intel = HeuristicIntelligence::new();
        let merged = intel
            .summarize_merge(&[
                item("Use vector indexing. Keep batches small."),
                item("use vector   indexing. Prefer HNSW."),
            ])
            .await
            .unwrap();
        assert_eq!(merged, "Use vector indexing. Keep batches small. Prefer HNSW");
    }

    #[tokio::test]
    async fn test_verify_penalizes_hedging() {
        let intel = HeuristicIntelligence::new();
        let plain = intel.verify(&item("The cache runs on port 6379")).await.unwrap();
        let hedged = intel
            .verify(&item("The cache probably runs on port 6379"))
            .await
            .unwrap();
        assert_eq!(plain.score, 1.0);
        assert!(hedged.score < plain.score);
        assert_eq!(hedged.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_debate_uses_consensus_score() {
        let intel = HeuristicIntelligence::new();
        let mut record = item("Team agreed to ship on Fridays");
        record.kind = ItemKind::Consensus {
            consensus_score: 0.7,
        };
        assert_eq!(intel.debate(&record).await.unwrap(), 0.7);
    }
}
