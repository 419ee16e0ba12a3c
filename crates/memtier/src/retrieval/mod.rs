//! Hybrid retrieval pipeline
//!
//! Stages, each narrowing the candidate set:
//! 1. Candidate generation: similarity search above a floor
//! 2. Keyword stage: intersect or union with keyword hits, depending on the intent
//! 3. Metadata filter: tags, category, date range, tier
//! 4. Graph expansion (intent dependent): entities of the top candidates seed a traversal
//! 5. Significance scoring and rerank, then top-k
//!
//! Reads go through the cache and never take item locks, so results are only eventually
//! consistent with in-flight consolidation.

pub mod filter;
pub mod significance;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::collab::{Embedder, IntelligenceService, cosine_similarity};
use crate::config::RetrievalConfig;
use crate::error::{MemtierError, Result};
use crate::memory::types::MemoryItem;

pub use filter::MemoryFilter;
pub use significance::{
    KeywordMode, Ranked, RetrievalPlan, ScoreWeights, Signals, composite, frequency_signal,
    rank, recency_signal,
};

/// Which stage surfaced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Similarity,
    Keyword,
    Graph,
}

/// A retrieved item with scoring information
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedItem {
    pub item: MemoryItem,
    /// Final composite score used for ranking
    pub score: f32,
    pub signals: Signals,
    pub source: CandidateSource,
}

impl Ranked for RetrievedItem {
    fn score(&self) -> f32 {
        self.score
    }

    fn item(&self) -> &MemoryItem {
        &self.item
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    similarity: f32,
    keyword: f32,
    source: CandidateSource,
}

/// Multi-stage retrieval orchestrator
pub struct RetrievalPipeline {
    cache: Arc<CacheManager>,
    embedder: Arc<dyn Embedder>,
    intelligence: Arc<dyn IntelligenceService>,
    config: RetrievalConfig,
}

impl RetrievalPipeline {
    pub fn new(
        cache: Arc<CacheManager>,
        embedder: Arc<dyn Embedder>,
        intelligence: Arc<dyn IntelligenceService>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            cache,
            embedder,
            intelligence,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve the `top_k` best items for `query` (default top-k when `None`)
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: &MemoryFilter,
    ) -> Result<Vec<RetrievedItem>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MemtierError::Validation("query must not be empty".into()));
        }
        let top_k = top_k.unwrap_or(self.config.default_top_k);
        if top_k > self.config.max_top_k {
            return Err(MemtierError::Validation(format!(
                "top_k {top_k} exceeds the maximum of {}",
                self.config.max_top_k
            )));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let intent = self.intelligence.classify_intent(query).await?;
        let plan = RetrievalPlan::for_intent(intent, &self.config);
        let embedding = self.embedder.embed(query).await?;
        let now = Utc::now();

        let results = self.run_plan(query, &embedding, &plan, filter, top_k, now).await?;

        let mut returned = Vec::with_capacity(results.len());
        for mut result in results {
            result.item = self.cache.record_access(result.item.id, now).await?;
            returned.push(result);
        }

        debug!(
            intent = intent.as_str(),
            results = returned.len(),
            "Retrieved memories"
        );
        Ok(returned)
    }

    /// Rank without recording accesses
    pub async fn run_plan(
        &self,
        query: &str,
        embedding: &[f32],
        plan: &RetrievalPlan,
        filter: &MemoryFilter,
        top_k: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetrievedItem>> {
        let storage = self.cache.storage();

        // stage 1: similarity candidates
        let mut candidates: HashMap<Uuid, Candidate> = storage
            .vector_search(embedding, self.config.candidate_limit, self.config.min_similarity)
            .await?
            .into_iter()
            .map(|hit| {
                (
                    hit.id,
                    Candidate {
                        similarity: hit.score,
                        keyword: 0.0,
                        source: CandidateSource::Similarity,
                    },
                )
            })
            .collect();

        // stage 2: keyword
        let keyword_hits = storage
            .keyword_search(query, self.config.candidate_limit)
            .await?;
        for hit in &keyword_hits {
            if let Some(candidate) = candidates.get_mut(&hit.id) {
                candidate.keyword = hit.score;
            }
        }
        match plan.keyword_mode {
            KeywordMode::Intersect => {
                if candidates.values().any(|c| c.keyword > 0.0) {
                    candidates.retain(|_, c| c.keyword > 0.0);
                }
            }
            KeywordMode::Union => {
                for hit in &keyword_hits {
                    candidates.entry(hit.id).or_insert(Candidate {
                        similarity: f32::NAN,
                        keyword: hit.score,
                        source: CandidateSource::Keyword,
                    });
                }
            }
        }
        let stage_ids = cut(&candidates, self.config.keyword_limit);

        // stage 3: metadata
        let mut items: Vec<MemoryItem> = self
            .cache
            .get_many(&stage_ids)
            .await?
            .into_iter()
            .filter(|item| filter.matches(item))
            .take(self.config.metadata_limit)
            .collect();

        // stage 4: graph expansion
        if plan.graph_hops > 0 && !items.is_empty() {
            let expanded = self.expand(&items, plan.graph_hops, filter).await?;
            for item in expanded {
                candidates.entry(item.id).or_insert(Candidate {
                    similarity: f32::NAN,
                    keyword: 0.0,
                    source: CandidateSource::Graph,
                });
                items.push(item);
            }
        }

        // stage 5: score and rerank
        let mut results: Vec<RetrievedItem> = items
            .into_iter()
            .filter_map(|item| {
                let candidate = candidates.get(&item.id).copied()?;
                let similarity = if candidate.similarity.is_nan() {
                    cosine_similarity(embedding, &item.embedding)
                } else {
                    candidate.similarity
                };
                let signals =
                    Signals::for_item(&item, similarity, candidate.keyword, &self.config, now);
                Some(RetrievedItem {
                    score: composite(&plan.weights, &signals),
                    signals,
                    source: candidate.source,
                    item,
                })
            })
            .collect();

        let mut seen = HashSet::new();
        results.retain(|r| seen.insert(r.item.id));
        rank(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    /// Items reachable from the entities of the top seed items, not already present
    async fn expand(
        &self,
        seeds: &[MemoryItem],
        hops: usize,
        filter: &MemoryFilter,
    ) -> Result<Vec<MemoryItem>> {
        let present: HashSet<Uuid> = seeds.iter().map(|i| i.id).collect();
        let mut entities: Vec<String> = Vec::new();
        for seed in seeds.iter().take(self.config.graph_seed_count) {
            for entity in &seed.entities {
                if !entities.iter().any(|e| e.eq_ignore_ascii_case(entity)) {
                    entities.push(entity.clone());
                }
            }
        }

        let mut found: Vec<Uuid> = Vec::new();
        for entity in &entities {
            for id in self.cache.storage().graph_traverse(entity, hops).await? {
                if !present.contains(&id) && !found.contains(&id) {
                    found.push(id);
                }
            }
        }
        found.truncate(self.config.metadata_limit);

        Ok(self
            .cache
            .get_many(&found)
            .await?
            .into_iter()
            .filter(|item| filter.matches(item))
            .collect())
    }
}

/// Best `limit` candidate ids by stage score (similarity + keyword), ties by id
fn cut(candidates: &HashMap<Uuid, Candidate>, limit: usize) -> Vec<Uuid> {
    let mut scored: Vec<(f32, Uuid)> = candidates
        .iter()
        .map(|(id, c)| {
            let similarity = if c.similarity.is_nan() { 0.0 } else { c.similarity };
            (similarity + c.keyword, *id)
        })
        .collect();
    scored.sort_by(|a, b| significance::by_score_then_id(*a, *b));
    scored.truncate(limit);
    scored.into_iter().map(|(_, id)| id).collect()
}

impl std::fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CandidateSource::Similarity => "similarity",
            CandidateSource::Keyword => "keyword",
            CandidateSource::Graph => "graph",
        })
    }
}
