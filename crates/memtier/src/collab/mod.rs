//! Collaborator interfaces consumed by the engine
//!
//! The engine depends only on the traits defined here: [`StorageIndex`] for persistence and
//! similarity/keyword/graph queries, [`IntelligenceService`] for language understanding, and
//! [`Embedder`] for turning text into vectors. In-process reference implementations
//! ([`LocalStore`], [`HeuristicIntelligence`], [`HashEmbedder`]) make the system runnable
//! without external services.

pub mod embedding;
pub mod external;
pub mod intelligence;
pub mod storage;
pub mod throttle;

pub use embedding::{Embedder, HashEmbedder, cosine_similarity};
pub use external::ExternalSummarizer;
pub use intelligence::{HeuristicIntelligence, IntelligenceService, QueryIntent, Verification};
pub use storage::{InsertOutcome, LocalStore, ScoredId, StorageIndex, StoreStats};
pub use throttle::{ThrottledIntelligence, ThrottledStorage};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "is", "it", "of",
    "on", "or", "that", "the", "this", "to", "was", "we", "what", "when", "where", "which", "who",
    "why", "with",
];

/// Lowercased alphanumeric tokens with stopwords and single characters removed
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stopwords_and_punctuation() {
        assert_eq!(
            tokenize("How do we optimize the Database, again?"),
            vec!["do", "optimize", "database", "again"]
        );
    }
}
