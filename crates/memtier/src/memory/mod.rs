//! Memory types and lifecycle operations
//!
//! Defines the core item record and the per-item lifecycle rules: tier assignment and
//! promotion, decay scoring, and the ingestion pipeline that creates items.

pub mod decay;
pub mod ingestion;
pub mod tiers;
pub mod types;

pub use decay::DecayEngine;
pub use ingestion::{IngestionPipeline, StoreOutcome, StoreRequest};
pub use tiers::{TierDecision, TierManager, TtlOutcome};
pub use types::{ArchiveReason, ItemKind, MemoryItem, Tier, content_hash, normalize_content};
