//! Memtier - Tiered memory lifecycle engine for autonomous agents
//!
//! Items move up through the working, short-term and long-term tiers as their decayed
//! significance changes. A priority job scheduler runs deduplication, merging, decay and
//! archival passes in the background, and a hybrid retrieval pipeline ranks items by
//! similarity, recency, frequency, importance and keyword signals.

pub mod audit;
pub mod cache;
pub mod collab;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod exec;
pub mod memory;
pub mod retrieval;
pub mod scheduler;
pub mod testing;

pub use config::Config;
pub use engine::{EngineStats, MemoryEngine};
pub use error::{MemtierError, Result};
pub use memory::{ItemKind, MemoryItem, StoreOutcome, StoreRequest, Tier};
pub use retrieval::{MemoryFilter, RetrievedItem};
pub use scheduler::{ConsolidationMode, ConsolidationSummary};
