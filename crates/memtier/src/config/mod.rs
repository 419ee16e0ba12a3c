use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MemtierError, Result};

/// Main configuration structure for memtier
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Storage location and snapshot settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Tier TTLs, promotion and archive rules
    #[serde(default)]
    pub tiers: TierConfig,
    /// Decay curve settings
    #[serde(default)]
    pub decay: DecayConfig,
    /// Exact and semantic deduplication settings
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Consolidation job system settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Hybrid retrieval pipeline settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Multi-level cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Audit log settings
    #[serde(default)]
    pub audit: AuditConfig,
    /// Intelligence collaborator settings
    #[serde(default)]
    pub intelligence: IntelligenceConfig,
}

impl Config {
    /// Load configuration from an explicit path, or from the first default location that exists.
    ///
    /// Falls back to `Config::default()` when no file is found.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".memtier").join("config.toml")),
            dirs::config_dir().map(|c| c.join("memtier").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemtierError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| MemtierError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break engine invariants
    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, value: f32) -> Result<()> {
            if !(0.0..=1.0).contains(&value) {
                return Err(MemtierError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
            Ok(())
        }

        if self.scheduler.workers == 0 {
            return Err(MemtierError::Config("scheduler.workers must be > 0".into()));
        }
        if self.scheduler.max_outstanding_calls == 0 {
            return Err(MemtierError::Config(
                "scheduler.max_outstanding_calls must be > 0".into(),
            ));
        }
        if self.scheduler.batch_size == 0 || self.scheduler.partitions == 0 {
            return Err(MemtierError::Config(
                "scheduler.batch_size and scheduler.partitions must be > 0".into(),
            ));
        }
        if self.decay.half_life_days <= 0.0 || !self.decay.half_life_days.is_finite() {
            return Err(MemtierError::Config(
                "decay.half_life_days must be a positive number".into(),
            ));
        }
        unit("dedup.similarity_threshold", self.dedup.similarity_threshold)?;
        unit("tiers.promote_importance", self.tiers.promote_importance)?;
        unit("tiers.bypass_importance", self.tiers.bypass_importance)?;
        unit("tiers.archive_max_importance", self.tiers.archive_max_importance)?;
        unit("retrieval.min_similarity", self.retrieval.min_similarity)?;
        if self.cache.l1_capacity == 0 || self.cache.l2_capacity == 0 {
            return Err(MemtierError::Config("cache capacities must be > 0".into()));
        }
        if let Some(ref path) = self.intelligence.summarizer_command {
            if !path.is_absolute() {
                return Err(MemtierError::Config(format!(
                    "intelligence.summarizer_command must be an absolute path, got {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all storage data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Snapshot file name inside `data_dir`
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
    /// Seconds between background snapshot flushes in the daemon
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_file: default_snapshot_file(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl StorageConfig {
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".memtier"))
        .unwrap_or_else(|| PathBuf::from(".memtier"))
}

fn default_snapshot_file() -> String {
    "items.json".to_string()
}

fn default_flush_interval_secs() -> u64 {
    60
}

/// Tier lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Working tier TTL in seconds (default: 1 hour)
    #[serde(default = "default_working_ttl_secs")]
    pub working_ttl_secs: i64,
    /// Short-term tier TTL in seconds (default: 15 days)
    #[serde(default = "default_short_term_ttl_secs")]
    pub short_term_ttl_secs: i64,
    /// Fraction of the current tier's TTL an item must spend there before normal promotion
    #[serde(default = "default_promotion_age_fraction")]
    pub promotion_age_fraction: f64,
    /// Access count that must be exceeded for normal promotion
    #[serde(default = "default_promote_access_count")]
    pub promote_access_count: u32,
    /// Importance that must be exceeded for normal promotion
    #[serde(default = "default_promote_importance")]
    pub promote_importance: f32,
    /// Importance above which promotion skips the age/access gate
    #[serde(default = "default_bypass_importance")]
    pub bypass_importance: f32,
    /// Minimum age in days before the archive rule applies
    #[serde(default = "default_archive_min_age_days")]
    pub archive_min_age_days: i64,
    /// Importance below which an unaccessed old item is archived
    #[serde(default = "default_archive_max_importance")]
    pub archive_max_importance: f32,
    /// Archive items that outlive their tier TTL without earning promotion
    #[serde(default = "default_archive_on_expiry")]
    pub archive_on_expiry: bool,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            working_ttl_secs: default_working_ttl_secs(),
            short_term_ttl_secs: default_short_term_ttl_secs(),
            promotion_age_fraction: default_promotion_age_fraction(),
            promote_access_count: default_promote_access_count(),
            promote_importance: default_promote_importance(),
            bypass_importance: default_bypass_importance(),
            archive_min_age_days: default_archive_min_age_days(),
            archive_max_importance: default_archive_max_importance(),
            archive_on_expiry: default_archive_on_expiry(),
        }
    }
}

fn default_working_ttl_secs() -> i64 {
    3600
}

fn default_short_term_ttl_secs() -> i64 {
    15 * 24 * 3600
}

fn default_promotion_age_fraction() -> f64 {
    0.5
}

fn default_promote_access_count() -> u32 {
    5
}

fn default_promote_importance() -> f32 {
    0.8
}

fn default_bypass_importance() -> f32 {
    0.9
}

fn default_archive_min_age_days() -> i64 {
    90
}

fn default_archive_max_importance() -> f32 {
    0.3
}

fn default_archive_on_expiry() -> bool {
    true
}

/// Decay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    /// Half-life constant of the decay curve in days
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life_days(),
        }
    }
}

fn default_half_life_days() -> f64 {
    30.0
}

/// How importance is combined when merging duplicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Keep the highest importance among the sources
    #[default]
    Max,
    /// Average importance weighted by each source's access count (plus one)
    WeightedAverage,
}

/// Deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Cosine similarity above which two items are near-duplicates
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Maximum neighbours fetched per item in the semantic stage
    #[serde(default = "default_neighbor_limit")]
    pub neighbor_limit: usize,
    /// Importance merge policy
    #[serde(default)]
    pub merge_policy: MergePolicy,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            neighbor_limit: default_neighbor_limit(),
            merge_policy: MergePolicy::default(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.95
}

fn default_neighbor_limit() -> usize {
    5
}

/// Consolidation scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of workers pulling from the job queue
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Retries allowed for transient failures before a job is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Multiplier applied per retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Cap on concurrently outstanding collaborator calls
    #[serde(default = "default_max_outstanding_calls")]
    pub max_outstanding_calls: usize,
    /// Items fetched per scan page inside a job
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Number of id-hash partitions each consolidation stage is split into
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Window of recent items covered by a light pass
    #[serde(default = "default_light_window_hours")]
    pub light_window_hours: i64,
    /// Cadence of periodic light passes in seconds
    #[serde(default = "default_light_interval_secs")]
    pub light_interval_secs: u64,
    /// Cadence of periodic deep passes in seconds
    #[serde(default = "default_deep_interval_secs")]
    pub deep_interval_secs: u64,
    /// Cadence of periodic full passes in seconds
    #[serde(default = "default_full_interval_secs")]
    pub full_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_outstanding_calls: default_max_outstanding_calls(),
            batch_size: default_batch_size(),
            partitions: default_partitions(),
            light_window_hours: default_light_window_hours(),
            light_interval_secs: default_light_interval_secs(),
            deep_interval_secs: default_deep_interval_secs(),
            full_interval_secs: default_full_interval_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_outstanding_calls() -> usize {
    8
}

fn default_batch_size() -> usize {
    100
}

fn default_partitions() -> u32 {
    4
}

fn default_light_window_hours() -> i64 {
    24
}

fn default_light_interval_secs() -> u64 {
    15 * 60
}

fn default_deep_interval_secs() -> u64 {
    6 * 3600
}

fn default_full_interval_secs() -> u64 {
    7 * 24 * 3600
}

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates requested from the similarity stage
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    /// Similarity floor for candidate generation
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Candidates kept after the keyword stage
    #[serde(default = "default_keyword_limit")]
    pub keyword_limit: usize,
    /// Candidates kept after the metadata stage
    #[serde(default = "default_metadata_limit")]
    pub metadata_limit: usize,
    /// Top candidates whose entities seed graph expansion
    #[serde(default = "default_graph_seed_count")]
    pub graph_seed_count: usize,
    /// Maximum entity-graph hops for intents that always expand
    #[serde(default = "default_graph_hops")]
    pub graph_hops: usize,
    /// Results returned when the caller does not say
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Largest top_k a caller may request
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    /// Age in days at which the recency signal reaches zero
    #[serde(default = "default_recency_horizon_days")]
    pub recency_horizon_days: f64,
    /// Access count at which the frequency signal saturates
    #[serde(default = "default_frequency_cap")]
    pub frequency_cap: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_limit: default_candidate_limit(),
            min_similarity: default_min_similarity(),
            keyword_limit: default_keyword_limit(),
            metadata_limit: default_metadata_limit(),
            graph_seed_count: default_graph_seed_count(),
            graph_hops: default_graph_hops(),
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            recency_horizon_days: default_recency_horizon_days(),
            frequency_cap: default_frequency_cap(),
        }
    }
}

fn default_candidate_limit() -> usize {
    100
}

fn default_min_similarity() -> f32 {
    0.2
}

fn default_keyword_limit() -> usize {
    50
}

fn default_metadata_limit() -> usize {
    20
}

fn default_graph_seed_count() -> usize {
    3
}

fn default_graph_hops() -> usize {
    2
}

fn default_top_k() -> usize {
    10
}

fn default_max_top_k() -> usize {
    100
}

fn default_recency_horizon_days() -> f64 {
    90.0
}

fn default_frequency_cap() -> u32 {
    50
}

/// Multi-level cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// L1 (process-local) entry capacity
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,
    /// L1 TTL in seconds
    #[serde(default = "default_l1_ttl_secs")]
    pub l1_ttl_secs: u64,
    /// L2 (shared) entry capacity
    #[serde(default = "default_l2_capacity")]
    pub l2_capacity: usize,
    /// L2 TTL in seconds
    #[serde(default = "default_l2_ttl_secs")]
    pub l2_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: default_l1_capacity(),
            l1_ttl_secs: default_l1_ttl_secs(),
            l2_capacity: default_l2_capacity(),
            l2_ttl_secs: default_l2_ttl_secs(),
        }
    }
}

fn default_l1_capacity() -> usize {
    1024
}

fn default_l1_ttl_secs() -> u64 {
    60
}

fn default_l2_capacity() -> usize {
    16_384
}

fn default_l2_ttl_secs() -> u64 {
    600
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditConfig {
    /// Append-only JSONL file. When unset, events are kept in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Intelligence collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntelligenceConfig {
    /// Absolute path of an external merge summarizer tool
    #[serde(default)]
    pub summarizer_command: Option<PathBuf>,
    /// Arguments passed to the summarizer tool
    #[serde(default)]
    pub summarizer_args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tiers.working_ttl_secs, 3600);
        assert_eq!(config.tiers.short_term_ttl_secs, 1_296_000);
        assert_eq!(config.decay.half_life_days, 30.0);
        assert_eq!(config.dedup.similarity_threshold, 0.95);
        assert_eq!(config.dedup.merge_policy, MergePolicy::Max);
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.retrieval.default_top_k, 10);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [dedup]
            merge_policy = "weighted_average"

            [scheduler]
            workers = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.dedup.merge_policy, MergePolicy::WeightedAverage);
        assert_eq!(config.dedup.similarity_threshold, 0.95);
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.max_retries, 3);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Config::from_toml("[scheduler]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, MemtierError::Config(_)));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let err = Config::from_toml("[dedup]\nsimilarity_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, MemtierError::Config(_)));
    }

    #[test]
    fn test_relative_summarizer_path_rejected() {
        let err = Config::from_toml("[intelligence]\nsummarizer_command = \"summarize\"\n")
            .unwrap_err();
        assert!(matches!(err, MemtierError::Config(_)));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[decay]\nhalf_life_days = 7.0\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.decay.half_life_days, 7.0);
    }
}
