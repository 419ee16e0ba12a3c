//! Memory engine facade
//!
//! Wires the collaborators, cache, lifecycle components, retrieval pipeline and consolidation
//! scheduler together and exposes the caller-facing operations.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditQuery, AuditSink, InMemoryAuditLog, JsonlAuditLog};
use crate::cache::{CacheManager, CacheStats};
use crate::collab::{
    Embedder, ExternalSummarizer, HashEmbedder, HeuristicIntelligence, IntelligenceService,
    LocalStore, StorageIndex, StoreStats, ThrottledIntelligence, ThrottledStorage,
};
use crate::config::Config;
use crate::dedup::{DedupEngine, MergeResolver};
use crate::error::{MemtierError, Result};
use crate::exec::ToolCommand;
use crate::memory::{DecayEngine, IngestionPipeline, MemoryItem, StoreOutcome, StoreRequest, TierManager};
use crate::retrieval::{MemoryFilter, RetrievalPipeline, RetrievedItem};
use crate::scheduler::{
    ConsolidationHandler, ConsolidationJob, ConsolidationMode, ConsolidationSummary, ItemLocks,
    JobPriority, QueueStats, Scheduler,
};

/// Point-in-time counters across the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub store: StoreStats,
    pub cache: CacheStats,
    pub jobs: QueueStats,
}

/// Caller-facing entry point of the memory system
pub struct MemoryEngine {
    config: Config,
    cache: Arc<CacheManager>,
    locks: ItemLocks,
    ingestion: IngestionPipeline,
    retrieval: RetrievalPipeline,
    scheduler: Arc<Scheduler>,
    audit: Arc<dyn AuditSink>,
    calls: Arc<Semaphore>,
}

impl MemoryEngine {
    /// Build an engine over explicit collaborators.
    ///
    /// Storage and intelligence calls share one semaphore of `scheduler.max_outstanding_calls`
    /// permits. Must be called inside a tokio runtime (workers are spawned here).
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageIndex>,
        intelligence: Arc<dyn IntelligenceService>,
        embedder: Arc<dyn Embedder>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let calls = Arc::new(Semaphore::new(config.scheduler.max_outstanding_calls));
        let storage: Arc<dyn StorageIndex> = Arc::new(ThrottledStorage::new(storage, calls.clone()));
        let intelligence: Arc<dyn IntelligenceService> =
            Arc::new(ThrottledIntelligence::new(intelligence, calls.clone()));

        let cache = Arc::new(CacheManager::new(storage, &config.cache));
        let locks = ItemLocks::default();
        let tiers = TierManager::new(config.tiers.clone());
        let decay = DecayEngine::new(&config.decay);

        let dedup = Arc::new(DedupEngine::new(
            cache.clone(),
            locks.clone(),
            MergeResolver::new(
                intelligence.clone(),
                embedder.clone(),
                decay.clone(),
                config.dedup.merge_policy,
            ),
            audit.clone(),
            config.dedup.clone(),
        ));

        let ingestion = IngestionPipeline::new(
            cache.clone(),
            locks.clone(),
            tiers.clone(),
            dedup.clone(),
            embedder.clone(),
            intelligence.clone(),
            audit.clone(),
        );
        let retrieval = RetrievalPipeline::new(
            cache.clone(),
            embedder.clone(),
            intelligence.clone(),
            config.retrieval.clone(),
        );

        let handler = Arc::new(ConsolidationHandler::new(
            cache.clone(),
            locks.clone(),
            tiers,
            decay,
            dedup,
            embedder,
            intelligence,
            audit.clone(),
        ));
        let scheduler = Arc::new(Scheduler::start(config.scheduler.clone(), handler));

        Self {
            config,
            cache,
            locks,
            ingestion,
            retrieval,
            scheduler,
            audit,
            calls,
        }
    }

    /// Build an engine over `storage` with the reference collaborators selected by `config`
    pub async fn from_config(config: Config, storage: Arc<dyn StorageIndex>) -> Result<Self> {
        let mut intelligence: Arc<dyn IntelligenceService> = Arc::new(HeuristicIntelligence::new());
        if let Some(ref program) = config.intelligence.summarizer_command {
            let tool = ToolCommand::new(program)?.args(config.intelligence.summarizer_args.clone());
            info!(tool = %program.display(), "Using external merge summarizer");
            intelligence = Arc::new(ExternalSummarizer::new(intelligence, tool));
        }

        let audit: Arc<dyn AuditSink> = match config.audit.path {
            Some(ref path) => {
                info!(path = %path.display(), "Writing audit log");
                Arc::new(JsonlAuditLog::open(path).await?)
            }
            None => Arc::new(InMemoryAuditLog::new()),
        };

        Ok(Self::new(
            config,
            storage,
            intelligence,
            Arc::new(HashEmbedder::default()),
            audit,
        ))
    }

    /// In-memory engine with default settings
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            config,
            Arc::new(LocalStore::in_memory()),
            Arc::new(HeuristicIntelligence::new()),
            Arc::new(HashEmbedder::default()),
            Arc::new(InMemoryAuditLog::new()),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ingest content. Exact duplicates of an active item return that item's id.
    pub async fn store(&self, request: StoreRequest) -> Result<StoreOutcome> {
        self.ingestion.ingest(request, Utc::now()).await
    }

    /// Ranked items for `query`
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: &MemoryFilter,
    ) -> Result<Vec<RetrievedItem>> {
        self.retrieval.retrieve(query, top_k, filter).await
    }

    /// Run a consolidation pass now, ahead of any triggered passes
    pub async fn consolidate(&self, mode: ConsolidationMode) -> Result<ConsolidationSummary> {
        self.scheduler.run(mode, JobPriority::High).await
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<ConsolidationJob> {
        self.scheduler
            .job_status(job_id)
            .await
            .ok_or_else(|| MemtierError::NotFound(format!("job {job_id}")))
    }

    pub async fn dead_letter_jobs(&self) -> Vec<ConsolidationJob> {
        self.scheduler.dead_letter().await
    }

    /// Read an item without counting an access
    pub async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>> {
        self.cache.get(id).await
    }

    /// Physically remove an item. The audit log keeps its last snapshot.
    pub async fn delete(&self, id: Uuid, reason: &str) -> Result<bool> {
        let _guard = self.locks.acquire(&[id]).await?;
        let Some(item) = self.cache.storage().get(id).await? else {
            return Ok(false);
        };

        let deleted = self.cache.delete(id).await?;
        if deleted {
            info!(item_id = %id, "Deleted memory");
            self.audit
                .append(AuditEvent::new(id, AuditAction::Deleted, "caller", reason).with_snapshot(&item))
                .await?;
        }
        Ok(deleted)
    }

    /// Audit trail of an item, oldest first
    pub async fn history(&self, id: Uuid) -> Result<Vec<crate::audit::AuditEvent>> {
        self.audit.query(&AuditQuery::for_item(id)).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            store: self.cache.storage().stats().await?,
            cache: self.cache.stats().await,
            jobs: self.scheduler.queue().stats().await,
        })
    }

    /// Start the periodic light, deep and full consolidation loops
    pub fn spawn_triggers(&self) -> Vec<JoinHandle<()>> {
        self.scheduler.spawn_triggers()
    }

    /// Stop workers and triggers, then refuse further collaborator calls
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.calls.close();
        info!("Memory engine stopped");
    }
}
