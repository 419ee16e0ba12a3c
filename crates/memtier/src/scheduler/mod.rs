//! Consolidation scheduler
//!
//! A consolidation pass is a sequence of stages (decay, dedup, merge, archive, reindex). Each
//! stage is split into one job per id-hash partition and enqueued on the shared priority queue;
//! the next stage starts once every job of the current one is Completed or Dead. The per-stage
//! reports are summed into a [`ConsolidationSummary`].
//!
//! Periodic triggers are plain background loops that run a pass on a fixed cadence. The cadence
//! is policy; the queue, workers and retry rules are the same for triggered and caller-initiated
//! passes.

pub mod handlers;
pub mod job;
pub mod locks;
pub mod partition;
pub mod queue;
pub mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{MemtierError, Result};

pub use handlers::ConsolidationHandler;
pub use job::{
    ConsolidationJob, JobPayload, JobPriority, JobReport, JobScope, JobStatus, JobType,
};
pub use locks::{ItemLockGuard, ItemLocks};
pub use partition::{Partition, aggregate};
pub use queue::{JobQueue, QueueStats};
pub use worker::{JobContext, JobHandler, RetryPolicy, WorkerPool};

/// Scope and depth of a consolidation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationMode {
    /// Exact dedup, decay and tier enforcement over recently created items
    Light,
    /// Exact and semantic dedup, decay and tier enforcement over the whole corpus
    Deep,
    /// Reindex everything, then a deep pass
    Full,
}

impl ConsolidationMode {
    /// Job types run by this mode, in order
    pub fn stages(self) -> &'static [JobType] {
        match self {
            ConsolidationMode::Light => &[JobType::Dedup, JobType::Decay, JobType::Archive],
            ConsolidationMode::Deep => &[
                JobType::Dedup,
                JobType::Merge,
                JobType::Decay,
                JobType::Archive,
            ],
            ConsolidationMode::Full => &[
                JobType::Reindex,
                JobType::Dedup,
                JobType::Merge,
                JobType::Decay,
                JobType::Archive,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConsolidationMode::Light => "light",
            ConsolidationMode::Deep => "deep",
            ConsolidationMode::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<ConsolidationMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Some(ConsolidationMode::Light),
            "deep" => Some(ConsolidationMode::Deep),
            "full" => Some(ConsolidationMode::Full),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsolidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a consolidation pass
///
/// Counts include the work committed by jobs that later died; `failed_jobs` lists those jobs so
/// they can be inspected in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationSummary {
    pub mode: ConsolidationMode,
    pub processed: u64,
    pub merged: u64,
    pub archived: u64,
    pub promoted: u64,
    pub decayed: u64,
    pub reindexed: u64,
    pub duration_ms: u64,
    pub job_ids: Vec<Uuid>,
    pub failed_jobs: Vec<Uuid>,
}

impl ConsolidationSummary {
    fn new(mode: ConsolidationMode) -> Self {
        Self {
            mode,
            processed: 0,
            merged: 0,
            archived: 0,
            promoted: 0,
            decayed: 0,
            reindexed: 0,
            duration_ms: 0,
            job_ids: Vec::new(),
            failed_jobs: Vec::new(),
        }
    }

    fn absorb(&mut self, report: &JobReport) {
        self.processed += report.processed;
        self.merged += report.merged;
        self.archived += report.archived;
        self.promoted += report.promoted;
        self.decayed += report.decayed;
        self.reindexed += report.reindexed;
    }
}

/// Owns the job queue and worker pool and runs consolidation passes
pub struct Scheduler {
    queue: Arc<JobQueue>,
    pool: Mutex<Option<WorkerPool>>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Start `config.workers` workers running jobs through `handler`
    pub fn start(config: SchedulerConfig, handler: Arc<dyn JobHandler>) -> Self {
        let queue = Arc::new(JobQueue::new());
        let pool = WorkerPool::spawn(
            config.workers,
            queue.clone(),
            handler,
            RetryPolicy::from(&config),
        );
        Self {
            queue,
            pool: Mutex::new(Some(pool)),
            config,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One job per partition for `job_type`
    fn stage_jobs(
        &self,
        mode: ConsolidationMode,
        job_type: JobType,
        priority: JobPriority,
    ) -> Vec<ConsolidationJob> {
        let since = match mode {
            ConsolidationMode::Light => {
                Some(Utc::now() - chrono::Duration::hours(self.config.light_window_hours))
            }
            ConsolidationMode::Deep | ConsolidationMode::Full => None,
        };

        Partition::split(self.config.partitions)
            .into_iter()
            .map(|partition| {
                ConsolidationJob::new(
                    job_type,
                    priority,
                    JobPayload {
                        scope: JobScope { since, partition },
                        batch_size: self.config.batch_size,
                    },
                )
            })
            .collect()
    }

    /// Run every stage of `mode` and wait for the pass to finish
    pub async fn run(
        &self,
        mode: ConsolidationMode,
        priority: JobPriority,
    ) -> Result<ConsolidationSummary> {
        if self.queue.is_closed().await {
            return Err(MemtierError::Shutdown);
        }

        let started = Instant::now();
        let mut summary = ConsolidationSummary::new(mode);
        info!(mode = %mode, "Starting consolidation pass");

        for &job_type in mode.stages() {
            let mut ids = Vec::new();
            for job in self.stage_jobs(mode, job_type, priority) {
                ids.push(self.queue.enqueue(job).await);
            }
            summary.job_ids.extend(&ids);

            let finished = self.queue.wait_for(&ids).await;
            if finished.iter().any(|j| !j.status.is_terminal()) {
                return Err(MemtierError::Shutdown);
            }

            let reports: Vec<JobReport> = finished.iter().map(|j| j.progress).collect();
            let stage = aggregate(&reports);
            summary.absorb(&stage);
            summary.failed_jobs.extend(
                finished
                    .iter()
                    .filter(|j| j.status == JobStatus::Dead)
                    .map(|j| j.id),
            );
            debug!(mode = %mode, stage = %job_type, processed = stage.processed, "Stage finished");
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            mode = %mode,
            processed = summary.processed,
            merged = summary.merged,
            archived = summary.archived,
            failed_jobs = summary.failed_jobs.len(),
            duration_ms = summary.duration_ms,
            "Consolidation pass finished"
        );
        Ok(summary)
    }

    pub async fn job_status(&self, id: Uuid) -> Option<ConsolidationJob> {
        self.queue.get(id).await
    }

    pub async fn dead_letter(&self) -> Vec<ConsolidationJob> {
        self.queue.dead_letter().await
    }

    /// Spawn one loop per mode running passes on the configured cadences.
    ///
    /// Light passes run at Medium priority, deep and full passes at Low, so caller-initiated
    /// passes (High) are always served first. The loops exit once the queue is closed.
    pub fn spawn_triggers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        [
            (
                ConsolidationMode::Light,
                JobPriority::Medium,
                self.config.light_interval_secs,
            ),
            (
                ConsolidationMode::Deep,
                JobPriority::Low,
                self.config.deep_interval_secs,
            ),
            (
                ConsolidationMode::Full,
                JobPriority::Low,
                self.config.full_interval_secs,
            ),
        ]
        .into_iter()
        .filter(|(_, _, secs)| *secs > 0)
        .map(|(mode, priority, secs)| {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler
                    .trigger_loop(mode, priority, Duration::from_secs(secs))
                    .await
            })
        })
        .collect()
    }

    async fn trigger_loop(&self, mode: ConsolidationMode, priority: JobPriority, every: Duration) {
        info!(mode = %mode, interval_secs = every.as_secs(), "Consolidation trigger started");
        loop {
            tokio::time::sleep(every).await;
            if self.queue.is_closed().await {
                break;
            }
            match self.run(mode, priority).await {
                Ok(summary) => debug!(mode = %mode, jobs = summary.job_ids.len(), "Triggered pass done"),
                Err(MemtierError::Shutdown) => break,
                Err(e) => warn!(mode = %mode, error = %e, "Triggered consolidation pass failed"),
            }
        }
        debug!(mode = %mode, "Consolidation trigger stopped");
    }

    /// Close the queue and wait for workers to drain. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.shutdown().await;
        }
    }
}
