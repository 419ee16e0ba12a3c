//! Worker pool
//!
//! A fixed number of workers pull jobs from the shared [`JobQueue`] and run them through a
//! [`JobHandler`]. Failures are classified: retryable errors go back to the queue after an
//! exponential backoff, everything else (and retry exhaustion) goes to the dead-letter state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{MemtierError, Result};
use crate::scheduler::job::{ConsolidationJob, JobReport, JobStatus};
use crate::scheduler::queue::JobQueue;

/// Executes one job. Must be idempotent: a retried job may re-run after a partial attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ConsolidationJob, ctx: &JobContext) -> Result<JobReport>;
}

/// Handle a running job uses to persist progress
pub struct JobContext {
    queue: Arc<JobQueue>,
    job_id: Uuid,
}

impl JobContext {
    pub fn new(queue: Arc<JobQueue>, job_id: Uuid) -> Self {
        Self { queue, job_id }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Record that every item up to and including `last_processed` is done
    pub async fn checkpoint(&self, last_processed: Uuid, progress: JobReport) {
        self.queue
            .checkpoint(self.job_id, last_processed, progress)
            .await;
    }
}

/// Exponential backoff settings for retryable job failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for RetryPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay_ms: config.initial_backoff_ms,
            max_delay_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`, capped at `max_delay_ms`
    pub fn compute_delay(&self, attempt: u32) -> u64 {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let jitter = (base * 0.1 * jitter_fraction(attempt)) as u64;
        let delay = (base as u64).saturating_add(jitter);
        delay.min(self.max_delay_ms)
    }
}

/// Deterministic jitter in [0, 1) derived from the attempt number
fn jitter_fraction(attempt: u32) -> f64 {
    let x = attempt.wrapping_mul(2654435761);
    (x % 100) as f64 / 100.0
}

/// Fixed-size pool of workers draining a job queue
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        workers: usize,
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        retry: RetryPolicy,
    ) -> Self {
        let handles = (0..workers.max(1))
            .map(|worker| {
                let queue = queue.clone();
                let handler = handler.clone();
                let retry = retry.clone();
                tokio::spawn(async move { run_worker(worker, queue, handler, retry).await })
            })
            .collect();

        info!(workers, "Started consolidation workers");
        Self { queue, handles }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Close the queue and wait for in-flight jobs to finish
    pub async fn shutdown(self) {
        self.queue.close().await;
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Consolidation workers stopped");
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    retry: RetryPolicy,
) {
    while let Some(mut job) = queue.next().await {
        debug!(worker, job_id = %job.id, job_type = %job.job_type, attempt = job.retry_count, "Running job");

        let ctx = JobContext::new(queue.clone(), job.id);
        let result = handler.handle(&job, &ctx).await;

        // pick up checkpoints written during the run
        if let Some(latest) = queue.get(job.id).await {
            job.checkpoint = latest.checkpoint;
            job.progress = latest.progress;
        }

        let now = Utc::now();
        match result {
            Ok(report) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    processed = report.processed,
                    merged = report.merged,
                    archived = report.archived,
                    "Job completed"
                );
                job.complete(report, now);
            }
            Err(MemtierError::Shutdown) => {
                debug!(job_id = %job.id, "Job interrupted by shutdown");
                job.status = JobStatus::Queued;
                job.last_error = Some(MemtierError::Shutdown.to_string());
            }
            Err(e) if e.is_retryable() => {
                let delay_ms = retry.compute_delay(job.retry_count);
                let error = e.to_string();
                if job.fail_retryable(
                    error.clone(),
                    retry.max_retries,
                    chrono::Duration::milliseconds(delay_ms as i64),
                    now,
                ) {
                    warn!(
                        job_id = %job.id,
                        attempt = job.retry_count,
                        max_retries = retry.max_retries,
                        delay_ms,
                        error = %error,
                        "Retrying consolidation job"
                    );
                } else {
                    error!(
                        job_id = %job.id,
                        retries = job.retry_count,
                        error = %error,
                        "Job exhausted retries, moved to dead-letter"
                    );
                }
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job failed permanently, moved to dead-letter");
                job.kill(e.to_string(), now);
            }
        }

        queue.update(job).await;
    }

    debug!(worker, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobPayload, JobPriority, JobScope, JobType};
    use crate::testing::ScriptedHandler;

    fn job() -> ConsolidationJob {
        ConsolidationJob::new(
            JobType::Dedup,
            JobPriority::High,
            JobPayload {
                scope: JobScope::default(),
                batch_size: 10,
            },
        )
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_compute_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert!(policy.compute_delay(1) > policy.compute_delay(0));
        assert!(policy.compute_delay(0) >= 500);
        assert_eq!(policy.compute_delay(20), 30_000);
    }

    #[tokio::test]
    async fn test_transient_failures_within_budget_complete() {
        let queue = Arc::new(JobQueue::new());
        let handler = Arc::new(ScriptedHandler::transient_failures(2));
        let pool = WorkerPool::spawn(2, queue.clone(), handler.clone(), fast_retry(3));

        let id = queue.enqueue(job()).await;
        let done = queue.wait_for(&[id]).await;

        assert_eq!(done[0].status, JobStatus::Completed);
        assert_eq!(done[0].retry_count, 2);
        assert_eq!(handler.calls(), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let queue = Arc::new(JobQueue::new());
        let handler = Arc::new(ScriptedHandler::transient_failures(10));
        let pool = WorkerPool::spawn(1, queue.clone(), handler.clone(), fast_retry(3));

        let id = queue.enqueue(job()).await;
        let done = queue.wait_for(&[id]).await;

        assert_eq!(done[0].status, JobStatus::Dead);
        assert_eq!(done[0].retry_count, 3);
        assert_eq!(handler.calls(), 4);
        assert!(done[0].last_error.is_some());

        // dead jobs are never picked up again
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(handler.calls(), 4);
        assert_eq!(queue.dead_letter().await.len(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let queue = Arc::new(JobQueue::new());
        let handler = Arc::new(ScriptedHandler::permanent_failure());
        let pool = WorkerPool::spawn(1, queue.clone(), handler.clone(), fast_retry(3));

        let id = queue.enqueue(job()).await;
        let done = queue.wait_for(&[id]).await;

        assert_eq!(done[0].status, JobStatus::Dead);
        assert_eq!(done[0].retry_count, 0);
        assert_eq!(handler.calls(), 1);
        pool.shutdown().await;
    }
}
