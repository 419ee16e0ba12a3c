//! Consolidation job model
//!
//! Job state machine:
//!
//! ```text
//! Queued -> Running -> Completed
//!              |
//!              +-> Failed (retryable, waiting out backoff) -> Queued
//!              +-> Dead (retries exhausted or permanent error)
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::partition::Partition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Recompute decay scores
    Decay,
    /// Exact (content hash) deduplication
    Dedup,
    /// Semantic near-duplicate merging
    Merge,
    /// Tier enforcement: promotion, TTL expiry and archival
    Archive,
    /// Recompute content hashes and embeddings
    Reindex,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Decay => "decay",
            JobType::Dedup => "dedup",
            JobType::Merge => "merge",
            JobType::Archive => "archive",
            JobType::Reindex => "reindex",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    Medium,
    Low,
}

impl JobPriority {
    /// Higher rank is served first
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::High => 2,
            JobPriority::Medium => 1,
            JobPriority::Low => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    /// Failed with a retryable error, waiting out its backoff
    Failed,
    /// Dead-lettered. Never retried automatically.
    Dead,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }
}

/// Which items a job covers
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JobScope {
    /// Only items created at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub partition: Partition,
}

impl JobScope {
    pub fn includes(&self, id: &Uuid, created_at: DateTime<Utc>) -> bool {
        self.partition.contains(id) && self.since.is_none_or(|since| created_at >= since)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub scope: JobScope,
    /// Items fetched per scan page
    pub batch_size: usize,
}

/// Counters accumulated by a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub processed: u64,
    pub merged: u64,
    pub archived: u64,
    pub promoted: u64,
    pub decayed: u64,
    pub reindexed: u64,
}

impl JobReport {
    pub fn absorb(&mut self, other: &JobReport) {
        self.processed += other.processed;
        self.merged += other.merged;
        self.archived += other.archived;
        self.promoted += other.promoted;
        self.decayed += other.decayed;
        self.reindexed += other.reindexed;
    }
}

/// A unit of background consolidation work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub retry_count: u32,
    /// Earliest time the job may run
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Last item id fully processed. A retry resumes after it.
    pub checkpoint: Option<Uuid>,
    /// Counters accumulated up to the checkpoint
    pub progress: JobReport,
}

impl ConsolidationJob {
    pub fn new(job_type: JobType, priority: JobPriority, payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            priority,
            payload,
            status: JobStatus::Queued,
            retry_count: 0,
            scheduled_at: now,
            created_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            checkpoint: None,
            progress: JobReport::default(),
        }
    }

    pub(crate) fn start(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(at);
    }

    pub(crate) fn complete(&mut self, report: JobReport, at: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.progress = report;
        self.finished_at = Some(at);
    }

    /// Record a retryable failure. Returns false (and dead-letters) once retries are exhausted.
    pub(crate) fn fail_retryable(
        &mut self,
        error: String,
        max_retries: u32,
        backoff: Duration,
        at: DateTime<Utc>,
    ) -> bool {
        self.last_error = Some(error);
        if self.retry_count >= max_retries {
            self.status = JobStatus::Dead;
            self.finished_at = Some(at);
            return false;
        }
        self.retry_count += 1;
        self.status = JobStatus::Failed;
        self.scheduled_at = at + backoff;
        true
    }

    pub(crate) fn kill(&mut self, error: String, at: DateTime<Utc>) {
        self.last_error = Some(error);
        self.status = JobStatus::Dead;
        self.finished_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ConsolidationJob {
        ConsolidationJob::new(
            JobType::Decay,
            JobPriority::Medium,
            JobPayload {
                scope: JobScope::default(),
                batch_size: 10,
            },
        )
    }

    #[test]
    fn test_retry_bound() {
        let mut job = job();
        let now = Utc::now();
        for attempt in 1..=3 {
            assert!(job.fail_retryable("timeout".into(), 3, Duration::zero(), now));
            assert_eq!(job.retry_count, attempt);
            assert_eq!(job.status, JobStatus::Failed);
        }
        assert!(!job.fail_retryable("timeout".into(), 3, Duration::zero(), now));
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.retry_count, 3);
    }

    #[test]
    fn test_backoff_moves_schedule() {
        let mut job = job();
        let now = Utc::now();
        job.fail_retryable("rate limited".into(), 3, Duration::milliseconds(500), now);
        assert_eq!(job.scheduled_at, now + Duration::milliseconds(500));
        assert_eq!(job.last_error.as_deref(), Some("rate limited"));
    }

    #[test]
    fn test_scope_filters_by_partition_and_age() {
        let now = Utc::now();
        let scope = JobScope {
            since: Some(now - Duration::hours(1)),
            partition: Partition::WHOLE,
        };
        let id = Uuid::new_v4();
        assert!(scope.includes(&id, now));
        assert!(!scope.includes(&id, now - Duration::hours(2)));
    }

    #[test]
    fn test_priority_rank() {
        assert!(JobPriority::High.rank() > JobPriority::Medium.rank());
        assert!(JobPriority::Medium.rank() > JobPriority::Low.rank());
    }
}
