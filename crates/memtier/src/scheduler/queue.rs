//! Priority job queue
//!
//! Ready jobs are served by `(priority, scheduled_at, enqueue order)`. Jobs waiting out a retry
//! backoff sit in a delayed set keyed by their due time and move to the ready heap once due.
//! Every job ever enqueued stays in the job table so its status can be queried.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::scheduler::job::{ConsolidationJob, JobReport, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    rank: u8,
    scheduled_at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher rank first, then earlier schedule, then FIFO
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.scheduled_at.cmp(&self.scheduled_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<Uuid, ConsolidationJob>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BTreeMap<(DateTime<Utc>, u64), Uuid>,
    seq: u64,
    closed: bool,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_ready(&mut self, id: Uuid) {
        let seq = self.next_seq();
        if let Some(job) = self.jobs.get_mut(&id) {
            job.status = JobStatus::Queued;
            let entry = ReadyEntry {
                rank: job.priority.rank(),
                scheduled_at: job.scheduled_at,
                seq,
                id,
            };
            self.ready.push(entry);
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some((&key, &id)) = self.delayed.first_key_value() {
            if key.0 > now {
                break;
            }
            self.delayed.remove(&key);
            self.push_ready(id);
        }
    }
}

/// Job counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

/// Shared job queue and job status table
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
    changed: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. Jobs scheduled in the future wait in the delayed set.
    pub async fn enqueue(&self, job: ConsolidationJob) -> Uuid {
        let id = job.id;
        {
            let mut state = self.state.lock().await;
            let due = job.scheduled_at;
            state.jobs.insert(id, job);
            if due > Utc::now() {
                let seq = state.next_seq();
                state.delayed.insert((due, seq), id);
            } else {
                state.push_ready(id);
            }
        }
        debug!(job_id = %id, "Enqueued job");
        self.available.notify_waiters();
        self.changed.notify_waiters();
        id
    }

    /// Take the next runnable job, marking it Running. Waits until one is available.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<ConsolidationJob> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }

                let now = Utc::now();
                state.promote_due(now);

                while let Some(entry) = state.ready.pop() {
                    if let Some(job) = state.jobs.get_mut(&entry.id) {
                        if job.status != JobStatus::Queued {
                            continue;
                        }
                        job.start(now);
                        let job = job.clone();
                        drop(state);
                        self.changed.notify_waiters();
                        return Some(job);
                    }
                }

                state.delayed.first_key_value().map(|(key, _)| key.0)
            };

            match next_due {
                Some(due) => {
                    let wait = (due - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Store the outcome of a run. Retryable failures go to the delayed set.
    pub async fn update(&self, job: ConsolidationJob) {
        let id = job.id;
        {
            let mut state = self.state.lock().await;
            let status = job.status;
            let due = job.scheduled_at;
            state.jobs.insert(id, job);
            if status == JobStatus::Failed {
                let seq = state.next_seq();
                state.delayed.insert((due, seq), id);
            }
        }
        self.available.notify_waiters();
        self.changed.notify_waiters();
    }

    /// Persist a mid-run checkpoint
    pub async fn checkpoint(&self, id: Uuid, last_processed: Uuid, progress: JobReport) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&id) {
            job.checkpoint = Some(last_processed);
            job.progress = progress;
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<ConsolidationJob> {
        self.state.lock().await.jobs.get(&id).cloned()
    }

    /// Jobs in the dead-letter state, oldest first
    pub async fn dead_letter(&self) -> Vec<ConsolidationJob> {
        let state = self.state.lock().await;
        let mut dead: Vec<ConsolidationJob> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Dead)
            .cloned()
            .collect();
        dead.sort_by_key(|j| (j.created_at, j.id));
        dead
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Dead => stats.dead += 1,
            }
        }
        stats
    }

    /// Wait until every listed job is Completed or Dead, returning their final state
    pub async fn wait_for(&self, ids: &[Uuid]) -> Vec<ConsolidationJob> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                let jobs: Vec<ConsolidationJob> = ids
                    .iter()
                    .filter_map(|id| state.jobs.get(id).cloned())
                    .collect();
                if state.closed || jobs.iter().all(|j| j.status.is_terminal()) {
                    return jobs;
                }
            }

            notified.await;
        }
    }

    /// Stop handing out jobs. Waiting workers and waiters wake up.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.available.notify_waiters();
        self.changed.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}
