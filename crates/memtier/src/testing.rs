//! Test utilities for memtier - deterministic collaborators and fixtures
//!
//! This module provides utilities for fast, reproducible tests:
//! - Item builders with back-dated timestamps
//! - An embedder with hand-picked vectors, for exact similarity scores
//! - A storage wrapper that injects transient failures
//! - A storage wrapper that stalls reads and accesses, to force interleavings
//! - A scripted job handler for exercising retry and dead-letter paths

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::collab::{Embedder, HashEmbedder, InsertOutcome, ScoredId, StorageIndex, StoreStats};
use crate::error::{MemtierError, Result};
use crate::memory::types::{ArchiveReason, MemoryItem};
use crate::scheduler::{ConsolidationJob, JobContext, JobHandler, JobReport};

/// Item created `age` ago, with every timestamp back-dated consistently and a hash embedding
pub fn fixture_item(content: &str, age: Duration) -> MemoryItem {
    let embedding = HashEmbedder::default().embed_text(content);
    MemoryItem::new(content, embedding, Utc::now() - age)
}

/// Embedder returning fixed vectors for known texts and a fallback for anything else
#[derive(Debug, Clone)]
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fallback: Vec<f32>,
}

impl FixedEmbedder {
    pub fn new(fallback: Vec<f32>) -> Self {
        Self {
            vectors: HashMap::new(),
            fallback,
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }

    fn dimension(&self) -> usize {
        self.fallback.len()
    }
}

/// Storage wrapper whose first `failures` calls fail with a transient error
pub struct FlakyStorage {
    inner: Arc<dyn StorageIndex>,
    remaining: AtomicU32,
    tripped: AtomicU32,
}

impl FlakyStorage {
    pub fn new(inner: Arc<dyn StorageIndex>, failures: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(failures),
            tripped: AtomicU32::new(0),
        }
    }

    /// Number of calls that failed so far
    pub fn tripped(&self) -> u32 {
        self.tripped.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<()> {
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            self.tripped.fetch_add(1, Ordering::SeqCst);
            return Err(MemtierError::TransientCollaborator(
                "injected storage timeout".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageIndex for FlakyStorage {
    async fn vector_search(
        &self,
        embedding: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredId>> {
        self.trip()?;
        self.inner.vector_search(embedding, k, min_score).await
    }

    async fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        self.trip()?;
        self.inner.keyword_search(query, k).await
    }

    async fn graph_traverse(&self, entity: &str, depth: usize) -> Result<Vec<Uuid>> {
        self.trip()?;
        self.inner.graph_traverse(entity, depth).await
    }

    async fn upsert(&self, item: MemoryItem) -> Result<()> {
        self.trip()?;
        self.inner.upsert(item).await
    }

    async fn upsert_if_version(&self, item: MemoryItem, expected: u64) -> Result<bool> {
        self.trip()?;
        self.inner.upsert_if_version(item, expected).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>> {
        self.trip()?;
        self.inner.get(id).await
    }

    async fn mark_archived(&self, id: Uuid, reason: ArchiveReason, at: DateTime<Utc>) -> Result<()> {
        self.trip()?;
        self.inner.mark_archived(id, reason, at).await
    }

    async fn conditional_insert_if_absent(
        &self,
        hash: &str,
        item: MemoryItem,
    ) -> Result<InsertOutcome> {
        self.trip()?;
        self.inner.conditional_insert_if_absent(hash, item).await
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Vec<MemoryItem>> {
        self.trip()?;
        self.inner.find_by_hash(hash).await
    }

    async fn commit_merge(
        &self,
        merged: MemoryItem,
        originals: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.trip()?;
        self.inner.commit_merge(merged, originals, at).await
    }

    async fn record_access(&self, id: Uuid, at: DateTime<Utc>) -> Result<MemoryItem> {
        self.trip()?;
        self.inner.record_access(id, at).await
    }

    async fn scan(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<MemoryItem>> {
        self.trip()?;
        self.inner.scan(after, limit).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.trip()?;
        self.inner.delete(id).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.trip()?;
        self.inner.stats().await
    }
}

/// Storage wrapper that holds results back before returning them.
///
/// `get` results are delayed by the configured read delay, and the first `record_access` result
/// by the access delay. The underlying call has already committed when the delay starts, so
/// other tasks observe the write while the caller still waits for it.
pub struct DelayedStorage {
    inner: Arc<dyn StorageIndex>,
    read_delay: StdDuration,
    first_access_delay: StdDuration,
    accesses: AtomicU32,
}

impl DelayedStorage {
    pub fn new(inner: Arc<dyn StorageIndex>) -> Self {
        Self {
            inner,
            read_delay: StdDuration::ZERO,
            first_access_delay: StdDuration::ZERO,
            accesses: AtomicU32::new(0),
        }
    }

    pub fn with_read_delay(mut self, delay: StdDuration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn with_first_access_delay(mut self, delay: StdDuration) -> Self {
        self.first_access_delay = delay;
        self
    }
}

#[async_trait]
impl StorageIndex for DelayedStorage {
    async fn vector_search(
        &self,
        embedding: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredId>> {
        self.inner.vector_search(embedding, k, min_score).await
    }

    async fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        self.inner.keyword_search(query, k).await
    }

    async fn graph_traverse(&self, entity: &str, depth: usize) -> Result<Vec<Uuid>> {
        self.inner.graph_traverse(entity, depth).await
    }

    async fn upsert(&self, item: MemoryItem) -> Result<()> {
        self.inner.upsert(item).await
    }

    async fn upsert_if_version(&self, item: MemoryItem, expected: u64) -> Result<bool> {
        self.inner.upsert_if_version(item, expected).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>> {
        let item = self.inner.get(id).await?;
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        Ok(item)
    }

    async fn mark_archived(&self, id: Uuid, reason: ArchiveReason, at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_archived(id, reason, at).await
    }

    async fn conditional_insert_if_absent(
        &self,
        hash: &str,
        item: MemoryItem,
    ) -> Result<InsertOutcome> {
        self.inner.conditional_insert_if_absent(hash, item).await
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Vec<MemoryItem>> {
        self.inner.find_by_hash(hash).await
    }

    async fn commit_merge(
        &self,
        merged: MemoryItem,
        originals: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.commit_merge(merged, originals, at).await
    }

    async fn record_access(&self, id: Uuid, at: DateTime<Utc>) -> Result<MemoryItem> {
        let item = self.inner.record_access(id, at).await?;
        if self.accesses.fetch_add(1, Ordering::SeqCst) == 0 && !self.first_access_delay.is_zero() {
            tokio::time::sleep(self.first_access_delay).await;
        }
        Ok(item)
    }

    async fn scan(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<MemoryItem>> {
        self.inner.scan(after, limit).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inner.stats().await
    }
}

/// Job handler that fails according to a script and counts its invocations
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    transient_remaining: AtomicU32,
    permanent: bool,
    calls: AtomicU32,
}

impl ScriptedHandler {
    /// Fail the first `n` calls with a transient error, then succeed
    pub fn transient_failures(n: u32) -> Self {
        Self {
            transient_remaining: AtomicU32::new(n),
            ..Self::default()
        }
    }

    /// Fail every call with a permanent error
    pub fn permanent_failure() -> Self {
        Self {
            permanent: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, _job: &ConsolidationJob, _ctx: &JobContext) -> Result<JobReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent {
            return Err(MemtierError::PermanentCollaborator("scripted auth failure".into()));
        }
        let transient = self
            .transient_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(MemtierError::TransientCollaborator("scripted timeout".into()));
        }
        Ok(JobReport {
            processed: 1,
            ..JobReport::default()
        })
    }
}
