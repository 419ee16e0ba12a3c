//! Concurrency caps for collaborator calls
//!
//! Both wrappers take a shared [`Semaphore`] so one limit covers every outstanding storage and
//! intelligence call the engine makes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, SemaphorePermit};
use uuid::Uuid;

use crate::collab::intelligence::{IntelligenceService, QueryIntent, Verification};
use crate::collab::storage::{InsertOutcome, ScoredId, StorageIndex, StoreStats};
use crate::error::{MemtierError, Result};
use crate::memory::types::{ArchiveReason, MemoryItem};

async fn acquire(semaphore: &Semaphore) -> Result<SemaphorePermit<'_>> {
    semaphore.acquire().await.map_err(|_| MemtierError::Shutdown)
}

/// Storage collaborator behind a call-count semaphore
pub struct ThrottledStorage {
    inner: Arc<dyn StorageIndex>,
    semaphore: Arc<Semaphore>,
}

impl ThrottledStorage {
    pub fn new(inner: Arc<dyn StorageIndex>, semaphore: Arc<Semaphore>) -> Self {
        Self { inner, semaphore }
    }
}

#[async_trait]
impl StorageIndex for ThrottledStorage {
    async fn vector_search(
        &self,
        embedding: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredId>> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.vector_search(embedding, k, min_score).await
    }

    async fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.keyword_search(query, k).await
    }

    async fn graph_traverse(&self, entity: &str, depth: usize) -> Result<Vec<Uuid>> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.graph_traverse(entity, depth).await
    }

    async fn upsert(&self, item: MemoryItem) -> Result<()> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.upsert(item).await
    }

    async fn upsert_if_version(&self, item: MemoryItem, expected: u64) -> Result<bool> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.upsert_if_version(item, expected).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.get(id).await
    }

    async fn mark_archived(&self, id: Uuid, reason: ArchiveReason, at: DateTime<Utc>) -> Result<()> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.mark_archived(id, reason, at).await
    }

    async fn conditional_insert_if_absent(
        &self,
        hash: &str,
        item: MemoryItem,
    ) -> Result<InsertOutcome> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.conditional_insert_if_absent(hash, item).await
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Vec<MemoryItem>> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.find_by_hash(hash).await
    }

    async fn commit_merge(
        &self,
        merged: MemoryItem,
        originals: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.commit_merge(merged, originals, at).await
    }

    async fn record_access(&self, id: Uuid, at: DateTime<Utc>) -> Result<MemoryItem> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.record_access(id, at).await
    }

    async fn scan(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<MemoryItem>> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.scan(after, limit).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.delete(id).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.stats().await
    }
}

/// Intelligence collaborator behind a call-count semaphore
pub struct ThrottledIntelligence {
    inner: Arc<dyn IntelligenceService>,
    semaphore: Arc<Semaphore>,
}

impl ThrottledIntelligence {
    pub fn new(inner: Arc<dyn IntelligenceService>, semaphore: Arc<Semaphore>) -> Self {
        Self { inner, semaphore }
    }
}

#[async_trait]
impl IntelligenceService for ThrottledIntelligence {
    async fn extract_entities(&self, text: &str) -> Result<Vec<String>> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.extract_entities(text).await
    }

    async fn verify(&self, item: &MemoryItem) -> Result<Verification> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.verify(item).await
    }

    async fn classify_intent(&self, query: &str) -> Result<QueryIntent> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.classify_intent(query).await
    }

    async fn summarize_merge(&self, candidates: &[MemoryItem]) -> Result<String> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.summarize_merge(candidates).await
    }

    async fn debate(&self, item: &MemoryItem) -> Result<f32> {
        let _permit = acquire(&self.semaphore).await?;
        self.inner.debate(item).await
    }
}
