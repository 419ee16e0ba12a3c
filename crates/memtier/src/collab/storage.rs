//! Storage and index collaborator
//!
//! [`StorageIndex`] is the persistence boundary: item CRUD, nearest-neighbour search, keyword
//! search, entity-graph traversal, and the atomic primitives (`conditional_insert_if_absent`,
//! `commit_merge`) that keep ingestion and merging free of check-then-act races.
//!
//! [`LocalStore`] keeps everything in memory behind a single lock and can persist a JSON
//! snapshot of all items.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::collab::{cosine_similarity, tokenize};
use crate::error::{MemtierError, Result};
use crate::memory::types::{ArchiveReason, MemoryItem, Tier};

/// An item id with a relevance score from a search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredId {
    pub id: Uuid,
    pub score: f32,
}

/// Result of an atomic conditional insert
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// No active item carried the hash; the new item was stored
    Inserted(Uuid),
    /// An active item already carries the hash; nothing was written
    Existing(MemoryItem),
}

/// Item counts reported by the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub active: usize,
    pub archived: usize,
    pub by_tier: BTreeMap<Tier, usize>,
}

/// Persistence and index operations consumed by the engine
#[async_trait]
pub trait StorageIndex: Send + Sync {
    /// Active items whose embedding scores at least `min_score` against `embedding`, best first
    async fn vector_search(&self, embedding: &[f32], k: usize, min_score: f32)
    -> Result<Vec<ScoredId>>;

    /// Active items matching query terms, best first
    async fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>>;

    /// Active items reachable from `entity` within `depth` hops of the entity graph
    async fn graph_traverse(&self, entity: &str, depth: usize) -> Result<Vec<Uuid>>;

    /// Insert or replace an item
    async fn upsert(&self, item: MemoryItem) -> Result<()>;

    /// Replace an item only if its stored `version` still equals `expected`.
    /// Returns false when another write landed first or the item is gone.
    async fn upsert_if_version(&self, item: MemoryItem, expected: u64) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>>;

    /// Flag an item archived. Archived items stay readable.
    async fn mark_archived(&self, id: Uuid, reason: ArchiveReason, at: DateTime<Utc>) -> Result<()>;

    /// Insert `item` only if no active item carries `hash`, atomically
    async fn conditional_insert_if_absent(&self, hash: &str, item: MemoryItem)
    -> Result<InsertOutcome>;

    /// Active items carrying `hash`, in id order
    async fn find_by_hash(&self, hash: &str) -> Result<Vec<MemoryItem>>;

    /// Archive `originals` (pointing them at `merged`) and insert `merged`, all or nothing
    async fn commit_merge(
        &self,
        merged: MemoryItem,
        originals: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Count an access and return the updated item
    async fn record_access(&self, id: Uuid, at: DateTime<Utc>) -> Result<MemoryItem>;

    /// Up to `limit` items (archived included) with ids strictly greater than `after`, in id order
    async fn scan(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<MemoryItem>>;

    /// Physically remove an item. Returns false if it did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn stats(&self) -> Result<StoreStats>;
}

#[derive(Debug, Default)]
struct StoreInner {
    items: BTreeMap<Uuid, MemoryItem>,
    /// content hash -> active items carrying it
    by_hash: HashMap<String, BTreeSet<Uuid>>,
    /// lowercased entity -> active items mentioning it
    by_entity: HashMap<String, BTreeSet<Uuid>>,
}

impl StoreInner {
    fn index(&mut self, item: &MemoryItem) {
        if item.is_archived {
            return;
        }
        self.by_hash
            .entry(item.content_hash.clone())
            .or_default()
            .insert(item.id);
        for entity in &item.entities {
            self.by_entity
                .entry(entity.to_lowercase())
                .or_default()
                .insert(item.id);
        }
    }

    fn unindex(&mut self, item: &MemoryItem) {
        if let Some(ids) = self.by_hash.get_mut(&item.content_hash) {
            ids.remove(&item.id);
            if ids.is_empty() {
                self.by_hash.remove(&item.content_hash);
            }
        }
        for entity in &item.entities {
            let key = entity.to_lowercase();
            if let Some(ids) = self.by_entity.get_mut(&key) {
                ids.remove(&item.id);
                if ids.is_empty() {
                    self.by_entity.remove(&key);
                }
            }
        }
    }

    fn put(&mut self, mut item: MemoryItem) {
        if let Some(old) = self.items.remove(&item.id) {
            item.version = old.version + 1;
            self.unindex(&old);
        }
        self.index(&item);
        self.items.insert(item.id, item);
    }

    fn archive(&mut self, id: Uuid, reason: ArchiveReason, at: DateTime<Utc>) -> Result<()> {
        let mut item = self
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| MemtierError::NotFound(format!("item {id}")))?;
        item.archive(reason, at);
        self.put(item);
        Ok(())
    }

    fn active_with_hash(&self, hash: &str) -> Vec<MemoryItem> {
        self.by_hash
            .get(hash)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.items.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory reference store with optional JSON snapshot persistence
#[derive(Debug, Default)]
pub struct LocalStore {
    inner: RwLock<StoreInner>,
    snapshot_path: Option<PathBuf>,
}

impl LocalStore {
    /// A store that is never persisted
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a store backed by `path`, loading the snapshot if one exists.
    ///
    /// Every loaded item is validated; a corrupt snapshot fails with `ConsistencyViolation`
    /// instead of being patched up.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = StoreInner::default();

        if tokio::fs::try_exists(&path).await? {
            let bytes = tokio::fs::read(&path).await?;
            let items: Vec<MemoryItem> = serde_json::from_slice(&bytes)?;
            let now = Utc::now();
            for item in items {
                item.validate(now)?;
                inner.put(item);
            }
            info!(path = %path.display(), items = inner.items.len(), "Loaded snapshot");
        } else {
            debug!(path = %path.display(), "No snapshot found, starting empty");
        }

        Ok(Self {
            inner: RwLock::new(inner),
            snapshot_path: Some(path),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Write all items to the snapshot file. No-op for in-memory stores.
    pub async fn flush(&self) -> Result<()> {
        let Some(ref path) = self.snapshot_path else {
            return Ok(());
        };

        let json = {
            let inner = self.inner.read().await;
            let items: Vec<&MemoryItem> = inner.items.values().collect();
            serde_json::to_vec(&items)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!(path = %path.display(), bytes = json.len(), "Flushed snapshot");
        Ok(())
    }
}

fn rank(mut scored: Vec<ScoredId>, k: usize) -> Vec<ScoredId> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    scored.truncate(k);
    scored
}

#[async_trait]
impl StorageIndex for LocalStore {
    async fn vector_search(
        &self,
        embedding: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredId>> {
        let inner = self.inner.read().await;
        let scored = inner
            .items
            .values()
            .filter(|item| !item.is_archived)
            .map(|item| ScoredId {
                id: item.id,
                score: cosine_similarity(embedding, &item.embedding),
            })
            .filter(|s| s.score >= min_score)
            .collect();
        Ok(rank(scored, k))
    }

    async fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let inner = self.inner.read().await;
        let scored = inner
            .items
            .values()
            .filter(|item| !item.is_archived)
            .filter_map(|item| {
                let mut words: HashSet<String> = tokenize(&item.content).into_iter().collect();
                words.extend(item.tags.iter().map(|t| t.to_lowercase()));
                let hits = terms.iter().filter(|t| words.contains(*t)).count();
                (hits > 0).then(|| ScoredId {
                    id: item.id,
                    score: hits as f32 / terms.len() as f32,
                })
            })
            .collect();
        Ok(rank(scored, k))
    }

    async fn graph_traverse(&self, entity: &str, depth: usize) -> Result<Vec<Uuid>> {
        let inner = self.inner.read().await;
        let mut seen_entities: HashSet<String> = HashSet::new();
        let mut seen_items: HashSet<Uuid> = HashSet::new();
        let mut frontier: BTreeSet<String> = BTreeSet::from([entity.to_lowercase()]);
        let mut found = Vec::new();

        for _ in 0..depth {
            let mut next = BTreeSet::new();
            for entity in &frontier {
                if !seen_entities.insert(entity.clone()) {
                    continue;
                }
                let Some(ids) = inner.by_entity.get(entity) else {
                    continue;
                };
                for id in ids {
                    if !seen_items.insert(*id) {
                        continue;
                    }
                    found.push(*id);
                    if let Some(item) = inner.items.get(id) {
                        next.extend(item.entities.iter().map(|e| e.to_lowercase()));
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        Ok(found)
    }

    async fn upsert(&self, item: MemoryItem) -> Result<()> {
        self.inner.write().await.put(item);
        Ok(())
    }

    async fn upsert_if_version(&self, item: MemoryItem, expected: u64) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.items.get(&item.id) {
            Some(current) if current.version == expected => {
                inner.put(item);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>> {
        Ok(self.inner.read().await.items.get(&id).cloned())
    }

    async fn mark_archived(&self, id: Uuid, reason: ArchiveReason, at: DateTime<Utc>) -> Result<()> {
        self.inner.write().await.archive(id, reason, at)
    }

    async fn conditional_insert_if_absent(
        &self,
        hash: &str,
        item: MemoryItem,
    ) -> Result<InsertOutcome> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.active_with_hash(hash).into_iter().next() {
            return Ok(InsertOutcome::Existing(existing));
        }
        let id = item.id;
        inner.put(item);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Vec<MemoryItem>> {
        Ok(self.inner.read().await.active_with_hash(hash))
    }

    async fn commit_merge(
        &self,
        mut merged: MemoryItem,
        originals: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;

        // check everything before touching anything
        if inner.items.contains_key(&merged.id) {
            return Err(MemtierError::Storage(format!(
                "merged item {} already exists",
                merged.id
            )));
        }
        for id in originals {
            match inner.items.get(id) {
                None => return Err(MemtierError::NotFound(format!("item {id}"))),
                Some(item) if item.is_archived => {
                    return Err(MemtierError::ConcurrencyConflict(*id));
                }
                Some(_) => {}
            }
        }

        // accesses that landed on a source while the merge was resolved carry over
        let sources: Vec<&MemoryItem> = originals.iter().filter_map(|id| inner.items.get(id)).collect();
        merged.access_count = sources
            .iter()
            .fold(0u32, |sum, s| sum.saturating_add(s.access_count));
        if let Some(latest) = sources.iter().map(|s| s.accessed_at).max() {
            merged.accessed_at = merged.accessed_at.max(latest);
        }

        for id in originals {
            if let Some(mut item) = inner.items.get(id).cloned() {
                item.archive(ArchiveReason::Merged, at);
                item.merged_into = Some(merged.id);
                inner.put(item);
            }
        }
        inner.put(merged);
        Ok(())
    }

    async fn record_access(&self, id: Uuid, at: DateTime<Utc>) -> Result<MemoryItem> {
        let mut inner = self.inner.write().await;
        let item = inner
            .items
            .get_mut(&id)
            .ok_or_else(|| MemtierError::NotFound(format!("item {id}")))?;
        item.mark_accessed(at);
        item.version += 1;
        Ok(item.clone())
    }

    async fn scan(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<MemoryItem>> {
        let inner = self.inner.read().await;
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(inner
            .items
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.items.remove(&id) {
            Some(item) => {
                inner.unindex(&item);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.inner.read().await;
        let mut stats = StoreStats {
            total: inner.items.len(),
            ..Default::default()
        };
        for item in inner.items.values() {
            if item.is_archived {
                stats.archived += 1;
            } else {
                stats.active += 1;
                *stats.by_tier.entry(item.tier).or_default() += 1;
            }
        }
        Ok(stats)
    }
}
