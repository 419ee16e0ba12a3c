//! Multi-level item cache
//!
//! L1 is a small process-local LRU with a short TTL, L2 a larger shared map with a medium TTL,
//! and L3 the storage collaborator itself. Reads fall through L1 → L2 → L3 and fill L2 then L1
//! on the way back. Writes go to L3 first and then drop the L1/L2 entries; the next read refills
//! them from L3.
//!
//! Writes never install their own result. Two overlapping writes to one key can return in either
//! order, and whichever returns last would otherwise overwrite the newer value. A per-key
//! generation counter is bumped by every invalidation, and a read-fill only installs its value if
//! the generation it observed before reading is still current, so a fill racing a write can never
//! resurrect the pre-write value. Fills and invalidations both happen under the L1 lock.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use crate::collab::storage::{InsertOutcome, StorageIndex};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::memory::types::{ArchiveReason, MemoryItem};

/// Cache level that served a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: MemoryItem,
    generation: u64,
    inserted_at: Instant,
    last_access: Instant,
    hit_count: u64,
}

impl CacheEntry {
    fn new(value: MemoryItem, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            value,
            generation,
            inserted_at: now,
            last_access: now,
            hit_count: 0,
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() < ttl
    }

    fn touch(&mut self) {
        self.hit_count += 1;
        self.last_access = Instant::now();
    }
}

#[derive(Debug, Default)]
struct LevelCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LevelCounters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, entries: usize) -> LevelStats {
        LevelStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

/// Counters for one cache level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl LevelStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Hit/miss counters for every level
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1: LevelStats,
    pub l2: LevelStats,
    pub l3: LevelStats,
}

/// Read-through/write-through cache in front of the storage collaborator
pub struct CacheManager {
    storage: Arc<dyn StorageIndex>,
    l1: Mutex<LruCache<Uuid, CacheEntry>>,
    l2: DashMap<Uuid, CacheEntry>,
    generations: DashMap<Uuid, u64>,
    l1_ttl: Duration,
    l2_ttl: Duration,
    l2_capacity: usize,
    l1_counters: LevelCounters,
    l2_counters: LevelCounters,
    l3_counters: LevelCounters,
}

impl CacheManager {
    pub fn new(storage: Arc<dyn StorageIndex>, config: &CacheConfig) -> Self {
        let l1_capacity = NonZeroUsize::new(config.l1_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            storage,
            l1: Mutex::new(LruCache::new(l1_capacity)),
            l2: DashMap::new(),
            generations: DashMap::new(),
            l1_ttl: Duration::from_secs(config.l1_ttl_secs),
            l2_ttl: Duration::from_secs(config.l2_ttl_secs),
            l2_capacity: config.l2_capacity.max(1),
            l1_counters: LevelCounters::default(),
            l2_counters: LevelCounters::default(),
            l3_counters: LevelCounters::default(),
        }
    }

    /// The storage collaborator behind the cache
    pub fn storage(&self) -> &Arc<dyn StorageIndex> {
        &self.storage
    }

    fn generation(&self, id: &Uuid) -> u64 {
        self.generations.get(id).map(|g| *g).unwrap_or(0)
    }

    fn bump_generation(&self, id: Uuid) -> u64 {
        let mut generation = self.generations.entry(id).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Read an item, filling upper levels on the way back
    pub async fn get(&self, id: Uuid) -> Result<Option<MemoryItem>> {
        Ok(self.get_traced(id).await?.map(|(item, _)| item))
    }

    /// Read an item and report which level served it
    pub async fn get_traced(&self, id: Uuid) -> Result<Option<(MemoryItem, CacheLevel)>> {
        let observed = self.generation(&id);

        {
            let mut l1 = self.l1.lock().await;
            match l1.peek(&id).map(|entry| entry.is_fresh(self.l1_ttl)) {
                Some(true) => {
                    if let Some(entry) = l1.get_mut(&id) {
                        entry.touch();
                        self.l1_counters.hit();
                        return Ok(Some((entry.value.clone(), CacheLevel::L1)));
                    }
                }
                Some(false) => {
                    l1.pop(&id);
                }
                None => {}
            }
        }
        self.l1_counters.miss();

        let from_l2 = self.l2.get_mut(&id).and_then(|mut entry| {
            if entry.is_fresh(self.l2_ttl) {
                entry.touch();
                Some(entry.value.clone())
            } else {
                None
            }
        });

        if let Some(item) = from_l2 {
            self.l2_counters.hit();
            self.fill(item.clone(), observed, false).await;
            return Ok(Some((item, CacheLevel::L2)));
        }
        self.l2.remove_if(&id, |_, entry| !entry.is_fresh(self.l2_ttl));
        self.l2_counters.miss();

        match self.storage.get(id).await? {
            Some(item) => {
                self.l3_counters.hit();
                self.fill(item.clone(), observed, true).await;
                Ok(Some((item, CacheLevel::L3)))
            }
            None => {
                self.l3_counters.miss();
                Ok(None)
            }
        }
    }

    /// Read several items, skipping ids that no longer exist
    pub async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<MemoryItem>> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.get(*id).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Install a value read at generation `observed`, unless a write has happened since
    async fn fill(&self, item: MemoryItem, observed: u64, into_l2: bool) {
        let mut l1 = self.l1.lock().await;
        if self.generation(&item.id) != observed {
            trace!(item_id = %item.id, "Skipping stale cache fill");
            return;
        }
        if into_l2 {
            self.insert_l2(CacheEntry::new(item.clone(), observed));
        }
        l1.put(item.id, CacheEntry::new(item, observed));
    }

    /// Drop cached values after a committed write
    pub async fn invalidate(&self, id: Uuid) {
        let mut l1 = self.l1.lock().await;
        self.bump_generation(id);
        self.l2.remove(&id);
        l1.pop(&id);
    }

    fn insert_l2(&self, entry: CacheEntry) {
        if self.l2.len() >= self.l2_capacity && !self.l2.contains_key(&entry.value.id) {
            self.l2.retain(|_, e| e.is_fresh(self.l2_ttl));
            if self.l2.len() >= self.l2_capacity {
                let oldest = self
                    .l2
                    .iter()
                    .min_by_key(|e| e.last_access)
                    .map(|e| *e.key());
                if let Some(oldest) = oldest {
                    self.l2.remove(&oldest);
                }
            }
        }
        self.l2.insert(entry.value.id, entry);
    }

    /// Write-through insert or replace
    pub async fn put(&self, item: MemoryItem) -> Result<()> {
        let id = item.id;
        self.storage.upsert(item).await?;
        self.invalidate(id).await;
        Ok(())
    }

    /// Write-through replace, only if nothing was written since `expected` was read.
    /// Returns false, leaving storage and cache untouched, when the item changed.
    pub async fn put_if_version(&self, item: MemoryItem, expected: u64) -> Result<bool> {
        let id = item.id;
        if !self.storage.upsert_if_version(item, expected).await? {
            trace!(item_id = %id, expected, "Versioned write lost the race");
            return Ok(false);
        }
        self.invalidate(id).await;
        Ok(true)
    }

    /// Write-through atomic conditional insert
    pub async fn insert_if_absent(&self, hash: &str, item: MemoryItem) -> Result<InsertOutcome> {
        let id = item.id;
        let outcome = self.storage.conditional_insert_if_absent(hash, item).await?;
        if let InsertOutcome::Inserted(_) = outcome {
            self.invalidate(id).await;
        }
        Ok(outcome)
    }

    /// Write-through atomic merge commit
    pub async fn commit_merge(
        &self,
        merged: MemoryItem,
        originals: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let merged_id = merged.id;
        self.storage.commit_merge(merged, originals, at).await?;
        for id in originals {
            self.invalidate(*id).await;
        }
        self.invalidate(merged_id).await;
        Ok(())
    }

    /// Write-through archival
    pub async fn archive(&self, id: Uuid, reason: ArchiveReason, at: DateTime<Utc>) -> Result<()> {
        self.storage.mark_archived(id, reason, at).await?;
        self.invalidate(id).await;
        Ok(())
    }

    /// Write-through access bookkeeping
    pub async fn record_access(&self, id: Uuid, at: DateTime<Utc>) -> Result<MemoryItem> {
        let item = self.storage.record_access(id, at).await?;
        self.invalidate(id).await;
        Ok(item)
    }

    /// Write-through physical delete
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let existed = self.storage.delete(id).await?;
        self.invalidate(id).await;
        Ok(existed)
    }

    pub async fn stats(&self) -> CacheStats {
        let l1_entries = self.l1.lock().await.len();
        CacheStats {
            l1: self.l1_counters.snapshot(l1_entries),
            l2: self.l2_counters.snapshot(self.l2.len()),
            l3: self.l3_counters.snapshot(0),
        }
    }
}
