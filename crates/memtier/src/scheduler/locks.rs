//! Per-item advisory locks
//!
//! Mutations (promotion, decay update, merge, archive) hold the lock of every item they touch.
//! Multi-item acquisition takes ids in sorted order; on contention everything acquired so far is
//! released and the attempt retried after a short backoff. Exhausting the attempts surfaces a
//! `ConcurrencyConflict`, which the job layer retries. Retrieval never takes these locks.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;
use uuid::Uuid;

use crate::error::{MemtierError, Result};

const DEFAULT_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);

/// Registry of held item locks
#[derive(Debug, Clone)]
pub struct ItemLocks {
    held: Arc<DashMap<Uuid, ()>>,
    attempts: u32,
    backoff: Duration,
}

impl Default for ItemLocks {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF)
    }
}

/// Held locks, released on drop
#[derive(Debug)]
pub struct ItemLockGuard {
    held: Arc<DashMap<Uuid, ()>>,
    ids: Vec<Uuid>,
}

impl ItemLockGuard {
    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }
}

impl Drop for ItemLockGuard {
    fn drop(&mut self) {
        for id in &self.ids {
            self.held.remove(id);
        }
    }
}

impl ItemLocks {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            held: Arc::new(DashMap::new()),
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Try once to take every lock. On contention, returns the contended id.
    pub fn try_acquire(&self, ids: &[Uuid]) -> std::result::Result<ItemLockGuard, Uuid> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guard = ItemLockGuard {
            held: self.held.clone(),
            ids: Vec::with_capacity(sorted.len()),
        };

        for id in sorted {
            let taken = match self.held.entry(id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(());
                    true
                }
            };
            if !taken {
                // dropping the guard releases the partial set
                return Err(id);
            }
            guard.ids.push(id);
        }

        Ok(guard)
    }

    /// Take every lock, retrying on contention
    pub async fn acquire(&self, ids: &[Uuid]) -> Result<ItemLockGuard> {
        let mut contended = Uuid::nil();
        for attempt in 0..self.attempts {
            match self.try_acquire(ids) {
                Ok(guard) => return Ok(guard),
                Err(id) => {
                    contended = id;
                    trace!(item_id = %id, attempt, "Item lock contended");
                    tokio::time::sleep(self.backoff * (attempt + 1)).await;
                }
            }
        }
        Err(MemtierError::ConcurrencyConflict(contended))
    }

    pub fn is_locked(&self, id: &Uuid) -> bool {
        self.held.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let locks = ItemLocks::default();
        let id = Uuid::new_v4();
        {
            let _guard = locks.acquire(&[id]).await.unwrap();
            assert!(locks.is_locked(&id));
        }
        assert!(!locks.is_locked(&id));
    }

    #[tokio::test]
    async fn test_partial_acquisition_is_rolled_back() {
        let locks = ItemLocks::default();
        let mut ids = [Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();

        let _held = locks.try_acquire(&[ids[1]]).unwrap();
        assert_eq!(locks.try_acquire(&ids).unwrap_err(), ids[1]);
        assert!(!locks.is_locked(&ids[0]));
    }

    #[tokio::test]
    async fn test_contention_surfaces_conflict() {
        let locks = ItemLocks::new(2, Duration::from_millis(1));
        let id = Uuid::new_v4();
        let _held = locks.acquire(&[id]).await.unwrap();

        let err = locks.acquire(&[id]).await.unwrap_err();
        assert!(matches!(err, MemtierError::ConcurrencyConflict(c) if c == id));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = ItemLocks::new(20, Duration::from_millis(2));
        let id = Uuid::new_v4();
        let held = locks.acquire(&[id]).await.unwrap();

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(&[id]).await.map(|g| g.ids().to_vec()) })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(held);

        assert_eq!(contender.await.unwrap().unwrap(), vec![id]);
    }
}
