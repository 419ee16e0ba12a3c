//! Append-only audit log
//!
//! Every mutating decision (creation, promotion, decay update, merge, archival, reindex,
//! deletion) is recorded as an [`AuditEvent`]. Events are never rewritten and are only read back
//! for history and compliance queries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::Result;
use crate::memory::types::MemoryItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    /// Ingested content matched an existing item and was folded into it
    DedupOnIngest,
    Promoted,
    DecayUpdated,
    Merged,
    Archived,
    Reindexed,
    Deleted,
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub item_id: Uuid,
    pub action: AuditAction,
    /// Component that made the decision, e.g. `ingest` or `consolidation:merge`
    pub actor: String,
    pub reason: String,
    /// Item state after the decision
    #[serde(default)]
    pub snapshot: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        item_id: Uuid,
        action: AuditAction,
        actor: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            item_id,
            action,
            actor: actor.into(),
            reason: reason.into(),
            snapshot: serde_json::Value::Null,
        }
    }

    /// Attach the item's state. The embedding is left out to keep records small.
    pub fn with_snapshot(mut self, item: &MemoryItem) -> Self {
        if let Ok(mut value) = serde_json::to_value(item) {
            if let Some(fields) = value.as_object_mut() {
                fields.remove("embedding");
            }
            self.snapshot = value;
        }
        self
    }
}

/// Filter for reading events back
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub item_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn for_item(item_id: Uuid) -> Self {
        Self {
            item_id: Some(item_id),
            ..Default::default()
        }
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        self.item_id.is_none_or(|id| id == event.item_id)
            && self.from.is_none_or(|from| event.timestamp >= from)
            && self.to.is_none_or(|to| event.timestamp <= to)
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append an event. `Ok` is the acknowledgement.
    async fn append(&self, event: AuditEvent) -> Result<()>;

    /// Events matching `query`, oldest first
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>>;
}

/// Audit log kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    events: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect())
    }
}

/// Audit log appended to a JSON-lines file
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut events = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let event: AuditEvent = serde_json::from_str(line)?;
            if query.matches(&event) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_in_memory_query_by_item() {
        let log = InMemoryAuditLog::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        log.append(AuditEvent::new(a, AuditAction::Created, "ingest", "new item"))
            .await
            .unwrap();
        log.append(AuditEvent::new(b, AuditAction::Created, "ingest", "new item"))
            .await
            .unwrap();
        log.append(AuditEvent::new(a, AuditAction::Promoted, "consolidation:archive", "working -> short_term"))
            .await
            .unwrap();

        let events = log.query(&AuditQuery::for_item(a)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action, AuditAction::Promoted);
    }

    #[tokio::test]
    async fn test_time_range_filter() {
        let log = InMemoryAuditLog::new();
        let mut old = AuditEvent::new(Uuid::new_v4(), AuditAction::Archived, "test", "old");
        old.timestamp = Utc::now() - Duration::days(10);
        log.append(old).await.unwrap();
        log.append(AuditEvent::new(Uuid::new_v4(), AuditAction::Archived, "test", "new"))
            .await
            .unwrap();

        let now = Utc::now();
        let recent = log
            .query(&AuditQuery::default().between(now - Duration::days(1), now))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].reason, "new");
    }

    #[tokio::test]
    async fn test_snapshot_omits_embedding() {
        let item = MemoryItem::new("content", vec![0.5; 16], Utc::now());
        let event = AuditEvent::new(item.id, AuditAction::Created, "ingest", "").with_snapshot(&item);
        assert!(event.snapshot.get("embedding").is_none());
        assert_eq!(event.snapshot["content"], "content");
    }

    #[tokio::test]
    async fn test_jsonl_log_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::open(dir.path().join("audit").join("events.jsonl"))
            .await
            .unwrap();

        let id = Uuid::new_v4();
        log.append(AuditEvent::new(id, AuditAction::Created, "ingest", "first"))
            .await
            .unwrap();
        log.append(AuditEvent::new(id, AuditAction::Deleted, "caller", "second"))
            .await
            .unwrap();

        let events = log.query(&AuditQuery::for_item(id)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, "first");

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
