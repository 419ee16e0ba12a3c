//! Filter types for retrieval
//!
//! Exact metadata filters applied by the third retrieval stage. All fields are optional; when
//! `None`, that filter is not applied. Multiple filters are combined with AND logic. Archived
//! items never match.

use chrono::{DateTime, Utc};

use crate::memory::types::{MemoryItem, Tier};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryFilter {
    /// Every listed tag must be present (case-insensitive)
    pub tags: Option<Vec<String>>,
    /// Exact category match (case-insensitive)
    pub category: Option<String>,
    /// Only items created at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Only items created at or before this time
    pub until: Option<DateTime<Utc>>,
    /// Only items in one of these tiers
    pub tiers: Option<Vec<Tier>>,
}

impl MemoryFilter {
    /// Create a new empty filter (no filtering applied)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_tiers(mut self, tiers: Vec<Tier>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    /// Check if this filter is empty (no conditions set)
    pub fn is_empty(&self) -> bool {
        self.tags.is_none()
            && self.category.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.tiers.is_none()
    }

    pub fn matches(&self, item: &MemoryItem) -> bool {
        if item.is_archived {
            return false;
        }

        if let Some(ref tags) = self.tags {
            let all_present = tags
                .iter()
                .all(|wanted| item.tags.iter().any(|t| t.eq_ignore_ascii_case(wanted)));
            if !all_present {
                return false;
            }
        }

        if let Some(ref category) = self.category {
            match item.category {
                Some(ref c) if c.eq_ignore_ascii_case(category) => {}
                _ => return false,
            }
        }

        if self.since.is_some_and(|since| item.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| item.created_at > until) {
            return false;
        }

        if let Some(ref tiers) = self.tiers {
            if !tiers.contains(&item.tier) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item() -> MemoryItem {
        let mut item = MemoryItem::new("Tune autovacuum", vec![1.0], Utc::now() - Duration::days(2));
        item.tags.insert("Postgres".into());
        item.tags.insert("ops".into());
        item.category = Some("runbook".into());
        item
    }

    #[test]
    fn test_empty_filter_matches_active_items() {
        let filter = MemoryFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&item()));
    }

    #[test]
    fn test_archived_never_matches() {
        let mut archived = item();
        archived.archive(crate::memory::types::ArchiveReason::Stale, Utc::now());
        assert!(!MemoryFilter::new().matches(&archived));
    }

    #[test]
    fn test_tags_require_all() {
        assert!(MemoryFilter::new().with_tags(["postgres"]).matches(&item()));
        assert!(MemoryFilter::new().with_tags(["postgres", "ops"]).matches(&item()));
        assert!(!MemoryFilter::new().with_tags(["postgres", "mysql"]).matches(&item()));
    }

    #[test]
    fn test_category_and_dates() {
        let now = Utc::now();
        assert!(MemoryFilter::new().with_category("Runbook").matches(&item()));
        assert!(!MemoryFilter::new().with_category("notes").matches(&item()));
        assert!(MemoryFilter::new().since(now - Duration::days(3)).matches(&item()));
        assert!(!MemoryFilter::new().since(now - Duration::days(1)).matches(&item()));
        assert!(!MemoryFilter::new().until(now - Duration::days(3)).matches(&item()));
    }

    #[test]
    fn test_tier_filter() {
        assert!(MemoryFilter::new().with_tiers(vec![Tier::Working]).matches(&item()));
        assert!(!MemoryFilter::new().with_tiers(vec![Tier::LongTerm]).matches(&item()));
    }
}
