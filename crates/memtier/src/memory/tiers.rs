//! Tier lifecycle policy
//!
//! Decides initial tier placement, promotion between tiers (Working → ShortTerm → LongTerm),
//! TTL enforcement and archival. Every decision is a pure function of the item and `now`;
//! the consolidation handlers apply the decisions under the item lock.

use chrono::{DateTime, Utc};

use crate::config::TierConfig;
use crate::memory::types::{ArchiveReason, ItemKind, MemoryItem, Tier};

/// Result of checking an item against its tier TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlOutcome {
    /// The item belongs in this tier (possibly the next one up, if the TTL lapsed and it qualifies)
    Retain(Tier),
    /// The TTL lapsed and the item did not qualify for promotion
    Expired,
}

/// What a tier pass should do with an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierDecision {
    Stay,
    Promote(Tier),
    Archive(ArchiveReason),
}

/// Applies tier rules to memory items
#[derive(Debug, Clone)]
pub struct TierManager {
    config: TierConfig,
}

impl Default for TierManager {
    fn default() -> Self {
        Self::new(TierConfig::default())
    }
}

impl TierManager {
    pub fn new(config: TierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// Every ingested item starts in working memory
    pub fn assign_initial_tier(&self, _item: &MemoryItem) -> Tier {
        Tier::Working
    }

    /// TTL of `tier` in seconds, `None` when unbounded
    pub fn ttl_secs(&self, tier: Tier) -> Option<i64> {
        match tier {
            Tier::Working => Some(self.config.working_ttl_secs),
            Tier::ShortTerm => Some(self.config.short_term_ttl_secs),
            Tier::LongTerm => None,
        }
    }

    /// TTL that applies to this particular item in its current tier
    fn item_ttl_secs(&self, item: &MemoryItem) -> Option<i64> {
        match (&item.kind, item.tier) {
            // learned procedures are kept once they leave working memory
            (ItemKind::Skill { .. }, Tier::ShortTerm) => None,
            (ItemKind::Memory, tier)
            | (ItemKind::Skill { .. }, tier)
            | (ItemKind::Consensus { .. }, tier) => self.ttl_secs(tier),
        }
    }

    /// Whether the item has earned a move to the next tier.
    ///
    /// Normal rule: time in tier > `promotion_age_fraction` × TTL, and
    /// (access_count > `promote_access_count` or importance > `promote_importance`).
    /// Importance above `bypass_importance` promotes unconditionally.
    pub fn should_promote(&self, item: &MemoryItem, now: DateTime<Utc>) -> bool {
        if item.is_archived || item.tier.next().is_none() {
            return false;
        }

        if item.importance > self.config.bypass_importance {
            return true;
        }

        let Some(ttl) = self.ttl_secs(item.tier) else {
            return false;
        };
        let age_gate = (ttl as f64 * self.config.promotion_age_fraction) as i64;

        item.secs_in_tier(now) > age_gate
            && (item.access_count > self.config.promote_access_count
                || item.importance > self.config.promote_importance)
    }

    /// Old, never accessed and unimportant items are archived
    pub fn should_archive(&self, item: &MemoryItem, now: DateTime<Utc>) -> bool {
        if item.is_archived {
            return false;
        }

        item.age_days(now) > self.config.archive_min_age_days as f64
            && item.access_count == 0
            && item.importance < self.config.archive_max_importance
    }

    /// Check the item against its tier TTL
    pub fn enforce_ttl(&self, item: &MemoryItem, now: DateTime<Utc>) -> TtlOutcome {
        let Some(ttl) = self.item_ttl_secs(item) else {
            return TtlOutcome::Retain(item.tier);
        };

        if item.secs_in_tier(now) <= ttl {
            return TtlOutcome::Retain(item.tier);
        }

        match item.tier.next() {
            Some(next) if self.should_promote(item, now) => TtlOutcome::Retain(next),
            _ => TtlOutcome::Expired,
        }
    }

    /// Combine the rules into one decision.
    ///
    /// Promotion wins over archival, and decay never demotes: the only way down is archival.
    pub fn evaluate(&self, item: &MemoryItem, now: DateTime<Utc>) -> TierDecision {
        if item.is_archived {
            return TierDecision::Stay;
        }

        if self.should_promote(item, now) {
            if let Some(next) = item.tier.next() {
                return TierDecision::Promote(next);
            }
        }

        if self.should_archive(item, now) {
            return TierDecision::Archive(ArchiveReason::Stale);
        }

        match self.enforce_ttl(item, now) {
            TtlOutcome::Expired if self.config.archive_on_expiry => {
                TierDecision::Archive(ArchiveReason::TtlExpired)
            }
            TtlOutcome::Retain(tier) if tier > item.tier => TierDecision::Promote(tier),
            _ => TierDecision::Stay,
        }
    }

    /// Apply a decision to the item. Returns true when the item changed.
    pub fn apply(&self, item: &mut MemoryItem, decision: TierDecision, now: DateTime<Utc>) -> bool {
        match decision {
            TierDecision::Stay => false,
            TierDecision::Promote(tier) => {
                if tier <= item.tier {
                    return false;
                }
                item.move_to_tier(tier, now);
                true
            }
            TierDecision::Archive(reason) => {
                if item.is_archived {
                    return false;
                }
                item.archive(reason, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item_aged(age: Duration, importance: f32, access_count: u32) -> (MemoryItem, DateTime<Utc>) {
        let now = Utc::now();
        let mut item = MemoryItem::new("Remember to use vector indexing", vec![0.1; 8], now - age);
        item.set_importance(importance);
        item.access_count = access_count;
        (item, now)
    }

    #[test]
    fn test_initial_tier_is_working() {
        let manager = TierManager::default();
        let (item, _) = item_aged(Duration::zero(), 0.9, 0);
        assert_eq!(manager.assign_initial_tier(&item), Tier::Working);
    }

    #[test]
    fn test_promote_after_age_and_access() {
        let manager = TierManager::default();
        let (item, now) = item_aged(Duration::hours(1), 0.9, 6);
        assert!(manager.should_promote(&item, now));
        assert_eq!(manager.evaluate(&item, now), TierDecision::Promote(Tier::ShortTerm));
    }

    #[test]
    fn test_no_promotion_before_age_gate() {
        let manager = TierManager::default();
        let (item, now) = item_aged(Duration::minutes(20), 0.5, 10);
        assert!(!manager.should_promote(&item, now));
    }

    #[test]
    fn test_no_promotion_without_access_or_importance() {
        let manager = TierManager::default();
        let (item, now) = item_aged(Duration::minutes(45), 0.5, 5);
        assert!(!manager.should_promote(&item, now));
    }

    #[test]
    fn test_high_importance_bypasses_gate() {
        let manager = TierManager::default();
        let (item, now) = item_aged(Duration::zero(), 0.95, 0);
        assert!(manager.should_promote(&item, now));
    }

    #[test]
    fn test_short_term_promotion_uses_same_shape() {
        let manager = TierManager::default();
        let (mut item, now) = item_aged(Duration::days(10), 0.85, 0);
        item.move_to_tier(Tier::ShortTerm, now - Duration::days(8));
        assert!(manager.should_promote(&item, now));

        item.tier_entered_at = now - Duration::days(3);
        assert!(!manager.should_promote(&item, now));
    }

    #[test]
    fn test_long_term_never_promotes() {
        let manager = TierManager::default();
        let (mut item, now) = item_aged(Duration::days(1), 1.0, 100);
        item.tier = Tier::LongTerm;
        assert!(!manager.should_promote(&item, now));
    }

    #[test]
    fn test_archive_rule() {
        let manager = TierManager::default();
        let (mut item, now) = item_aged(Duration::days(91), 0.2, 0);
        item.tier = Tier::LongTerm;
        assert!(manager.should_archive(&item, now));

        item.access_count = 1;
        assert!(!manager.should_archive(&item, now));

        item.access_count = 0;
        item.set_importance(0.3);
        assert!(!manager.should_archive(&item, now));
    }

    #[test]
    fn test_ttl_expiry_without_promotion() {
        let manager = TierManager::default();
        let (item, now) = item_aged(Duration::hours(2), 0.4, 0);
        assert_eq!(manager.enforce_ttl(&item, now), TtlOutcome::Expired);
        assert_eq!(
            manager.evaluate(&item, now),
            TierDecision::Archive(ArchiveReason::TtlExpired)
        );
    }

    #[test]
    fn test_ttl_expiry_with_promotion() {
        let manager = TierManager::default();
        let (item, now) = item_aged(Duration::hours(2), 0.85, 0);
        assert_eq!(manager.enforce_ttl(&item, now), TtlOutcome::Retain(Tier::ShortTerm));
    }

    #[test]
    fn test_ttl_within_window_retains() {
        let manager = TierManager::default();
        let (item, now) = item_aged(Duration::minutes(10), 0.4, 0);
        assert_eq!(manager.enforce_ttl(&item, now), TtlOutcome::Retain(Tier::Working));
        assert_eq!(manager.evaluate(&item, now), TierDecision::Stay);
    }

    #[test]
    fn test_skill_does_not_expire_from_short_term() {
        let manager = TierManager::default();
        let (mut item, now) = item_aged(Duration::days(40), 0.4, 0);
        item.kind = ItemKind::Skill {
            name: "rollback".to_string(),
        };
        item.move_to_tier(Tier::ShortTerm, now - Duration::days(30));
        assert_eq!(manager.enforce_ttl(&item, now), TtlOutcome::Retain(Tier::ShortTerm));
    }

    #[test]
    fn test_archive_on_expiry_disabled() {
        let config = TierConfig {
            archive_on_expiry: false,
            ..Default::default()
        };
        let manager = TierManager::new(config);
        let (item, now) = item_aged(Duration::hours(2), 0.4, 0);
        assert_eq!(manager.evaluate(&item, now), TierDecision::Stay);
    }

    #[test]
    fn test_apply_never_demotes() {
        let manager = TierManager::default();
        let (mut item, now) = item_aged(Duration::hours(1), 0.5, 0);
        item.tier = Tier::LongTerm;
        assert!(!manager.apply(&mut item, TierDecision::Promote(Tier::ShortTerm), now));
        assert_eq!(item.tier, Tier::LongTerm);
    }
}
