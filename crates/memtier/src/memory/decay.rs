//! Decay scoring for memory importance
//!
//! The decay curve is anchored to `created_at` only:
//!
//! `decay_score = importance * exp(-age_days / half_life_days)`
//!
//! Accesses increment `access_count` (an input to promotion) but do not reset the clock.

use chrono::{DateTime, Utc};

use crate::config::DecayConfig;
use crate::error::Result;
use crate::memory::types::MemoryItem;

/// Computes time-discounted importance
#[derive(Debug, Clone)]
pub struct DecayEngine {
    half_life_days: f64,
}

impl Default for DecayEngine {
    fn default() -> Self {
        Self::new(&DecayConfig::default())
    }
}

impl DecayEngine {
    pub fn new(config: &DecayConfig) -> Self {
        Self {
            half_life_days: config.half_life_days,
        }
    }

    pub fn half_life_days(&self) -> f64 {
        self.half_life_days
    }

    /// Decay score for a given importance and age. `age_days <= 0` returns `importance` exactly.
    pub fn score(&self, importance: f32, age_days: f64) -> f32 {
        if age_days <= 0.0 {
            return importance;
        }
        (importance as f64 * (-age_days / self.half_life_days).exp()) as f32
    }

    /// Decay score of `item` as of `now`.
    ///
    /// Fails with `ConsistencyViolation` if the item's timestamps are impossible;
    /// a fabricated age would corrupt the score.
    pub fn compute(&self, item: &MemoryItem, now: DateTime<Utc>) -> Result<f32> {
        item.validate(now)?;
        Ok(self.score(item.importance, item.age_days(now)))
    }

    /// Recompute and store the decay score. Returns true only if the value changed,
    /// so a pass with no elapsed time performs no writes.
    pub fn refresh(&self, item: &mut MemoryItem, now: DateTime<Utc>) -> Result<bool> {
        let score = self.compute(item, now)?;
        if score == item.decay_score {
            return Ok(false);
        }
        item.decay_score = score;
        Ok(true)
    }
}
