//! Deterministic partitioning of the item space
//!
//! Items are assigned to partitions by id hash, so independent workers can each own a partition
//! without coordination. Partition results combine by summing their reports.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::job::JobReport;

/// One slice of the item space: ids whose value modulo `count` equals `index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub index: u32,
    pub count: u32,
}

impl Partition {
    /// The single partition covering every id
    pub const WHOLE: Partition = Partition { index: 0, count: 1 };

    pub fn contains(&self, id: &Uuid) -> bool {
        let count = self.count.max(1) as u128;
        id.as_u128() % count == self.index as u128
    }

    /// All `count` partitions, in index order
    pub fn split(count: u32) -> Vec<Partition> {
        let count = count.max(1);
        (0..count).map(|index| Partition { index, count }).collect()
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::WHOLE
    }
}

/// Combine per-partition reports
pub fn aggregate<'a>(reports: impl IntoIterator<Item = &'a JobReport>) -> JobReport {
    reports
        .into_iter()
        .fold(JobReport::default(), |mut total, report| {
            total.absorb(report);
            total
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_id_lands_in_exactly_one_partition() {
        let partitions = Partition::split(4);
        for _ in 0..200 {
            let id = Uuid::new_v4();
            let owners = partitions.iter().filter(|p| p.contains(&id)).count();
            assert_eq!(owners, 1);
        }
    }

    #[test]
    fn test_zero_count_is_whole() {
        let parts = Partition::split(0);
        assert_eq!(parts, vec![Partition::WHOLE]);
        assert!(Partition::WHOLE.contains(&Uuid::new_v4()));
    }

    #[test]
    fn test_aggregate_sums() {
        let a = JobReport {
            processed: 3,
            merged: 1,
            ..Default::default()
        };
        let b = JobReport {
            processed: 4,
            archived: 2,
            ..Default::default()
        };
        let total = aggregate([&a, &b]);
        assert_eq!(total.processed, 7);
        assert_eq!(total.merged, 1);
        assert_eq!(total.archived, 2);
    }
}
