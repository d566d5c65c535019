//! Ordered partition sets used by the init protocol and query estimates.

use crate::ids::PartitionId;

/// Deduplicated, ascending-ordered set of partition ids.
///
/// Most sets in the init path hold a handful of entries, so the backing
/// store is a sorted `Vec` rather than a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSet {
    partitions: Vec<PartitionId>,
}

impl PartitionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a single-partition set.
    #[must_use]
    pub fn single(partition: PartitionId) -> Self {
        Self {
            partitions: vec![partition],
        }
    }

    /// Inserts a partition, keeping the backing store sorted.
    ///
    /// Returns `false` when the partition was already present.
    pub fn insert(&mut self, partition: PartitionId) -> bool {
        match self.partitions.binary_search(&partition) {
            Ok(_) => false,
            Err(position) => {
                self.partitions.insert(position, partition);
                true
            }
        }
    }

    /// Returns whether the set contains the partition.
    #[must_use]
    pub fn contains(&self, partition: PartitionId) -> bool {
        self.partitions.binary_search(&partition).is_ok()
    }

    /// Number of partitions in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Returns whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Iterates partitions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.partitions.iter().copied()
    }

    /// Counts how many of the given partitions are members of this set.
    #[must_use]
    pub fn intersect_count(&self, candidates: &[PartitionId]) -> usize {
        candidates
            .iter()
            .filter(|partition| self.contains(**partition))
            .count()
    }

    /// Borrows the sorted backing slice.
    #[must_use]
    pub fn as_slice(&self) -> &[PartitionId] {
        &self.partitions
    }
}

impl FromIterator<PartitionId> for PartitionSet {
    fn from_iter<I: IntoIterator<Item = PartitionId>>(iter: I) -> Self {
        let mut partitions = iter.into_iter().collect::<Vec<_>>();
        partitions.sort_unstable();
        partitions.dedup();
        Self { partitions }
    }
}

impl From<&[PartitionId]> for PartitionSet {
    fn from(slice: &[PartitionId]) -> Self {
        slice.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::PartitionSet;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn insert_keeps_ascending_order_and_dedups() {
        let mut set = PartitionSet::new();
        assert_that!(set.insert(3), eq(true));
        assert_that!(set.insert(1), eq(true));
        assert_that!(set.insert(3), eq(false));
        assert_that!(set.as_slice(), eq(&[1, 3][..]));
    }

    #[rstest]
    fn from_iterator_sorts_and_dedups() {
        let set: PartitionSet = [4, 0, 4, 2].into_iter().collect();
        assert_that!(set.as_slice(), eq(&[0, 2, 4][..]));
        assert_that!(set.len(), eq(3_usize));
    }

    #[rstest]
    fn intersect_count_only_counts_members() {
        let set: PartitionSet = [0, 2, 5].into_iter().collect();
        assert_that!(set.intersect_count(&[0, 1, 2, 3]), eq(2_usize));
        assert_that!(set.intersect_count(&[]), eq(0_usize));
    }
}
