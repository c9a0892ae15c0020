use std::ops::Range;

use crate::{Result, TrainErr};

/// Splits `total` samples among `world_size` ranks and returns the shard for `rank`.
///
/// Properties:
/// - Ranges are contiguous, disjoint and cover `[0..total)`.
/// - Sizes differ by at most 1.
pub fn shard_range(total: usize, rank: usize, world_size: usize) -> Range<usize> {
    let base = total / world_size;
    let rem = total % world_size;

    let start = rank * base + rank.min(rem);
    let end = start + base + usize::from(rank < rem);

    start..end
}

/// The slice of the dataset a rank trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    rank: usize,
    world_size: usize,
}

impl ShardSpec {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(TrainErr::InvalidConfig(format!(
                "shard {rank} out of range for {world_size} ranks"
            )));
        }

        Ok(Self { rank, world_size })
    }

    /// The whole dataset, for single worker runs.
    pub fn full() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    #[inline]
    pub fn range(self, total: usize) -> Range<usize> {
        shard_range(total, self.rank, self.world_size)
    }

    /// The samples this rank trains on per pass: its range, padded by wrapping
    /// around the dataset up to `ceil(total / world_size)` samples so every rank
    /// runs the same amount of batches.
    pub fn indices(self, total: usize) -> Vec<usize> {
        if total == 0 {
            return Vec::new();
        }

        let range = self.range(total);
        let padding = total.div_ceil(self.world_size) - range.len();
        range.chain((0..padding).map(|i| i % total)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_range_balanced() {
        // total 10, ranks 3 => sizes 4,3,3
        assert_eq!(shard_range(10, 0, 3), 0..4);
        assert_eq!(shard_range(10, 1, 3), 4..7);
        assert_eq!(shard_range(10, 2, 3), 7..10);
    }

    #[test]
    fn more_ranks_than_samples_leaves_empty_shards() {
        assert_eq!(shard_range(1, 0, 2), 0..1);
        assert_eq!(shard_range(1, 1, 2), 1..1);
    }

    #[test]
    fn short_shards_are_padded_to_the_longest() {
        let lens: Vec<_> = (0..3)
            .map(|rank| ShardSpec::new(rank, 3).unwrap().indices(10).len())
            .collect();
        assert_eq!(lens, [4, 4, 4]);

        assert_eq!(ShardSpec::new(2, 3).unwrap().indices(10), [7, 8, 9, 0]);
        assert_eq!(ShardSpec::new(1, 2).unwrap().indices(1), [0]);
        assert!(ShardSpec::new(0, 2).unwrap().indices(0).is_empty());
        assert_eq!(ShardSpec::full().indices(3), [0, 1, 2]);
    }

    #[test]
    fn shard_spec_rejects_ranks_outside_the_world() {
        assert!(ShardSpec::new(2, 2).is_err());
        assert_eq!(ShardSpec::new(1, 3).unwrap().range(10), 4..7);
    }
}
