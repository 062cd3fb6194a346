use crate::ledger::BlockRef;
use crate::registry::TemporalUnit;
use alloy::primitives::U256;

/// Partition width of the registry's block-count index.
pub const BLOCK_BUCKET_SIZE: u64 = 240;
/// Partition width of the registry's timestamp index.
pub const TIMESTAMP_BUCKET_SIZE: u64 = 3_600;

/// A coarse partition of the scheduling registry's index on one temporal axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bucket {
    pub unit: TemporalUnit,
    pub base: u64,
}

impl Bucket {
    pub fn width(unit: TemporalUnit) -> u64 {
        match unit {
            TemporalUnit::Blocks => BLOCK_BUCKET_SIZE,
            TemporalUnit::Timestamp => TIMESTAMP_BUCKET_SIZE,
        }
    }

    /// The registry keys block buckets as positive int256 values and
    /// timestamp buckets as negative ones; this mirrors that encoding.
    pub fn encoded(&self) -> U256 {
        let base = U256::from(self.base);
        match self.unit {
            TemporalUnit::Blocks => base,
            TemporalUnit::Timestamp => U256::ZERO.wrapping_sub(base),
        }
    }
}

pub fn calc_bucket(value: u64, unit: TemporalUnit) -> Bucket {
    let width = Bucket::width(unit);
    Bucket {
        unit,
        base: value - value % width,
    }
}

/// The six partitions tracked at any time: current, next and after-next on
/// both temporal axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSet {
    pub current_block: Bucket,
    pub current_timestamp: Bucket,
    pub next_block: Bucket,
    pub next_timestamp: Bucket,
    pub after_next_block: Bucket,
    pub after_next_timestamp: Bucket,
}

impl BucketSet {
    pub fn all(&self) -> [Bucket; 6] {
        [
            self.current_block,
            self.current_timestamp,
            self.next_block,
            self.next_timestamp,
            self.after_next_block,
            self.after_next_timestamp,
        ]
    }

    pub fn contains(&self, bucket: Bucket) -> bool {
        self.all().contains(&bucket)
    }
}

/// Pure function of the latest observed block header. Recomputed whenever the
/// chain head is refreshed on the low-frequency chain timer.
pub fn buckets_for(latest: &BlockRef) -> BucketSet {
    BucketSet {
        current_block: calc_bucket(latest.number, TemporalUnit::Blocks),
        current_timestamp: calc_bucket(latest.timestamp, TemporalUnit::Timestamp),
        next_block: calc_bucket(latest.number + BLOCK_BUCKET_SIZE, TemporalUnit::Blocks),
        next_timestamp: calc_bucket(
            latest.timestamp + TIMESTAMP_BUCKET_SIZE,
            TemporalUnit::Timestamp,
        ),
        after_next_block: calc_bucket(
            latest.number + 2 * BLOCK_BUCKET_SIZE,
            TemporalUnit::Blocks,
        ),
        after_next_timestamp: calc_bucket(
            latest.timestamp + 2 * TIMESTAMP_BUCKET_SIZE,
            TemporalUnit::Timestamp,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_bucket_floors_to_partition_base() {
        assert_eq!(
            calc_bucket(1000, TemporalUnit::Blocks),
            Bucket {
                unit: TemporalUnit::Blocks,
                base: 960
            }
        );
        assert_eq!(calc_bucket(960, TemporalUnit::Blocks).base, 960);
        assert_eq!(calc_bucket(0, TemporalUnit::Timestamp).base, 0);
        assert_eq!(calc_bucket(3_601, TemporalUnit::Timestamp).base, 3_600);
    }

    #[test]
    fn test_block_axis_coverage_has_no_gaps() {
        // For any head B the three block buckets must cover [B, B + 2*width].
        for head in [0u64, 1, 239, 240, 777, 100_000] {
            let set = buckets_for(&BlockRef {
                number: head,
                timestamp: 0,
            });
            for value in (head..=head + 2 * BLOCK_BUCKET_SIZE).step_by(7) {
                let bucket = calc_bucket(value, TemporalUnit::Blocks);
                assert!(
                    set.contains(bucket),
                    "value {value} not covered for head {head}"
                );
            }
        }
    }

    #[test]
    fn test_encoded_distinguishes_axes() {
        let block = calc_bucket(480, TemporalUnit::Blocks);
        let ts = calc_bucket(7_200, TemporalUnit::Timestamp);
        assert_eq!(block.encoded(), U256::from(480));
        // Timestamp buckets are the two's-complement negation.
        assert_eq!(
            ts.encoded(),
            U256::ZERO.wrapping_sub(U256::from(7_200))
        );
    }

    #[test]
    fn test_bucket_set_lists_six_partitions() {
        let set = buckets_for(&BlockRef {
            number: 1_000,
            timestamp: 1_600_000_000,
        });
        assert_eq!(set.all().len(), 6);
        assert_eq!(set.current_block.base, 960);
        assert_eq!(set.next_block.base, 1_200);
        assert_eq!(set.after_next_block.base, 1_440);
    }
}
