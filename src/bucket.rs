//! Bucket location table.

use std::sync::Arc;

use crate::alloc::AllocStrategy;
use crate::block::BlockId;
use crate::io::BlockManager;

/// Maps every bucket to the ordered sequence of blocks holding its records.
///
/// Sequences grow on demand, growth never moves blocks that are already assigned. The table owns
/// all its blocks and returns them to the block manager when dropped.
pub struct BucketLocationTable<'c> {
    manager: &'c BlockManager,
    strategy: Arc<dyn AllocStrategy>,
    buckets: Vec<Vec<BlockId>>,
}

impl<'c> BucketLocationTable<'c> {
    /// Creates a table of `nbuckets` buckets with `blocks_per_bucket` blocks allocated for each.
    pub fn new(
        manager: &'c BlockManager,
        strategy: Arc<dyn AllocStrategy>,
        nbuckets: usize,
        blocks_per_bucket: usize,
    ) -> Self {
        let buckets = (0..nbuckets)
            .map(|_| manager.new_blocks(strategy.as_ref(), 0, blocks_per_bucket))
            .collect();

        BucketLocationTable {
            manager,
            strategy,
            buckets,
        }
    }

    /// Returns the location of block `i` of `bucket`.
    /// A sequence too short for `i` grows to `(i + 1) * 2` blocks.
    pub fn bid(&mut self, bucket: usize, i: usize) -> BlockId {
        let bids = &mut self.buckets[bucket];
        if i >= bids.len() {
            let size = bids.len();
            let new_size = (i + 1) * 2;
            log::trace!("growing bucket {} from {} to {} blocks", bucket, size, new_size);
            bids.extend(self.manager.new_blocks(self.strategy.as_ref(), size as u64, new_size - size));
        }
        bids[i]
    }

    /// Returns the blocks of `bucket`.
    pub fn bids(&self, bucket: usize) -> &[BlockId] {
        &self.buckets[bucket]
    }
}

impl<'c> Drop for BucketLocationTable<'c> {
    fn drop(&mut self) {
        for bids in self.buckets.iter() {
            self.manager.delete_blocks(bids);
        }
    }
}
