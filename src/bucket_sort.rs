//! Sort pass: loads every bucket into memory, sorts it with two radix levels and streams it out.

use std::mem;

use rayon::prelude::*;

use crate::block::{Block, BlockId};
use crate::bucket::BucketLocationTable;
use crate::classify::{
    classify, classify_block, exclusive_prefix_sum, first_level_log_fan_out, local_sort, second_level_log_fan_out,
};
use crate::io::{BlockManager, Request};
use crate::key::{Key, KeyRef, Record};
use crate::sort::SortError;
use crate::stream::BufOStream;

/// Blocks of one bucket: idle buffers and the reads filling the others.
struct StagingArea<T: Record> {
    block_size: usize,
    idle: Vec<Block<T>>,
    inflight: Vec<Request<Block<T>>>,
}

impl<T: Record> StagingArea<T> {
    fn new(capacity: usize, block_size: usize) -> Self {
        StagingArea {
            block_size,
            idle: (0..capacity).map(|_| Block::new(block_size)).collect(),
            inflight: Vec::with_capacity(capacity),
        }
    }

    /// Issues a read for every block of `bids`.
    fn prefetch(&mut self, manager: &BlockManager, bids: &[BlockId]) {
        debug_assert!(self.inflight.is_empty());
        debug_assert!(bids.len() <= self.idle.len());

        for bid in bids {
            let block = self.idle.pop().unwrap_or_else(|| Block::new(self.block_size));
            self.inflight.push(manager.read(*bid, block));
        }
    }

    /// Waits for all issued reads and returns the blocks in bucket order.
    fn wait(&mut self) -> Result<Vec<Block<T>>, SortError> {
        self.inflight.drain(..).map(Request::wait).collect()
    }

    fn recycle(&mut self, blocks: Vec<Block<T>>) {
        for mut block in blocks {
            block.clear();
            self.idle.push(block);
        }
    }
}

/// Sorts the buckets of `table` in key order and pushes their records to `out`.
///
/// Two staging areas of `max_bucket_blocks` blocks are used: while bucket `k` is sorted the reads
/// of bucket `k + 1` are in flight. No bucket may hold more than `max_bucket_blocks` blocks.
///
/// # Arguments
/// * `manager` - Block manager holding the buckets
/// * `pool` - Thread pool running the second-level sorts
/// * `table` - Bucket block locations
/// * `bucket_sizes` - Exact record count of every bucket
/// * `lognbuckets` - Logarithm of the number of buckets
/// * `max_bucket_blocks` - Size of a staging area in blocks
/// * `block_size` - Block size in records
/// * `cache_size` - Cache size in bytes the first-level fan-out is tuned for
/// * `out` - Output cursor
#[allow(clippy::too_many_arguments)]
pub fn sort_buckets<T: Record>(
    manager: &BlockManager,
    pool: &rayon::ThreadPool,
    table: &BucketLocationTable<'_>,
    bucket_sizes: &[u64],
    lognbuckets: u32,
    max_bucket_blocks: usize,
    block_size: usize,
    cache_size: usize,
    out: &mut BufOStream<'_, T>,
) -> Result<(), SortError> {
    let nbuckets = bucket_sizes.len();
    let shift = T::Key::BITS - lognbuckets;

    let mut active = StagingArea::new(max_bucket_blocks, block_size);
    let mut prefetch = StagingArea::new(max_bucket_blocks, block_size);

    if nbuckets > 0 {
        active.prefetch(manager, bucket_bids(table, bucket_sizes, block_size, 0));
    }
    if nbuckets > 1 {
        prefetch.prefetch(manager, bucket_bids(table, bucket_sizes, block_size, 1));
    }

    for k in 0..nbuckets {
        let blocks = active.wait()?;
        let offset = T::Key::ZERO.bucket_base(shift, k);
        sort_bucket(pool, &blocks, bucket_sizes[k] as usize, offset, shift, cache_size, out)?;

        active.recycle(blocks);
        if k + 2 < nbuckets {
            active.prefetch(manager, bucket_bids(table, bucket_sizes, block_size, k + 2));
        }
        mem::swap(&mut active, &mut prefetch);
    }

    return Ok(());
}

/// Returns the blocks holding the records of bucket `k`.
fn bucket_bids<'t>(table: &'t BucketLocationTable<'_>, bucket_sizes: &[u64], block_size: usize, k: usize) -> &'t [BlockId] {
    let nblocks = ((bucket_sizes[k] + block_size as u64 - 1) / block_size as u64) as usize;
    &table.bids(k)[..nblocks]
}

/// Sorts the `size` records held by `blocks`, all of them sharing the key bits above `shift`.
fn sort_bucket<T: Record>(
    pool: &rayon::ThreadPool,
    blocks: &[Block<T>],
    size: usize,
    offset: T::Key,
    shift: u32,
    cache_size: usize,
    out: &mut BufOStream<'_, T>,
) -> Result<(), SortError> {
    if size == 0 {
        return Ok(());
    }

    let log_k1 = first_level_log_fan_out(size, mem::size_of::<KeyRef<T>>(), cache_size, shift);
    let shift1 = shift - log_k1;
    log::debug!(
        "sorting bucket at {:?}: {} records, first level fan-out {}",
        offset,
        size,
        1usize << log_k1
    );

    let mut counts = vec![0usize; 1 << log_k1];
    let mut refs1 = Vec::with_capacity(size);
    let mut remaining = size;
    for block in blocks {
        let n = block.len().min(remaining);
        classify_block(&block.as_slice()[..n], &mut refs1, &mut counts, offset, shift1);
        remaining -= n;
    }
    debug_assert_eq!(refs1.len(), size);

    exclusive_prefix_sum(&mut counts);
    let mut refs2 = refs1.clone();
    classify(&refs1, &mut refs2, &mut counts, offset, shift1);

    // sub-bucket i is refs2[counts[i - 1]..counts[i]], sorted into the same range of refs1
    let mut jobs = Vec::with_capacity(counts.len());
    let mut src_rest = refs2.as_slice();
    let mut dst_rest = refs1.as_mut_slice();
    let mut start = 0;
    for (i, &end) in counts.iter().enumerate() {
        let (src, src_tail) = src_rest.split_at(end - start);
        let (dst, dst_tail) = mem::take(&mut dst_rest).split_at_mut(end - start);
        src_rest = src_tail;
        dst_rest = dst_tail;
        start = end;

        if !src.is_empty() {
            jobs.push((i, src, dst));
        }
    }

    pool.install(|| {
        jobs.into_par_iter().for_each(|(i, src, dst)| {
            let log_k2 = second_level_log_fan_out(src.len(), shift1);
            local_sort(src, dst, log_k2, offset.bucket_base(shift1, i), shift1 - log_k2);
        })
    });

    for key_ref in refs1.iter() {
        out.push(key_ref.record.clone())?;
    }

    return Ok(());
}
