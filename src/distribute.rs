//! Distribution pass: scatters records into bucket blocks on disk.

use std::mem;
use std::ops::Range;

use crate::block::Block;
use crate::bucket::BucketLocationTable;
use crate::io::BlockManager;
use crate::key::{Key, Record};
use crate::sort::SortError;
use crate::stream::{BufIStream, BufferedWriter};
use crate::vector::ExtVector;

/// Distributes the records of `source[range]` into `2^lognbuckets` buckets by their high key bits.
///
/// Every bucket gets one block in memory; filled blocks are written to the bucket's next location
/// in `table` through a write-behind pool of `nbuckets + nwrite_buffers` blocks. On return
/// `bucket_sizes[i]` holds the exact record count of bucket `i`.
///
/// # Arguments
/// * `manager` - Block manager of the source vector
/// * `table` - Bucket block locations, grown as needed
/// * `bucket_sizes` - Per-bucket record counts, its length is the number of buckets
/// * `lognbuckets` - Logarithm of the number of buckets
/// * `source` - Flushed vector to read from
/// * `range` - Positions of the records to distribute
/// * `nread_buffers` - Number of blocks read ahead
/// * `nwrite_buffers` - Maximum number of block writes in flight
#[allow(clippy::too_many_arguments)]
pub fn distribute<T: Record>(
    manager: &BlockManager,
    table: &mut BucketLocationTable<'_>,
    bucket_sizes: &mut [u64],
    lognbuckets: u32,
    source: &ExtVector<'_, T>,
    range: Range<u64>,
    nread_buffers: usize,
    nwrite_buffers: usize,
) -> Result<(), SortError> {
    let nbuckets = bucket_sizes.len();
    let block_size = source.block_size();
    debug_assert_eq!(nbuckets, 1 << lognbuckets);
    debug_assert!(range.end <= source.len());

    let first_block = (range.start / block_size as u64) as usize;
    let last_block = ((range.end + block_size as u64 - 1) / block_size as u64) as usize;
    let bids = source.blocks()[first_block..last_block].to_vec();

    let mut input: BufIStream<T> = BufIStream::new(manager, bids, block_size, nread_buffers);
    let mut out = BufferedWriter::new(manager, block_size, nbuckets + nwrite_buffers, nwrite_buffers);

    let mut blocks = (0..nbuckets)
        .map(|_| out.get_free_block())
        .collect::<Result<Vec<Block<T>>, SortError>>()?;
    let mut written = vec![0usize; nbuckets];

    // records of the first block preceding the range are read and dropped
    for _ in 0..source.block_offset(range.start) {
        input.read_next()?;
    }

    let shift = T::Key::BITS - lognbuckets;
    for _ in range.clone() {
        let record = input.read_next()?;
        let bucket = record.key().bucket_index(T::Key::ZERO, shift);

        blocks[bucket].push(record);
        if blocks[bucket].is_full() {
            let bid = table.bid(bucket, written[bucket]);
            written[bucket] += 1;

            let fresh = out.get_free_block()?;
            let full = mem::replace(&mut blocks[bucket], fresh);
            out.write(full, bid)?;
        }
    }

    let estimated = (range.end - range.start) / nbuckets as u64;
    for (bucket, block) in blocks.into_iter().enumerate() {
        bucket_sizes[bucket] = (written[bucket] * block_size + block.len()) as u64;
        if !block.is_empty() {
            let bid = table.bid(bucket, written[bucket]);
            out.write(block, bid)?;
        }
        log::debug!(
            "bucket {} has size {}, estimated size: {}",
            bucket,
            bucket_sizes[bucket],
            estimated
        );
    }
    out.flush()?;

    return Ok(());
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rand::Rng;
    use rstest::*;

    use super::distribute;
    use crate::alloc::Striping;
    use crate::block::Block;
    use crate::bucket::BucketLocationTable;
    use crate::key::{Key, Keyed};
    use crate::sort::{KSorter, KSorterBuilder};
    use crate::vector::ExtVector;

    #[fixture]
    fn sorter() -> KSorter {
        KSorterBuilder::new()
            .with_block_size(4)
            .with_block_raw_size(128)
            .with_disks_number(2)
            .build()
            .unwrap()
    }

    fn read_bucket(sorter: &KSorter, table: &BucketLocationTable<'_>, bucket: usize, size: u64) -> Vec<(u32, u32)> {
        let nblocks = ((size + 3) / 4) as usize;
        table.bids(bucket)[..nblocks]
            .iter()
            .flat_map(|bid| sorter.manager().read(*bid, Block::new(4)).wait().unwrap())
            .collect()
    }

    #[rstest]
    #[case(0..100, 2, 0)]
    #[case(0..100, 3, 1)]
    #[case(5..98, 3, 1)]
    #[case(7..9, 2, 4)]
    fn test_distribute(
        sorter: KSorter,
        #[case] range: std::ops::Range<u64>,
        #[case] lognbuckets: u32,
        #[case] estimate: usize,
    ) {
        let mut rng = rand::thread_rng();
        let records: Vec<(u32, u32)> = (0..100).map(|i| (rng.gen(), i)).collect();
        let vector = ExtVector::from_iter(&sorter, records.clone()).unwrap();

        let nbuckets = 1usize << lognbuckets;
        let mut table = BucketLocationTable::new(sorter.manager(), Arc::new(Striping::new(2)), nbuckets, estimate);
        let mut sizes = vec![0u64; nbuckets];

        distribute(sorter.manager(), &mut table, &mut sizes, lognbuckets, &vector, range.clone(), 2, 2).unwrap();

        let selected = &records[range.start as usize..range.end as usize];
        assert_eq!(sizes.iter().sum::<u64>(), selected.len() as u64);

        let shift = u32::BITS - lognbuckets;
        for bucket in 0..nbuckets {
            let content = read_bucket(&sorter, &table, bucket, sizes[bucket]);
            assert_eq!(content.len() as u64, sizes[bucket]);
            assert!(content.iter().all(|r| r.key().bucket_index(0, shift) == bucket));

            // distribution keeps input order within a bucket
            let expected: Vec<(u32, u32)> = selected
                .iter()
                .filter(|r| r.key().bucket_index(0, shift) == bucket)
                .copied()
                .collect();
            assert_eq!(content, expected);
        }
    }

    #[rstest]
    fn test_distribute_skewed_input_grows_buckets(sorter: KSorter) {
        let vector = ExtVector::from_iter(&sorter, (0..50u32).map(|i| (0u32, i))).unwrap();
        let mut table = BucketLocationTable::new(sorter.manager(), Arc::new(Striping::new(2)), 4, 1);
        let mut sizes = vec![0u64; 4];

        distribute(sorter.manager(), &mut table, &mut sizes, 2, &vector, 0..50, 2, 2).unwrap();

        assert_eq!(sizes, vec![50, 0, 0, 0]);
        assert!(table.bids(0).len() >= 13);
        assert_eq!(read_bucket(&sorter, &table, 0, 50), Vec::from_iter((0..50u32).map(|i| (0u32, i))));
    }
}
