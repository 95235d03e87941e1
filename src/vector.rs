//! Disk-resident record vector.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use crate::alloc::AllocStrategy;
use crate::block::{Block, BlockId};
use crate::io::{BlockManager, Request};
use crate::key::Record;
use crate::sort::{KSorter, SortError};
use crate::stream::BufIStream;

/// Blocks written behind per disk while pushing.
const WRITE_BEHIND_PER_DISK: usize = 2;

/// Vector of records stored in blocks on the disks of a [`KSorter`].
///
/// Records are appended to an in-memory tail block which is written out once full. Call
/// [`ExtVector::flush`] to write a partially filled tail block as well.
pub struct ExtVector<'c, T: Record> {
    manager: &'c BlockManager,
    strategy: Arc<dyn AllocStrategy>,
    block_size: usize,
    bids: Vec<BlockId>,
    len: u64,
    tail: Block<T>,
    pending: VecDeque<Request<Block<T>>>,
    write_behind: usize,
}

impl<'c, T: Record> ExtVector<'c, T> {
    /// Creates an empty vector using the sorter's allocation policy.
    pub fn new(sorter: &'c KSorter) -> Self {
        let strategy = sorter.config().alloc_policy.build(sorter.manager().ndisks());
        Self::with_strategy(sorter, Arc::from(strategy))
    }

    /// Creates an empty vector placing its blocks with `strategy`.
    pub fn with_strategy(sorter: &'c KSorter, strategy: Arc<dyn AllocStrategy>) -> Self {
        let manager = sorter.manager();
        let block_size = sorter.config().block_size;

        ExtVector {
            manager,
            strategy,
            block_size,
            bids: Vec::new(),
            len: 0,
            tail: Block::new(block_size),
            pending: VecDeque::new(),
            write_behind: WRITE_BEHIND_PER_DISK * manager.ndisks(),
        }
    }

    /// Creates a vector from the items of an iterator and flushes it.
    pub fn from_iter<I>(sorter: &'c KSorter, items: I) -> Result<Self, SortError>
    where
        I: IntoIterator<Item = T>,
    {
        let mut vector = Self::new(sorter);
        for item in items {
            vector.push(item)?;
        }
        vector.flush()?;

        return Ok(vector);
    }

    /// Appends a record.
    pub fn push(&mut self, item: T) -> Result<(), SortError> {
        self.tail.push(item);
        self.len += 1;

        if self.tail.is_full() {
            let bid = self.tail_bid();
            let fresh = self.free_block()?;
            let block = mem::replace(&mut self.tail, fresh);
            self.pending.push_back(self.manager.write(bid, block));
        }

        return Ok(());
    }

    /// Writes the tail block and waits for all pending writes.
    pub fn flush(&mut self) -> Result<(), SortError> {
        if !self.tail.is_empty() {
            let bid = self.tail_bid();
            let tail = mem::replace(&mut self.tail, Block::new(self.block_size));
            self.tail = self.manager.write(bid, tail).wait()?;
        }
        for request in self.pending.drain(..) {
            request.wait()?;
        }

        return Ok(());
    }

    /// Returns the location of the last record's block, allocating it if needed.
    fn tail_bid(&mut self) -> BlockId {
        let index = ((self.len - 1) / self.block_size as u64) as usize;
        if index == self.bids.len() {
            let bids = self.manager.new_blocks(self.strategy.as_ref(), index as u64, 1);
            self.bids.extend(bids);
        }
        self.bids[index]
    }

    fn free_block(&mut self) -> Result<Block<T>, SortError> {
        if self.pending.len() >= self.write_behind {
            if let Some(request) = self.pending.pop_front() {
                let mut block = request.wait()?;
                block.clear();
                return Ok(block);
            }
        }
        return Ok(Block::new(self.block_size));
    }

    /// Re-reads the tail block after the blocks were rewritten in place.
    pub(crate) fn reload_tail(&mut self) -> Result<(), SortError> {
        let in_tail = (self.len % self.block_size as u64) as usize;
        self.tail = match self.bids.last() {
            Some(bid) if in_tail > 0 => self.manager.read(*bid, Block::new(self.block_size)).wait()?,
            _ => Block::new(self.block_size),
        };
        debug_assert_eq!(self.tail.len(), in_tail);

        return Ok(());
    }

    /// Returns the number of records.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the block size in records.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the block locations in vector order.
    pub fn blocks(&self) -> &[BlockId] {
        &self.bids
    }

    pub fn strategy(&self) -> &Arc<dyn AllocStrategy> {
        &self.strategy
    }

    pub(crate) fn manager(&self) -> &'c BlockManager {
        self.manager
    }

    /// Returns the location of the block holding position `pos`.
    pub fn block_id(&self, pos: u64) -> Option<BlockId> {
        self.bids.get((pos / self.block_size as u64) as usize).copied()
    }

    /// Returns the offset of position `pos` within its block.
    pub fn block_offset(&self, pos: u64) -> usize {
        (pos % self.block_size as u64) as usize
    }

    /// Flushes the vector and returns a read-ahead stream over its records.
    pub fn iter(&mut self) -> Result<BufIStream<'c, T>, SortError> {
        self.flush()?;
        let nbuffers = WRITE_BEHIND_PER_DISK * self.manager.ndisks();

        return Ok(BufIStream::new(self.manager, self.bids.clone(), self.block_size, nbuffers));
    }

    /// Reads all records into memory.
    pub fn to_vec(&mut self) -> Result<Vec<T>, SortError> {
        self.iter()?.collect()
    }
}

impl<'c, T: Record> Drop for ExtVector<'c, T> {
    fn drop(&mut self) {
        for request in self.pending.drain(..) {
            if let Err(err) = request.wait() {
                log::error!("vector block write failed: {}", err);
            }
        }
        self.manager.delete_blocks(&self.bids);
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::ExtVector;
    use crate::block::BlockId;
    use crate::sort::{KSorter, KSorterBuilder};

    #[fixture]
    fn sorter() -> KSorter {
        KSorterBuilder::new()
            .with_block_size(4)
            .with_block_raw_size(128)
            .with_disks_number(2)
            .build()
            .unwrap()
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(4)]
    #[case(37)]
    fn test_vector_from_iter(sorter: KSorter, #[case] len: u32) {
        let items = Vec::from_iter(0..len);
        let mut vector = ExtVector::from_iter(&sorter, items.clone()).unwrap();

        assert_eq!(vector.len(), len as u64);
        assert_eq!(vector.blocks().len(), (len as usize + 3) / 4);
        assert_eq!(vector.to_vec().unwrap(), items);
    }

    #[rstest]
    fn test_vector_push_after_flush(sorter: KSorter) {
        let mut vector = ExtVector::new(&sorter);
        for i in 0..6u64 {
            vector.push(i).unwrap();
        }
        vector.flush().unwrap();
        let blocks = vector.blocks().to_vec();

        for i in 6..9u64 {
            vector.push(i).unwrap();
        }

        assert_eq!(&vector.blocks()[..2], blocks.as_slice());
        assert_eq!(vector.to_vec().unwrap(), Vec::from_iter(0..9u64));
    }

    #[rstest]
    fn test_vector_positions(sorter: KSorter) {
        let vector = ExtVector::from_iter(&sorter, 0..10u16).unwrap();

        assert_eq!(vector.block_id(0), Some(vector.blocks()[0]));
        assert_eq!(vector.block_id(7), Some(vector.blocks()[1]));
        assert_eq!(vector.block_id(9), Some(vector.blocks()[2]));
        assert_eq!(vector.block_id(12), None);
        assert_eq!(vector.block_offset(7), 3);
        assert_eq!(vector.block_offset(8), 0);
    }

    #[rstest]
    fn test_vector_releases_blocks(sorter: KSorter) {
        {
            let vector = ExtVector::from_iter(&sorter, 0..10u16).unwrap();
            let distinct: std::collections::HashSet<BlockId> = vector.blocks().iter().copied().collect();
            assert_eq!(distinct.len(), 3);
            assert_eq!(sorter.manager().allocated_blocks(), 3);
        }
        assert_eq!(sorter.manager().allocated_blocks(), 0);
    }
}
