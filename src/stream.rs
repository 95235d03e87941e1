//! Buffered block streams: read-ahead input, write-behind output and the write-behind block pool
//! used by the distribution pass.

use std::collections::VecDeque;
use std::io;
use std::mem;

use crate::block::{Block, BlockId};
use crate::io::{BlockManager, Request};
use crate::key::Record;
use crate::sort::SortError;

/// Read-ahead input stream over a sequence of blocks.
/// Keeps up to `nbuffers` block reads in flight ahead of the consumer.
pub struct BufIStream<'c, T: Record> {
    manager: &'c BlockManager,
    bids: Vec<BlockId>,
    next_bid: usize,
    block_size: usize,
    inflight: VecDeque<Request<Block<T>>>,
    current: std::vec::IntoIter<T>,
}

impl<'c, T: Record> BufIStream<'c, T> {
    /// Creates a stream and starts prefetching.
    ///
    /// # Arguments
    /// * `manager` - Block manager the blocks belong to
    /// * `bids` - Blocks to be read, in stream order
    /// * `block_size` - Block size in records
    /// * `nbuffers` - Number of blocks read ahead
    pub fn new(manager: &'c BlockManager, bids: Vec<BlockId>, block_size: usize, nbuffers: usize) -> Self {
        let mut stream = BufIStream {
            manager,
            bids,
            next_bid: 0,
            block_size,
            inflight: VecDeque::with_capacity(nbuffers.max(1)),
            current: Vec::new().into_iter(),
        };
        for _ in 0..nbuffers.max(1) {
            stream.prefetch();
        }

        return stream;
    }

    fn prefetch(&mut self) {
        if let Some(bid) = self.bids.get(self.next_bid) {
            self.inflight
                .push_back(self.manager.read(*bid, Block::new(self.block_size)));
            self.next_bid += 1;
        }
    }

    /// Returns the next record, failing if the stream is exhausted.
    pub fn read_next(&mut self) -> Result<T, SortError> {
        match self.next() {
            Some(item) => item,
            None => Err(SortError::IO(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "block stream exhausted",
            ))),
        }
    }
}

impl<'c, T: Record> Iterator for BufIStream<'c, T> {
    type Item = Result<T, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(Ok(item));
            }

            let request = self.inflight.pop_front()?;
            self.prefetch();
            match request.wait() {
                Ok(block) => self.current = block.into_iter(),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Write-behind output stream filling a sequence of blocks in order.
/// Keeps up to `nbuffers` block writes in flight.
pub struct BufOStream<'c, T: Record> {
    manager: &'c BlockManager,
    bids: Vec<BlockId>,
    next_bid: usize,
    block_size: usize,
    nbuffers: usize,
    current: Block<T>,
    inflight: VecDeque<Request<Block<T>>>,
}

impl<'c, T: Record> BufOStream<'c, T> {
    /// Creates an output stream writing to `bids` in order.
    pub fn new(manager: &'c BlockManager, bids: Vec<BlockId>, block_size: usize, nbuffers: usize) -> Self {
        BufOStream {
            manager,
            bids,
            next_bid: 0,
            block_size,
            nbuffers: nbuffers.max(1),
            current: Block::new(block_size),
            inflight: VecDeque::new(),
        }
    }

    /// Appends a record to the stream.
    pub fn push(&mut self, item: T) -> Result<(), SortError> {
        self.current.push(item);
        if self.current.is_full() {
            self.flush_current()?;
        }
        return Ok(());
    }

    fn flush_current(&mut self) -> Result<(), SortError> {
        let bid = *self
            .bids
            .get(self.next_bid)
            .ok_or(SortError::OutOfSpace { blocks: self.bids.len() })?;
        self.next_bid += 1;

        let fresh = if self.inflight.len() >= self.nbuffers {
            match self.inflight.pop_front() {
                Some(request) => {
                    let mut block = request.wait()?;
                    block.clear();
                    block
                }
                None => Block::new(self.block_size),
            }
        } else {
            Block::new(self.block_size)
        };

        let block = mem::replace(&mut self.current, fresh);
        self.inflight.push_back(self.manager.write(bid, block));

        return Ok(());
    }

    /// Writes the trailing partial block and waits for all writes.
    /// Returns the number of blocks written.
    pub fn finish(mut self) -> Result<usize, SortError> {
        if !self.current.is_empty() {
            self.flush_current()?;
        }
        for request in self.inflight.drain(..) {
            request.wait()?;
        }

        return Ok(self.next_bid);
    }
}

/// Write-behind block pool.
///
/// Hands out up to `pool_size` blocks and writes filled blocks to arbitrary locations, keeping at
/// most `max_inflight` writes outstanding. Written blocks return to the pool.
pub struct BufferedWriter<'c, T: Record> {
    manager: &'c BlockManager,
    block_size: usize,
    pool_size: usize,
    allocated: usize,
    max_inflight: usize,
    free: Vec<Block<T>>,
    inflight: VecDeque<Request<Block<T>>>,
}

impl<'c, T: Record> BufferedWriter<'c, T> {
    pub fn new(manager: &'c BlockManager, block_size: usize, pool_size: usize, max_inflight: usize) -> Self {
        BufferedWriter {
            manager,
            block_size,
            pool_size,
            allocated: 0,
            max_inflight: max_inflight.max(1),
            free: Vec::new(),
            inflight: VecDeque::new(),
        }
    }

    /// Returns an empty block, waiting for the oldest write if the pool is exhausted.
    pub fn get_free_block(&mut self) -> Result<Block<T>, SortError> {
        if let Some(block) = self.free.pop() {
            return Ok(block);
        }
        if self.allocated < self.pool_size {
            self.allocated += 1;
            return Ok(Block::new(self.block_size));
        }

        match self.inflight.pop_front() {
            Some(request) => {
                let mut block = request.wait()?;
                block.clear();
                Ok(block)
            }
            None => {
                // every pooled block is held by the caller
                self.allocated += 1;
                Ok(Block::new(self.block_size))
            }
        }
    }

    /// Queues `block` to be written to `bid`.
    pub fn write(&mut self, block: Block<T>, bid: BlockId) -> Result<(), SortError> {
        self.inflight.push_back(self.manager.write(bid, block));
        while self.inflight.len() > self.max_inflight {
            self.recycle_oldest()?;
        }
        return Ok(());
    }

    fn recycle_oldest(&mut self) -> Result<(), SortError> {
        if let Some(request) = self.inflight.pop_front() {
            let mut block = request.wait()?;
            block.clear();
            self.free.push(block);
        }
        return Ok(());
    }

    /// Waits for all queued writes.
    pub fn flush(&mut self) -> Result<(), SortError> {
        while !self.inflight.is_empty() {
            self.recycle_oldest()?;
        }
        return Ok(());
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{BufIStream, BufOStream, BufferedWriter};
    use crate::alloc::Striping;
    use crate::io::test::block_manager;
    use crate::sort::SortError;

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(16)]
    fn test_output_then_input_stream(#[case] nbuffers: usize) {
        let manager = block_manager(2, 128);
        let bids = manager.new_blocks(&Striping::new(2), 0, 6);

        let mut out = BufOStream::new(&manager, bids.clone(), 4, nbuffers);
        for i in 0..22u32 {
            out.push((i, i * 2)).unwrap();
        }
        assert_eq!(out.finish().unwrap(), 6);

        let input: BufIStream<(u32, u32)> = BufIStream::new(&manager, bids, 4, nbuffers);
        let actual: Result<Vec<_>, _> = input.collect();
        let expected: Vec<(u32, u32)> = (0..22).map(|i| (i, i * 2)).collect();
        assert_eq!(actual.unwrap(), expected);
    }

    #[test]
    fn test_output_stream_out_of_space() {
        let manager = block_manager(1, 128);
        let bids = manager.new_blocks(&Striping::new(1), 0, 1);

        let mut out = BufOStream::new(&manager, bids, 2, 2);
        out.push(1u8).unwrap();
        out.push(2u8).unwrap();
        out.push(3u8).unwrap();
        assert!(matches!(out.finish(), Err(SortError::OutOfSpace { blocks: 1 })));
    }

    #[test]
    fn test_input_stream_read_next() {
        let manager = block_manager(1, 128);
        let bids = manager.new_blocks(&Striping::new(1), 0, 1);

        let mut out = BufOStream::new(&manager, bids.clone(), 4, 1);
        out.push(7u64).unwrap();
        out.finish().unwrap();

        let mut input: BufIStream<u64> = BufIStream::new(&manager, bids, 4, 1);
        assert_eq!(input.read_next().unwrap(), 7);
        assert!(matches!(input.read_next(), Err(SortError::IO(_))));
    }

    #[test]
    fn test_buffered_writer() {
        let manager = block_manager(2, 128);
        let bids = manager.new_blocks(&Striping::new(2), 0, 8);
        let mut writer = BufferedWriter::new(&manager, 2, 3, 2);

        for (i, bid) in bids.iter().enumerate() {
            let mut block = writer.get_free_block().unwrap();
            assert!(block.is_empty());
            block.push(i as u16);
            block.push(i as u16 + 100);
            writer.write(block, *bid).unwrap();
        }
        writer.flush().unwrap();

        let input: BufIStream<u16> = BufIStream::new(&manager, bids, 2, 2);
        let actual: Vec<u16> = input.map(Result::unwrap).collect();
        let expected: Vec<u16> = (0..8).flat_map(|i| [i, i + 100]).collect();
        assert_eq!(actual, expected);
    }
}
