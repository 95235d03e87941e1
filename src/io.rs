//! Asynchronous block I/O.
//!
//! Every disk is a file served by its own worker thread. Transfers are queued on the disk the
//! block lives on and are represented by [`Request`] handles. A transfer takes the block buffer
//! by value and gives it back on [`Request::wait`], so a buffer is never touched by the worker
//! and by the caller at the same time.

use std::fmt;
use std::fs;
use std::io::{self, prelude::*};
use std::ops::Sub;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::alloc::AllocStrategy;
use crate::block::{decode_block, encode_block, Block, BlockId};
use crate::key::Record;
use crate::sort::SortError;

/// Block transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read = 0,
    Write = 1,
}

type Job = Box<dyn FnOnce(&mut fs::File) + Send>;

/// Handle of a queued block transfer.
#[must_use = "a request has to be waited for to get its buffer back"]
pub struct Request<R> {
    receiver: Receiver<Result<R, SortError>>,
    stats: Arc<IoStats>,
}

impl<R> Request<R> {
    /// Blocks until the transfer completes and returns its result.
    pub fn wait(self) -> Result<R, SortError> {
        let start = Instant::now();
        let result = self.receiver.recv();
        self.stats.wait_time.fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);

        return result.map_err(|_| {
            SortError::IO(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "disk queue terminated before the request completed",
            ))
        })?;
    }
}

/// I/O counters shared by all disks of a block manager.
#[derive(Debug, Default)]
pub struct IoStats {
    reads: AtomicU64,
    writes: AtomicU64,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    read_time: AtomicU64,
    write_time: AtomicU64,
    wait_time: AtomicU64,
}

impl IoStats {
    fn record(&self, op: IoOp, bytes: usize, elapsed: Duration) {
        let nanos = elapsed.as_nanos() as u64;
        match op {
            IoOp::Read => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.read_time.fetch_add(nanos, Ordering::Relaxed);
            }
            IoOp::Write => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.written_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.write_time.fetch_add(nanos, Ordering::Relaxed);
            }
        }
    }

    /// Returns the current counter values.
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            read_time: Duration::from_nanos(self.read_time.load(Ordering::Relaxed)),
            write_time: Duration::from_nanos(self.write_time.load(Ordering::Relaxed)),
            wait_time: Duration::from_nanos(self.wait_time.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`IoStats`]. Subtract two snapshots to get the statistics of a period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
    /// Time spent by disk workers reading, summed over disks.
    pub read_time: Duration,
    /// Time spent by disk workers writing, summed over disks.
    pub write_time: Duration,
    /// Time the caller spent blocked in [`Request::wait`].
    pub wait_time: Duration,
}

impl Sub for IoStatsSnapshot {
    type Output = IoStatsSnapshot;

    fn sub(self, rhs: Self) -> Self::Output {
        IoStatsSnapshot {
            reads: self.reads - rhs.reads,
            writes: self.writes - rhs.writes,
            read_bytes: self.read_bytes - rhs.read_bytes,
            written_bytes: self.written_bytes - rhs.written_bytes,
            read_time: self.read_time.saturating_sub(rhs.read_time),
            write_time: self.write_time.saturating_sub(rhs.write_time),
            wait_time: self.wait_time.saturating_sub(rhs.wait_time),
        }
    }
}

impl fmt::Display for IoStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reads: {} ({} bytes, {:.3}s), writes: {} ({} bytes, {:.3}s), wait: {:.3}s",
            self.reads,
            self.read_bytes,
            self.read_time.as_secs_f64(),
            self.writes,
            self.written_bytes,
            self.write_time.as_secs_f64(),
            self.wait_time.as_secs_f64(),
        )
    }
}

#[derive(Debug, Default)]
struct SlotPool {
    next: u64,
    free: Vec<u64>,
}

impl SlotPool {
    fn allocate(&mut self) -> u64 {
        match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.next += 1;
                self.next - 1
            }
        }
    }

    fn release(&mut self, slot: u64) {
        debug_assert!(slot < self.next && !self.free.contains(&slot));
        self.free.push(slot);
    }

    fn in_use(&self) -> u64 {
        self.next - self.free.len() as u64
    }
}

struct Disk {
    slots: Mutex<SlotPool>,
    reads: Option<Sender<Job>>,
    writes: Option<Sender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Disk {
    fn spawn(index: usize, file: fs::File, priority: Arc<AtomicU8>) -> io::Result<Self> {
        let (read_tx, read_rx) = crossbeam_channel::unbounded();
        let (write_tx, write_rx) = crossbeam_channel::unbounded();

        let worker = thread::Builder::new()
            .name(format!("disk-{}", index))
            .spawn(move || serve(file, read_rx, write_rx, priority))?;

        return Ok(Disk {
            slots: Mutex::new(SlotPool::default()),
            reads: Some(read_tx),
            writes: Some(write_tx),
            worker: Some(worker),
        });
    }

    fn submit(&self, op: IoOp, job: Job) {
        let queue = match op {
            IoOp::Read => &self.reads,
            IoOp::Write => &self.writes,
        };
        // a failed send drops the job together with its result sender, the request then reports the failure
        if let Some(queue) = queue {
            let _ = queue.send(job);
        }
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        self.reads.take();
        self.writes.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("disk worker terminated abnormally");
            }
        }
    }
}

/// Disk worker loop. Jobs of the prioritized direction are served first.
fn serve(mut file: fs::File, reads: Receiver<Job>, writes: Receiver<Job>, priority: Arc<AtomicU8>) {
    loop {
        let (first, second) = if priority.load(Ordering::Relaxed) == IoOp::Read as u8 {
            (&reads, &writes)
        } else {
            (&writes, &reads)
        };

        let job = match first.try_recv().or_else(|_| second.try_recv()) {
            Ok(job) => job,
            Err(_) => {
                let job = crossbeam_channel::select! {
                    recv(reads) -> job => job,
                    recv(writes) -> job => job,
                };
                match job {
                    Ok(job) => job,
                    Err(_) => break,
                }
            }
        };
        job(&mut file);
    }

    // queues are closed, finish whatever is still pending
    for job in writes.try_iter().chain(reads.try_iter()) {
        job(&mut file);
    }
}

/// Block manager: owns the disks, allocates block slots on them and queues block transfers.
pub struct BlockManager {
    disks: Vec<Disk>,
    raw_size: usize,
    priority: Arc<AtomicU8>,
    stats: Arc<IoStats>,
}

impl BlockManager {
    /// Creates a block manager using every file as a separate disk.
    ///
    /// # Arguments
    /// * `files` - Disk files, one per disk
    /// * `raw_size` - Size of a block slot in bytes
    pub fn new(files: Vec<fs::File>, raw_size: usize) -> Result<Self, SortError> {
        let priority = Arc::new(AtomicU8::new(IoOp::Write as u8));
        let disks = files
            .into_iter()
            .enumerate()
            .map(|(index, file)| Disk::spawn(index, file, priority.clone()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(SortError::IO)?;

        log::debug!("block manager started (disks: {}, slot size: {})", disks.len(), raw_size);

        return Ok(BlockManager {
            disks,
            raw_size,
            priority,
            stats: Arc::new(IoStats::default()),
        });
    }

    /// Returns the number of disks.
    pub fn ndisks(&self) -> usize {
        self.disks.len()
    }

    /// Returns the block slot size in bytes.
    pub fn raw_size(&self) -> usize {
        self.raw_size
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Sets the transfer direction disk workers serve first.
    pub fn set_priority_op(&self, op: IoOp) {
        self.priority.store(op as u8, Ordering::Relaxed);
    }

    /// Allocates `count` blocks for sequence positions `first_index..first_index + count`.
    pub fn new_blocks(&self, strategy: &dyn AllocStrategy, first_index: u64, count: usize) -> Vec<BlockId> {
        (0..count as u64)
            .map(|i| {
                let disk = strategy.disk(first_index + i) % self.disks.len();
                let slot = self.disks[disk].slots.lock().allocate();
                BlockId::new(disk, slot)
            })
            .collect()
    }

    /// Returns blocks to their disks.
    pub fn delete_blocks(&self, bids: &[BlockId]) {
        for bid in bids {
            self.disks[bid.disk].slots.lock().release(bid.slot);
        }
    }

    /// Returns the number of blocks currently allocated on all disks.
    pub fn allocated_blocks(&self) -> u64 {
        self.disks.iter().map(|disk| disk.slots.lock().in_use()).sum()
    }

    /// Queues reading block `bid` into `block`.
    pub fn read<T: Record>(&self, bid: BlockId, mut block: Block<T>) -> Request<Block<T>> {
        let raw_size = self.raw_size;
        let stats = self.stats.clone();

        self.submit(bid, IoOp::Read, move |file| {
            let start = Instant::now();
            let mut buf = vec![0u8; raw_size];
            file.seek(io::SeekFrom::Start(bid.slot * raw_size as u64))
                .and_then(|_| file.read_exact(&mut buf))
                .map_err(SortError::IO)?;
            stats.record(IoOp::Read, raw_size, start.elapsed());

            decode_block(&buf, &mut block)?;
            return Ok(block);
        })
    }

    /// Queues writing `block` to block `bid`. The request gives the block back once written.
    pub fn write<T: Record>(&self, bid: BlockId, block: Block<T>) -> Request<Block<T>> {
        let raw_size = self.raw_size;
        let stats = self.stats.clone();

        self.submit(bid, IoOp::Write, move |file| {
            let mut buf = Vec::with_capacity(raw_size);
            encode_block(&block, raw_size, &mut buf)?;

            let start = Instant::now();
            file.seek(io::SeekFrom::Start(bid.slot * raw_size as u64))
                .and_then(|_| file.write_all(&buf))
                .map_err(SortError::IO)?;
            stats.record(IoOp::Write, raw_size, start.elapsed());

            return Ok(block);
        })
    }

    fn submit<R, F>(&self, bid: BlockId, op: IoOp, transfer: F) -> Request<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut fs::File) -> Result<R, SortError> + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        self.disks[bid.disk].submit(
            op,
            Box::new(move |file| {
                let _ = sender.send(transfer(file));
            }),
        );

        return Request {
            receiver,
            stats: self.stats.clone(),
        };
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::fs;

    use rstest::*;

    use super::{BlockManager, IoOp, SlotPool};
    use crate::alloc::Striping;
    use crate::block::{Block, BlockId};
    use crate::sort::SortError;

    pub(crate) fn block_manager(ndisks: usize, raw_size: usize) -> BlockManager {
        let files: Vec<fs::File> = (0..ndisks).map(|_| tempfile::tempfile().unwrap()).collect();
        BlockManager::new(files, raw_size).unwrap()
    }

    #[fixture]
    fn manager() -> BlockManager {
        block_manager(2, 256)
    }

    #[test]
    fn test_slot_pool_reuses_released_slots() {
        let mut pool = SlotPool::default();
        let slots: Vec<u64> = (0..3).map(|_| pool.allocate()).collect();
        assert_eq!(slots, vec![0, 1, 2]);

        pool.release(1);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.allocate(), 1);
        assert_eq!(pool.allocate(), 3);
        assert_eq!(pool.in_use(), 4);
    }

    #[rstest]
    fn test_new_and_delete_blocks(manager: BlockManager) {
        let bids = manager.new_blocks(&Striping::new(2), 1, 4);
        assert_eq!(
            bids,
            vec![BlockId::new(1, 0), BlockId::new(0, 0), BlockId::new(1, 1), BlockId::new(0, 1)]
        );
        assert_eq!(manager.allocated_blocks(), 4);

        manager.delete_blocks(&bids[..2]);
        assert_eq!(manager.allocated_blocks(), 2);
    }

    #[rstest]
    fn test_write_then_read(manager: BlockManager) {
        let bids = manager.new_blocks(&Striping::new(2), 0, 3);

        let requests: Vec<_> = bids
            .iter()
            .enumerate()
            .map(|(i, bid)| {
                let mut block = Block::new(4);
                for j in 0..=i as u32 {
                    block.push((j, i as u64));
                }
                manager.write(*bid, block)
            })
            .collect();
        for request in requests {
            request.wait().unwrap();
        }

        manager.set_priority_op(IoOp::Read);
        for (i, bid) in bids.iter().enumerate().rev() {
            let block: Block<(u32, u64)> = manager.read(*bid, Block::new(4)).wait().unwrap();
            let expected: Vec<(u32, u64)> = (0..=i as u32).map(|j| (j, i as u64)).collect();
            assert_eq!(block.as_slice(), expected.as_slice());
        }

        let stats = manager.stats().snapshot();
        assert_eq!(stats.writes, 3);
        assert_eq!(stats.reads, 3);
        assert_eq!(stats.written_bytes, 3 * 256);
    }

    #[rstest]
    fn test_write_overflow_is_reported(manager: BlockManager) {
        let bid = manager.new_blocks(&Striping::new(2), 0, 1)[0];
        let mut block = Block::new(64);
        for i in 0..64u64 {
            block.push(u64::MAX - i);
        }

        let result = manager.write(bid, block).wait();
        assert!(matches!(result, Err(SortError::BlockOverflow { capacity: 256, .. })));
    }

    #[rstest]
    fn test_read_past_end_is_reported(manager: BlockManager) {
        let result = manager.read::<u32>(BlockId::new(0, 10), Block::new(4)).wait();
        assert!(matches!(result, Err(SortError::IO(_))));
    }
}
