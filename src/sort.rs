//! External key sorter.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log;

use crate::alloc::AllocPolicy;
use crate::block::Block;
use crate::bucket::BucketLocationTable;
use crate::bucket_sort::sort_buckets;
use crate::classify::floor_log2;
use crate::config::SortConfig;
use crate::distribute::distribute;
use crate::io::{BlockManager, IoOp};
use crate::key::{Key, Record};
use crate::stream::BufOStream;
use crate::vector::ExtVector;

/// Read and write buffers reserved per disk during distribution.
const IO_BUFFERS_PER_DISK: usize = 2;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Block serialization error.
    SerializationError(rmp_serde::encode::Error),
    /// Block deserialization error.
    DeserializationError(rmp_serde::decode::Error),
    /// Inconsistent sorter parameters.
    InvalidConfig(String),
    /// Sort range out of the vector bounds.
    InvalidRange { start: u64, end: u64, len: u64 },
    /// Memory budget too small to hold a single bucket.
    InsufficientMemory { blocks: usize, required: usize },
    /// Encoded block does not fit into a block slot.
    BlockOverflow { size: usize, capacity: usize },
    /// Bucket does not fit into the memory budget.
    BucketOverflow { bucket: usize, size: u64, capacity: u64 },
    /// Output ran past its block sequence.
    OutOfSpace { blocks: usize },
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::SerializationError(err) => Some(err),
            SortError::DeserializationError(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
            SortError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            SortError::InvalidRange { start, end, len } => {
                write!(f, "range {}..{} is out of vector bounds (length: {})", start, end, len)
            }
            SortError::InsufficientMemory { blocks, required } => write!(
                f,
                "memory budget of {} blocks is insufficient, at least {} blocks required",
                blocks, required
            ),
            SortError::BlockOverflow { size, capacity } => {
                write!(f, "encoded block of {} bytes exceeds block slot of {} bytes", size, capacity)
            }
            SortError::BucketOverflow { bucket, size, capacity } => write!(
                f,
                "bucket {} of {} records exceeds bucket capacity of {} records, increase the memory budget",
                bucket, size, capacity
            ),
            SortError::OutOfSpace { blocks } => write!(f, "output exceeds its {} blocks", blocks),
        }
    }
}

/// Key sorter builder. Provides methods for [`KSorter`] initialization.
#[derive(Debug, Clone, Default)]
pub struct KSorterBuilder {
    config: SortConfig,
}

impl KSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        KSorterBuilder::default()
    }

    /// Builds a [`KSorter`] instance using provided configuration.
    pub fn build(self) -> Result<KSorter, SortError> {
        KSorter::new(self.config)
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> KSorterBuilder {
        self.config.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> KSorterBuilder {
        self.config.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets number of disks. Every disk is a separate file served by its own I/O thread.
    pub fn with_disks_number(mut self, ndisks: usize) -> KSorterBuilder {
        self.config.ndisks = ndisks;
        return self;
    }

    /// Places one disk file in every directory.
    pub fn with_disk_dirs<P: Into<PathBuf>>(mut self, dirs: impl IntoIterator<Item = P>) -> KSorterBuilder {
        self.config.disk_dirs = dirs.into_iter().map(Into::into).collect();
        return self;
    }

    /// Sets internal memory budget in bytes.
    pub fn with_memory(mut self, memory: usize) -> KSorterBuilder {
        self.config.memory = memory;
        return self;
    }

    /// Sets block size in records.
    pub fn with_block_size(mut self, block_size: usize) -> KSorterBuilder {
        self.config.block_size = block_size;
        return self;
    }

    /// Sets block slot size on disk in bytes.
    pub fn with_block_raw_size(mut self, raw_size: usize) -> KSorterBuilder {
        self.config.block_raw_size = raw_size;
        return self;
    }

    /// Sets cache size in bytes.
    pub fn with_cache_size(mut self, cache_size: usize) -> KSorterBuilder {
        self.config.cache_size = cache_size;
        return self;
    }

    /// Sets disk block placement policy.
    pub fn with_alloc_policy(mut self, policy: AllocPolicy) -> KSorterBuilder {
        self.config.alloc_policy = policy;
        return self;
    }
}

/// External key sorter.
///
/// Owns the disks, their I/O threads and the sorting thread pool. Vectors created on a sorter
/// store their records on its disks and can only be sorted by it.
pub struct KSorter {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Sorter parameters.
    config: SortConfig,
    /// Disk block manager. Declared before `tmp_dir` to stop the disks first.
    manager: BlockManager,
    /// Directory to be used to store temporary data.
    tmp_dir: tempfile::TempDir,
}

impl KSorter {
    /// Creates a new sorter instance.
    ///
    /// # Arguments
    /// * `config` - Sorter parameters, validated before use
    pub fn new(config: SortConfig) -> Result<Self, SortError> {
        config.validate()?;

        let thread_pool = Self::init_thread_pool(config.threads_number)?;
        let tmp_dir = Self::init_tmp_directory(config.tmp_dir.as_deref())?;
        let files = Self::init_disks(&config, tmp_dir.path())?;
        let manager = BlockManager::new(files, config.block_raw_size)?;

        return Ok(KSorter {
            thread_pool,
            config,
            manager,
            tmp_dir,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
        let tmp_dir = if let Some(tmp_path) = tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    fn init_disks(config: &SortConfig, tmp_path: &Path) -> Result<Vec<fs::File>, SortError> {
        let files = if config.disk_dirs.is_empty() {
            (0..config.ndisks)
                .map(|_| tempfile::tempfile_in(tmp_path))
                .collect::<io::Result<Vec<_>>>()
        } else {
            for dir in config.disk_dirs.iter() {
                log::info!("using {} as a disk directory", dir.display());
            }
            config
                .disk_dirs
                .iter()
                .map(tempfile::tempfile_in)
                .collect::<io::Result<Vec<_>>>()
        }
        .map_err(|err| SortError::TempDir(err))?;

        return Ok(files);
    }

    /// Returns the sorter parameters.
    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Returns the disk block manager.
    pub fn manager(&self) -> &BlockManager {
        &self.manager
    }

    /// Returns the directory holding temporary data.
    pub fn tmp_dir(&self) -> &Path {
        self.tmp_dir.path()
    }

    /// Sorts the whole vector by key using the configured memory budget.
    pub fn sort<T: Record>(&self, vector: &mut ExtVector<'_, T>) -> Result<(), SortError> {
        let len = vector.len();
        self.sort_range(vector, 0..len)
    }

    /// Sorts `vector[range]` by key using the configured memory budget.
    pub fn sort_range<T: Record>(&self, vector: &mut ExtVector<'_, T>, range: Range<u64>) -> Result<(), SortError> {
        self.stable_ksort(vector, range, self.config.memory)
    }

    /// Stably sorts the records of `vector[range]` by key in place. Records outside the range keep
    /// their positions.
    ///
    /// Records are first distributed into `2^lognbuckets` buckets by their high key bits, then every
    /// bucket is read back, sorted in memory and written over the range.
    ///
    /// # Arguments
    /// * `vector` - Vector created on this sorter
    /// * `range` - Positions to be sorted
    /// * `memory` - Internal memory budget in bytes
    pub fn stable_ksort<T: Record>(
        &self,
        vector: &mut ExtVector<'_, T>,
        range: Range<u64>,
        memory: usize,
    ) -> Result<(), SortError> {
        if range.start > range.end || range.end > vector.len() {
            return Err(SortError::InvalidRange {
                start: range.start,
                end: range.end,
                len: vector.len(),
            });
        }
        if !std::ptr::eq(vector.manager(), &self.manager) {
            return Err(SortError::InvalidConfig("vector belongs to another sorter".to_string()));
        }
        vector.flush()?;
        if range.start == range.end {
            return Ok(());
        }

        let started = Instant::now();
        let stats_before = self.manager.stats().snapshot();

        let manager = &self.manager;
        let ndisks = manager.ndisks();
        let block_size = vector.block_size();
        let n = range.end - range.start;

        let m = memory / manager.raw_size();
        let reserved = 2 * IO_BUFFERS_PER_DISK * ndisks;
        if m <= reserved {
            return Err(SortError::InsufficientMemory {
                blocks: m,
                required: reserved + 1,
            });
        }
        let nmaxbuckets = m - reserved;
        let lognbuckets = floor_log2(nmaxbuckets).min(T::Key::BITS);
        let nbuckets = 1usize << lognbuckets;
        let estimated_blocks = div_ceil(div_ceil(n, nbuckets as u64), block_size as u64) as usize;

        log::info!(
            "sorting {} records (memory: {} blocks, buckets: {}, estimated blocks per bucket: {})",
            n,
            m,
            nbuckets,
            estimated_blocks
        );

        let mut table = BucketLocationTable::new(manager, vector.strategy().clone(), nbuckets, estimated_blocks);
        let mut bucket_sizes = vec![0u64; nbuckets];

        manager.set_priority_op(IoOp::Write);
        distribute(
            manager,
            &mut table,
            &mut bucket_sizes,
            lognbuckets,
            vector,
            range.clone(),
            IO_BUFFERS_PER_DISK * ndisks,
            IO_BUFFERS_PER_DISK * ndisks,
        )?;
        let distributed = started.elapsed();
        log::info!("distribution done in {:.3}s", distributed.as_secs_f64());

        let max_bucket_blocks = (m - IO_BUFFERS_PER_DISK * ndisks) / 2;
        let capacity = (max_bucket_blocks * block_size) as u64;
        if let Some((bucket, &size)) = bucket_sizes.iter().enumerate().find(|(_, size)| **size > capacity) {
            return Err(SortError::BucketOverflow { bucket, size, capacity });
        }
        let max_size = bucket_sizes.iter().copied().max().unwrap_or(0);
        let staging_blocks = (div_ceil(max_size, block_size as u64) as usize).min(max_bucket_blocks);
        let nwrite_buffers = m - 2 * staging_blocks;
        log::debug!(
            "staging area: {} blocks, output write buffers: {}",
            staging_blocks,
            nwrite_buffers
        );

        let first_block = (range.start / block_size as u64) as usize;
        let last_block = div_ceil(range.end, block_size as u64) as usize;
        let (head, tail) = self.read_boundaries(vector, &range)?;

        manager.set_priority_op(IoOp::Read);
        let bids = vector.blocks()[first_block..last_block].to_vec();
        let mut out = BufOStream::new(manager, bids, block_size, nwrite_buffers);
        for record in head {
            out.push(record)?;
        }
        sort_buckets(
            manager,
            &self.thread_pool,
            &table,
            &bucket_sizes,
            lognbuckets,
            staging_blocks,
            block_size,
            self.config.cache_size,
            &mut out,
        )?;
        for record in tail {
            out.push(record)?;
        }
        out.finish()?;

        drop(table);
        vector.reload_tail()?;

        let elapsed = started.elapsed();
        log::info!(
            "sorting done in {:.3}s (distribution: {:.3}s, bucket sort: {:.3}s)",
            elapsed.as_secs_f64(),
            distributed.as_secs_f64(),
            (elapsed - distributed).as_secs_f64()
        );
        log::info!("I/O statistics: {}", self.manager.stats().snapshot() - stats_before);

        return Ok(());
    }

    /// Reads the records sharing the first block of `range` but preceding it and the records
    /// sharing the last block of `range` but following it.
    fn read_boundaries<T: Record>(
        &self,
        vector: &ExtVector<'_, T>,
        range: &Range<u64>,
    ) -> Result<(Vec<T>, Vec<T>), SortError> {
        let block_size = vector.block_size();

        let head_len = vector.block_offset(range.start);
        let head = match vector.block_id(range.start) {
            Some(bid) if head_len > 0 => {
                let block = self.manager.read(bid, Block::new(block_size)).wait()?;
                block.into_iter().take(head_len).collect()
            }
            _ => Vec::new(),
        };

        let tail_start = vector.block_offset(range.end);
        let tail = match vector.block_id(range.end) {
            Some(bid) if tail_start > 0 => {
                let block = self.manager.read(bid, Block::new(block_size)).wait()?;
                block.into_iter().skip(tail_start).collect()
            }
            _ => Vec::new(),
        };

        return Ok((head, tail));
    }
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}
