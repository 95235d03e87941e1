//! Sorter configuration.

use std::path::PathBuf;

use crate::alloc::AllocPolicy;
use crate::block::BLOCK_HEADER_SIZE;
use crate::sort::SortError;

/// Default internal memory budget: 64 MiB.
pub const DEFAULT_MEMORY: usize = 64 * 1024 * 1024;
/// Default block size in records.
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;
/// Default block slot size: 1 MiB.
pub const DEFAULT_BLOCK_RAW_SIZE: usize = 1024 * 1024;
/// Default cache size the first-level fan-out is tuned for: 512 KiB.
pub const DEFAULT_CACHE_SIZE: usize = 512 * 1024;

/// Encoded size of a `(u64, String)` record besides the string bytes: array, integer and string headers.
pub const LINE_RECORD_OVERHEAD: usize = 1 + 9 + 5;
/// Upper bound of the encoded block array header.
const BLOCK_ARRAY_HEADER_SIZE: usize = 5;

/// Returns the number of `(u64, String)` records with strings of up to `max_line_len` bytes that
/// always fit into a block slot of `raw_size` bytes, at least one.
pub fn line_block_size(raw_size: usize, max_line_len: usize) -> usize {
    let payload = raw_size.saturating_sub(BLOCK_HEADER_SIZE + BLOCK_ARRAY_HEADER_SIZE);
    (payload / (max_line_len + LINE_RECORD_OVERHEAD)).max(1)
}

/// Validated sorter parameters.
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Internal memory budget in bytes.
    pub memory: usize,
    /// Block size in records.
    pub block_size: usize,
    /// Block slot size on disk in bytes.
    pub block_raw_size: usize,
    /// Cache size in bytes.
    pub cache_size: usize,
    /// Number of disks.
    pub ndisks: usize,
    /// Disk block placement policy.
    pub alloc_policy: AllocPolicy,
    /// Number of threads used by the in-memory sort. [`None`] means one per CPU core.
    pub threads_number: Option<usize>,
    /// Directory for temporary data. [`None`] means the OS temporary directory.
    pub tmp_dir: Option<PathBuf>,
    /// One directory per disk. Overrides `ndisks` and `tmp_dir` for disk files when not empty.
    pub disk_dirs: Vec<PathBuf>,
}

impl SortConfig {
    /// Checks parameter consistency.
    pub fn validate(&self) -> Result<(), SortError> {
        if self.block_size == 0 {
            return Err(SortError::InvalidConfig("block size must be positive".to_string()));
        }
        if self.block_raw_size <= BLOCK_HEADER_SIZE {
            return Err(SortError::InvalidConfig(format!(
                "block raw size must exceed {} bytes",
                BLOCK_HEADER_SIZE
            )));
        }
        if self.disks_number() == 0 {
            return Err(SortError::InvalidConfig("at least one disk is required".to_string()));
        }
        if self.cache_size == 0 {
            return Err(SortError::InvalidConfig("cache size must be positive".to_string()));
        }
        if self.threads_number == Some(0) {
            return Err(SortError::InvalidConfig("threads number must be positive".to_string()));
        }

        return Ok(());
    }

    /// Returns the effective number of disks.
    pub fn disks_number(&self) -> usize {
        if self.disk_dirs.is_empty() {
            self.ndisks
        } else {
            self.disk_dirs.len()
        }
    }
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            memory: DEFAULT_MEMORY,
            block_size: DEFAULT_BLOCK_SIZE,
            block_raw_size: DEFAULT_BLOCK_RAW_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            ndisks: 1,
            alloc_policy: AllocPolicy::default(),
            threads_number: None,
            tmp_dir: None,
            disk_dirs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use rstest::*;

    use super::{line_block_size, SortConfig, DEFAULT_BLOCK_RAW_SIZE};
    use crate::block::{encode_block, Block};
    use crate::sort::SortError;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SortConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case(SortConfig { block_size: 0, ..SortConfig::default() })]
    #[case(SortConfig { block_raw_size: 4, ..SortConfig::default() })]
    #[case(SortConfig { ndisks: 0, ..SortConfig::default() })]
    #[case(SortConfig { cache_size: 0, ..SortConfig::default() })]
    #[case(SortConfig { threads_number: Some(0), ..SortConfig::default() })]
    fn test_invalid_config(#[case] config: SortConfig) {
        assert!(matches!(config.validate(), Err(SortError::InvalidConfig(_))));
    }

    #[test]
    fn test_disk_dirs_override_disks_number() {
        let config = SortConfig {
            ndisks: 0,
            disk_dirs: vec![PathBuf::from("a"), PathBuf::from("b")],
            ..SortConfig::default()
        };
        assert_eq!(config.disks_number(), 2);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case(DEFAULT_BLOCK_RAW_SIZE, 0)]
    #[case(DEFAULT_BLOCK_RAW_SIZE, 200)]
    #[case(DEFAULT_BLOCK_RAW_SIZE, 5000)]
    #[case(4096, 300)]
    #[case(256, 40)]
    fn test_line_block_size_fits_slot(#[case] raw_size: usize, #[case] line_len: usize) {
        let block_size = line_block_size(raw_size, line_len);
        let line = "x".repeat(line_len);

        let mut block = Block::new(block_size);
        while !block.is_full() {
            block.push((u64::MAX, line.clone()));
        }

        let mut buf = Vec::new();
        assert!(encode_block(&block, raw_size, &mut buf).is_ok());
        assert_eq!(buf.len(), raw_size);
    }

    #[test]
    fn test_line_block_size_keeps_one_record() {
        assert_eq!(line_block_size(256, 1000), 1);
    }
}
