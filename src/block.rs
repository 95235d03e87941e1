//! Fixed-capacity record blocks and their on-disk slot encoding.
//!
//! A block occupies exactly one disk slot of `raw_size` bytes laid out as a little-endian `u32`
//! payload length, the MessagePack encoded records and zero padding.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::sort::SortError;

/// Slot header size: encoded payload length.
pub const BLOCK_HEADER_SIZE: usize = 4;

/// Block location: a slot on one of the disks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    /// Disk index.
    pub disk: usize,
    /// Slot index within the disk.
    pub slot: u64,
}

impl BlockId {
    pub fn new(disk: usize, slot: u64) -> Self {
        BlockId { disk, slot }
    }
}

/// Block of records limited by elements count.
#[derive(Debug, Clone)]
pub struct Block<T> {
    limit: usize,
    inner: Vec<T>,
}

impl<T> Block<T> {
    /// Creates an empty block holding up to `limit` records.
    pub fn new(limit: usize) -> Self {
        Block {
            limit,
            inner: Vec::with_capacity(limit),
        }
    }

    /// Adds a new record to the block.
    pub fn push(&mut self, item: T) {
        debug_assert!(self.inner.len() < self.limit);
        self.inner.push(item);
    }

    /// Returns the number of records in the block.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the block reached its limit.
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }

    /// Returns the maximum number of records.
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn as_slice(&self) -> &[T] {
        self.inner.as_slice()
    }
}

impl<T> IntoIterator for Block<T> {
    type Item = T;
    type IntoIter = <Vec<T> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

/// Encodes `block` into `buf` as a full slot of `raw_size` bytes.
pub(crate) fn encode_block<T: Serialize>(block: &Block<T>, raw_size: usize, buf: &mut Vec<u8>) -> Result<(), SortError> {
    buf.clear();
    buf.extend_from_slice(&[0u8; BLOCK_HEADER_SIZE]);
    rmp_serde::encode::write(buf, &block.inner).map_err(SortError::SerializationError)?;

    let payload_size = buf.len() - BLOCK_HEADER_SIZE;
    if buf.len() > raw_size {
        return Err(SortError::BlockOverflow {
            size: buf.len(),
            capacity: raw_size,
        });
    }

    buf[..BLOCK_HEADER_SIZE].copy_from_slice(&(payload_size as u32).to_le_bytes());
    buf.resize(raw_size, 0);

    return Ok(());
}

/// Decodes a slot previously produced by [`encode_block`] replacing the records of `block`.
pub(crate) fn decode_block<T: DeserializeOwned>(buf: &[u8], block: &mut Block<T>) -> Result<(), SortError> {
    let corrupted = || {
        SortError::IO(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "corrupted block header",
        ))
    };

    let header: [u8; BLOCK_HEADER_SIZE] = buf
        .get(..BLOCK_HEADER_SIZE)
        .and_then(|header| header.try_into().ok())
        .ok_or_else(corrupted)?;
    let payload_size = u32::from_le_bytes(header) as usize;
    let payload = buf
        .get(BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload_size)
        .ok_or_else(corrupted)?;

    let items: Vec<T> = rmp_serde::decode::from_read(payload).map_err(SortError::DeserializationError)?;
    if items.len() > block.limit {
        return Err(SortError::IO(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("block holds {} records, limit is {}", items.len(), block.limit),
        )));
    }
    block.inner = items;

    return Ok(());
}
