//! `ext-ksort` is a rust external key sort implementation.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. `ext-ksort` sorts records by a fixed-width
//! unsigned integer key in two passes. During the first pass it distributes records into buckets by their high key
//! bits, during the second pass it loads every bucket into memory, sorts it with a two-level radix sort and writes
//! it back in place. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `ext-ksort` supports the following features:
//!
//! * **Stable key sorting:**
//!   records with equal keys keep their input order.
//! * **Data agnostic:**
//!   it supports all record types that implement `serde` serialization/deserialization and expose a key
//!   through the [`Keyed`] trait. Blocks are stored in the `MessagePack` format.
//! * **Multiple disks:**
//!   blocks are spread over several disk files, each served by its own I/O thread, using a configurable
//!   allocation policy.
//! * **Overlapped I/O:**
//!   block reads and writes are asynchronous and overlap with in-memory sorting.
//! * **Multithreading support:**
//!   second-level bucket sorts run in parallel on a thread pool.
//!
//! # Example
//!
//! ```no_run
//! use ext_ksort::{ExtVector, KSorterBuilder};
//!
//! fn main() {
//!     let sorter = KSorterBuilder::new()
//!         .with_memory(256 * 1024 * 1024)
//!         .with_disks_number(2)
//!         .build()
//!         .unwrap();
//!
//!     let input = (0..1_000_000u64).map(|i| (i.wrapping_mul(0x9e3779b97f4a7c15), i));
//!     let mut vector = ExtVector::from_iter(&sorter, input).unwrap();
//!
//!     sorter.sort(&mut vector).unwrap();
//!
//!     for record in vector.iter().unwrap().map(Result::unwrap).take(10) {
//!         println!("{:?}", record);
//!     }
//! }
//! ```

pub mod alloc;
pub mod block;
pub mod bucket;
pub mod bucket_sort;
pub mod classify;
pub mod config;
pub mod distribute;
pub mod io;
pub mod key;
pub mod sort;
pub mod stream;
pub mod vector;

pub use alloc::{AllocPolicy, AllocStrategy};
pub use block::{Block, BlockId};
pub use config::SortConfig;
pub use io::{BlockManager, IoOp, IoStatsSnapshot, Request};
pub use key::{Key, KeyRef, Keyed, Record};
pub use sort::{KSorter, KSorterBuilder, SortError};
pub use stream::{BufIStream, BufOStream, BufferedWriter};
pub use vector::ExtVector;
