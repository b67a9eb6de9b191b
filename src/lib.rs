#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A segmented, SIMD-filtered concurrent hash table with incremental
//! per-bucket resizing, and a crash-consistent persistent-memory variant.
//!
//! The table hashes keys into fixed buckets; each bucket owns a private,
//! power-of-two array of cache-line-sized cells holding 16-bit tags and
//! 16-byte slots. Lookups filter slots by SIMD tag comparison before any
//! full key comparison, and never take a lock. Writers lock only the one
//! cell they mutate. A bucket grows by doubling its own cell array and
//! atomically swapping a packed descriptor word, so resizing one bucket
//! never blocks traffic to the others.
//!
//! Keys and values each come in two schemas: [`Fixed`] (an inline `u64`)
//! and [`Var`] (length-prefixed bytes stored out of line). Pick them per
//! table instantiation:
//!
//! ```
//! use turbo_hash::{Fixed, HashTable, Var};
//!
//! let table = HashTable::<Var, Var>::new(64, 4)?;
//! table.put(b"apple", b"red")?;
//! table.put(b"pear", b"green")?;
//!
//! assert_eq!(table.get(b"apple"), Some(b"red".to_vec()));
//! assert!(table.delete(b"pear"));
//! assert!(!table.contains_key(b"pear"));
//! # Ok::<(), turbo_hash::Error>(())
//! ```
//!
//! The persistent-memory variant, [`PmemHashTable`], carves cells and
//! records from a [`PmemPool`] and orders every mutation through a
//! [`PersistentBarrier`] so a crash at any point leaves the table
//! recoverable via [`PmemHashTable::recover`].

pub(crate) mod error;
pub(crate) mod map;
pub(crate) mod pmem;
pub(crate) mod util;

pub use error::{Error, Result};
pub use map::{Cell128, Cell256, CellLayout, FieldSchema, Fixed, HashTable, RawField, Var};
pub use pmem::{
    CountingBarrier, MemoryPool, NoopBarrier, PersistentBarrier, PmemHashTable, PmemPool,
    PoolOffset,
};
pub use util::Slice;
