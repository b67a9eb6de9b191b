//! Key-value record encodings.
//!
//! Keys and values each come in two shapes: `Fixed` (a `u64` stored inline
//! in the slot) and `Var` (length-prefixed bytes stored out of line). The
//! four combinations form a closed set, resolved once per table
//! instantiation; a table never mixes encodings.
//!
//! Out-of-line record layouts (all lengths are little-endian `u64`):
//!
//! ```text
//! Fixed key, Var value:   | key u64 | val_len | val bytes |
//! Var key, Fixed value:   | key_len | val u64 | key bytes |
//! Var key, Var value:     | key_len | val_len | key bytes | val bytes |
//! ```
//!
//! The record's total size is recomputable from its own bytes, so freeing a
//! record needs only its address and the table's encoding.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::fmt::Debug;
use std::ptr;

use crate::error::{Error, Result};
use crate::util::hash::{mix_u64, murmur_hash64a};

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Fixed {}
    impl Sealed for super::Var {}
}

/// Shape of one side (key or value) of a table's records.
///
/// Implemented by exactly two types, [`Fixed`] and [`Var`]; the trait is
/// sealed because the slot format only supports these two shapes.
pub trait FieldSchema: sealed::Sealed + 'static {
    /// True when the field is stored inline in the slot.
    const FLAT: bool;
    /// Borrowed form accepted by table operations and handed to callbacks.
    type Ref<'a>: Copy + Debug;
    /// Owned form returned by copying reads.
    type Owned: Clone + Debug + PartialEq + Send;

    fn to_raw(r: Self::Ref<'_>) -> RawField<'_>;
    fn from_raw<'a>(raw: RawField<'a>) -> Self::Ref<'a>;
    fn to_owned(r: Self::Ref<'_>) -> Self::Owned;
}

/// Inline `u64` field schema.
pub struct Fixed;

/// Length-prefixed byte-string field schema.
pub struct Var;

impl FieldSchema for Fixed {
    const FLAT: bool = true;
    type Ref<'a> = u64;
    type Owned = u64;

    fn to_raw(r: Self::Ref<'_>) -> RawField<'_> {
        RawField::Fixed(r)
    }

    fn from_raw<'a>(raw: RawField<'a>) -> u64 {
        match raw {
            RawField::Fixed(v) => v,
            RawField::Var(_) => unreachable!("fixed schema decoded a var field"),
        }
    }

    fn to_owned(r: u64) -> u64 {
        r
    }
}

impl FieldSchema for Var {
    const FLAT: bool = false;
    type Ref<'a> = &'a [u8];
    type Owned = Vec<u8>;

    fn to_raw(r: Self::Ref<'_>) -> RawField<'_> {
        RawField::Var(r)
    }

    fn from_raw<'a>(raw: RawField<'a>) -> &'a [u8] {
        match raw {
            RawField::Var(v) => v,
            RawField::Fixed(_) => unreachable!("var schema decoded a fixed field"),
        }
    }

    fn to_owned(r: &[u8]) -> Vec<u8> {
        r.to_vec()
    }
}

/// A key or value in transit, untyped by schema.
#[derive(Clone, Copy, Debug)]
pub enum RawField<'a> {
    Fixed(u64),
    Var(&'a [u8]),
}

impl RawField<'_> {
    pub(crate) fn hash64(&self) -> u64 {
        match *self {
            RawField::Fixed(v) => mix_u64(v),
            RawField::Var(bytes) => murmur_hash64a(bytes),
        }
    }
}

/// The four physical record encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Encoding {
    FixedFixed,
    FixedVar,
    VarFixed,
    VarVar,
}

const LEN_SIZE: usize = std::mem::size_of::<u64>();

impl Encoding {
    pub(crate) fn of(key_flat: bool, value_flat: bool) -> Self {
        match (key_flat, value_flat) {
            (true, true) => Encoding::FixedFixed,
            (true, false) => Encoding::FixedVar,
            (false, true) => Encoding::VarFixed,
            (false, false) => Encoding::VarVar,
        }
    }

    /// Inline encodings need no out-of-line record at all.
    pub(crate) fn is_inline(self) -> bool {
        matches!(self, Encoding::FixedFixed)
    }

    pub(crate) fn record_len(self, key: RawField<'_>, value: RawField<'_>) -> usize {
        match (self, key, value) {
            (Encoding::FixedFixed, ..) => 0,
            (Encoding::FixedVar, RawField::Fixed(_), RawField::Var(v)) => {
                LEN_SIZE + LEN_SIZE + v.len()
            }
            (Encoding::VarFixed, RawField::Var(k), RawField::Fixed(_)) => {
                LEN_SIZE + LEN_SIZE + k.len()
            }
            (Encoding::VarVar, RawField::Var(k), RawField::Var(v)) => {
                LEN_SIZE + LEN_SIZE + k.len() + v.len()
            }
            _ => unreachable!("field shapes disagree with the table encoding"),
        }
    }

    /// Writes the record bytes for `key`/`value` into `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must provide `record_len(key, value)` writable bytes.
    pub(crate) unsafe fn encode(self, key: RawField<'_>, value: RawField<'_>, addr: *mut u8) {
        match (self, key, value) {
            (Encoding::FixedFixed, ..) => {}
            (Encoding::FixedVar, RawField::Fixed(k), RawField::Var(v)) => {
                write_u64(addr, k);
                write_u64(addr.add(LEN_SIZE), v.len() as u64);
                ptr::copy_nonoverlapping(v.as_ptr(), addr.add(2 * LEN_SIZE), v.len());
            }
            (Encoding::VarFixed, RawField::Var(k), RawField::Fixed(v)) => {
                write_u64(addr, k.len() as u64);
                write_u64(addr.add(LEN_SIZE), v);
                ptr::copy_nonoverlapping(k.as_ptr(), addr.add(2 * LEN_SIZE), k.len());
            }
            (Encoding::VarVar, RawField::Var(k), RawField::Var(v)) => {
                write_u64(addr, k.len() as u64);
                write_u64(addr.add(LEN_SIZE), v.len() as u64);
                let body = addr.add(2 * LEN_SIZE);
                ptr::copy_nonoverlapping(k.as_ptr(), body, k.len());
                ptr::copy_nonoverlapping(v.as_ptr(), body.add(k.len()), v.len());
            }
            _ => unreachable!("field shapes disagree with the table encoding"),
        }
    }

    /// Total record size, recomputed from the record's own bytes.
    ///
    /// # Safety
    ///
    /// `addr` must point at a record previously written by `encode` with
    /// this same encoding.
    pub(crate) unsafe fn stored_size(self, addr: *const u8) -> usize {
        match self {
            Encoding::FixedFixed => 0,
            Encoding::FixedVar => 2 * LEN_SIZE + read_u64(addr.add(LEN_SIZE)) as usize,
            Encoding::VarFixed => 2 * LEN_SIZE + read_u64(addr) as usize,
            Encoding::VarVar => {
                2 * LEN_SIZE + read_u64(addr) as usize + read_u64(addr.add(LEN_SIZE)) as usize
            }
        }
    }

    /// # Safety
    ///
    /// Same contract as [`Encoding::stored_size`]; the returned borrow is
    /// valid for as long as the record storage is.
    pub(crate) unsafe fn decode_key<'a>(self, addr: *const u8) -> RawField<'a> {
        match self {
            Encoding::FixedFixed => unreachable!("inline records have no storage"),
            Encoding::FixedVar => RawField::Fixed(read_u64(addr)),
            Encoding::VarFixed => {
                let len = read_u64(addr) as usize;
                RawField::Var(std::slice::from_raw_parts(addr.add(2 * LEN_SIZE), len))
            }
            Encoding::VarVar => {
                let len = read_u64(addr) as usize;
                RawField::Var(std::slice::from_raw_parts(addr.add(2 * LEN_SIZE), len))
            }
        }
    }

    /// # Safety
    ///
    /// Same contract as [`Encoding::decode_key`].
    pub(crate) unsafe fn decode_value<'a>(self, addr: *const u8) -> RawField<'a> {
        match self {
            Encoding::FixedFixed => unreachable!("inline records have no storage"),
            Encoding::FixedVar => {
                let len = read_u64(addr.add(LEN_SIZE)) as usize;
                RawField::Var(std::slice::from_raw_parts(addr.add(2 * LEN_SIZE), len))
            }
            Encoding::VarFixed => RawField::Fixed(read_u64(addr.add(LEN_SIZE))),
            Encoding::VarVar => {
                let key_len = read_u64(addr) as usize;
                let len = read_u64(addr.add(LEN_SIZE)) as usize;
                RawField::Var(std::slice::from_raw_parts(
                    addr.add(2 * LEN_SIZE + key_len),
                    len,
                ))
            }
        }
    }
}

unsafe fn write_u64(addr: *mut u8, v: u64) {
    ptr::write_unaligned(addr.cast::<u64>(), v.to_le());
}

unsafe fn read_u64(addr: *const u8) -> u64 {
    u64::from_le(ptr::read_unaligned(addr.cast::<u64>()))
}

/// Allocates and frees out-of-line record storage through the global
/// allocator. Records are 8-aligned; the free side recomputes the layout
/// from the record bytes.
pub(crate) struct RecordStorage;

impl RecordStorage {
    const ALIGN: usize = 8;

    pub(crate) fn allocate(len: usize) -> Result<*mut u8> {
        debug_assert!(len > 0);
        let layout = Layout::from_size_align(len, Self::ALIGN)
            .map_err(|_| Error::Allocation { size: len })?;
        let addr = unsafe { alloc(layout) };
        if addr.is_null() {
            handle_alloc_error(layout);
        }
        Ok(addr)
    }

    /// # Safety
    ///
    /// `addr` must have been returned by `allocate` for a record of this
    /// encoding, and must not be freed twice.
    pub(crate) unsafe fn free(encoding: Encoding, addr: *mut u8) {
        let len = encoding.stored_size(addr);
        debug_assert!(len > 0);
        let layout = Layout::from_size_align_unchecked(len, Self::ALIGN);
        dealloc(addr, layout);
    }
}

/// Computes the slot's H1 word for a key: flat keys store themselves, var
/// keys store their full 64-bit hash.
pub(crate) fn h1_of(key: RawField<'_>, hash: u64) -> u64 {
    match key {
        RawField::Fixed(k) => k,
        RawField::Var(_) => hash,
    }
}

/// Re-derives the probing hash from a stored H1 (used by rehash, where the
/// original key bytes are not re-read).
pub(crate) fn h1_to_hash(key_flat: bool, h1: u64) -> u64 {
    if key_flat {
        mix_u64(h1)
    } else {
        h1
    }
}

/// The 16-bit tag stored in the cell's tag zone.
pub(crate) fn h2_of(hash: u64) -> u16 {
    (hash >> 16) as u16
}

/// The bucket selector comes from the top 32 bits so it stays independent
/// of the cell-index bits.
pub(crate) fn bucket_hash_of(hash: u64) -> u32 {
    (hash >> 32) as u32
}
