//! Fixed-size cell metadata: header word, per-slot tags, and tag matching.
//!
//! A cell is a raw, cache-line-sized block inside a bucket's arena:
//!
//! ```text
//! | header | tag zone (2-byte H2 per slot) | slot zone (16 bytes per slot) |
//! ```
//!
//! The header word packs, from the least significant bit up: the cell lock
//! bit, the occupancy bitmap, and (in its upper half) the delete bitmap.
//! The first one or two 16-byte slot positions are covered by the metadata
//! itself, so data slots start at [`CellLayout::START_SLOT`].
//!
//! All mutation of a cell's tags and slots happens with the lock bit held.
//! Readers never lock; they rely on the writer publishing the occupancy bit
//! with a `Release` store ordered after the tag and slot writes, and on
//! re-validating the header version after copying a record out.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use crate::util::BitSet;

/// One of the two fixed cell geometries (128 or 256 bytes).
///
/// The constants mirror each other: `OCC_MASK` selects the occupancy bits of
/// the header, and the same mask shifted by `DELETE_SHIFT` selects the
/// delete bitmap. Bit 0 is always the lock.
pub trait CellLayout: 'static {
    /// Cell size in bytes. Power of two.
    const CELL_SIZE: usize;
    /// `log2(CELL_SIZE)`.
    const CELL_SHIFT: u32;
    /// First usable slot index (lower slots hold the metadata).
    const START_SLOT: u8;
    /// Last usable slot index, inclusive.
    const LAST_SLOT: u8;
    /// Number of usable slots.
    const SLOT_COUNT: u32;
    /// Occupancy bitmap mask within the header word.
    const OCC_MASK: u32;
    /// Left shift of the delete bitmap within the header word.
    const DELETE_SHIFT: u32;

    #[doc(hidden)]
    unsafe fn load_header(cell: *const u8, order: Ordering) -> u32;
    #[doc(hidden)]
    unsafe fn store_header(cell: *mut u8, value: u32, order: Ordering);
    #[doc(hidden)]
    unsafe fn header_fetch_or(cell: *mut u8, bits: u32, order: Ordering) -> u32;
    #[doc(hidden)]
    unsafe fn header_fetch_and(cell: *mut u8, bits: u32, order: Ordering) -> u32;
}

/// 256-byte cell: 4-byte header, 14 data slots (indexes 2..=15), one of
/// which stays in reserve so an update always has a landing slot.
pub struct Cell256;

/// 128-byte cell: 2-byte header, 7 data slots (indexes 1..=7).
pub struct Cell128;

impl CellLayout for Cell256 {
    const CELL_SIZE: usize = 256;
    const CELL_SHIFT: u32 = 8;
    const START_SLOT: u8 = 2;
    const LAST_SLOT: u8 = 15;
    const SLOT_COUNT: u32 = 14;
    const OCC_MASK: u32 = 0xFFFC;
    const DELETE_SHIFT: u32 = 16;

    unsafe fn load_header(cell: *const u8, order: Ordering) -> u32 {
        (*cell.cast::<AtomicU32>()).load(order)
    }

    unsafe fn store_header(cell: *mut u8, value: u32, order: Ordering) {
        (*cell.cast::<AtomicU32>()).store(value, order);
    }

    unsafe fn header_fetch_or(cell: *mut u8, bits: u32, order: Ordering) -> u32 {
        (*cell.cast::<AtomicU32>()).fetch_or(bits, order)
    }

    unsafe fn header_fetch_and(cell: *mut u8, bits: u32, order: Ordering) -> u32 {
        (*cell.cast::<AtomicU32>()).fetch_and(bits, order)
    }
}

impl CellLayout for Cell128 {
    const CELL_SIZE: usize = 128;
    const CELL_SHIFT: u32 = 7;
    const START_SLOT: u8 = 1;
    const LAST_SLOT: u8 = 7;
    const SLOT_COUNT: u32 = 7;
    const OCC_MASK: u32 = 0xFE;
    const DELETE_SHIFT: u32 = 8;

    unsafe fn load_header(cell: *const u8, order: Ordering) -> u32 {
        u32::from((*cell.cast::<AtomicU16>()).load(order))
    }

    unsafe fn store_header(cell: *mut u8, value: u32, order: Ordering) {
        debug_assert!(value <= u32::from(u16::MAX));
        (*cell.cast::<AtomicU16>()).store(value as u16, order);
    }

    unsafe fn header_fetch_or(cell: *mut u8, bits: u32, order: Ordering) -> u32 {
        u32::from((*cell.cast::<AtomicU16>()).fetch_or(bits as u16, order))
    }

    unsafe fn header_fetch_and(cell: *mut u8, bits: u32, order: Ordering) -> u32 {
        u32::from((*cell.cast::<AtomicU16>()).fetch_and(bits as u16, order))
    }
}

/// Bit 0 of the header word.
pub(crate) const LOCK_BIT: u32 = 1;

const SLOT_SHIFT: u32 = 4;

/// A decoded snapshot of one cell's header, taken with a single `Acquire`
/// load. All derived bitsets are views of this snapshot; concurrent writers
/// may move on, which readers tolerate through version re-validation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CellMeta<C: CellLayout> {
    occupancy: u32,
    deleted: u32,
    _layout: PhantomData<C>,
}

impl<C: CellLayout> CellMeta<C> {
    /// # Safety
    ///
    /// `cell` must point at a live, `C::CELL_SIZE`-byte cell.
    pub(crate) unsafe fn load(cell: *const u8) -> Self {
        let header = C::load_header(cell, Ordering::Acquire);
        Self::from_header(header)
    }

    pub(crate) fn from_header(header: u32) -> Self {
        Self {
            occupancy: header & C::OCC_MASK,
            deleted: (header >> C::DELETE_SHIFT) & C::OCC_MASK,
            _layout: PhantomData,
        }
    }

    /// Slots whose tag equals `mask` candidates: tag-equality AND occupied
    /// AND not deleted. Tag collisions are expected; the caller must still
    /// compare the full key.
    pub(crate) fn match_bitset(&self, tag_eq_mask: u32) -> BitSet {
        BitSet::new(tag_eq_mask & self.occupancy & !self.deleted & C::OCC_MASK)
    }

    /// Slots with no live or tombstoned record.
    pub(crate) fn empty_bitset(&self) -> BitSet {
        BitSet::new(!self.occupancy & C::OCC_MASK)
    }

    /// Occupied slots carrying a tombstone, reusable by insertion.
    pub(crate) fn erased_bitset(&self) -> BitSet {
        BitSet::new(self.deleted & C::OCC_MASK)
    }

    /// Occupied, non-tombstoned slots.
    pub(crate) fn valid_bitset(&self) -> BitSet {
        BitSet::new(self.occupancy & !self.deleted & C::OCC_MASK)
    }

    pub(crate) fn is_occupied(&self, slot: u8) -> bool {
        self.occupancy & (1 << slot) != 0
    }

    pub(crate) fn is_deleted(&self, slot: u8) -> bool {
        self.deleted & (1 << slot) != 0
    }

    /// One slot is always reserved, so "full" is `SLOT_COUNT - 1` occupied.
    pub(crate) fn is_full(&self) -> bool {
        self.occupancy.count_ones() >= C::SLOT_COUNT - 1
    }

    pub(crate) fn occupied_count(&self) -> u32 {
        self.occupancy.count_ones()
    }

    /// Both bitmaps, lock bit excluded. Changes whenever any slot's
    /// visibility changes, which is what read-side validation needs.
    pub(crate) fn version(&self) -> u32 {
        self.occupancy | (self.deleted << C::DELETE_SHIFT)
    }

    pub(crate) fn occupancy_bits(&self) -> u32 {
        self.occupancy
    }

    pub(crate) fn deleted_bits(&self) -> u32 {
        self.deleted
    }
}

/// Loads the version bits of a cell without building a full snapshot.
///
/// # Safety
///
/// `cell` must point at a live cell.
pub(crate) unsafe fn load_version<C: CellLayout>(cell: *const u8) -> u32 {
    let header = C::load_header(cell, Ordering::Acquire);
    (header & C::OCC_MASK) | (header & (C::OCC_MASK << C::DELETE_SHIFT))
}

/// Builds the header word a writer publishes: bitmaps with the lock bit
/// cleared.
pub(crate) fn make_header<C: CellLayout>(occupancy: u32, deleted: u32) -> u32 {
    debug_assert_eq!(occupancy & !C::OCC_MASK, 0);
    debug_assert_eq!(deleted & !C::OCC_MASK, 0);
    occupancy | (deleted << C::DELETE_SHIFT)
}

/// Scoped ownership of a cell's lock bit.
///
/// Dropping the guard releases the bit with a `fetch_and(Release)`;
/// [`CellLockGuard::publish`] instead folds the release into the single
/// header store that makes the writer's slot mutation visible.
pub(crate) struct CellLockGuard<C: CellLayout> {
    cell: *mut u8,
    _layout: PhantomData<C>,
}

impl<C: CellLayout> CellLockGuard<C> {
    /// Spin-acquires the cell lock.
    ///
    /// # Safety
    ///
    /// `cell` must point at a live cell that outlives the guard.
    pub(crate) unsafe fn acquire(cell: *mut u8) -> Self {
        let backoff = Backoff::new();
        loop {
            if C::header_fetch_or(cell, LOCK_BIT, Ordering::Acquire) & LOCK_BIT == 0 {
                return Self {
                    cell,
                    _layout: PhantomData,
                };
            }
            while C::load_header(cell, Ordering::Relaxed) & LOCK_BIT != 0 {
                backoff.snooze();
            }
        }
    }

    /// Re-reads the header under the lock.
    pub(crate) fn meta(&self) -> CellMeta<C> {
        let header = unsafe { C::load_header(self.cell, Ordering::Acquire) };
        CellMeta::from_header(header)
    }

    /// Stores `header` (lock bit must be clear) with `Release`, publishing
    /// every tag/slot write made under the lock and unlocking in one store.
    pub(crate) fn publish(self, header: u32) {
        debug_assert_eq!(header & LOCK_BIT, 0);
        unsafe { C::store_header(self.cell, header, Ordering::Release) };
        std::mem::forget(self);
    }
}

impl<C: CellLayout> Drop for CellLockGuard<C> {
    fn drop(&mut self) {
        unsafe { C::header_fetch_and(self.cell, !LOCK_BIT, Ordering::Release) };
    }
}

/// Raw accessors for the tag and slot zones. All take a slot index and
/// check it against the layout's usable range.
pub(crate) struct CellRef<C: CellLayout> {
    cell: *mut u8,
    _layout: PhantomData<C>,
}

impl<C: CellLayout> Clone for CellRef<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: CellLayout> Copy for CellRef<C> {}

impl<C: CellLayout> CellRef<C> {
    /// # Safety
    ///
    /// `cell` must point at a live, aligned `C::CELL_SIZE`-byte cell.
    pub(crate) unsafe fn new(cell: *mut u8) -> Self {
        debug_assert!(!cell.is_null());
        debug_assert_eq!(cell as usize & (C::CELL_SIZE - 1), 0);
        Self {
            cell,
            _layout: PhantomData,
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.cell
    }

    pub(crate) fn meta(&self) -> CellMeta<C> {
        unsafe { CellMeta::load(self.cell) }
    }

    pub(crate) fn version(&self) -> u32 {
        unsafe { load_version::<C>(self.cell) }
    }

    pub(crate) fn lock(&self) -> CellLockGuard<C> {
        unsafe { CellLockGuard::acquire(self.cell) }
    }

    fn check_slot(slot: u8) {
        debug_assert!(
            slot >= C::START_SLOT && slot <= C::LAST_SLOT,
            "slot index {slot} outside usable range {}..={}",
            C::START_SLOT,
            C::LAST_SLOT
        );
    }

    fn tag_atom(&self, slot: u8) -> &AtomicU16 {
        Self::check_slot(slot);
        unsafe { &*self.cell.add(2 * slot as usize).cast::<AtomicU16>() }
    }

    pub(crate) fn load_tag(&self, slot: u8) -> u16 {
        self.tag_atom(slot).load(Ordering::Relaxed)
    }

    /// Must only be called with the cell lock held.
    pub(crate) fn store_tag(&self, slot: u8, tag: u16) {
        self.tag_atom(slot).store(tag, Ordering::Relaxed);
    }

    fn slot_atoms(&self, slot: u8) -> (&AtomicU64, &AtomicU64) {
        Self::check_slot(slot);
        unsafe {
            let base = self.cell.add((slot as usize) << SLOT_SHIFT);
            (
                &*base.cast::<AtomicU64>(),
                &*base.add(8).cast::<AtomicU64>(),
            )
        }
    }

    /// Reads `(h1, entry)`. Safe to call without the lock: visibility of a
    /// coherent pair is guaranteed by the header `Acquire`/`Release`
    /// protocol plus version re-validation.
    pub(crate) fn load_slot(&self, slot: u8) -> (u64, u64) {
        let (h1, entry) = self.slot_atoms(slot);
        (h1.load(Ordering::Relaxed), entry.load(Ordering::Relaxed))
    }

    /// Must only be called with the cell lock held.
    pub(crate) fn store_slot(&self, slot: u8, h1: u64, entry: u64) {
        let (a, b) = self.slot_atoms(slot);
        a.store(h1, Ordering::Relaxed);
        b.store(entry, Ordering::Relaxed);
    }

    /// Tag-equality bitmask for `needle` across every slot position.
    ///
    /// Non-data lanes (the metadata slots) may report spurious matches;
    /// callers mask with the occupancy bitmap, which has no bits there.
    pub(crate) fn match_tags(&self, needle: u16) -> u32 {
        match_tags_raw::<C>(self.cell, needle)
    }
}

#[cfg(target_arch = "x86_64")]
fn match_tags_raw<C: CellLayout>(cell: *const u8, needle: u16) -> u32 {
    // SSE2 is part of the x86_64 baseline. The vector load races with tag
    // stores made under the cell lock; any torn lane is filtered by the
    // caller's occupancy mask and version re-validation, the same contract
    // as the scalar path.
    use std::arch::x86_64::{_mm_cmpeq_epi16, _mm_loadu_si128, _mm_movemask_epi8, _mm_set1_epi16};

    unsafe {
        let needle_vec = _mm_set1_epi16(needle as i16);
        let mut mask: u32 = 0;
        let mut lane_base = 0u32;
        let mut offset = 0usize;
        while offset < (C::LAST_SLOT as usize + 1) * 2 {
            let lanes = _mm_loadu_si128(cell.add(offset).cast());
            let eq = _mm_cmpeq_epi16(lanes, needle_vec);
            let bytes = _mm_movemask_epi8(eq) as u32;
            // Each 16-bit lane contributes two identical byte-mask bits;
            // keep one per lane.
            let mut compact = 0u32;
            for lane in 0..8 {
                if bytes & (1 << (2 * lane)) != 0 {
                    compact |= 1 << lane;
                }
            }
            mask |= compact << lane_base;
            lane_base += 8;
            offset += 16;
        }
        mask
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn match_tags_raw<C: CellLayout>(cell: *const u8, needle: u16) -> u32 {
    let mut mask = 0u32;
    for slot in C::START_SLOT..=C::LAST_SLOT {
        let tag = unsafe { &*cell.add(2 * slot as usize).cast::<AtomicU16>() };
        if tag.load(Ordering::Relaxed) == needle {
            mask |= 1 << slot;
        }
    }
    mask
}
