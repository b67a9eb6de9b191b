//! Per-bucket descriptor word and bucket-wide slot iteration.
//!
//! Each bucket is described by one `AtomicU64`:
//!
//! ```text
//! | 48-bit cell-array address << 16 | log2(cell_count) << 8 | flags |
//! ```
//!
//! Flag bit 1 is the rehash latch; bit 0 is reserved. Packing the address
//! and the cell count into a single word lets readers take a coherent
//! snapshot of both with one `Acquire` load, and lets the rehash engine
//! publish a doubled cell array with one `Release` store.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::map::cell::{CellLayout, CellRef};
use crate::util::BitSet;

const ADDR_SHIFT: u32 = 16;
const LOG_SHIFT: u32 = 8;
const LOG_MASK: u64 = 0xFF;
const REHASH_BIT: u64 = 0b10;

/// The packed descriptor of one bucket.
pub(crate) struct BucketMeta {
    word: AtomicU64,
}

impl BucketMeta {
    pub(crate) fn empty() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    fn pack(addr: *mut u8, cell_count: u32) -> u64 {
        debug_assert!(cell_count.is_power_of_two());
        let addr = addr as u64;
        debug_assert_eq!(addr >> 48, 0, "cell-array address exceeds 48 bits");
        (addr << ADDR_SHIFT) | (u64::from(cell_count.trailing_zeros()) << LOG_SHIFT)
    }

    /// Coherent `(address, cell_count)` snapshot, `Acquire`-ordered so the
    /// pointed-to cells are visible.
    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot::from_word(self.word.load(Ordering::Acquire))
    }

    /// Installs a new cell array, clearing the rehash latch in the same
    /// store. The `Release` publishes every cell written before the swap.
    pub(crate) fn publish(&self, addr: *mut u8, cell_count: u32) {
        self.word.store(Self::pack(addr, cell_count), Ordering::Release);
    }

    /// Latches the bucket for rehash. Returns false when another thread
    /// already holds the latch.
    pub(crate) fn try_lock_rehash(&self) -> bool {
        self.word.fetch_or(REHASH_BIT, Ordering::Acquire) & REHASH_BIT == 0
    }

    /// Drops the latch without changing the cell array (the failure path;
    /// the success path clears it through [`BucketMeta::publish`]).
    pub(crate) fn unlock_rehash(&self) {
        self.word.fetch_and(!REHASH_BIT, Ordering::Release);
    }
}

/// One loaded descriptor word, decoded.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BucketSnapshot {
    addr: *mut u8,
    cell_count_log: u8,
    rehashing: bool,
}

impl BucketSnapshot {
    fn from_word(word: u64) -> Self {
        Self {
            addr: (word >> ADDR_SHIFT) as *mut u8,
            cell_count_log: ((word >> LOG_SHIFT) & LOG_MASK) as u8,
            rehashing: word & REHASH_BIT != 0,
        }
    }

    pub(crate) fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub(crate) fn cell_count(&self) -> u32 {
        1 << self.cell_count_log
    }

    pub(crate) fn cell_count_mask(&self) -> u32 {
        self.cell_count() - 1
    }

    pub(crate) fn is_rehashing(&self) -> bool {
        self.rehashing
    }

    /// True when `other` still describes the same cell array. Used by
    /// writers to detect a rehash that swapped the array between their
    /// descriptor load and their cell lock.
    pub(crate) fn same_array(&self, other: &BucketSnapshot) -> bool {
        self.addr == other.addr && self.cell_count_log == other.cell_count_log
    }

    /// # Safety
    ///
    /// The snapshot's cell array must still be live, and `index` must be
    /// below `cell_count()`.
    pub(crate) unsafe fn cell<C: CellLayout>(&self, index: u32) -> CellRef<C> {
        debug_assert!(index < self.cell_count());
        CellRef::new(self.addr.add((index as usize) << C::CELL_SHIFT))
    }
}

/// Iterates every valid (occupied, non-tombstoned) slot of one bucket,
/// cell by cell. Each cell's bitmap is snapshotted once when the iterator
/// enters it.
pub(crate) struct BucketIterator<C: CellLayout> {
    snapshot: BucketSnapshot,
    next_cell: u32,
    current: Option<(CellRef<C>, BitSet)>,
    _layout: PhantomData<C>,
}

impl<C: CellLayout> BucketIterator<C> {
    /// # Safety
    ///
    /// The snapshot's cell array must outlive the iterator.
    pub(crate) unsafe fn new(snapshot: BucketSnapshot) -> Self {
        Self {
            snapshot,
            next_cell: 0,
            current: None,
            _layout: PhantomData,
        }
    }
}

impl<C: CellLayout> Iterator for BucketIterator<C> {
    type Item = (CellRef<C>, u8);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((cell, ref mut bits)) = self.current {
                if let Some(slot) = bits.next() {
                    return Some((cell, slot));
                }
                self.current = None;
            }
            if self.next_cell >= self.snapshot.cell_count() {
                return None;
            }
            let cell = unsafe { self.snapshot.cell::<C>(self.next_cell) };
            self.next_cell += 1;
            self.current = Some((cell, cell.meta().valid_bitset()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BucketIterator, BucketMeta};
    use crate::map::cell::{make_header, Cell256, CellLayout};

    #[repr(align(256))]
    struct Arena([u8; 256 * 4]);

    #[test]
    fn snapshot_round_trip() {
        let mut arena = Box::new(Arena([0u8; 256 * 4]));
        let addr = arena.0.as_mut_ptr();

        let meta = BucketMeta::empty();
        meta.publish(addr, 4);

        let snap = meta.snapshot();
        assert_eq!(snap.addr(), addr);
        assert_eq!(snap.cell_count(), 4);
        assert_eq!(snap.cell_count_mask(), 3);
        assert!(!snap.is_rehashing());
    }

    #[test]
    fn rehash_latch() {
        let meta = BucketMeta::empty();
        assert!(meta.try_lock_rehash());
        assert!(meta.snapshot().is_rehashing());
        assert!(!meta.try_lock_rehash());

        meta.unlock_rehash();
        assert!(meta.try_lock_rehash());
    }

    #[test]
    fn publish_clears_latch() {
        let mut arena = Box::new(Arena([0u8; 256 * 4]));
        let meta = BucketMeta::empty();
        assert!(meta.try_lock_rehash());
        meta.publish(arena.0.as_mut_ptr(), 2);
        assert!(!meta.snapshot().is_rehashing());
    }

    #[test]
    fn iterates_valid_slots_across_cells() {
        let mut arena = Box::new(Arena([0u8; 256 * 4]));
        let meta = BucketMeta::empty();
        meta.publish(arena.0.as_mut_ptr(), 4);
        let snap = meta.snapshot();

        unsafe {
            // Cell 0: slots 2 and 5 valid, slot 3 tombstoned.
            let c0 = snap.cell::<Cell256>(0);
            c0.lock()
                .publish(make_header::<Cell256>(0b10_1100, 0b00_1000));
            // Cell 2: slot 15 valid.
            let c2 = snap.cell::<Cell256>(2);
            c2.lock().publish(make_header::<Cell256>(1 << 15, 0));

            let slots: Vec<(usize, u8)> = BucketIterator::<Cell256>::new(snap)
                .map(|(cell, slot)| {
                    let cell_index =
                        (cell.as_ptr() as usize - snap.addr() as usize) >> Cell256::CELL_SHIFT;
                    (cell_index, slot)
                })
                .collect();
            assert_eq!(slots, vec![(0, 2), (0, 5), (2, 15)]);
        }
    }
}
