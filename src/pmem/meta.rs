//! Double-buffered durable bucket descriptors.
//!
//! Each bucket's `(cell-array offset, cell count)` is mirrored into the
//! pool as two physical slots plus a one-byte version discriminant. A store
//! writes the slot the version byte does NOT designate, persists it, then
//! flips and persists the version byte. A crash at any point leaves the
//! version byte designating exactly one fully written slot, so recovery
//! never reads a half-updated descriptor.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::pmem::barrier::PersistentBarrier;
use crate::pmem::pool::PoolOffset;

const OFFSET_SHIFT: u32 = 16;
const LOG_SHIFT: u32 = 8;
const LOG_MASK: u64 = 0xFF;

/// The commit sequence of one descriptor store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommitPhase {
    /// Nothing written yet; the current slot is authoritative.
    Clean,
    /// The spare slot holds the new descriptor, durably. The version byte
    /// still designates the old slot.
    Staging,
    /// The version byte durably designates the new slot.
    Committed,
}

/// One bucket's durable descriptor. Lives inside the pool; all access goes
/// through atomics so the DRAM-visible side stays race-free.
#[repr(C)]
pub(crate) struct BucketMetaPmem {
    slots: [AtomicU64; 2],
    version: AtomicU8,
    _pad: [u8; 7],
}

impl BucketMetaPmem {
    fn pack(offset: PoolOffset, cell_count: u32) -> u64 {
        debug_assert!(cell_count.is_power_of_two());
        debug_assert_eq!(offset >> 48, 0, "pool offset exceeds 48 bits");
        (offset << OFFSET_SHIFT) | (u64::from(cell_count.trailing_zeros()) << LOG_SHIFT)
    }

    fn current(&self) -> usize {
        (self.version.load(Ordering::Acquire) & 1) as usize
    }

    /// Commits a new `(offset, cell_count)` descriptor through the
    /// Clean -> Staging -> Committed sequence.
    pub(crate) fn store<B: PersistentBarrier>(
        &self,
        offset: PoolOffset,
        cell_count: u32,
        barrier: &B,
    ) {
        let current = self.current();
        let spare = current ^ 1;

        let mut phase = CommitPhase::Clean;
        loop {
            match phase {
                CommitPhase::Clean => {
                    self.slots[spare].store(Self::pack(offset, cell_count), Ordering::Relaxed);
                    barrier.persist(&self.slots[spare] as *const AtomicU64 as *const u8, 8);
                    phase = CommitPhase::Staging;
                }
                CommitPhase::Staging => {
                    self.version.store(spare as u8, Ordering::Release);
                    barrier.persist(&self.version as *const AtomicU8 as *const u8, 1);
                    phase = CommitPhase::Committed;
                }
                CommitPhase::Committed => break,
            }
        }
    }

    /// Reads the descriptor the version byte designates. Returns `None`
    /// when the designated slot was never written.
    pub(crate) fn extract(&self) -> Option<(PoolOffset, u32)> {
        let word = self.slots[self.current()].load(Ordering::Acquire);
        let offset = word >> OFFSET_SHIFT;
        if offset == 0 {
            return None;
        }
        Some((offset, 1 << ((word >> LOG_SHIFT) & LOG_MASK)))
    }
}

#[cfg(test)]
mod tests {
    use super::BucketMetaPmem;
    use crate::pmem::barrier::{CountingBarrier, NoopBarrier};
    use std::sync::atomic::{AtomicU64, AtomicU8};

    fn fresh() -> BucketMetaPmem {
        BucketMetaPmem {
            slots: [AtomicU64::new(0), AtomicU64::new(0)],
            version: AtomicU8::new(0),
            _pad: [0; 7],
        }
    }

    #[test]
    fn empty_extracts_none() {
        assert_eq!(fresh().extract(), None);
    }

    #[test]
    fn store_flips_between_slots() {
        let meta = fresh();
        meta.store(0x1000, 4, &NoopBarrier);
        assert_eq!(meta.extract(), Some((0x1000, 4)));

        meta.store(0x2000, 8, &NoopBarrier);
        assert_eq!(meta.extract(), Some((0x2000, 8)));

        meta.store(0x3000, 16, &NoopBarrier);
        assert_eq!(meta.extract(), Some((0x3000, 16)));
    }

    #[test]
    fn store_is_two_persist_steps() {
        let meta = fresh();
        let barrier = CountingBarrier::new();
        meta.store(0x4000, 2, &barrier);
        // One persist for the spare slot, one for the version byte.
        assert_eq!(barrier.flushes(), 2);
        assert_eq!(barrier.fences(), 2);
    }

    #[test]
    fn old_slot_survives_until_commit() {
        // A store interrupted after staging must leave the old descriptor
        // readable: the spare slot never aliases the designated one.
        let meta = fresh();
        meta.store(0x1000, 4, &NoopBarrier);
        let designated = meta.slots[meta.current()].load(std::sync::atomic::Ordering::Relaxed);

        // Simulate the Staging phase of the next store by hand.
        let spare = meta.current() ^ 1;
        meta.slots[spare].store(
            BucketMetaPmem::pack(0x2000, 8),
            std::sync::atomic::Ordering::Relaxed,
        );

        // Version byte unchanged, so extract still sees the old value.
        assert_eq!(
            meta.slots[meta.current()].load(std::sync::atomic::Ordering::Relaxed),
            designated
        );
        assert_eq!(meta.extract(), Some((0x1000, 4)));
    }
}
