//! Persistent-pool capability and a DRAM-backed simulation.
//!
//! A pool hands out pool-relative offsets, never raw pointers: offsets stay
//! valid across restarts even when the pool maps at a different address.
//! Offset zero is the null offset. The pool also carries one durable root
//! offset, the anchor recovery starts from.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Pool-relative address. Zero is null.
pub type PoolOffset = u64;

/// A persistent memory pool consumed as an opaque capability.
pub trait PmemPool: Send + Sync {
    /// Current mapping address of offset zero.
    fn base(&self) -> *mut u8;

    /// Pool size in bytes.
    fn size(&self) -> usize;

    /// Allocates `len` bytes at `align`. The returned memory is zeroed.
    fn allocate(&self, len: usize, align: usize) -> Result<PoolOffset>;

    /// Returns an allocation to the pool.
    fn free(&self, offset: PoolOffset, len: usize);

    /// The durable root offset (zero when never set).
    fn root(&self) -> PoolOffset;

    fn set_root(&self, offset: PoolOffset);

    /// Resolves a non-null offset against the current mapping.
    fn resolve(&self, offset: PoolOffset) -> *mut u8 {
        debug_assert!(offset != 0 && (offset as usize) < self.size());
        unsafe { self.base().add(offset as usize) }
    }

    /// The offset a mapped address corresponds to.
    fn offset_of(&self, addr: *const u8) -> PoolOffset {
        addr as u64 - self.base() as u64
    }
}

const POOL_ALIGN: usize = 4096;
/// First usable offset; keeps offset zero meaning null.
const FIRST_OFFSET: usize = 64;

/// Heap-backed pool simulation. Bump allocation only; `free` records the
/// returned bytes but does not recycle them, which is enough for recovery
/// tests where the pool outlives the tables built over it.
pub struct MemoryPool {
    base: *mut u8,
    layout: Layout,
    cursor: Mutex<usize>,
    freed: AtomicU64,
    root: AtomicU64,
}

unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    pub fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, POOL_ALIGN)
            .map_err(|_| Error::Allocation { size })?;
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Ok(Self {
            base,
            layout,
            cursor: Mutex::new(FIRST_OFFSET),
            freed: AtomicU64::new(0),
            root: AtomicU64::new(0),
        })
    }

    /// Bytes handed back through `free` so far.
    pub fn freed_bytes(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }
}

impl PmemPool for MemoryPool {
    fn base(&self) -> *mut u8 {
        self.base
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn allocate(&self, len: usize, align: usize) -> Result<PoolOffset> {
        debug_assert!(align.is_power_of_two());
        let mut cursor = self.cursor.lock();
        let start = (*cursor + align - 1) & !(align - 1);
        let end = match start.checked_add(len) {
            Some(end) if end <= self.size() => end,
            _ => return Err(Error::Allocation { size: len }),
        };
        *cursor = end;
        Ok(start as PoolOffset)
    }

    fn free(&self, _offset: PoolOffset, len: usize) {
        self.freed.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn root(&self) -> PoolOffset {
        self.root.load(Ordering::Acquire)
    }

    fn set_root(&self, offset: PoolOffset) {
        self.root.store(offset, Ordering::Release);
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryPool, PmemPool};

    #[test]
    fn offsets_are_aligned_and_disjoint() {
        let pool = MemoryPool::new(1 << 16).unwrap();
        let a = pool.allocate(100, 8).unwrap();
        let b = pool.allocate(100, 256).unwrap();
        assert!(a != 0);
        assert_eq!(b % 256, 0);
        assert!(b >= a + 100);
        assert_eq!(pool.resolve(b) as usize % 256, 0);
    }

    #[test]
    fn allocations_are_zeroed() {
        let pool = MemoryPool::new(1 << 12).unwrap();
        let off = pool.allocate(64, 8).unwrap();
        let addr = pool.resolve(off);
        for i in 0..64 {
            assert_eq!(unsafe { *addr.add(i) }, 0);
        }
    }

    #[test]
    fn exhaustion_errors() {
        let pool = MemoryPool::new(1 << 12).unwrap();
        assert!(pool.allocate(1 << 13, 8).is_err());
    }

    #[test]
    fn root_round_trip() {
        let pool = MemoryPool::new(1 << 12).unwrap();
        assert_eq!(pool.root(), 0);
        pool.set_root(128);
        assert_eq!(pool.root(), 128);
    }

    #[test]
    fn offset_of_inverts_resolve() {
        let pool = MemoryPool::new(1 << 12).unwrap();
        let off = pool.allocate(16, 8).unwrap();
        assert_eq!(pool.offset_of(pool.resolve(off)), off);
    }
}
