//! Bump-pointer allocation of cell arrays from large, recyclable blocks.
//!
//! A [`MemBlock`] is one large aligned allocation sliced into cell arrays on
//! demand. Blocks are reference-counted per carve; when the last bucket
//! carved from a block releases it, the block's bump pointer resets and the
//! block returns to a free deque for reuse. Rehashing therefore recycles
//! memory instead of round-tripping through the system allocator.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::collections::{HashMap, VecDeque};
use std::ptr;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Identifies the block a cell array was carved from, so the bucket can
/// release it after rehash.
pub(crate) type BlockId = u32;

pub(crate) struct MemBlock {
    start: *mut u8,
    layout: Layout,
    cell_size: usize,
    size_cells: usize,
    used_cells: usize,
    refs: u32,
    id: BlockId,
}

// The raw pointer is owned by the block; blocks only move between the
// allocator's containers under its mutex.
unsafe impl Send for MemBlock {}

impl MemBlock {
    fn new(id: BlockId, cell_size: usize, size_cells: usize) -> Result<Self> {
        let bytes = cell_size * size_cells;
        let layout = Layout::from_size_align(bytes, cell_size)
            .map_err(|_| Error::Allocation { size: bytes })?;
        let start = unsafe { alloc_zeroed(layout) };
        if start.is_null() {
            handle_alloc_error(layout);
        }
        Ok(Self {
            start,
            layout,
            cell_size,
            size_cells,
            used_cells: 0,
            refs: 0,
            id,
        })
    }

    fn remaining(&self) -> usize {
        self.size_cells - self.used_cells
    }

    /// Carves `count` zeroed cells. Returns `None` when the block cannot fit
    /// them; the caller pulls a fresh block instead.
    fn allocate(&mut self, count: usize) -> Option<*mut u8> {
        if count > self.remaining() {
            return None;
        }
        let addr = unsafe { self.start.add(self.used_cells * self.cell_size) };
        self.used_cells += count;
        self.refs += 1;
        // Recycled blocks carry stale bytes from their previous life.
        unsafe { ptr::write_bytes(addr, 0, count * self.cell_size) };
        Some(addr)
    }

    /// Drops one carve reference. Returns true when the block became free
    /// and its bump pointer was reset.
    fn release(&mut self) -> bool {
        debug_assert!(self.refs > 0);
        self.refs -= 1;
        if self.refs == 0 {
            self.used_cells = 0;
            true
        } else {
            false
        }
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.start, self.layout) };
    }
}

struct AllocatorInner {
    free: VecDeque<BlockId>,
    blocks: HashMap<BlockId, MemBlock>,
    current: Option<BlockId>,
    next_id: BlockId,
}

/// Thread-safe cell-array allocator over a pool of [`MemBlock`]s.
///
/// The shared path takes the internal lock per call. Call sites that hold
/// exclusive access (table construction) go through [`MemAllocator::get_mut`]
/// and skip the lock.
pub(crate) struct MemAllocator {
    inner: Mutex<AllocatorInner>,
    cell_size: usize,
    block_cells: usize,
}

impl MemAllocator {
    pub(crate) fn new(cell_size: usize, block_cells: usize) -> Self {
        debug_assert!(cell_size.is_power_of_two());
        debug_assert!(block_cells > 0);
        Self {
            inner: Mutex::new(AllocatorInner {
                free: VecDeque::new(),
                blocks: HashMap::new(),
                current: None,
                next_id: 0,
            }),
            cell_size,
            block_cells,
        }
    }

    /// Carves an array of `count` zeroed cells, pulling or creating a new
    /// block when the current one runs out.
    pub(crate) fn allocate(&self, count: usize) -> Result<(BlockId, *mut u8)> {
        let mut inner = self.inner.lock();
        self.allocate_inner(&mut inner, count)
    }

    /// Caller-synchronized variant for construction-time bulk carving.
    pub(crate) fn allocate_mut(&mut self, count: usize) -> Result<(BlockId, *mut u8)> {
        let inner = self.inner.get_mut();
        let cell_size = self.cell_size;
        let block_cells = self.block_cells;
        Self::allocate_locked(inner, cell_size, block_cells, count)
    }

    fn allocate_inner(&self, inner: &mut AllocatorInner, count: usize) -> Result<(BlockId, *mut u8)> {
        Self::allocate_locked(inner, self.cell_size, self.block_cells, count)
    }

    fn allocate_locked(
        inner: &mut AllocatorInner,
        cell_size: usize,
        block_cells: usize,
        count: usize,
    ) -> Result<(BlockId, *mut u8)> {
        if let Some(id) = inner.current {
            if let Some(block) = inner.blocks.get_mut(&id) {
                if let Some(addr) = block.allocate(count) {
                    return Ok((id, addr));
                }
            }
        }

        // The current block is exhausted (or missing). Reuse a free block
        // that fits, else create one.
        let want = count.max(block_cells);
        let reusable = inner
            .free
            .iter()
            .position(|id| inner.blocks[id].size_cells >= count);
        let id = match reusable.and_then(|pos| inner.free.remove(pos)) {
            Some(id) => id,
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                log::debug!(
                    "adding mem block {id}: {} cells ({} bytes)",
                    want,
                    want * cell_size
                );
                let block = MemBlock::new(id, cell_size, want)?;
                inner.blocks.insert(id, block);
                id
            }
        };
        inner.current = Some(id);

        let addr = inner
            .blocks
            .get_mut(&id)
            .and_then(|block| block.allocate(count))
            .ok_or(Error::Allocation {
                size: count * cell_size,
            })?;
        Ok((id, addr))
    }

    /// Drops one carve reference on `id`, recycling the block when it hits
    /// zero. Safe to call from epoch-deferred destructors.
    pub(crate) fn release(&self, id: BlockId) {
        let mut inner = self.inner.lock();
        let freed = match inner.blocks.get_mut(&id) {
            Some(block) => block.release(),
            None => {
                debug_assert!(false, "release of unknown block {id}");
                return;
            }
        };
        if freed && inner.current != Some(id) {
            inner.free.push_back(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemAllocator;

    #[test]
    fn carves_are_disjoint_and_zeroed() {
        let alloc = MemAllocator::new(256, 64);
        let (id_a, a) = alloc.allocate(4).unwrap();
        let (id_b, b) = alloc.allocate(4).unwrap();
        assert_eq!(id_a, id_b);
        assert_eq!(unsafe { b.offset_from(a) }, 4 * 256);
        for i in 0..4 * 256 {
            assert_eq!(unsafe { *a.add(i) }, 0);
        }
    }

    #[test]
    fn new_block_when_exhausted() {
        let alloc = MemAllocator::new(128, 8);
        let (id_a, _) = alloc.allocate(6).unwrap();
        let (id_b, _) = alloc.allocate(6).unwrap();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn oversized_request_gets_dedicated_block() {
        let alloc = MemAllocator::new(128, 8);
        let (_, addr) = alloc.allocate(32).unwrap();
        assert!(!addr.is_null());
    }

    #[test]
    fn release_recycles() {
        let alloc = MemAllocator::new(128, 8);
        let (id_a, _) = alloc.allocate(8).unwrap();

        // Exhausted; the next carve opens block B.
        let (id_b, _) = alloc.allocate(8).unwrap();
        assert_ne!(id_a, id_b);

        // Freeing A fully puts it back on the free deque; exhausting B then
        // reuses A instead of growing the pool.
        alloc.release(id_a);
        let (id_c, addr) = alloc.allocate(8).unwrap();
        assert_eq!(id_c, id_a);
        // Recycled memory is re-zeroed.
        for i in 0..8 * 128 {
            assert_eq!(unsafe { *addr.add(i) }, 0);
        }
    }

    #[test]
    fn refcount_tracks_carves() {
        let alloc = MemAllocator::new(128, 16);
        let (id, _) = alloc.allocate(4).unwrap();
        let (id2, _) = alloc.allocate(4).unwrap();
        assert_eq!(id, id2);
        alloc.release(id);
        // Still one carve outstanding; block must not be recycled while the
        // current block, nor handed out as free.
        alloc.release(id);
    }
}
