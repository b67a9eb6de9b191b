//! The concurrent hash table core: probing, slot claiming, deletion, and
//! per-bucket incremental rehash.
//!
//! Writers coordinate through per-cell lock bits; readers never lock and
//! rely on the header publish ordering plus version re-validation. A bucket
//! grows by doubling its private cell array and swapping its descriptor
//! word, so growth never takes a table-wide lock.
//!
//! Writer protocol: lock the target cell, then re-load the bucket
//! descriptor. If the rehash latch is set or the cell array was swapped,
//! the write is abandoned and the whole operation restarts against the new
//! array. The rehash engine sets the latch first and then locks each old
//! cell once while copying it, so a writer that passed validation finishes
//! before its cell is migrated.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Guard};
use crossbeam_utils::{Backoff, CachePadded};
use smallvec::{smallvec, SmallVec};

use crate::error::{Error, Result};
use crate::map::alloc::MemAllocator;
use crate::map::bucket::{BucketIterator, BucketMeta, BucketSnapshot};
use crate::map::cell::{make_header, Cell256, CellLayout, CellRef};
use crate::map::probe::ProbeWithinBucket;
use crate::map::record::{
    bucket_hash_of, h1_of, h1_to_hash, h2_of, Encoding, FieldSchema, RawField, RecordStorage,
};
use crate::util::{strict_assert, Slice};

/// Cells a new block can hold; blocks are 4 MiB.
const BLOCK_BYTES: usize = 4 << 20;

/// A segmented, SIMD-filtered concurrent hash table.
///
/// `K` and `V` pick the field schemas ([`crate::Fixed`] or [`crate::Var`]);
/// `C` picks the cell geometry and defaults to the 256-byte cell.
///
/// # Examples
///
/// ```
/// use turbo_hash::{Fixed, HashTable, Var};
///
/// let table = HashTable::<Fixed, Var>::new(16, 4)?;
/// table.put(7, b"seven")?;
/// assert_eq!(table.get(7), Some(b"seven".to_vec()));
/// assert!(table.delete(7));
/// assert_eq!(table.get(7), None);
/// # Ok::<(), turbo_hash::Error>(())
/// ```
pub struct HashTable<K: FieldSchema, V: FieldSchema, C: CellLayout = Cell256> {
    buckets: Box<[BucketMeta]>,
    /// Block each bucket's current cell array was carved from.
    block_ids: Box<[AtomicU32]>,
    bucket_mask: u32,
    allocator: Arc<MemAllocator>,
    size: CachePadded<AtomicUsize>,
    capacity: AtomicUsize,
    encoding: Encoding,
    _schema: PhantomData<(K, V, C)>,
}

// The raw cell-array pointers inside `BucketMeta` are managed exclusively
// through the atomic protocols above.
unsafe impl<K: FieldSchema, V: FieldSchema, C: CellLayout> Send for HashTable<K, V, C> {}
unsafe impl<K: FieldSchema, V: FieldSchema, C: CellLayout> Sync for HashTable<K, V, C> {}

/// Everything derived from one key, computed once per operation.
#[derive(Clone, Copy)]
struct KeyCtx<'a> {
    raw: RawField<'a>,
    hash: u64,
    h1: u64,
    h2: u16,
    bucket: usize,
}

/// Where an insert scan landed.
enum ScanOutcome {
    /// The key exists at this slot; a put becomes a backup-slot update.
    Exists {
        cell_index: u32,
        slot: u8,
        version: u32,
    },
    /// A free (empty or tombstoned) slot to claim for a new key.
    Claim {
        cell_index: u32,
        slot: u8,
        version: u32,
    },
    /// Every probed cell was full with no reusable tombstone.
    Exhausted,
}

impl<K: FieldSchema, V: FieldSchema, C: CellLayout> HashTable<K, V, C> {
    /// Creates a table of `bucket_count` buckets, each starting with
    /// `cell_count` cells. Both must be non-zero powers of two.
    pub fn new(bucket_count: usize, cell_count: usize) -> Result<Self> {
        let valid = |n: usize| n != 0 && n.is_power_of_two() && n <= u32::MAX as usize;
        if !valid(bucket_count) || !valid(cell_count) {
            return Err(Error::Config {
                bucket_count,
                cell_count,
            });
        }

        let block_cells = (BLOCK_BYTES / C::CELL_SIZE).max(cell_count);
        let mut allocator = MemAllocator::new(C::CELL_SIZE, block_cells);

        let mut buckets = Vec::with_capacity(bucket_count);
        let mut block_ids = Vec::with_capacity(bucket_count);
        for _ in 0..bucket_count {
            let (id, addr) = allocator.allocate_mut(cell_count)?;
            let meta = BucketMeta::empty();
            meta.publish(addr, cell_count as u32);
            buckets.push(meta);
            block_ids.push(AtomicU32::new(id));
        }

        let slots_per_cell = (C::SLOT_COUNT - 1) as usize;
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            block_ids: block_ids.into_boxed_slice(),
            bucket_mask: (bucket_count - 1) as u32,
            allocator: Arc::new(allocator),
            size: CachePadded::new(AtomicUsize::new(0)),
            capacity: AtomicUsize::new(bucket_count * cell_count * slots_per_cell),
            encoding: Encoding::of(K::FLAT, V::FLAT),
            _schema: PhantomData,
        })
    }

    fn key_ctx<'a>(&self, raw: RawField<'a>) -> KeyCtx<'a> {
        let hash = raw.hash64();
        KeyCtx {
            raw,
            hash,
            h1: h1_of(raw, hash),
            h2: h2_of(hash),
            bucket: (bucket_hash_of(hash) & self.bucket_mask) as usize,
        }
    }

    /// Inserts or updates `key`. An update writes the new record into a
    /// backup slot of the same cell and flips both occupancy bits in one
    /// header store, so readers see either the old or the new value, never
    /// a mix.
    pub fn put(&self, key: K::Ref<'_>, value: V::Ref<'_>) -> Result<()> {
        let ctx = self.key_ctx(K::to_raw(key));
        let raw_value = V::to_raw(value);
        let guard = epoch::pin();
        let backoff = Backoff::new();
        let mut rehashed = false;

        loop {
            let snap = self.buckets[ctx.bucket].snapshot();
            if snap.is_rehashing() {
                backoff.snooze();
                continue;
            }
            match unsafe { self.scan_for_insert(&snap, &ctx) } {
                ScanOutcome::Exists {
                    cell_index,
                    slot,
                    version,
                } => {
                    if unsafe {
                        self.update_slot(&snap, &ctx, raw_value, cell_index, slot, version, &guard)
                    }? {
                        return Ok(());
                    }
                }
                ScanOutcome::Claim {
                    cell_index,
                    slot,
                    version,
                } => {
                    if unsafe {
                        self.claim_slot(&snap, &ctx, raw_value, cell_index, slot, version, &guard)
                    }? {
                        return Ok(());
                    }
                }
                ScanOutcome::Exhausted => {
                    if rehashed {
                        return Err(Error::TableFull {
                            bucket: ctx.bucket as u32,
                        });
                    }
                    self.rehash_bucket(ctx.bucket, &guard)?;
                    rehashed = true;
                    continue;
                }
            }
            // A writer or rehash got in the way; rescan.
            backoff.spin();
        }
    }

    /// Returns a copy of the value stored under `key`.
    pub fn get(&self, key: K::Ref<'_>) -> Option<V::Owned> {
        self.find_with(key, |v| V::to_owned(v))
    }

    /// Runs `f` over a borrowed view of the value stored under `key`,
    /// without copying the record out.
    pub fn find_with<R>(&self, key: K::Ref<'_>, f: impl FnOnce(V::Ref<'_>) -> R) -> Option<R> {
        let ctx = self.key_ctx(K::to_raw(key));
        let _guard = epoch::pin();
        let snap = self.buckets[ctx.bucket].snapshot();
        let (.., entry) = unsafe { self.find_in_bucket(&snap, &ctx) }?;
        let raw = unsafe { self.value_raw(entry) };
        Some(f(V::from_raw(raw)))
    }

    pub fn contains_key(&self, key: K::Ref<'_>) -> bool {
        self.find_with(key, |_| ()).is_some()
    }

    /// Tombstones `key`. The slot's occupancy bit stays set until the
    /// bucket's next rehash; only the delete bit flips. Returns whether the
    /// key was present.
    pub fn delete(&self, key: K::Ref<'_>) -> bool {
        let ctx = self.key_ctx(K::to_raw(key));
        let guard = epoch::pin();
        let backoff = Backoff::new();

        loop {
            let snap = self.buckets[ctx.bucket].snapshot();
            if snap.is_rehashing() {
                backoff.snooze();
                continue;
            }
            let (cell_index, slot, version, _) = match unsafe { self.find_in_bucket(&snap, &ctx) }
            {
                Some(found) => found,
                None => return false,
            };

            let cell = unsafe { snap.cell::<C>(cell_index) };
            let lock = cell.lock();
            if !self.bucket_unchanged(ctx.bucket, &snap) {
                drop(lock);
                backoff.spin();
                continue;
            }
            let meta = lock.meta();
            if meta.version() != version {
                drop(lock);
                backoff.spin();
                continue;
            }

            let (_, entry) = cell.load_slot(slot);
            lock.publish(make_header::<C>(
                meta.occupancy_bits(),
                meta.deleted_bits() | 1 << slot,
            ));
            self.size.fetch_sub(1, Ordering::Relaxed);
            unsafe { self.defer_free_entry(entry, &guard) };
            return true;
        }
    }

    /// Live entries, as a relaxed estimate.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Claimable slots across all buckets at their current cell counts.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn load_factor(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Doubles every bucket's cell array, partitioning the buckets across
    /// scoped worker threads. Returns the number of entries migrated.
    pub fn minor_rehash_all(&self) -> Result<usize> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(self.buckets.len());
        let per_worker = (self.buckets.len() + workers - 1) / workers;

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for chunk_start in (0..self.buckets.len()).step_by(per_worker) {
                let chunk = chunk_start..(chunk_start + per_worker).min(self.buckets.len());
                handles.push(scope.spawn(move || {
                    let guard = epoch::pin();
                    let mut moved = 0;
                    for bucket in chunk {
                        moved += self.rehash_bucket(bucket, &guard)?;
                    }
                    Ok::<usize, Error>(moved)
                }));
            }

            let mut moved = 0;
            for handle in handles {
                match handle.join() {
                    Ok(result) => moved += result?,
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
            Ok(moved)
        })
    }

    /// Doubles one bucket's cell array and migrates its live slots,
    /// dropping tombstones. If another thread holds the rehash latch this
    /// waits for it and reports zero migrations; the bucket grew either
    /// way.
    fn rehash_bucket(&self, bucket: usize, guard: &Guard) -> Result<usize> {
        let meta = &self.buckets[bucket];
        if !meta.try_lock_rehash() {
            let backoff = Backoff::new();
            while meta.snapshot().is_rehashing() {
                backoff.snooze();
            }
            return Ok(0);
        }

        let old = meta.snapshot();
        let new_count = old.cell_count() * 2;
        let (new_id, new_addr) = match self.allocator.allocate(new_count as usize) {
            Ok(carve) => carve,
            Err(e) => {
                meta.unlock_rehash();
                return Err(e);
            }
        };

        log::debug!(
            "rehashing bucket {bucket}: {} -> {} cells",
            old.cell_count(),
            new_count
        );

        match unsafe { repack_bucket::<K, C>(bucket, &old, new_addr, new_count) } {
            Ok(moved) => {
                let old_id = self.block_ids[bucket].swap(new_id, Ordering::Relaxed);
                meta.publish(new_addr, new_count);
                self.capacity.fetch_add(
                    old.cell_count() as usize * (C::SLOT_COUNT - 1) as usize,
                    Ordering::Relaxed,
                );
                let allocator = Arc::clone(&self.allocator);
                // Readers pinned before the publish may still probe the old
                // array; its block is released only after they unpin.
                unsafe { guard.defer_unchecked(move || allocator.release(old_id)) };
                Ok(moved)
            }
            Err(e) => {
                self.allocator.release(new_id);
                meta.unlock_rehash();
                Err(e)
            }
        }
    }

    /// Probes for `key`, classifying the bucket for an insert.
    ///
    /// # Safety
    ///
    /// The snapshot's cell array must be live (epoch guard pinned).
    unsafe fn scan_for_insert(&self, snap: &BucketSnapshot, ctx: &KeyCtx<'_>) -> ScanOutcome {
        let mut candidate: Option<(u32, u8, u32)> = None;

        for cell_index in ProbeWithinBucket::new(ctx.hash, snap.cell_count_mask()) {
            let cell = snap.cell::<C>(cell_index);
            let meta = cell.meta();
            let version = meta.version();

            for slot in meta.match_bitset(cell.match_tags(ctx.h2)) {
                let (h1, entry) = cell.load_slot(slot);
                if self.key_matches(ctx, h1, entry) {
                    return ScanOutcome::Exists {
                        cell_index,
                        slot,
                        version,
                    };
                }
            }

            // Tombstones are preferred over fresh slots so the bucket's
            // empty reserve is preserved.
            if candidate.is_none() {
                if let Some(slot) = meta.erased_bitset().first() {
                    candidate = Some((cell_index, slot, version));
                }
            }

            if !meta.is_full() {
                if candidate.is_none() {
                    if let Some(slot) = meta.empty_bitset().first() {
                        candidate = Some((cell_index, slot, version));
                    }
                }
                // The key cannot live past the first not-full cell, so the
                // scan is complete.
                break;
            }
        }

        match candidate {
            Some((cell_index, slot, version)) => ScanOutcome::Claim {
                cell_index,
                slot,
                version,
            },
            None => ScanOutcome::Exhausted,
        }
    }

    /// Lock-free probe. Returns `(cell_index, slot, version, entry)` of the
    /// matched slot, validated against the cell version after the slot pair
    /// was read.
    ///
    /// # Safety
    ///
    /// The snapshot's cell array must be live (epoch guard pinned).
    unsafe fn find_in_bucket(
        &self,
        snap: &BucketSnapshot,
        ctx: &KeyCtx<'_>,
    ) -> Option<(u32, u8, u32, u64)> {
        for cell_index in ProbeWithinBucket::new(ctx.hash, snap.cell_count_mask()) {
            let cell = snap.cell::<C>(cell_index);
            'rescan: loop {
                let meta = cell.meta();
                for slot in meta.match_bitset(cell.match_tags(ctx.h2)) {
                    let (h1, entry) = cell.load_slot(slot);
                    if !self.key_matches(ctx, h1, entry) {
                        continue;
                    }
                    if cell.version() != meta.version() {
                        // The slot pair may be torn by a concurrent claim.
                        continue 'rescan;
                    }
                    return Some((cell_index, slot, meta.version(), entry));
                }
                // Delete never clears occupancy bits, so a not-full cell is
                // an exact (not heuristic) end of the key's probe path.
                if !meta.is_full() {
                    return None;
                }
                break;
            }
        }
        None
    }

    /// Claims a scanned free slot under the cell lock. Returns false when
    /// validation failed and the caller must rescan.
    ///
    /// # Safety
    ///
    /// The snapshot's cell array must be live (epoch guard pinned).
    #[allow(clippy::too_many_arguments)]
    unsafe fn claim_slot(
        &self,
        snap: &BucketSnapshot,
        ctx: &KeyCtx<'_>,
        value: RawField<'_>,
        cell_index: u32,
        slot: u8,
        version: u32,
        _guard: &Guard,
    ) -> Result<bool> {
        let cell = snap.cell::<C>(cell_index);
        let lock = cell.lock();
        if !self.bucket_unchanged(ctx.bucket, snap) {
            return Ok(false);
        }
        let meta = lock.meta();
        if meta.version() != version {
            return Ok(false);
        }

        let entry = self.make_entry(ctx.raw, value)?;
        cell.store_slot(slot, ctx.h1, entry);
        cell.store_tag(slot, ctx.h2);
        lock.publish(make_header::<C>(
            meta.occupancy_bits() | 1 << slot,
            meta.deleted_bits() & !(1 << slot),
        ));
        self.size.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Updates an existing key by writing the new record into a backup slot
    /// of the same cell. Returns false when validation failed.
    ///
    /// # Safety
    ///
    /// The snapshot's cell array must be live (epoch guard pinned).
    #[allow(clippy::too_many_arguments)]
    unsafe fn update_slot(
        &self,
        snap: &BucketSnapshot,
        ctx: &KeyCtx<'_>,
        value: RawField<'_>,
        cell_index: u32,
        slot: u8,
        version: u32,
        guard: &Guard,
    ) -> Result<bool> {
        let cell = snap.cell::<C>(cell_index);
        let lock = cell.lock();
        if !self.bucket_unchanged(ctx.bucket, snap) {
            return Ok(false);
        }
        let meta = lock.meta();
        if meta.version() != version {
            return Ok(false);
        }

        // The reserve guarantees a landing slot: occupancy never exceeds
        // SLOT_COUNT - 1.
        strict_assert!(meta.occupied_count() <= C::SLOT_COUNT - 1);
        let backup = match meta
            .erased_bitset()
            .first()
            .or_else(|| meta.empty_bitset().first())
        {
            Some(s) => s,
            None => return Ok(false),
        };

        let (_, old_entry) = cell.load_slot(slot);
        let entry = self.make_entry(ctx.raw, value)?;
        cell.store_slot(backup, ctx.h1, entry);
        cell.store_tag(backup, ctx.h2);

        // One store retires the old slot and publishes the new one.
        let occupancy = (meta.occupancy_bits() | 1 << backup) & !(1 << slot);
        let deleted = meta.deleted_bits() & !(1 << backup) & !(1 << slot);
        lock.publish(make_header::<C>(occupancy, deleted));

        self.defer_free_entry(old_entry, guard);
        Ok(true)
    }

    fn bucket_unchanged(&self, bucket: usize, seen: &BucketSnapshot) -> bool {
        let now = self.buckets[bucket].snapshot();
        !now.is_rehashing() && now.same_array(seen)
    }

    /// Full key comparison behind the tag filter. For flat keys H1 equality
    /// is the comparison; var keys re-read their bytes from the record.
    ///
    /// # Safety
    ///
    /// `entry` must be protected by a pinned epoch guard.
    unsafe fn key_matches(&self, ctx: &KeyCtx<'_>, h1: u64, entry: u64) -> bool {
        if h1 != ctx.h1 {
            return false;
        }
        if K::FLAT {
            return true;
        }
        // H1 is the var key's 64-bit hash; collisions require a byte
        // comparison against the stored record.
        let record = entry as *const u8;
        if record.is_null() {
            return false;
        }
        match (ctx.raw, self.encoding.decode_key(record)) {
            (RawField::Var(a), RawField::Var(b)) => Slice::new(a) == Slice::new(b),
            _ => false,
        }
    }

    /// # Safety
    ///
    /// Non-inline entries must be protected by a pinned epoch guard.
    unsafe fn value_raw<'a>(&self, entry: u64) -> RawField<'a> {
        if self.encoding.is_inline() {
            RawField::Fixed(entry)
        } else {
            self.encoding.decode_value(entry as *const u8)
        }
    }

    /// Builds the slot entry word: the inline value itself, or a pointer to
    /// a freshly encoded out-of-line record.
    fn make_entry(&self, key: RawField<'_>, value: RawField<'_>) -> Result<u64> {
        if self.encoding.is_inline() {
            return match value {
                RawField::Fixed(v) => Ok(v),
                RawField::Var(_) => unreachable!("inline table with var value"),
            };
        }
        let len = self.encoding.record_len(key, value);
        let addr = RecordStorage::allocate(len)?;
        unsafe { self.encoding.encode(key, value, addr) };
        Ok(addr as u64)
    }

    /// # Safety
    ///
    /// `entry` must be unlinked from every slot before the deferred free
    /// runs, and freed at most once.
    unsafe fn defer_free_entry(&self, entry: u64, guard: &Guard) {
        if self.encoding.is_inline() || entry == 0 {
            return;
        }
        let encoding = self.encoding;
        let record = entry as *mut u8;
        guard.defer_unchecked(move || RecordStorage::free(encoding, record));
    }
}

/// Copies every live slot of `old` into `new_addr`, repacking cell by cell
/// with a next-free-slot vector. Old cells are locked one at a time and
/// never mutated; tombstones are dropped. Shared by the DRAM and
/// persistent-memory rehash paths.
///
/// # Safety
///
/// The bucket's rehash latch must be held, and `new_addr` must be a
/// private, zeroed array of `new_count` cells.
pub(crate) unsafe fn repack_bucket<K: FieldSchema, C: CellLayout>(
    bucket: usize,
    old: &BucketSnapshot,
    new_addr: *mut u8,
    new_count: u32,
) -> Result<usize> {
    let new_mask = new_count - 1;
    let mut next_slot: SmallVec<[u8; 64]> = smallvec![C::START_SLOT; new_count as usize];
    let mut moved = 0usize;

    for cell_index in 0..old.cell_count() {
        let cell = old.cell::<C>(cell_index);
        let lock = cell.lock();
        let meta = lock.meta();
        for slot in meta.valid_bitset() {
            let (h1, entry) = cell.load_slot(slot);
            let hash = h1_to_hash(K::FLAT, h1);

            let mut placed = false;
            for target in ProbeWithinBucket::new(hash, new_mask) {
                let next = next_slot[target as usize];
                // New cells also keep one slot in reserve.
                if u32::from(next - C::START_SLOT) >= C::SLOT_COUNT - 1 {
                    continue;
                }
                let new_cell = CellRef::<C>::new(new_addr.add((target as usize) << C::CELL_SHIFT));
                new_cell.store_slot(next, h1, entry);
                new_cell.store_tag(next, h2_of(hash));
                next_slot[target as usize] = next + 1;
                placed = true;
                break;
            }
            if !placed {
                // Degenerate hashing: even the doubled array cannot host
                // this slot within the probe bound.
                return Err(Error::TableFull {
                    bucket: bucket as u32,
                });
            }
            moved += 1;
        }
        drop(lock);
    }

    // Publish each new cell's occupancy in one header word; the bucket
    // descriptor swap releases all of them together.
    for target in 0..new_count {
        let next = next_slot[target as usize];
        if next == C::START_SLOT {
            continue;
        }
        let occupancy = ((1u32 << next) - 1) & !((1u32 << C::START_SLOT) - 1);
        strict_assert!(occupancy & !C::OCC_MASK == 0);
        let cell_ptr = new_addr.add((target as usize) << C::CELL_SHIFT);
        C::store_header(cell_ptr, make_header::<C>(occupancy, 0), Ordering::Relaxed);
    }

    Ok(moved)
}

impl<K: FieldSchema, V: FieldSchema, C: CellLayout> Drop for HashTable<K, V, C> {
    fn drop(&mut self) {
        // Tombstoned and replaced records were already handed to the epoch;
        // only records still reachable from live slots remain.
        if self.encoding.is_inline() {
            return;
        }
        for meta in self.buckets.iter() {
            let snap = meta.snapshot();
            unsafe {
                for (cell, slot) in BucketIterator::<C>::new(snap) {
                    let (_, entry) = cell.load_slot(slot);
                    if entry != 0 {
                        RecordStorage::free(self.encoding, entry as *mut u8);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HashTable;
    use crate::error::Error;
    use crate::map::cell::Cell128;
    use crate::map::record::{Fixed, Var};

    #[test]
    fn put_get_fixed_fixed() {
        let table = HashTable::<Fixed, Fixed>::new(8, 4).unwrap();
        for k in 0..200u64 {
            table.put(k, k * 3).unwrap();
        }
        for k in 0..200u64 {
            assert_eq!(table.get(k), Some(k * 3), "key {k}");
        }
        assert_eq!(table.get(12345), None);
        assert_eq!(table.size(), 200);
    }

    #[test]
    fn update_keeps_single_live_entry() {
        let table = HashTable::<Fixed, Fixed>::new(2, 4).unwrap();
        table.put(9, 1).unwrap();
        table.put(9, 2).unwrap();
        table.put(9, 3).unwrap();
        assert_eq!(table.get(9), Some(3));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn delete_then_reinsert() {
        let table = HashTable::<Fixed, Fixed>::new(4, 4).unwrap();
        table.put(5, 50).unwrap();
        assert!(table.delete(5));
        assert!(!table.delete(5));
        assert_eq!(table.get(5), None);
        assert_eq!(table.size(), 0);

        table.put(5, 51).unwrap();
        assert_eq!(table.get(5), Some(51));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn var_var_round_trip() {
        let table = HashTable::<Var, Var>::new(8, 4).unwrap();
        table.put(b"alpha", b"one").unwrap();
        table.put(b"beta", b"two").unwrap();
        assert_eq!(table.get(b"alpha"), Some(b"one".to_vec()));
        assert_eq!(table.get(b"beta"), Some(b"two".to_vec()));
        assert_eq!(table.get(b"gamma"), None);

        table.put(b"alpha", b"uno").unwrap();
        assert_eq!(table.get(b"alpha"), Some(b"uno".to_vec()));
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn mixed_encodings() {
        let fv = HashTable::<Fixed, Var>::new(4, 4).unwrap();
        fv.put(1, b"payload").unwrap();
        assert_eq!(fv.get(1), Some(b"payload".to_vec()));

        let vf = HashTable::<Var, Fixed>::new(4, 4).unwrap();
        vf.put(b"key", 77).unwrap();
        assert_eq!(vf.get(b"key"), Some(77));
        assert!(vf.contains_key(b"key"));
        assert!(!vf.contains_key(b"other"));
    }

    #[test]
    fn find_with_borrows_value() {
        let table = HashTable::<Fixed, Var>::new(4, 4).unwrap();
        table.put(3, b"abcdef").unwrap();
        let len = table.find_with(3, |v| v.len());
        assert_eq!(len, Some(6));
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(matches!(
            HashTable::<Fixed, Fixed>::new(3, 4),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            HashTable::<Fixed, Fixed>::new(4, 0),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn capacity_and_load_factor() {
        let table = HashTable::<Fixed, Fixed>::new(2, 4).unwrap();
        // 2 buckets x 4 cells x 13 claimable slots.
        assert_eq!(table.capacity(), 2 * 4 * 13);
        for k in 0..50u64 {
            table.put(k, k).unwrap();
        }
        let expected = 50.0 / table.capacity() as f64;
        assert!((table.load_factor() - expected).abs() < 1e-9);
    }

    #[test]
    fn rehash_all_preserves_entries_and_doubles_capacity() {
        let table = HashTable::<Fixed, Fixed>::new(2, 4).unwrap();
        for k in 0..100u64 {
            table.put(k, k + 1000).unwrap();
        }
        let before = table.capacity();
        table.minor_rehash_all().unwrap();
        assert_eq!(table.capacity(), before * 2);
        for k in 0..100u64 {
            assert_eq!(table.get(k), Some(k + 1000), "key {k} after rehash");
        }
        assert_eq!(table.size(), 100);
    }

    #[test]
    fn rehash_reclaims_tombstones() {
        let table = HashTable::<Fixed, Fixed>::new(2, 4).unwrap();
        for k in 0..60u64 {
            table.put(k, k).unwrap();
        }
        for k in 0..30u64 {
            assert!(table.delete(k));
        }
        table.minor_rehash_all().unwrap();
        for k in 0..30u64 {
            assert_eq!(table.get(k), None);
        }
        for k in 30..60u64 {
            assert_eq!(table.get(k), Some(k));
        }
        assert_eq!(table.size(), 30);
    }

    #[test]
    fn cell128_layout_works_end_to_end() {
        let table = HashTable::<Fixed, Fixed, Cell128>::new(4, 4).unwrap();
        for k in 0..50u64 {
            table.put(k, !k).unwrap();
        }
        for k in 0..50u64 {
            assert_eq!(table.get(k), Some(!k));
        }
        // 4 buckets x 4 cells x 6 claimable slots.
        assert_eq!(table.capacity(), 4 * 4 * 6);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let table = HashTable::<Fixed, Fixed>::new(2, 1).unwrap();
        // Far beyond 2 x 1 x 13 slots; rehash must kick in repeatedly.
        for k in 0..300u64 {
            table.put(k, k).unwrap();
        }
        for k in 0..300u64 {
            assert_eq!(table.get(k), Some(k), "key {k}");
        }
    }
}
