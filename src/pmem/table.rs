//! The persistent-memory hash table variant.
//!
//! Same probing and cell-lock core as the DRAM table, but cells and
//! out-of-line records are carved from a [`PmemPool`], slot entries hold
//! pool offsets instead of pointers, and every mutation follows the
//! durability order
//!
//! ```text
//! payload -> flush+fence -> tag -> flush+fence -> occupancy -> flush+fence
//! ```
//!
//! so a crash between any two steps can only leak unreachable storage,
//! never surface a slot whose tag and payload disagree. Bucket descriptors
//! are additionally mirrored into the pool as double-buffered
//! [`BucketMetaPmem`] records; [`PmemHashTable::recover`] rebuilds the DRAM
//! mirror from them after a restart.

use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Guard};
use crossbeam_utils::{Backoff, CachePadded};

use crate::error::{Error, Result};
use crate::map::bucket::{BucketIterator, BucketMeta, BucketSnapshot};
use crate::map::cell::{make_header, Cell256, CellLayout, CellRef};
use crate::map::probe::ProbeWithinBucket;
use crate::map::record::{
    bucket_hash_of, h1_of, h2_of, Encoding, FieldSchema, RawField,
};
use crate::map::table::repack_bucket;
use crate::pmem::barrier::PersistentBarrier;
use crate::pmem::meta::BucketMetaPmem;
use crate::pmem::pool::{PmemPool, PoolOffset};
use crate::util::Slice;

const ROOT_MAGIC: u64 = 0x5455_5242_4f48_5348; // "TURBOHSH"

/// Durable table descriptor at the pool root. The per-bucket
/// [`BucketMetaPmem`] array follows it immediately.
#[repr(C)]
struct RootHeader {
    magic: AtomicU64,
    bucket_count: AtomicU64,
    /// Key/value schema flags and the cell geometry, so recovery rejects a
    /// pool written by a differently instantiated table.
    geometry: AtomicU64,
}

const ROOT_HEADER_LEN: usize = size_of::<RootHeader>();
const META_LEN: usize = size_of::<BucketMetaPmem>();

fn geometry_word(key_flat: bool, value_flat: bool, cell_shift: u32) -> u64 {
    u64::from(key_flat) | (u64::from(value_flat) << 1) | (u64::from(cell_shift) << 8)
}

/// A crash-consistent hash table over a persistent pool.
///
/// `P` supplies pool-relative allocation and the durable root; `B` supplies
/// the flush/fence primitives. Both are capabilities the engine consumes,
/// not reimplementations of persistent-memory plumbing.
pub struct PmemHashTable<K, V, C = Cell256, P = crate::pmem::pool::MemoryPool, B = crate::pmem::barrier::NoopBarrier>
where
    K: FieldSchema,
    V: FieldSchema,
    C: CellLayout,
    P: PmemPool,
    B: PersistentBarrier,
{
    pool: Arc<P>,
    barrier: B,
    /// DRAM mirror; addresses resolve into the pool's current mapping.
    buckets: Box<[BucketMeta]>,
    bucket_mask: u32,
    /// Offset of the first durable bucket descriptor.
    metas_offset: PoolOffset,
    size: CachePadded<AtomicUsize>,
    capacity: AtomicUsize,
    encoding: Encoding,
    _schema: PhantomData<(K, V, C)>,
}

unsafe impl<K, V, C, P, B> Send for PmemHashTable<K, V, C, P, B>
where
    K: FieldSchema,
    V: FieldSchema,
    C: CellLayout,
    P: PmemPool,
    B: PersistentBarrier,
{
}
unsafe impl<K, V, C, P, B> Sync for PmemHashTable<K, V, C, P, B>
where
    K: FieldSchema,
    V: FieldSchema,
    C: CellLayout,
    P: PmemPool,
    B: PersistentBarrier,
{
}

#[derive(Clone, Copy)]
struct KeyCtx<'a> {
    raw: RawField<'a>,
    hash: u64,
    h1: u64,
    h2: u16,
    bucket: usize,
}

enum ScanOutcome {
    Exists {
        cell_index: u32,
        slot: u8,
        version: u32,
    },
    Claim {
        cell_index: u32,
        slot: u8,
        version: u32,
    },
    Exhausted,
}

impl<K, V, C, P, B> PmemHashTable<K, V, C, P, B>
where
    K: FieldSchema,
    V: FieldSchema,
    C: CellLayout,
    P: PmemPool,
    B: PersistentBarrier,
{
    /// Creates a fresh table inside `pool` and anchors it at the pool root.
    pub fn initialize(
        pool: Arc<P>,
        barrier: B,
        bucket_count: usize,
        cell_count: usize,
    ) -> Result<Self> {
        let valid = |n: usize| n != 0 && n.is_power_of_two() && n <= u32::MAX as usize;
        if !valid(bucket_count) || !valid(cell_count) {
            return Err(Error::Config {
                bucket_count,
                cell_count,
            });
        }

        let root_len = ROOT_HEADER_LEN + bucket_count * META_LEN;
        let root_offset = pool.allocate(root_len, 8)?;
        let metas_offset = root_offset + ROOT_HEADER_LEN as u64;

        let header = unsafe { &*pool.resolve(root_offset).cast::<RootHeader>() };
        header.magic.store(ROOT_MAGIC, Ordering::Relaxed);
        header
            .bucket_count
            .store(bucket_count as u64, Ordering::Relaxed);
        header.geometry.store(
            geometry_word(K::FLAT, V::FLAT, C::CELL_SHIFT),
            Ordering::Relaxed,
        );
        barrier.persist(pool.resolve(root_offset), ROOT_HEADER_LEN);

        let mut buckets = Vec::with_capacity(bucket_count);
        for bucket in 0..bucket_count {
            let cells_len = cell_count * C::CELL_SIZE;
            let cells_offset = pool.allocate(cells_len, C::CELL_SIZE)?;
            let addr = pool.resolve(cells_offset);
            barrier.persist(addr, cells_len);

            let durable = unsafe {
                &*pool
                    .resolve(metas_offset + (bucket * META_LEN) as u64)
                    .cast::<BucketMetaPmem>()
            };
            durable.store(cells_offset, cell_count as u32, &barrier);

            let meta = BucketMeta::empty();
            meta.publish(addr, cell_count as u32);
            buckets.push(meta);
        }

        pool.set_root(root_offset);

        let slots_per_cell = (C::SLOT_COUNT - 1) as usize;
        Ok(Self {
            pool,
            barrier,
            buckets: buckets.into_boxed_slice(),
            bucket_mask: (bucket_count - 1) as u32,
            metas_offset,
            size: CachePadded::new(AtomicUsize::new(0)),
            capacity: AtomicUsize::new(bucket_count * cell_count * slots_per_cell),
            encoding: Encoding::of(K::FLAT, V::FLAT),
            _schema: PhantomData,
        })
    }

    /// Rebuilds the DRAM mirror from the pool's durable descriptors after a
    /// restart. The live-entry count is recomputed by scanning occupancy
    /// bitmaps.
    pub fn recover(pool: Arc<P>, barrier: B) -> Result<Self> {
        let root_offset = pool.root();
        if root_offset == 0 {
            return Err(Error::Recovery {
                reason: "pool has no root descriptor",
            });
        }

        let header = unsafe { &*pool.resolve(root_offset).cast::<RootHeader>() };
        if header.magic.load(Ordering::Acquire) != ROOT_MAGIC {
            return Err(Error::Recovery {
                reason: "root magic mismatch",
            });
        }
        if header.geometry.load(Ordering::Acquire)
            != geometry_word(K::FLAT, V::FLAT, C::CELL_SHIFT)
        {
            return Err(Error::Recovery {
                reason: "table geometry does not match this instantiation",
            });
        }
        let bucket_count = header.bucket_count.load(Ordering::Acquire) as usize;
        if bucket_count == 0 || !bucket_count.is_power_of_two() {
            return Err(Error::Recovery {
                reason: "corrupt bucket count",
            });
        }

        let metas_offset = root_offset + ROOT_HEADER_LEN as u64;
        let mut buckets = Vec::with_capacity(bucket_count);
        let mut capacity = 0usize;
        let mut size = 0usize;
        for bucket in 0..bucket_count {
            let durable = unsafe {
                &*pool
                    .resolve(metas_offset + (bucket * META_LEN) as u64)
                    .cast::<BucketMetaPmem>()
            };
            let (cells_offset, cell_count) = durable.extract().ok_or(Error::Recovery {
                reason: "bucket descriptor missing",
            })?;

            let meta = BucketMeta::empty();
            meta.publish(pool.resolve(cells_offset), cell_count);
            capacity += cell_count as usize * (C::SLOT_COUNT - 1) as usize;
            size += unsafe { BucketIterator::<C>::new(meta.snapshot()) }.count();
            buckets.push(meta);
        }

        log::info!("recovered {bucket_count} buckets, {size} live entries");

        Ok(Self {
            pool,
            barrier,
            buckets: buckets.into_boxed_slice(),
            bucket_mask: (bucket_count - 1) as u32,
            metas_offset,
            size: CachePadded::new(AtomicUsize::new(size)),
            capacity: AtomicUsize::new(capacity),
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

    /// Inserts or updates `key` with the full durability ordering.
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
                        self.claim_slot(&snap, &ctx, raw_value, cell_index, slot, version)
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
            backoff.spin();
        }
    }

    pub fn get(&self, key: K::Ref<'_>) -> Option<V::Owned> {
        self.find_with(key, |v| V::to_owned(v))
    }

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

    /// Tombstones `key` and persists the delete bit.
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
            let (cell_index, slot, version, entry) =
                match unsafe { self.find_in_bucket(&snap, &ctx) } {
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

            lock.publish(make_header::<C>(
                meta.occupancy_bits(),
                meta.deleted_bits() | 1 << slot,
            ));
            self.barrier.persist(cell.as_ptr(), size_of::<u32>());
            self.size.fetch_sub(1, Ordering::Relaxed);
            unsafe { self.defer_free_entry(entry, &guard) };
            return true;
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn load_factor(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }

    /// Doubles every bucket, as the DRAM variant does, committing each new
    /// descriptor durably before the DRAM mirror swaps.
    pub fn minor_rehash_all(&self) -> Result<usize> {
        let guard = epoch::pin();
        let mut moved = 0;
        for bucket in 0..self.buckets.len() {
            moved += self.rehash_bucket(bucket, &guard)?;
        }
        Ok(moved)
    }

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
        let new_len = new_count as usize * C::CELL_SIZE;
        let new_offset = match self.pool.allocate(new_len, C::CELL_SIZE) {
            Ok(offset) => offset,
            Err(e) => {
                meta.unlock_rehash();
                return Err(e);
            }
        };
        let new_addr = self.pool.resolve(new_offset);

        log::debug!(
            "rehashing pmem bucket {bucket}: {} -> {} cells",
            old.cell_count(),
            new_count
        );

        match unsafe { repack_bucket::<K, C>(bucket, &old, new_addr, new_count) } {
            Ok(moved) => {
                // The whole new array must be durable before the durable
                // descriptor designates it.
                self.barrier.persist(new_addr, new_len);
                self.durable_meta(bucket)
                    .store(new_offset, new_count, &self.barrier);
                meta.publish(new_addr, new_count);
                self.capacity.fetch_add(
                    old.cell_count() as usize * (C::SLOT_COUNT - 1) as usize,
                    Ordering::Relaxed,
                );

                let pool = Arc::clone(&self.pool);
                let old_offset = self.pool.offset_of(old.addr());
                let old_len = old.cell_count() as usize * C::CELL_SIZE;
                unsafe { guard.defer_unchecked(move || pool.free(old_offset, old_len)) };
                Ok(moved)
            }
            Err(e) => {
                self.pool.free(new_offset, new_len);
                meta.unlock_rehash();
                Err(e)
            }
        }
    }

    fn durable_meta(&self, bucket: usize) -> &BucketMetaPmem {
        unsafe {
            &*self
                .pool
                .resolve(self.metas_offset + (bucket * META_LEN) as u64)
                .cast::<BucketMetaPmem>()
        }
    }

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
                        continue 'rescan;
                    }
                    return Some((cell_index, slot, meta.version(), entry));
                }
                if !meta.is_full() {
                    return None;
                }
                break;
            }
        }
        None
    }

    /// # Safety
    ///
    /// The snapshot's cell array must be live (epoch guard pinned).
    unsafe fn claim_slot(
        &self,
        snap: &BucketSnapshot,
        ctx: &KeyCtx<'_>,
        value: RawField<'_>,
        cell_index: u32,
        slot: u8,
        version: u32,
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

        self.stage_slot(cell, slot, ctx, value)?;
        lock.publish(make_header::<C>(
            meta.occupancy_bits() | 1 << slot,
            meta.deleted_bits() & !(1 << slot),
        ));
        self.barrier.persist(cell.as_ptr(), size_of::<u32>());
        self.size.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

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

        let backup = match meta
            .erased_bitset()
            .first()
            .or_else(|| meta.empty_bitset().first())
        {
            Some(s) => s,
            None => return Ok(false),
        };

        let (_, old_entry) = cell.load_slot(slot);
        self.stage_slot(cell, backup, ctx, value)?;

        let occupancy = (meta.occupancy_bits() | 1 << backup) & !(1 << slot);
        let deleted = meta.deleted_bits() & !(1 << backup) & !(1 << slot);
        lock.publish(make_header::<C>(occupancy, deleted));
        self.barrier.persist(cell.as_ptr(), size_of::<u32>());

        self.defer_free_entry(old_entry, guard);
        Ok(true)
    }

    /// Writes and persists a slot's payload and tag, stopping short of the
    /// occupancy publish. The durability order's first two steps.
    ///
    /// # Safety
    ///
    /// The cell lock must be held.
    unsafe fn stage_slot(
        &self,
        cell: CellRef<C>,
        slot: u8,
        ctx: &KeyCtx<'_>,
        value: RawField<'_>,
    ) -> Result<()> {
        let entry = self.make_entry(ctx.raw, value)?;
        cell.store_slot(slot, ctx.h1, entry);
        self.barrier
            .persist(cell.as_ptr().add((slot as usize) << 4), 16);
        cell.store_tag(slot, ctx.h2);
        self.barrier.persist(cell.as_ptr().add(2 * slot as usize), 2);
        Ok(())
    }

    fn bucket_unchanged(&self, bucket: usize, seen: &BucketSnapshot) -> bool {
        let now = self.buckets[bucket].snapshot();
        !now.is_rehashing() && now.same_array(seen)
    }

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
        if entry == 0 {
            return false;
        }
        let record = self.pool.resolve(entry) as *const u8;
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
            self.encoding.decode_value(self.pool.resolve(entry))
        }
    }

    /// Encodes and persists an out-of-line record, returning its offset;
    /// inline values pass through.
    fn make_entry(&self, key: RawField<'_>, value: RawField<'_>) -> Result<u64> {
        if self.encoding.is_inline() {
            return match value {
                RawField::Fixed(v) => Ok(v),
                RawField::Var(_) => unreachable!("inline table with var value"),
            };
        }
        let len = self.encoding.record_len(key, value);
        let offset = self.pool.allocate(len, 8)?;
        let addr = self.pool.resolve(offset);
        unsafe { self.encoding.encode(key, value, addr) };
        self.barrier.persist(addr, len);
        Ok(offset)
    }

    /// # Safety
    ///
    /// `entry` must be unlinked from every slot before the deferred free
    /// runs, and freed at most once.
    unsafe fn defer_free_entry(&self, entry: u64, guard: &Guard) {
        if self.encoding.is_inline() || entry == 0 {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let encoding = self.encoding;
        guard.defer_unchecked(move || {
            let addr = pool.resolve(entry);
            let len = encoding.stored_size(addr);
            pool.free(entry, len);
        });
    }

    /// Stages a slot (payload and tag persisted) and then abandons the
    /// insert before the occupancy publish, modeling a crash between the
    /// durability order's second and third steps.
    #[cfg(test)]
    fn put_interrupted_before_publish(&self, key: K::Ref<'_>, value: V::Ref<'_>) -> Result<()> {
        let ctx = self.key_ctx(K::to_raw(key));
        let raw_value = V::to_raw(value);
        let _guard = epoch::pin();
        let snap = self.buckets[ctx.bucket].snapshot();
        match unsafe { self.scan_for_insert(&snap, &ctx) } {
            ScanOutcome::Claim { cell_index, slot, .. } => {
                let cell = unsafe { snap.cell::<C>(cell_index) };
                let lock = cell.lock();
                unsafe { self.stage_slot(cell, slot, &ctx, raw_value) }?;
                // Dropping the guard clears only the lock bit; the
                // occupancy bitmap never learns about the slot.
                drop(lock);
                Ok(())
            }
            _ => Err(Error::TableFull {
                bucket: ctx.bucket as u32,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PmemHashTable;
    use crate::map::record::{Fixed, Var};
    use crate::pmem::barrier::{CountingBarrier, NoopBarrier};
    use crate::pmem::pool::MemoryPool;
    use std::sync::Arc;

    fn pool(bytes: usize) -> Arc<MemoryPool> {
        Arc::new(MemoryPool::new(bytes).unwrap())
    }

    #[test]
    fn put_get_delete() {
        let pool = pool(1 << 22);
        let table =
            PmemHashTable::<Fixed, Fixed>::initialize(pool, NoopBarrier, 4, 4).unwrap();
        for k in 0..100u64 {
            table.put(k, k * 7).unwrap();
        }
        for k in 0..100u64 {
            assert_eq!(table.get(k), Some(k * 7));
        }
        assert!(table.delete(50));
        assert_eq!(table.get(50), None);
        assert_eq!(table.size(), 99);
    }

    #[test]
    fn recover_sees_all_entries() {
        let pool = pool(1 << 22);
        {
            let table = PmemHashTable::<Fixed, Var>::initialize(
                Arc::clone(&pool),
                NoopBarrier,
                4,
                4,
            )
            .unwrap();
            for k in 0..80u64 {
                table.put(k, format!("value-{k}").as_bytes()).unwrap();
            }
            assert!(table.delete(13));
        }

        let table = PmemHashTable::<Fixed, Var>::recover(pool, NoopBarrier).unwrap();
        assert_eq!(table.size(), 79);
        for k in 0..80u64 {
            if k == 13 {
                assert_eq!(table.get(k), None);
            } else {
                assert_eq!(table.get(k), Some(format!("value-{k}").into_bytes()));
            }
        }
    }

    #[test]
    fn recover_after_rehash() {
        let pool = pool(1 << 23);
        {
            let table = PmemHashTable::<Fixed, Fixed>::initialize(
                Arc::clone(&pool),
                NoopBarrier,
                2,
                2,
            )
            .unwrap();
            for k in 0..200u64 {
                table.put(k, !k).unwrap();
            }
            table.minor_rehash_all().unwrap();
        }

        let table = PmemHashTable::<Fixed, Fixed>::recover(pool, NoopBarrier).unwrap();
        assert_eq!(table.size(), 200);
        for k in 0..200u64 {
            assert_eq!(table.get(k), Some(!k));
        }
    }

    #[test]
    fn recover_rejects_wrong_geometry() {
        let pool = pool(1 << 20);
        {
            PmemHashTable::<Fixed, Fixed>::initialize(Arc::clone(&pool), NoopBarrier, 2, 2)
                .unwrap();
        }
        assert!(PmemHashTable::<Var, Var>::recover(pool, NoopBarrier).is_err());
    }

    #[test]
    fn recover_without_root_fails() {
        let pool = pool(1 << 16);
        assert!(PmemHashTable::<Fixed, Fixed>::recover(pool, NoopBarrier).is_err());
    }

    #[test]
    fn interrupted_insert_is_invisible_after_recovery() {
        let pool = pool(1 << 21);
        {
            let table = PmemHashTable::<Fixed, Fixed>::initialize(
                Arc::clone(&pool),
                NoopBarrier,
                2,
                4,
            )
            .unwrap();
            table.put(1, 100).unwrap();
            // Crash between the tag persist and the occupancy publish.
            table.put_interrupted_before_publish(2, 200).unwrap();
        }

        let table = PmemHashTable::<Fixed, Fixed>::recover(pool, NoopBarrier).unwrap();
        assert_eq!(table.get(1), Some(100));
        assert_eq!(table.get(2), None);
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn durability_steps_counted() {
        let pool = pool(1 << 20);
        let table: PmemHashTable<Fixed, Fixed, crate::map::cell::Cell256, MemoryPool, CountingBarrier> =
            PmemHashTable::initialize(pool, CountingBarrier::new(), 2, 2).unwrap();
        let before = table.barrier.fences();
        table.put(9, 9).unwrap();
        // Inline encoding: slot pair, tag, occupancy. Three persist steps.
        assert_eq!(table.barrier.fences() - before, 3);
    }
}
