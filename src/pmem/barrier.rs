//! Durability-barrier capability.
//!
//! Persistent-memory hardware exposes "flush this cache line" and "fence
//! prior stores" as primitives; the engine consumes them through this trait
//! so the ordering protocol can run, and be tested, against DRAM.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Flush-and-fence primitives ordering stores toward persistence.
pub trait PersistentBarrier: Send + Sync {
    /// Asks for the cache lines covering `[addr, addr + len)` to be written
    /// back toward the persistence domain.
    fn flush(&self, addr: *const u8, len: usize);

    /// Orders all prior flushes before any later store.
    fn fence(&self);

    /// Flush followed by fence, the common commit step.
    fn persist(&self, addr: *const u8, len: usize) {
        self.flush(addr, len);
        self.fence();
    }
}

/// Barrier for DRAM-backed pools: flushes are no-ops, fences compile down
/// to an `SeqCst` atomic fence so the store ordering still holds.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopBarrier;

impl PersistentBarrier for NoopBarrier {
    fn flush(&self, _addr: *const u8, _len: usize) {}

    fn fence(&self) {
        fence(Ordering::SeqCst);
    }
}

/// Test barrier counting every flush and fence, for asserting the
/// durability protocol's step sequence.
#[derive(Debug, Default)]
pub struct CountingBarrier {
    flushes: AtomicUsize,
    fences: AtomicUsize,
}

impl CountingBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn fences(&self) -> usize {
        self.fences.load(Ordering::Relaxed)
    }
}

impl PersistentBarrier for CountingBarrier {
    fn flush(&self, _addr: *const u8, _len: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn fence(&self) {
        fence(Ordering::SeqCst);
        self.fences.fetch_add(1, Ordering::Relaxed);
    }
}
