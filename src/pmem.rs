//! The persistent-memory variant: durable bucket descriptors, durability
//! barriers, and pool capabilities.

pub(crate) mod barrier;
pub(crate) mod meta;
pub(crate) mod pool;
pub(crate) mod table;

pub use barrier::{CountingBarrier, NoopBarrier, PersistentBarrier};
pub use pool::{MemoryPool, PmemPool, PoolOffset};
pub use table::PmemHashTable;
