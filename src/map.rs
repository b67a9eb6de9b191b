//! The DRAM-resident hash table and its building blocks.

pub(crate) mod alloc;
pub(crate) mod bucket;
pub(crate) mod cell;
pub(crate) mod probe;
pub(crate) mod record;
pub(crate) mod table;

pub use cell::{Cell128, Cell256, CellLayout};
pub use record::{FieldSchema, Fixed, RawField, Var};
pub use table::HashTable;
