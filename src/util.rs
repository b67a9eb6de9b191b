pub(crate) mod bitset;
pub(crate) mod hash;
pub mod slice;

pub(crate) use bitset::BitSet;
pub use slice::Slice;

/// Checks a bitmap/tag invariant. Always on in debug builds; the
/// `strict-checks` feature keeps it on in release builds too.
macro_rules! strict_assert {
    ($($arg:tt)*) => {
        if cfg!(any(debug_assertions, feature = "strict-checks")) {
            assert!($($arg)*);
        }
    };
}
pub(crate) use strict_assert;
