//! A lazy iterator over the set bit positions of a small bitmask.
//!
//! Cell bitmaps (occupancy, tag matches, tombstones) are at most 32 bits
//! wide, so a `u32` covers every cell layout.

/// Iterates the set bit positions of a `u32`, lowest first.
///
/// `BitSet` is `Copy`, so a scan can be restarted by keeping the original
/// value around.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BitSet {
    bits: u32,
}

impl BitSet {
    pub(crate) fn new(bits: u32) -> Self {
        Self { bits }
    }

    /// Number of set bits remaining.
    pub(crate) fn len(&self) -> u32 {
        self.bits.count_ones()
    }

    /// The lowest set bit position without consuming it.
    pub(crate) fn first(&self) -> Option<u8> {
        if self.bits == 0 {
            None
        } else {
            Some(self.bits.trailing_zeros() as u8)
        }
    }
}

impl Iterator for BitSet {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.bits == 0 {
            return None;
        }
        let pos = self.bits.trailing_zeros() as u8;
        // Clear the lowest set bit.
        self.bits &= self.bits - 1;
        Some(pos)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.len() as usize;
        (n, Some(n))
    }
}
