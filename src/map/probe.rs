//! Bounded linear probing over the cells of one bucket.

/// Longest probe sequence a lookup or insert may walk within a bucket.
/// Reaching the bound without success means the bucket must be rehashed,
/// never probed further.
pub(crate) const MAX_PROBE_LEN: u32 = 15;

const PROBE_STEP: u32 = 1;

/// Produces cell indices within one bucket: starts at `hash & mask`, steps
/// linearly, wraps on the cell-count mask, and stops after
/// `min(cell_count, MAX_PROBE_LEN)` cells.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ProbeWithinBucket {
    cell_index: u32,
    cell_count_mask: u32,
    probe_count: u32,
    limit: u32,
}

impl ProbeWithinBucket {
    /// `cell_count_mask` is `cell_count - 1`; cell counts are powers of two.
    pub(crate) fn new(hash: u64, cell_count_mask: u32) -> Self {
        Self {
            cell_index: (hash as u32) & cell_count_mask,
            cell_count_mask,
            probe_count: 0,
            limit: (cell_count_mask + 1).min(MAX_PROBE_LEN),
        }
    }
}

impl Iterator for ProbeWithinBucket {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.probe_count >= self.limit {
            return None;
        }
        let current = self.cell_index;
        self.cell_index = (self.cell_index + PROBE_STEP) & self.cell_count_mask;
        self.probe_count += 1;
        Some(current)
    }
}
