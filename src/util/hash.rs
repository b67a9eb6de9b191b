//! Keyed 64-bit mixing hashes.
//!
//! Two functions cover both key shapes: `murmur_hash64a` for byte strings
//! and `mix_u64` for numeric keys. There is no ambient hasher state; both
//! are pure functions of their input so a slot's placement can be re-derived
//! during rehash.

const M: u64 = 0xc6a4_a793_5bd1_e995;
const SEED: u64 = 0xe17a_1465;
const R: u32 = 47;

/// MurmurHash64A with a fixed seed.
pub(crate) fn murmur_hash64a(data: &[u8]) -> u64 {
    let len = data.len();
    let mut h: u64 = SEED ^ (len as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u64 = 0;
        for (i, &b) in tail.iter().enumerate() {
            k |= u64::from(b) << (8 * i);
        }
        h ^= k;
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Multiplicative mixer for numeric keys: folds the high and low halves of
/// the 128-bit product so every input bit affects every output bit.
pub(crate) fn mix_u64(x: u64) -> u64 {
    const K: u64 = 0xde5f_b9d2_6304_58e9;
    let wide = u128::from(x) * u128::from(K);
    (wide as u64).wrapping_add((wide >> 64) as u64)
}

#[cfg(test)]
mod tests {
    use super::{mix_u64, murmur_hash64a};

    #[test]
    fn murmur_is_deterministic() {
        let h1 = murmur_hash64a(b"hello world");
        let h2 = murmur_hash64a(b"hello world");
        assert_eq!(h1, h2);
        assert_ne!(h1, murmur_hash64a(b"hello worle"));
    }

    #[test]
    fn murmur_handles_all_tail_lengths() {
        // 0..=16 bytes covers the empty input, a pure tail, one full block,
        // and a block plus tail.
        let data = b"0123456789abcdef";
        let mut seen = std::collections::HashSet::new();
        for len in 0..=data.len() {
            assert!(seen.insert(murmur_hash64a(&data[..len])));
        }
    }

    #[test]
    fn mix_spreads_low_entropy_inputs() {
        // Sequential integers must land in different high bits, since the
        // bucket index is taken from the top of the hash.
        let mut tops = std::collections::HashSet::new();
        for i in 0..1024u64 {
            tops.insert(mix_u64(i) >> 32);
        }
        assert!(tops.len() > 1000);
    }

    #[test]
    fn mix_is_not_identity() {
        assert_ne!(mix_u64(1), 1);
        assert_ne!(mix_u64(1), mix_u64(2));
    }
}
