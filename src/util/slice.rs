//! A borrowed byte-range view with lexicographic comparison.

use std::cmp::Ordering;
use std::fmt;

/// A borrowed view over a byte range, compared lexicographically with
/// byte-length as the tie breaker.
///
/// Variable-length keys and values decoded from a record are returned as
/// `Slice`s pointing into the record's storage, so lookups stay zero-copy
/// until the caller asks for an owned value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slice<'a> {
    data: &'a [u8],
}

impl<'a> Slice<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl Ord for Slice<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.data.cmp(other.data)
    }
}

impl PartialOrd for Slice<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'a> From<&'a [u8]> for Slice<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self::new(data)
    }
}

impl<'a> From<&'a str> for Slice<'a> {
    fn from(s: &'a str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl AsRef<[u8]> for Slice<'_> {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

impl PartialEq<[u8]> for Slice<'_> {
    fn eq(&self, other: &[u8]) -> bool {
        self.data == other
    }
}

impl fmt::Debug for Slice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.data) {
            Ok(s) => write!(f, "Slice({s:?})"),
            Err(_) => write!(f, "Slice({:02x?})", self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Slice;

    #[test]
    fn lexicographic_order() {
        let a = Slice::from("abc");
        let b = Slice::from("abd");
        let c = Slice::from("ab");
        assert!(a < b);
        assert!(c < a);
        assert_eq!(a, Slice::new(b"abc"));
    }

    #[test]
    fn empty() {
        let e = Slice::new(b"");
        assert!(e.is_empty());
        assert_eq!(e.len(), 0);
    }
}
