#![forbid(unsafe_code)]
//! Primitive types shared across the SegFS item layer.
//!
//! Keys are bounded byte strings ordered lexicographically; the item cache,
//! manifest, and segment layers all speak in terms of them. The range
//! comparator defined here drives both cached-range coverage checks and
//! coalescing during range insertion.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Maximum length in bytes of any key in the system.
pub const MAX_KEY_SIZE: usize = 1024;

/// Flag set on items written to a segment to record a deletion (tombstone).
pub const ITEM_FLAG_DELETION: u8 = 0x1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key length {len} exceeds maximum {MAX_KEY_SIZE}")]
    TooLong { len: usize },
}

/// An immutable byte-string key, at most [`MAX_KEY_SIZE`] bytes.
///
/// Total order is lexicographic over the raw bytes. Clones are deep copies;
/// every holder owns its key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from the given bytes, validating the length bound.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, KeyError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_KEY_SIZE {
            return Err(KeyError::TooLong { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// The lexicographic maximum key: [`MAX_KEY_SIZE`] bytes of `0xff`.
    ///
    /// Used as the open-ended boundary when no cached range lies above a
    /// query key. It orders at-or-above every valid key and is otherwise a
    /// normal key.
    #[must_use]
    pub fn max() -> Self {
        Self(vec![0xff; MAX_KEY_SIZE])
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", HexBytes(&self.0))
    }
}

impl TryFrom<&[u8]> for Key {
    type Error = KeyError;

    fn try_from(bytes: &[u8]) -> Result<Self, KeyError> {
        Self::new(bytes.to_vec())
    }
}

struct HexBytes<'a>(&'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().take(24) {
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > 24 {
            write!(f, "..{}b", self.0.len())?;
        }
        Ok(())
    }
}

/// Three-way comparison of two closed key ranges.
///
/// Returns `Less` when `[a_start, a_end]` lies strictly below
/// `[b_start, b_end]`, `Greater` when strictly above, and `Equal` when the
/// ranges share at least one key (touching counts). A point query compares
/// as the degenerate range `[key, key]`.
#[must_use]
pub fn compare_ranges(a_start: &Key, a_end: &Key, b_start: &Key, b_end: &Key) -> Ordering {
    if a_end < b_start {
        Ordering::Less
    } else if a_start > b_end {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(bytes: &[u8]) -> Key {
        Key::new(bytes.to_vec()).expect("key within bounds")
    }

    #[test]
    fn order_is_lexicographic() {
        assert!(key(b"a") < key(b"b"));
        assert!(key(b"a") < key(b"aa"));
        assert!(key(b"ab") < key(b"b"));
        assert!(key(b"") < key(b"\x00"));
    }

    #[test]
    fn max_key_dominates() {
        assert!(key(b"") < Key::max());
        assert!(key(b"zzzz") < Key::max());
        assert!(key(&[0xff; MAX_KEY_SIZE - 1]) < Key::max());
        assert_eq!(Key::max(), Key::max());
    }

    #[test]
    fn new_rejects_oversized() {
        let err = Key::new(vec![0_u8; MAX_KEY_SIZE + 1]).unwrap_err();
        assert_eq!(
            err,
            KeyError::TooLong {
                len: MAX_KEY_SIZE + 1
            }
        );
        assert!(Key::new(vec![0_u8; MAX_KEY_SIZE]).is_ok());
    }

    #[test]
    fn range_comparison_classifies_overlap() {
        let (a, c, e, g) = (key(b"a"), key(b"c"), key(b"e"), key(b"g"));

        assert_eq!(compare_ranges(&a, &c, &e, &g), Ordering::Less);
        assert_eq!(compare_ranges(&e, &g, &a, &c), Ordering::Greater);
        // Sharing a single endpoint counts as overlap.
        assert_eq!(compare_ranges(&a, &c, &c, &g), Ordering::Equal);
        // Containment and partial overlap.
        assert_eq!(compare_ranges(&a, &g, &c, &e), Ordering::Equal);
        assert_eq!(compare_ranges(&c, &e, &a, &g), Ordering::Equal);
        assert_eq!(compare_ranges(&a, &e, &c, &g), Ordering::Equal);
    }

    #[test]
    fn point_range_coverage() {
        let (a, c, e) = (key(b"a"), key(b"c"), key(b"e"));
        assert_eq!(compare_ranges(&c, &c, &a, &e), Ordering::Equal);
        assert_eq!(compare_ranges(&c, &c, &c, &c), Ordering::Equal);
        assert_eq!(compare_ranges(&a, &a, &c, &e), Ordering::Less);
    }
}
