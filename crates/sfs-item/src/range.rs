//! Cached key ranges.
//!
//! Records the closed key ranges that are completely described by the item
//! index, so a missing item inside a cached range is an authoritative
//! negative answer rather than a trip to the manifest.
//!
//! Ranges never overlap: insertion absorbs every existing range that shares
//! at least one key with the incoming one and installs the union. With that
//! invariant the ranges sort identically by start and by end, so a
//! `BTreeMap` keyed by start key is enough to find coverage and neighbors.

use sfs_types::{compare_ranges, Key};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Coverage answer for a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Coverage {
    /// The key sits inside a cached range ending at `end` (inclusive).
    Covered { end: Key },
    /// The key sits in an uncached hole reaching up to `next_start`, the
    /// start of the next cached range above it or the maximum key when
    /// nothing is cached above.
    Hole { next_start: Key },
}

#[derive(Debug, Default)]
pub(crate) struct RangeSet {
    ranges: BTreeMap<Key, Key>,
}

impl RangeSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.ranges.len()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&Key, &Key)> {
        self.ranges.iter()
    }

    /// Locate the range containing `key`, or the hole it falls in.
    pub(crate) fn check(&self, key: &Key) -> Coverage {
        if let Some((start, end)) = self
            .ranges
            .range::<Key, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
        {
            if compare_ranges(key, key, start, end) == Ordering::Equal {
                return Coverage::Covered { end: end.clone() };
            }
        }

        match self
            .ranges
            .range::<Key, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
        {
            Some((start, _)) => Coverage::Hole {
                next_start: start.clone(),
            },
            None => Coverage::Hole {
                next_start: Key::max(),
            },
        }
    }

    /// Insert `[start, end]`, coalescing with every existing range that
    /// shares at least one key. Absorbed ranges are removed and the union is
    /// installed as a single range, so a fully contained insertion collapses
    /// into the range that already covers it.
    pub(crate) fn insert(&mut self, mut start: Key, mut end: Key) {
        debug_assert!(start <= end, "range start above end");

        // Only ranges starting at or below our end can overlap, and an
        // absorbed range never uncovers a new overlap above it, so one
        // backward scan from the insertion end suffices.
        let probe_end = end.clone();
        let mut absorbed = Vec::new();
        for (other_start, other_end) in self
            .ranges
            .range::<Key, _>((Bound::Unbounded, Bound::Included(&probe_end)))
            .rev()
        {
            if compare_ranges(&start, &end, other_start, other_end) != Ordering::Equal {
                // Strictly below us; everything earlier is lower still.
                break;
            }
            absorbed.push(other_start.clone());
            if *other_start < start {
                start = other_start.clone();
            }
            if *other_end > end {
                end = other_end.clone();
            }
        }

        for other_start in absorbed {
            self.ranges.remove(&other_start);
        }
        self.ranges.insert(start, end);
    }
}
