#![forbid(unsafe_code)]
//! Item cache between the filesystem item API and the segment manifest.
//!
//! A tree of cached items isolates item API callers from the relatively
//! expensive segment searches. A second index of cached key ranges records
//! the regions of the key space that are completely described by the cached
//! items, letting the cache answer negative lookups without touching the
//! manifest. Deletions are recorded as tombstone items that shadow older
//! on-storage data; they are erased once written to a segment.
//!
//! All state lives behind one cache-wide mutex held only for short,
//! non-blocking critical sections. Any operation that may need manifest
//! data observes the cache, drops the lock, asks the [`ManifestReader`] to
//! populate the missing range, and re-observes; concurrent readers may have
//! filled the cache in the meantime, which batch insertion tolerates by
//! dropping duplicates.

mod range;
mod tree;

use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_types::{Key, ITEM_FLAG_DELETION};
use tracing::{debug, info, trace};

use range::{Coverage, RangeSet};
use tree::{InsertOutcome, ItemTree, NodeId, Payload};

/// Reads items out of the manifest's segments into the cache.
///
/// `read_items` must populate `cache` with every item in `[start, end]`
/// (closed) and install the covering range, atomically, via an [`ItemBatch`]
/// and [`ItemCache::insert_batch`]. It is called without the cache lock held
/// and may run concurrently with other readers; the cache re-verifies its
/// state afterwards. Errors are surfaced to the item API caller unchanged.
pub trait ManifestReader: Send + Sync + Sized {
    fn read_items(&self, cache: &ItemCache<Self>, start: &Key, end: &Key) -> Result<()>;
}

/// Destination of a dirty item flush: an in-memory segment under
/// construction.
///
/// `first_item` begins the segment and must be followed by `nr_items - 1`
/// `append_item` calls. Both are plain memory appends and are called with
/// the cache lock held; implementations must not block.
pub trait SegmentWriter {
    /// Whether a segment can hold this many items with these key and value
    /// byte totals. Pure predicate on the segment format.
    fn fits_single(&self, nr_items: usize, key_bytes: usize, val_bytes: usize) -> bool;

    fn first_item(&mut self, key: &Key, val: &[u8], flags: u8, nr_items: usize, key_bytes: usize);

    fn append_item(&mut self, key: &Key, val: &[u8], flags: u8);
}

/// An ordered scratch list of items prepared off-lock for
/// [`ItemCache::insert_batch`].
#[derive(Debug, Default)]
pub struct ItemBatch {
    items: Vec<(Key, Vec<u8>)>,
}

impl ItemBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item. Callers supply keys in ascending order; the batch
    /// preserves it.
    pub fn add(&mut self, key: Key, val: &[u8]) {
        debug_assert!(
            self.items.last().map_or(true, |(last, _)| *last < key),
            "batch keys must be added in ascending order"
        );
        self.items.push((key, val.to_vec()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Snapshot of item cache counters and gauges.
///
/// Obtained via [`ItemCache::metrics()`] with a single lock acquisition.
/// The counters are monotonically increasing for the lifetime of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemCacheMetrics {
    /// Lookups that found a live item.
    pub lookup_hits: u64,
    /// Lookups that found nothing or a tombstone.
    pub lookup_misses: u64,
    /// Coverage checks answered by a cached range.
    pub range_hits: u64,
    /// Coverage checks that fell into an uncached hole.
    pub range_misses: u64,
    /// Covering ranges installed by batch insertion.
    pub range_inserts: u64,
    /// Items created dirty through the item API.
    pub creates: u64,
    /// Items converted to tombstones.
    pub deletes: u64,
    /// Current number of cached items, tombstones included.
    pub nr_items: usize,
    /// Current number of cached ranges.
    pub nr_ranges: usize,
    /// Current number of dirty items.
    pub nr_dirty_items: usize,
    /// Total key bytes of dirty items.
    pub dirty_key_bytes: usize,
    /// Total value bytes of dirty items.
    pub dirty_val_bytes: usize,
}

impl ItemCacheMetrics {
    /// Lookup hit ratio in the range [0.0, 1.0]. Returns 0.0 before any
    /// lookups.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.lookup_hits + self.lookup_misses;
        if total == 0 {
            0.0
        } else {
            self.lookup_hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    items: ItemTree,
    ranges: RangeSet,
    lookup_hits: u64,
    lookup_misses: u64,
    range_hits: u64,
    range_misses: u64,
    range_inserts: u64,
    creates: u64,
    deletes: u64,
}

impl CacheState {
    /// Find the live item at `key`, counting a hit or miss. Tombstones count
    /// as misses.
    fn find_counted(&mut self, key: &Key) -> Option<NodeId> {
        let found = self.items.find(key);
        if found.is_some() {
            self.lookup_hits += 1;
        } else {
            self.lookup_misses += 1;
        }
        found
    }

    fn check_range_counted(&mut self, key: &Key) -> Coverage {
        let coverage = self.ranges.check(key);
        match coverage {
            Coverage::Covered { .. } => self.range_hits += 1,
            Coverage::Hole { .. } => self.range_misses += 1,
        }
        coverage
    }

    /// Convert a live item into a dirty tombstone, returning the old value
    /// for the caller to drop outside the lock. Clearing and re-marking
    /// dirty keeps the byte accounting exact even when the item was already
    /// dirty.
    fn become_tombstone(&mut self, id: NodeId) -> Vec<u8> {
        self.items.clear_dirty(id);
        let old = self.items.take_tombstone(id);
        self.items.mark_dirty(id);
        self.deletes += 1;
        old
    }

    fn snapshot_metrics(&self) -> ItemCacheMetrics {
        let (nr_dirty_items, dirty_key_bytes, dirty_val_bytes) = self.items.dirty_totals();
        ItemCacheMetrics {
            lookup_hits: self.lookup_hits,
            lookup_misses: self.lookup_misses,
            range_hits: self.range_hits,
            range_misses: self.range_misses,
            range_inserts: self.range_inserts,
            creates: self.creates,
            deletes: self.deletes,
            nr_items: self.items.len(),
            nr_ranges: self.ranges.len(),
            nr_dirty_items,
            dirty_key_bytes,
            dirty_val_bytes,
        }
    }
}

/// One step of the observe/read/retry loop. The read marker never crosses
/// the public API; it only carries the uncached sub-range out of the
/// critical section.
enum Step<T> {
    Done(T),
    NotFound,
    Read(Key, Key),
}

/// Copy as much of `src` as fits into `dst`, returning the bytes copied.
fn copy_value(src: &[u8], dst: &mut [u8]) -> usize {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

/// The next item to return from the `next` walk: the first non-tombstone
/// strictly after `key`, bounded by the lesser of the cached range end and
/// the caller's last key.
fn item_for_next(items: &ItemTree, key: &Key, range_end: &Key, last: &Key) -> Option<NodeId> {
    let limit = if range_end < last { range_end } else { last };

    let mut cur = items.next_after(key);
    while let Some(id) = cur {
        if items.key(id) > limit {
            return None;
        }
        if !items.is_tombstone(id) {
            return Some(id);
        }
        cur = items.successor(id);
    }
    None
}

/// The item cache: an ordered index of cached items plus the key ranges they
/// completely describe, in front of a [`ManifestReader`].
pub struct ItemCache<M: ManifestReader> {
    manifest: M,
    state: Mutex<CacheState>,
}

impl<M: ManifestReader> ItemCache<M> {
    pub fn new(manifest: M) -> Self {
        info!(target: "sfs::item", event = "cache_setup");
        Self {
            manifest,
            state: Mutex::new(CacheState::default()),
        }
    }

    #[must_use]
    pub fn manifest(&self) -> &M {
        &self.manifest
    }

    /// Take a snapshot of current cache metrics under one lock acquisition.
    #[must_use]
    pub fn metrics(&self) -> ItemCacheMetrics {
        self.state.lock().snapshot_metrics()
    }

    fn read_missing(&self, start: &Key, end: &Key) -> Result<()> {
        trace!(target: "sfs::item", event = "manifest_read", start = ?start, end = ?end);
        self.manifest.read_items(self, start, end)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Find the item at `key` and copy its value into `val`, returning the
    /// number of bytes copied. The copy truncates at the buffer length.
    ///
    /// Reads the manifest as needed; `NotFound` means the key's absence is
    /// range-confirmed.
    pub fn lookup(&self, key: &Key, val: &mut [u8]) -> Result<usize> {
        loop {
            let step = {
                let mut state = self.state.lock();
                match state.find_counted(key) {
                    Some(id) => Step::Done(copy_value(state.items.value(id), val)),
                    None => match state.check_range_counted(key) {
                        Coverage::Covered { .. } => Step::NotFound,
                        Coverage::Hole { next_start } => Step::Read(key.clone(), next_start),
                    },
                }
            };
            match step {
                Step::Done(n) => return Ok(n),
                Step::NotFound => return Err(SfsError::NotFound),
                Step::Read(start, end) => self.read_missing(&start, &end)?,
            }
        }
    }

    /// [`ItemCache::lookup`] requiring the value length to equal `size`
    /// exactly. Callers treat a mismatch as filesystem corruption.
    pub fn lookup_exact(&self, key: &Key, val: &mut [u8], size: usize) -> Result<()> {
        match self.lookup(key, val) {
            Ok(n) if n == size => Ok(()),
            Ok(n) => Err(SfsError::Corruption(format!(
                "item value length {n}, expected {size}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Return the first live item strictly after `key` and at most `last`,
    /// copying its value into `val` when given. Yields the found key and the
    /// bytes copied, so callers iterate by feeding the found key back in.
    ///
    /// Tombstones are stepped over. The cached range around the search key
    /// bounds how far a single pass can trust the cache; uncached space
    /// below `last` is read from the manifest and the walk retried.
    /// `NotFound` once the cache covers `[key, last]` with no live item.
    pub fn next(&self, key: &Key, last: &Key, mut val: Option<&mut [u8]>) -> Result<(Key, usize)> {
        // Callers iterate until they step past their last key; skip the
        // search entirely in that case.
        if key > last {
            return Err(SfsError::NotFound);
        }

        loop {
            let step = {
                let mut state = self.state.lock();
                match state.check_range_counted(key) {
                    Coverage::Covered { end: range_end } => {
                        if let Some(id) = item_for_next(&state.items, key, &range_end, last) {
                            let found = state.items.key(id).clone();
                            let n = match val.as_deref_mut() {
                                Some(buf) => copy_value(state.items.value(id), buf),
                                None => 0,
                            };
                            Step::Done((found, n))
                        } else if range_end < *last {
                            // The cache runs out before the caller's limit;
                            // the missing space starts at the range end.
                            Step::Read(range_end, last.clone())
                        } else {
                            Step::NotFound
                        }
                    }
                    // The missing space starts at the search key itself.
                    Coverage::Hole { next_start } => Step::Read(key.clone(), next_start),
                }
            };
            match step {
                Step::Done(found) => return Ok(found),
                Step::NotFound => return Err(SfsError::NotFound),
                Step::Read(start, end) => self.read_missing(&start, &end)?,
            }
        }
    }

    /// [`ItemCache::next`] requiring found keys to have the same length as
    /// the search key. A mismatch is a sign of corruption.
    pub fn next_same(
        &self,
        key: &Key,
        last: &Key,
        val: Option<&mut [u8]>,
    ) -> Result<(Key, usize)> {
        let (found, n) = self.next(key, last, val)?;
        if found.len() != key.len() {
            return Err(SfsError::Corruption(format!(
                "next key length {}, expected {}",
                found.len(),
                key.len()
            )));
        }
        Ok((found, n))
    }

    /// [`ItemCache::next_same`] additionally requiring values of at least
    /// `min_len` bytes. A shorter value is a sign of corruption; a buffer
    /// smaller than `min_len` is invalid.
    pub fn next_same_min(
        &self,
        key: &Key,
        last: &Key,
        val: &mut [u8],
        min_len: usize,
    ) -> Result<(Key, usize)> {
        if val.len() < min_len {
            return Err(SfsError::Invalid(format!(
                "value buffer of {} bytes below minimum length {min_len}",
                val.len()
            )));
        }
        let (found, n) = self.next_same(key, last, Some(val))?;
        if n < min_len {
            return Err(SfsError::Corruption(format!(
                "next value length {n}, expected at least {min_len}"
            )));
        }
        Ok((found, n))
    }

    // ── Mutations ───────────────────────────────────────────────────────

    /// Create a new dirty item. `Exists` if a live item already holds the
    /// key; a cached tombstone is replaced.
    ///
    /// Never reads the manifest, so it can shadow an on-storage item with a
    /// fresh one of the same key; callers own that decision.
    pub fn create(&self, key: &Key, val: &[u8]) -> Result<()> {
        // Allocate the item before taking the lock.
        let item_key = key.clone();
        let payload = Payload::Live(val.to_vec());

        let outcome = {
            let mut state = self.state.lock();
            let outcome = state.items.insert(item_key, payload, true);
            if matches!(outcome, InsertOutcome::Inserted(_)) {
                state.creates += 1;
            }
            outcome
        };

        match outcome {
            InsertOutcome::Inserted(_) => {
                debug!(target: "sfs::item", event = "item_create", key = ?key, val_len = val.len());
                Ok(())
            }
            InsertOutcome::Exists => Err(SfsError::Exists),
        }
    }

    /// Replace the value of an existing item and mark it dirty. `NotFound`
    /// if no item exists at the key; reads the manifest as needed.
    pub fn update(&self, key: &Key, val: &[u8]) -> Result<()> {
        // Duplicate the value before taking the lock; the old value is
        // dropped after releasing it.
        let mut new_val = Some(val.to_vec());

        loop {
            let step = {
                let mut state = self.state.lock();
                match state.find_counted(key) {
                    Some(id) => {
                        // Clear first so the byte accounting tracks the
                        // value swap exactly.
                        state.items.clear_dirty(id);
                        let old = state
                            .items
                            .replace_value(id, new_val.take().unwrap_or_default());
                        state.items.mark_dirty(id);
                        Step::Done(old)
                    }
                    None => match state.check_range_counted(key) {
                        Coverage::Covered { .. } => Step::NotFound,
                        Coverage::Hole { next_start } => Step::Read(key.clone(), next_start),
                    },
                }
            };
            match step {
                Step::Done(_old) => return Ok(()),
                Step::NotFound => return Err(SfsError::NotFound),
                Step::Read(start, end) => self.read_missing(&start, &end)?,
            }
        }
    }

    /// Make sure the item at `key` is cached and dirty, reading it if it
    /// isn't cached. `NotFound` if the item doesn't exist.
    pub fn dirty(&self, key: &Key) -> Result<()> {
        loop {
            let step = {
                let mut state = self.state.lock();
                match state.find_counted(key) {
                    Some(id) => {
                        state.items.mark_dirty(id);
                        Step::Done(())
                    }
                    None => match state.check_range_counted(key) {
                        Coverage::Covered { .. } => Step::NotFound,
                        Coverage::Hole { next_start } => Step::Read(key.clone(), next_start),
                    },
                }
            };
            match step {
                Step::Done(()) => return Ok(()),
                Step::NotFound => return Err(SfsError::NotFound),
                Step::Read(start, end) => self.read_missing(&start, &end)?,
            }
        }
    }

    /// Delete the item at `key` by converting it to a dirty tombstone,
    /// reading it first if it isn't cached. `NotFound` if the item doesn't
    /// exist, which keeps callers from piling up tombstones for keys that
    /// never existed.
    pub fn delete(&self, key: &Key) -> Result<()> {
        loop {
            let step = {
                let mut state = self.state.lock();
                match state.find_counted(key) {
                    Some(id) => Step::Done(state.become_tombstone(id)),
                    None => match state.check_range_counted(key) {
                        Coverage::Covered { .. } => Step::NotFound,
                        Coverage::Hole { next_start } => Step::Read(key.clone(), next_start),
                    },
                }
            };
            match step {
                // The old value drops here, outside the lock.
                Step::Done(_old) => {
                    debug!(target: "sfs::item", event = "item_delete", key = ?key);
                    return Ok(());
                }
                Step::NotFound => return Err(SfsError::NotFound),
                Step::Read(start, end) => self.read_missing(&start, &end)?,
            }
        }
    }

    /// Delete an item the caller has already dirtied, so it is known to be
    /// cached. Cannot fail.
    pub fn delete_dirty(&self, key: &Key) {
        let _old = {
            let mut state = self.state.lock();
            state
                .find_counted(key)
                .map(|id| state.become_tombstone(id))
        };
    }

    /// Delete a set of items without partial failure: first dirty (and so
    /// pin) every key, stopping on the first error before any tombstone is
    /// created, then delete each.
    pub fn delete_many(&self, keys: &[Key]) -> Result<()> {
        for key in keys {
            self.dirty(key)?;
        }
        for key in keys {
            self.delete_dirty(key);
        }
        Ok(())
    }

    // ── Batch intake ────────────────────────────────────────────────────

    /// Insert a batch of clean items read from segments, together with the
    /// covering range `[start, end]`, atomically.
    ///
    /// The cache may have changed since the read was issued: any batch item
    /// whose key is already cached (live or tombstone) is dropped, because
    /// the cache's version is at least as fresh as what was read.
    pub fn insert_batch(&self, batch: ItemBatch, start: &Key, end: &Key) -> Result<()> {
        if start > end {
            return Err(SfsError::Invalid(format!(
                "batch range start {start:?} above end {end:?}"
            )));
        }

        let total = batch.items.len();
        let range_start = start.clone();
        let range_end = end.clone();

        let installed = {
            let mut state = self.state.lock();
            state.ranges.insert(range_start, range_end);
            state.range_inserts += 1;

            let mut installed = 0_usize;
            for (key, val) in batch.items {
                let (exact, _, _) = state.items.walk(&key);
                if exact.is_some() {
                    continue;
                }
                state.items.insert(key, Payload::Live(val), false);
                installed += 1;
            }
            installed
        };

        trace!(
            target: "sfs::item",
            event = "insert_batch",
            start = ?start,
            end = ?end,
            installed,
            dropped = total - installed
        );
        Ok(())
    }

    // ── Flush ───────────────────────────────────────────────────────────

    /// Whether any dirty items are waiting to be flushed.
    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.state.lock().items.has_dirty()
    }

    /// Whether the current dirty items plus `nr_items` more with these key
    /// and value byte totals still fit in a single segment.
    #[must_use]
    pub fn dirty_fits_single<S: SegmentWriter + ?Sized>(
        &self,
        seg: &S,
        nr_items: usize,
        key_bytes: usize,
        val_bytes: usize,
    ) -> bool {
        let state = self.state.lock();
        let (dirty_items, dirty_key_bytes, dirty_val_bytes) = state.items.dirty_totals();
        seg.fits_single(
            nr_items + dirty_items,
            key_bytes + dirty_key_bytes,
            val_bytes + dirty_val_bytes,
        )
    }

    /// Fill `seg` with the initial run of sorted dirty items that fits in a
    /// single segment. Emitted items are marked clean; emitted tombstones
    /// are erased from the cache, their deletion now recorded in the
    /// segment. Returns the number of items emitted.
    pub fn dirty_seg<S: SegmentWriter + ?Sized>(&self, seg: &mut S) -> usize {
        let mut state = self.state.lock();

        // First pass: how many sorted dirty items fit.
        let (nr_items, key_bytes) = {
            let items = &state.items;
            let (mut fit_items, mut fit_keys) = (0_usize, 0_usize);
            let (mut count, mut keys, mut vals) = (0_usize, 0_usize, 0_usize);
            let mut cur = items.first_dirty();
            while let Some(id) = cur {
                count += 1;
                keys += items.key(id).len();
                vals += items.value_len(id);
                if !seg.fits_single(count, keys, vals) {
                    break;
                }
                fit_items = count;
                fit_keys = keys;
                cur = items.next_dirty(id);
            }
            (fit_items, fit_keys)
        };

        // Second pass: emit. The first item carries the totals the segment
        // needs to lay out its key and value regions.
        let mut emitted = 0_usize;
        let mut cur = state.items.first_dirty();
        while emitted < nr_items {
            let Some(id) = cur else { break };

            let flags = if state.items.is_tombstone(id) {
                ITEM_FLAG_DELETION
            } else {
                0
            };
            if emitted == 0 {
                seg.first_item(
                    state.items.key(id),
                    state.items.value(id),
                    flags,
                    nr_items,
                    key_bytes,
                );
            } else {
                seg.append_item(state.items.key(id), state.items.value(id), flags);
            }

            state.items.clear_dirty(id);
            let next = state.items.next_dirty(id);
            if state.items.is_tombstone(id) {
                state.items.erase(id);
            }
            cur = next;
            emitted += 1;
        }

        drop(state);
        debug!(target: "sfs::item", event = "dirty_seg", emitted, key_bytes);
        emitted
    }
}
