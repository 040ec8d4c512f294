//! Augmented ordered index of cached items.
//!
//! An arena-backed AVL tree keyed by byte-string key. Child and parent links
//! are arena indices rather than pointers, which keeps the structure free of
//! `unsafe` while still giving us bidirectional traversal and erase during
//! iteration: erasing a node relinks neighbors but never moves another node,
//! so outstanding [`NodeId`]s stay valid.
//!
//! Every node carries a three-bit dirty summary: whether the node itself is
//! dirty and whether its left or right subtree contains any dirty node. The
//! summary lets [`ItemTree::first_dirty`] / [`ItemTree::next_dirty`] walk
//! dirty items in key order while skipping entire clean subtrees.
//!
//! The summary is not a commutative function of the children: the left and
//! right bits name a specific side. A rotation therefore recomputes the
//! summary of both participating nodes from their live children instead of
//! copying it across.
//!
//! The tree also owns the dirty accounting (item count, key bytes, value
//! bytes); `mark_dirty`, `clear_dirty`, and `erase` keep it in step with the
//! summary bits so the totals always equal the sums over dirty nodes.

use sfs_types::Key;
use std::cmp::Ordering;
use std::mem;

pub(crate) const SELF_DIRTY: u8 = 0x1;
pub(crate) const LEFT_DIRTY: u8 = 0x2;
pub(crate) const RIGHT_DIRTY: u8 = 0x4;

/// Arena index of a live node.
pub(crate) type NodeId = usize;

/// The stored state of an item: a live value or a deletion marker.
///
/// A tombstone shadows older on-storage data until it is written out to a
/// segment; it carries no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Payload {
    Live(Vec<u8>),
    Tombstone,
}

impl Payload {
    pub(crate) fn value_len(&self) -> usize {
        match self {
            Self::Live(val) => val.len(),
            Self::Tombstone => 0,
        }
    }

    pub(crate) fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }
}

#[derive(Debug)]
struct Node {
    key: Key,
    payload: Payload,
    summary: u8,
    height: u8,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

/// Result of [`ItemTree::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    Inserted(NodeId),
    /// A live item already holds the key; the insertion was discarded.
    Exists,
}

#[derive(Debug, Default)]
pub(crate) struct ItemTree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
    nr_items: usize,
    nr_dirty_items: usize,
    dirty_key_bytes: usize,
    dirty_val_bytes: usize,
}

impl ItemTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("live node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("live node id")
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn dealloc(&mut self, id: NodeId) -> Node {
        self.free.push(id);
        self.nodes[id].take().expect("live node id")
    }

    pub(crate) fn len(&self) -> usize {
        self.nr_items
    }

    pub(crate) fn has_dirty(&self) -> bool {
        self.nr_dirty_items != 0
    }

    /// Current dirty accounting: (item count, key bytes, value bytes).
    pub(crate) fn dirty_totals(&self) -> (usize, usize, usize) {
        (
            self.nr_dirty_items,
            self.dirty_key_bytes,
            self.dirty_val_bytes,
        )
    }

    pub(crate) fn key(&self, id: NodeId) -> &Key {
        &self.node(id).key
    }

    pub(crate) fn value(&self, id: NodeId) -> &[u8] {
        match &self.node(id).payload {
            Payload::Live(val) => val,
            Payload::Tombstone => &[],
        }
    }

    pub(crate) fn value_len(&self, id: NodeId) -> usize {
        self.node(id).payload.value_len()
    }

    pub(crate) fn is_tombstone(&self, id: NodeId) -> bool {
        self.node(id).payload.is_tombstone()
    }

    // ── Search ──────────────────────────────────────────────────────────

    /// Descend for `key`, returning the exact node plus the last nodes the
    /// descent stepped left and right from. When no exact match exists those
    /// are the in-order neighbors of the search point.
    pub(crate) fn walk(&self, key: &Key) -> (Option<NodeId>, Option<NodeId>, Option<NodeId>) {
        let mut prev = None;
        let mut next = None;
        let mut cur = self.root;

        while let Some(id) = cur {
            let node = self.node(id);
            match key.cmp(&node.key) {
                Ordering::Less => {
                    next = Some(id);
                    cur = node.left;
                }
                Ordering::Greater => {
                    prev = Some(id);
                    cur = node.right;
                }
                Ordering::Equal => return (Some(id), prev, next),
            }
        }

        (None, prev, next)
    }

    /// Find the live item at `key`. Tombstones read as absent; callers that
    /// replace tombstones do so through [`ItemTree::insert`].
    pub(crate) fn find(&self, key: &Key) -> Option<NodeId> {
        let (exact, _, _) = self.walk(key);
        exact.filter(|&id| !self.node(id).payload.is_tombstone())
    }

    /// First node strictly after `key`, tombstones included so walks can
    /// step over them.
    pub(crate) fn next_after(&self, key: &Key) -> Option<NodeId> {
        let (exact, _, next) = self.walk(key);
        match exact {
            Some(id) => self.successor(id),
            None => next,
        }
    }

    /// In-order successor of a node.
    pub(crate) fn successor(&self, id: NodeId) -> Option<NodeId> {
        if let Some(right) = self.node(id).right {
            let mut cur = right;
            while let Some(left) = self.node(cur).left {
                cur = left;
            }
            return Some(cur);
        }

        let mut child = id;
        let mut parent = self.node(id).parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// Insert an item. A live item at the key rejects the insertion; a
    /// tombstone at the key is erased (dirty accounting included) and the
    /// new item takes its place. `dirty` seeds the node's own dirty bit and
    /// propagates it through the ancestors.
    pub(crate) fn insert(&mut self, key: Key, payload: Payload, dirty: bool) -> InsertOutcome {
        'restart: loop {
            let mut parent = None;
            let mut link_left = false;
            let mut cur = self.root;

            while let Some(id) = cur {
                match key.cmp(&self.node(id).key) {
                    Ordering::Less => {
                        parent = Some(id);
                        link_left = true;
                        cur = self.node(id).left;
                    }
                    Ordering::Greater => {
                        parent = Some(id);
                        link_left = false;
                        cur = self.node(id).right;
                    }
                    Ordering::Equal => {
                        if !self.node(id).payload.is_tombstone() {
                            return InsertOutcome::Exists;
                        }
                        // Replace the tombstone: erase it and search again,
                        // since the erase can rebalance the whole path.
                        self.erase(id);
                        continue 'restart;
                    }
                }
            }

            let key_len = key.len();
            let val_len = payload.value_len();
            let id = self.alloc(Node {
                key,
                payload,
                summary: if dirty { SELF_DIRTY } else { 0 },
                height: 1,
                parent,
                left: None,
                right: None,
            });
            match parent {
                None => self.root = Some(id),
                Some(p) => {
                    if link_left {
                        self.node_mut(p).left = Some(id);
                    } else {
                        self.node_mut(p).right = Some(id);
                    }
                }
            }
            self.nr_items += 1;

            if dirty {
                self.nr_dirty_items += 1;
                self.dirty_key_bytes += key_len;
                self.dirty_val_bytes += val_len;
                self.propagate_summary(parent, None);
            }
            self.retrace(parent);

            return InsertOutcome::Inserted(id);
        }
    }

    /// Set the node's own dirty bit and account for its key and value bytes.
    /// No-op when already dirty.
    pub(crate) fn mark_dirty(&mut self, id: NodeId) {
        let node = self.node(id);
        if node.summary & SELF_DIRTY != 0 {
            return;
        }
        let key_len = node.key.len();
        let val_len = node.payload.value_len();
        let parent = node.parent;

        self.node_mut(id).summary |= SELF_DIRTY;
        self.nr_dirty_items += 1;
        self.dirty_key_bytes += key_len;
        self.dirty_val_bytes += val_len;

        self.propagate_summary(parent, None);
    }

    /// Clear the node's own dirty bit and release its accounting. No-op when
    /// already clean.
    pub(crate) fn clear_dirty(&mut self, id: NodeId) {
        let node = self.node(id);
        if node.summary & SELF_DIRTY == 0 {
            return;
        }
        let key_len = node.key.len();
        let val_len = node.payload.value_len();
        let parent = node.parent;

        self.node_mut(id).summary &= !SELF_DIRTY;
        self.nr_dirty_items -= 1;
        self.dirty_key_bytes -= key_len;
        self.dirty_val_bytes -= val_len;

        self.propagate_summary(parent, None);
    }

    /// Swap in a new value, returning the old one. The caller is responsible
    /// for clearing and re-marking dirty around the swap so the byte
    /// accounting stays exact.
    pub(crate) fn replace_value(&mut self, id: NodeId, val: Vec<u8>) -> Vec<u8> {
        match mem::replace(&mut self.node_mut(id).payload, Payload::Live(val)) {
            Payload::Live(old) => old,
            Payload::Tombstone => Vec::new(),
        }
    }

    /// Turn the node into a tombstone, returning the old value for the
    /// caller to drop outside the lock. As with [`ItemTree::replace_value`],
    /// dirty accounting is the caller's job.
    pub(crate) fn take_tombstone(&mut self, id: NodeId) -> Vec<u8> {
        match mem::replace(&mut self.node_mut(id).payload, Payload::Tombstone) {
            Payload::Live(old) => old,
            Payload::Tombstone => Vec::new(),
        }
    }

    /// Remove a node: clear its dirty accounting first, then unlink it
    /// structurally. Other nodes never move, so their ids stay valid.
    pub(crate) fn erase(&mut self, id: NodeId) {
        self.clear_dirty(id);
        self.unlink(id);
        self.nr_items -= 1;
        self.dealloc(id);
    }

    // ── Dirty walk ──────────────────────────────────────────────────────

    /// First dirty node in key order.
    pub(crate) fn first_dirty(&self) -> Option<NodeId> {
        self.first_dirty_in(self.root)
    }

    fn first_dirty_in(&self, mut cur: Option<NodeId>) -> Option<NodeId> {
        while let Some(id) = cur {
            let node = self.node(id);
            if node.summary & LEFT_DIRTY != 0 {
                cur = node.left;
            } else if node.summary & SELF_DIRTY != 0 {
                return Some(id);
            } else if node.summary & RIGHT_DIRTY != 0 {
                cur = node.right;
            } else {
                break;
            }
        }
        None
    }

    /// Next dirty node after `id` in key order: the right subtree if it has
    /// dirty nodes, else the nearest greater ancestor, taking that ancestor
    /// itself when dirty and restarting from it otherwise.
    pub(crate) fn next_dirty(&self, mut id: NodeId) -> Option<NodeId> {
        loop {
            let node = self.node(id);
            if node.summary & RIGHT_DIRTY != 0 {
                return self.first_dirty_in(node.right);
            }

            let mut child = id;
            let mut parent = self.node(child).parent;
            while let Some(p) = parent {
                if self.node(p).right != Some(child) {
                    break;
                }
                child = p;
                parent = self.node(p).parent;
            }
            let p = parent?;

            if self.node(p).summary & SELF_DIRTY != 0 {
                return Some(p);
            }
            id = p;
        }
    }

    // ── Summary maintenance ─────────────────────────────────────────────

    fn child_dirty_bit(&self, child: Option<NodeId>, bit: u8) -> u8 {
        match child {
            Some(c) if self.node(c).summary != 0 => bit,
            _ => 0,
        }
    }

    fn compute_summary(&self, id: NodeId) -> u8 {
        let node = self.node(id);
        (node.summary & SELF_DIRTY)
            | self.child_dirty_bit(node.left, LEFT_DIRTY)
            | self.child_dirty_bit(node.right, RIGHT_DIRTY)
    }

    /// Recompute summaries upward from `cur`, stopping at `stop` or at the
    /// first ancestor whose summary is already correct. All structural
    /// changes sit below the starting point on a single upward path, so an
    /// unchanged ancestor ends the walk.
    fn propagate_summary(&mut self, mut cur: Option<NodeId>, stop: Option<NodeId>) {
        while let Some(id) = cur {
            if Some(id) == stop {
                break;
            }
            let fresh = self.compute_summary(id);
            if self.node(id).summary == fresh {
                break;
            }
            self.node_mut(id).summary = fresh;
            cur = self.node(id).parent;
        }
    }

    // ── Structural maintenance ──────────────────────────────────────────

    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                if self.node(p).left == Some(old) {
                    self.node_mut(p).left = new;
                } else {
                    self.node_mut(p).right = new;
                }
            }
        }
    }

    fn height_of(&self, id: Option<NodeId>) -> u8 {
        id.map_or(0, |id| self.node(id).height)
    }

    fn update_height(&mut self, id: NodeId) {
        let node = self.node(id);
        let height = 1 + self.height_of(node.left).max(self.height_of(node.right));
        self.node_mut(id).height = height;
    }

    fn balance(&self, id: NodeId) -> i32 {
        let node = self.node(id);
        i32::from(self.height_of(node.left)) - i32::from(self.height_of(node.right))
    }

    /// Left-rotate around `x`, returning the new subtree root. Heights and
    /// summaries of both nodes are recomputed, the demoted node first; the
    /// subtree's membership is unchanged so ancestors need no update.
    fn rotate_left(&mut self, x: NodeId) -> NodeId {
        let y = self.node(x).right.expect("rotate_left needs a right child");
        let inner = self.node(y).left;
        let parent = self.node(x).parent;

        self.node_mut(x).right = inner;
        if let Some(t) = inner {
            self.node_mut(t).parent = Some(x);
        }
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
        self.replace_child(parent, x, Some(y));
        self.node_mut(y).parent = parent;

        self.update_height(x);
        self.update_height(y);
        let fresh = self.compute_summary(x);
        self.node_mut(x).summary = fresh;
        let fresh = self.compute_summary(y);
        self.node_mut(y).summary = fresh;

        y
    }

    fn rotate_right(&mut self, x: NodeId) -> NodeId {
        let y = self.node(x).left.expect("rotate_right needs a left child");
        let inner = self.node(y).right;
        let parent = self.node(x).parent;

        self.node_mut(x).left = inner;
        if let Some(t) = inner {
            self.node_mut(t).parent = Some(x);
        }
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
        self.replace_child(parent, x, Some(y));
        self.node_mut(y).parent = parent;

        self.update_height(x);
        self.update_height(y);
        let fresh = self.compute_summary(x);
        self.node_mut(x).summary = fresh;
        let fresh = self.compute_summary(y);
        self.node_mut(y).summary = fresh;

        y
    }

    /// Walk from `cur` to the root restoring heights and the AVL balance
    /// bound. Summaries along the path must already be correct; rotations
    /// keep them correct locally.
    fn retrace(&mut self, mut cur: Option<NodeId>) {
        while let Some(id) = cur {
            self.update_height(id);
            let bf = self.balance(id);
            let sub_root = if bf > 1 {
                let left = self.node(id).left.expect("left-heavy node");
                if self.balance(left) < 0 {
                    self.rotate_left(left);
                }
                self.rotate_right(id)
            } else if bf < -1 {
                let right = self.node(id).right.expect("right-heavy node");
                if self.balance(right) > 0 {
                    self.rotate_right(right);
                }
                self.rotate_left(id)
            } else {
                id
            };
            cur = self.node(sub_root).parent;
        }
    }

    /// Unlink a node from the tree, fixing summaries and rebalancing.
    fn unlink(&mut self, id: NodeId) {
        let (left, right, parent) = {
            let node = self.node(id);
            (node.left, node.right, node.parent)
        };

        if left.is_none() || right.is_none() {
            // At most one child: splice it into our place.
            let child = left.or(right);
            self.replace_child(parent, id, child);
            if let Some(c) = child {
                self.node_mut(c).parent = parent;
            }
            self.propagate_summary(parent, None);
            self.retrace(parent);
            return;
        }

        let left = left.expect("checked above");
        let right = right.expect("checked above");

        // Two children: relink the in-order successor (leftmost of the right
        // subtree) into our position. The successor has no left child.
        let mut succ = right;
        while let Some(l) = self.node(succ).left {
            succ = l;
        }

        if succ == right {
            // The successor is our direct right child and keeps its own
            // right subtree.
            self.node_mut(succ).left = Some(left);
            self.node_mut(left).parent = Some(succ);
            self.replace_child(parent, id, Some(succ));
            self.node_mut(succ).parent = parent;

            let fresh = self.compute_summary(succ);
            self.node_mut(succ).summary = fresh;
            self.propagate_summary(parent, None);
            self.retrace(Some(succ));
        } else {
            let succ_parent = self.node(succ).parent.expect("deep successor has parent");
            let succ_right = self.node(succ).right;

            self.node_mut(succ_parent).left = succ_right;
            if let Some(r) = succ_right {
                self.node_mut(r).parent = Some(succ_parent);
            }
            self.node_mut(succ).right = Some(right);
            self.node_mut(right).parent = Some(succ);
            self.node_mut(succ).left = Some(left);
            self.node_mut(left).parent = Some(succ);
            self.replace_child(parent, id, Some(succ));
            self.node_mut(succ).parent = parent;

            // Fix the segment below the successor's new position, then the
            // successor from scratch, then the segment above it.
            self.propagate_summary(Some(succ_parent), Some(succ));
            let fresh = self.compute_summary(succ);
            self.node_mut(succ).summary = fresh;
            self.propagate_summary(parent, None);
            self.retrace(Some(succ_parent));
        }
    }

    // ── Audit ───────────────────────────────────────────────────────────

    /// Recompute every structural and augmented property from scratch and
    /// panic on any mismatch. Test builds only.
    #[cfg(test)]
    pub(crate) fn audit(&self) {
        let totals = self.audit_subtree(self.root, None, None, None);
        assert_eq!(totals.count, self.nr_items, "item count");
        assert_eq!(totals.dirty_count, self.nr_dirty_items, "dirty item count");
        assert_eq!(totals.dirty_key_bytes, self.dirty_key_bytes, "dirty key bytes");
        assert_eq!(totals.dirty_val_bytes, self.dirty_val_bytes, "dirty value bytes");
        let live_slots = self.nodes.iter().filter(|slot| slot.is_some()).count();
        assert_eq!(live_slots, self.nr_items, "arena slots");
        assert_eq!(self.nodes.len() - self.free.len(), self.nr_items, "free list");
    }

    #[cfg(test)]
    fn audit_subtree(
        &self,
        cur: Option<NodeId>,
        parent: Option<NodeId>,
        lower: Option<&Key>,
        upper: Option<&Key>,
    ) -> AuditTotals {
        let Some(id) = cur else {
            return AuditTotals::default();
        };
        let node = self.node(id);

        assert_eq!(node.parent, parent, "parent link of {id}");
        if let Some(lower) = lower {
            assert!(node.key > *lower, "ordering below {id}");
        }
        if let Some(upper) = upper {
            assert!(node.key < *upper, "ordering above {id}");
        }
        if node.payload.is_tombstone() {
            assert_eq!(node.payload.value_len(), 0, "tombstone value at {id}");
        }

        let left = self.audit_subtree(node.left, Some(id), lower, Some(&node.key));
        let right = self.audit_subtree(node.right, Some(id), Some(&node.key), upper);

        let height = 1 + left.height.max(right.height);
        assert_eq!(node.height, height, "height of {id}");
        let bf = i32::from(left.height) - i32::from(right.height);
        assert!(bf.abs() <= 1, "balance of {id}");

        let self_dirty = node.summary & SELF_DIRTY != 0;
        let expect = (if self_dirty { SELF_DIRTY } else { 0 })
            | (if left.any_dirty { LEFT_DIRTY } else { 0 })
            | (if right.any_dirty { RIGHT_DIRTY } else { 0 });
        assert_eq!(node.summary, expect, "summary of {id}");

        AuditTotals {
            height,
            any_dirty: self_dirty || left.any_dirty || right.any_dirty,
            count: 1 + left.count + right.count,
            dirty_count: usize::from(self_dirty) + left.dirty_count + right.dirty_count,
            dirty_key_bytes: if self_dirty { node.key.len() } else { 0 }
                + left.dirty_key_bytes
                + right.dirty_key_bytes,
            dirty_val_bytes: if self_dirty { node.payload.value_len() } else { 0 }
                + left.dirty_val_bytes
                + right.dirty_val_bytes,
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
struct AuditTotals {
    height: u8,
    any_dirty: bool,
    count: usize,
    dirty_count: usize,
    dirty_key_bytes: usize,
    dirty_val_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn key(bytes: &[u8]) -> Key {
        Key::new(bytes.to_vec()).expect("key within bounds")
    }

    fn live(val: &[u8]) -> Payload {
        Payload::Live(val.to_vec())
    }

    fn dirty_keys(tree: &ItemTree) -> Vec<Key> {
        let mut out = Vec::new();
        let mut cur = tree.first_dirty();
        while let Some(id) = cur {
            out.push(tree.key(id).clone());
            cur = tree.next_dirty(id);
        }
        out
    }

    #[test]
    fn insert_and_find() {
        let mut tree = ItemTree::new();
        for k in [b"m", b"c", b"t", b"a", b"e", b"p", b"z"] {
            assert!(matches!(
                tree.insert(key(k), live(k), false),
                InsertOutcome::Inserted(_)
            ));
            tree.audit();
        }
        assert_eq!(tree.len(), 7);
        assert!(tree.find(&key(b"e")).is_some());
        assert!(tree.find(&key(b"q")).is_none());
        assert_eq!(tree.insert(key(b"e"), live(b"x"), false), InsertOutcome::Exists);
    }

    #[test]
    fn rebalance_on_sorted_insertion() {
        let mut tree = ItemTree::new();
        for byte in 0_u8..64 {
            tree.insert(key(&[byte]), live(&[byte]), false);
            tree.audit();
        }
        // A 64-node AVL tree is at most 8 levels deep.
        assert!(tree.node(tree.root.unwrap()).height <= 8);

        let mut cur = tree.next_after(&key(b""));
        let mut seen = 0_u8;
        while let Some(id) = cur {
            assert_eq!(tree.key(id), &key(&[seen]));
            seen += 1;
            cur = tree.successor(id);
        }
        assert_eq!(seen, 64);
    }

    #[test]
    fn find_skips_tombstones() {
        let mut tree = ItemTree::new();
        tree.insert(key(b"a"), Payload::Tombstone, false);
        assert!(tree.find(&key(b"a")).is_none());
        // The walk entry point still reaches the tombstone so iteration can
        // step over it.
        assert!(tree.next_after(&key(b"")).is_some());
    }

    #[test]
    fn insert_replaces_tombstone_and_clears_accounting() {
        let mut tree = ItemTree::new();
        let InsertOutcome::Inserted(id) = tree.insert(key(b"k"), Payload::Tombstone, true) else {
            panic!("tombstone insert failed");
        };
        assert!(tree.is_tombstone(id));
        assert_eq!(tree.dirty_totals(), (1, 1, 0));

        assert!(matches!(
            tree.insert(key(b"k"), live(b"value"), true),
            InsertOutcome::Inserted(_)
        ));
        tree.audit();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.dirty_totals(), (1, 1, 5));
        assert!(tree.find(&key(b"k")).is_some());
    }

    #[test]
    fn mark_clear_accounting() {
        let mut tree = ItemTree::new();
        let InsertOutcome::Inserted(a) = tree.insert(key(b"aa"), live(b"123"), false) else {
            panic!()
        };
        let InsertOutcome::Inserted(b) = tree.insert(key(b"bb"), live(b"4567"), false) else {
            panic!()
        };
        assert_eq!(tree.dirty_totals(), (0, 0, 0));

        tree.mark_dirty(a);
        tree.mark_dirty(b);
        tree.mark_dirty(b); // idempotent
        tree.audit();
        assert_eq!(tree.dirty_totals(), (2, 4, 7));

        tree.clear_dirty(a);
        tree.audit();
        assert_eq!(tree.dirty_totals(), (1, 2, 4));
        tree.clear_dirty(a); // idempotent
        assert_eq!(tree.dirty_totals(), (1, 2, 4));
    }

    #[test]
    fn dirty_walk_in_key_order() {
        let mut tree = ItemTree::new();
        let mut ids = BTreeMap::new();
        for byte in 0_u8..32 {
            let InsertOutcome::Inserted(id) = tree.insert(key(&[byte]), live(&[byte]), false)
            else {
                panic!()
            };
            ids.insert(byte, id);
        }
        for byte in [7_u8, 3, 29, 0, 16, 31, 8] {
            tree.mark_dirty(ids[&byte]);
            tree.audit();
        }

        let expect: Vec<Key> = [0_u8, 3, 7, 8, 16, 29, 31]
            .iter()
            .map(|b| key(&[*b]))
            .collect();
        assert_eq!(dirty_keys(&tree), expect);
    }

    #[test]
    fn erase_leaf_inner_and_root() {
        let mut tree = ItemTree::new();
        for byte in 0_u8..16 {
            tree.insert(key(&[byte]), live(&[byte]), false);
        }
        // Erase in an order that exercises leaf, one-child, and two-child
        // unlinks, auditing each step.
        for byte in [5_u8, 0, 15, 8, 7, 9, 1, 2, 3, 4, 6, 10, 11, 12, 13, 14] {
            let (exact, _, _) = tree.walk(&key(&[byte]));
            tree.erase(exact.expect("present"));
            tree.audit();
            assert!(tree.find(&key(&[byte])).is_none());
        }
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn erase_keeps_other_ids_valid() {
        let mut tree = ItemTree::new();
        let mut ids = Vec::new();
        for byte in 0_u8..8 {
            let InsertOutcome::Inserted(id) = tree.insert(key(&[byte]), live(&[byte]), false)
            else {
                panic!()
            };
            ids.push(id);
        }
        tree.mark_dirty(ids[2]);
        tree.mark_dirty(ids[5]);

        // Erase a two-child node between the two dirty ones; the dirty walk
        // must survive with the same ids.
        tree.erase(ids[3]);
        tree.audit();
        assert_eq!(tree.first_dirty(), Some(ids[2]));
        assert_eq!(tree.next_dirty(ids[2]), Some(ids[5]));
    }

    #[test]
    fn replace_value_roundtrip() {
        let mut tree = ItemTree::new();
        let InsertOutcome::Inserted(id) = tree.insert(key(b"k"), live(b"old"), true) else {
            panic!()
        };
        tree.clear_dirty(id);
        let old = tree.replace_value(id, b"newer".to_vec());
        tree.mark_dirty(id);
        tree.audit();
        assert_eq!(old, b"old");
        assert_eq!(tree.value(id), b"newer");
        assert_eq!(tree.dirty_totals(), (1, 1, 5));
    }

    #[test]
    fn take_tombstone_returns_value() {
        let mut tree = ItemTree::new();
        let InsertOutcome::Inserted(id) = tree.insert(key(b"k"), live(b"doomed"), true) else {
            panic!()
        };
        tree.clear_dirty(id);
        let old = tree.take_tombstone(id);
        tree.mark_dirty(id);
        tree.audit();
        assert_eq!(old, b"doomed");
        assert!(tree.is_tombstone(id));
        assert_eq!(tree.dirty_totals(), (1, 1, 0));
        assert!(tree.find(&key(b"k")).is_none());
    }

    // Random operation sequences against a model map, auditing the tree
    // after every step.

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8, u8),
        InsertDirty(u8, u8),
        MarkDirty(u8),
        ClearDirty(u8),
        Delete(u8),
        Erase(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), any::<u8>()).prop_map(|(k, v)| Op::Insert(k % 24, v)),
            (any::<u8>(), any::<u8>()).prop_map(|(k, v)| Op::InsertDirty(k % 24, v)),
            any::<u8>().prop_map(|k| Op::MarkDirty(k % 24)),
            any::<u8>().prop_map(|k| Op::ClearDirty(k % 24)),
            any::<u8>().prop_map(|k| Op::Delete(k % 24)),
            any::<u8>().prop_map(|k| Op::Erase(k % 24)),
        ]
    }

    #[derive(Debug, Clone, PartialEq)]
    struct ModelItem {
        value: Vec<u8>,
        tombstone: bool,
        dirty: bool,
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(96))]

        #[test]
        fn random_ops_preserve_invariants(ops in proptest::collection::vec(op_strategy(), 1..120)) {
            let mut tree = ItemTree::new();
            let mut model: BTreeMap<u8, ModelItem> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Insert(k, v) | Op::InsertDirty(k, v) => {
                        let dirty = matches!(op, Op::InsertDirty(..));
                        let outcome = tree.insert(key(&[k]), live(&[v]), dirty);
                        match model.get(&k) {
                            Some(item) if !item.tombstone => {
                                prop_assert_eq!(outcome, InsertOutcome::Exists);
                            }
                            _ => {
                                prop_assert!(matches!(outcome, InsertOutcome::Inserted(_)));
                                model.insert(k, ModelItem { value: vec![v], tombstone: false, dirty });
                            }
                        }
                    }
                    Op::MarkDirty(k) => {
                        if let (Some(id), _, _) = tree.walk(&key(&[k])) {
                            tree.mark_dirty(id);
                            model.get_mut(&k).expect("model in sync").dirty = true;
                        }
                    }
                    Op::ClearDirty(k) => {
                        if let (Some(id), _, _) = tree.walk(&key(&[k])) {
                            tree.clear_dirty(id);
                            model.get_mut(&k).expect("model in sync").dirty = false;
                        }
                    }
                    Op::Delete(k) => {
                        if let Some(id) = tree.find(&key(&[k])) {
                            tree.clear_dirty(id);
                            tree.take_tombstone(id);
                            tree.mark_dirty(id);
                            let item = model.get_mut(&k).expect("model in sync");
                            item.tombstone = true;
                            item.value = Vec::new();
                            item.dirty = true;
                        }
                    }
                    Op::Erase(k) => {
                        if let (Some(id), _, _) = tree.walk(&key(&[k])) {
                            tree.erase(id);
                            model.remove(&k);
                        }
                    }
                }
                tree.audit();
            }

            // Live lookups and their values agree with the model.
            for k in 0_u8..24 {
                let found = tree.find(&key(&[k]));
                let expect_live = model.get(&k).is_some_and(|item| !item.tombstone);
                prop_assert_eq!(found.is_some(), expect_live);
                if let Some(id) = found {
                    prop_assert_eq!(tree.value(id), &model[&k].value[..]);
                }
            }

            // The dirty walk yields exactly the model's dirty keys in order.
            let walked = dirty_keys(&tree);
            let expect: Vec<Key> = model
                .iter()
                .filter(|(_, item)| item.dirty)
                .map(|(k, _)| key(&[*k]))
                .collect();
            prop_assert_eq!(walked, expect);
        }
    }
}
