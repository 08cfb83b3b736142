//! Ordered multiset for massively parallel insertion and erasure.
//!
//! A B-tree of branching factor 8 whose nodes live in a [`SlotArena`], with
//! all parent/child links expressed as slot indices. Concurrency is
//! lock coupling over a per-slot lock table: every descent holds at most a
//! parent/child pair (plus siblings during a rebalance), and structural
//! fixes happen on the way down (full nodes are split before descending on
//! insert, minimal nodes are refilled before descending on erase), so no
//! operation ever has to walk back up, and no key is ever visible in two
//! positions at once.
//!
//! Unlike the hash set, duplicates are admitted and counted individually;
//! `erase` removes exactly one matching occurrence. In-order traversal
//! yields keys in non-decreasing order.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;

use crate::arena::{SlotArena, NIL};
use crate::error::Error;

/// Branching factor 8: up to 7 keys and 8 children per node.
const MAX_KEYS: usize = 7;
/// Non-root nodes never go below this many keys.
const MIN_KEYS: usize = 3;

/// One tree node; occupies exactly one arena slot.
#[derive(Clone, Copy)]
struct Node<K: Copy> {
    keys: [MaybeUninit<K>; MAX_KEYS],
    /// `len + 1` entries are meaningful on internal nodes, none on leaves.
    children: [u32; MAX_KEYS + 1],
    len: u8,
    leaf: bool,
}

impl<K: Copy + Ord> Node<K> {
    fn new(leaf: bool) -> Self {
        Self {
            keys: [MaybeUninit::uninit(); MAX_KEYS],
            children: [NIL; MAX_KEYS + 1],
            len: 0,
            leaf,
        }
    }

    fn key(&self, i: usize) -> K {
        debug_assert!(i < self.len as usize);
        unsafe { self.keys[i].assume_init() }
    }

    fn set_key(&mut self, i: usize, key: K) {
        debug_assert!(i < self.len as usize);
        self.keys[i] = MaybeUninit::new(key);
    }

    /// First index whose key is `>= key`, or `len`.
    fn lower_bound(&self, key: &K) -> usize {
        let len = self.len as usize;
        (0..len).find(|&i| self.key(i) >= *key).unwrap_or(len)
    }

    /// First index whose key is `> key`, or `len`. Equal keys sort to the
    /// left, so inserts descend to the right of existing duplicates.
    fn upper_bound(&self, key: &K) -> usize {
        let len = self.len as usize;
        (0..len).find(|&i| self.key(i) > *key).unwrap_or(len)
    }

    fn insert_key_at(&mut self, i: usize, key: K) {
        let len = self.len as usize;
        debug_assert!(len < MAX_KEYS && i <= len);
        self.keys.copy_within(i..len, i + 1);
        self.keys[i] = MaybeUninit::new(key);
        self.len += 1;
    }

    fn remove_key_at(&mut self, i: usize) -> K {
        let len = self.len as usize;
        debug_assert!(i < len);
        let key = self.key(i);
        self.keys.copy_within(i + 1..len, i);
        self.len -= 1;
        key
    }

    /// Insert a child pointer; call after the paired `insert_key_at` so the
    /// child count (`len + 1`) is already up to date.
    fn insert_child_at(&mut self, i: usize, child: u32) {
        let count = self.len as usize + 1;
        debug_assert!(i < count);
        self.children.copy_within(i..count - 1, i + 1);
        self.children[i] = child;
    }

    /// Remove a child pointer; call after the paired `remove_key_at`.
    fn remove_child_at(&mut self, i: usize) -> u32 {
        let count = self.len as usize + 2;
        let child = self.children[i];
        self.children.copy_within(i + 1..count, i);
        child
    }
}

/// What an erase descent is looking for.
enum Target<K> {
    /// One occurrence of this key.
    Key(K),
    /// The smallest key of the subtree (successor extraction).
    Min,
    /// The largest key of the subtree (predecessor extraction).
    Max,
}

/// Fixed-capacity concurrent B-tree multiset.
///
/// Holds at most `capacity` keys, duplicates included, all storage allocated
/// up front. `insert` and `erase` may be called from any number of threads;
/// [`iter`](FlatBtree::iter) takes `&mut self` so traversal is statically
/// confined to quiescent moments.
///
/// ```
/// use flatcoll::FlatBtree;
///
/// let tree: FlatBtree<i32> = FlatBtree::with_capacity(10).unwrap();
/// tree.insert(3).unwrap();
/// tree.insert(1).unwrap();
/// tree.insert(3).unwrap(); // duplicates are kept
/// assert_eq!(tree.len(), 3);
/// assert!(tree.erase(&3)); // removes one occurrence
/// assert!(tree.contains(&3));
/// ```
pub struct FlatBtree<K: Copy + Ord> {
    arena: SlotArena<Node<K>>,
    /// One lock per node slot; a lock's slot may be recycled, the lock is not.
    locks: Box<[Mutex<()>]>,
    root: AtomicU32,
    /// Lock of the virtual parent of the root; serializes root replacement.
    root_latch: Mutex<()>,
    len: AtomicUsize,
    capacity: usize,
}

impl<K: Copy + Ord> FlatBtree<K> {
    /// Create a multiset that can hold up to `capacity` keys (duplicates
    /// counted individually). Fails with [`Error::InvalidCapacity`] when
    /// `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        // One node per element is a loose upper bound (every node keeps at
        // least MIN_KEYS keys except the root); the slack covers the root
        // and nodes allocated mid-split.
        let node_slots = capacity + 2;
        Ok(Self {
            arena: SlotArena::with_capacity(node_slots),
            locks: (0..node_slots).map(|_| Mutex::new(())).collect(),
            root: AtomicU32::new(NIL),
            root_latch: Mutex::new(()),
            len: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Maximum number of keys the multiset can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys currently stored (duplicates counted individually).
    ///
    /// Exact whenever no mutation is in flight; during concurrent mutation
    /// it drifts by at most the number of in-flight operations.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// `true` when the multiset holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node(&self, idx: u32) -> &Node<K> {
        // All callers hold the lock covering `idx` (or the exclusive borrow
        // in the iterator), so the slot is initialized and stable.
        unsafe { self.arena.get(idx) }
    }

    /// # Safety
    /// Caller must hold the lock for `idx` and must not hold another
    /// reference to the same slot.
    #[allow(clippy::mut_from_ref)]
    unsafe fn node_mut(&self, idx: u32) -> &mut Node<K> {
        unsafe { self.arena.get_mut(idx) }
    }

    /// Insert `key`; duplicates are always accepted while capacity remains.
    pub fn insert(&self, key: K) -> Result<(), Error> {
        // Reserve an element slot first so concurrent inserts can never
        // overshoot the declared capacity.
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map_err(|_| Error::exhausted_one())?;
        match self.insert_inner(key) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    fn insert_inner(&self, key: K) -> Result<(), Error> {
        let latch = self.root_latch.lock();
        let root_idx = self.root.load(Ordering::Acquire);
        if root_idx == NIL {
            let idx = self.arena.acquire().ok_or_else(Error::exhausted_one)?;
            let mut node = Node::new(true);
            node.insert_key_at(0, key);
            unsafe { self.arena.write(idx, node) };
            self.root.store(idx, Ordering::Release);
            return Ok(());
        }

        let mut cur = root_idx;
        let mut cur_guard = self.locks[cur as usize].lock();
        if self.node(cur).len as usize == MAX_KEYS {
            // Grow: the old root splits and a fresh root takes both halves.
            // The latch is still held, so nobody can observe the new root
            // before it is locked below.
            let new_root_idx = self.arena.acquire().ok_or_else(Error::exhausted_one)?;
            let (sep, right_idx) = match self.split_node(cur) {
                Ok(split) => split,
                Err(err) => {
                    unsafe { self.arena.release(new_root_idx) };
                    return Err(err);
                }
            };
            let mut new_root = Node::new(false);
            new_root.insert_key_at(0, sep);
            new_root.children[0] = cur;
            new_root.children[1] = right_idx;
            unsafe { self.arena.write(new_root_idx, new_root) };
            self.root.store(new_root_idx, Ordering::Release);

            let new_guard = self.locks[new_root_idx as usize].lock();
            drop(cur_guard);
            cur = new_root_idx;
            cur_guard = new_guard;
        }
        drop(latch);

        // Single-pass descent: every child is split before it is entered,
        // so the node above always has room for the separator.
        loop {
            if self.node(cur).leaf {
                let node = unsafe { self.node_mut(cur) };
                let pos = node.upper_bound(&key);
                node.insert_key_at(pos, key);
                return Ok(());
            }
            let pos = self.node(cur).upper_bound(&key);
            let mut child = self.node(cur).children[pos];
            let mut child_guard = self.locks[child as usize].lock();
            if self.node(child).len as usize == MAX_KEYS {
                let (sep, right_idx) = self.split_node(child)?;
                let node = unsafe { self.node_mut(cur) };
                node.insert_key_at(pos, sep);
                node.insert_child_at(pos + 1, right_idx);
                if key >= sep {
                    drop(child_guard);
                    child = right_idx;
                    child_guard = self.locks[child as usize].lock();
                }
            }
            drop(cur_guard);
            cur = child;
            cur_guard = child_guard;
        }
    }

    /// Split the full node `idx` (its lock held by the caller) around its
    /// median. Returns the separator and the freshly allocated right half;
    /// the right half is unreachable until the caller links it, so it needs
    /// no lock. Allocates before mutating, so a failure leaves `idx` intact.
    fn split_node(&self, idx: u32) -> Result<(K, u32), Error> {
        let right_idx = self.arena.acquire().ok_or_else(Error::exhausted_one)?;
        let node = unsafe { self.node_mut(idx) };
        debug_assert_eq!(node.len as usize, MAX_KEYS);
        let mid = MAX_KEYS / 2;
        let sep = node.key(mid);
        let moved = MAX_KEYS - mid - 1;

        let mut right = Node::new(node.leaf);
        right.keys[..moved].copy_from_slice(&node.keys[mid + 1..MAX_KEYS]);
        if !node.leaf {
            right.children[..moved + 1].copy_from_slice(&node.children[mid + 1..MAX_KEYS + 1]);
        }
        right.len = moved as u8;
        node.len = mid as u8;

        unsafe { self.arena.write(right_idx, right) };
        Ok((sep, right_idx))
    }

    /// `true` if at least one occurrence of `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        let latch = self.root_latch.lock();
        let root_idx = self.root.load(Ordering::Acquire);
        if root_idx == NIL {
            return false;
        }
        let mut cur = root_idx;
        let mut _guard = self.locks[cur as usize].lock();
        drop(latch);
        loop {
            let node = self.node(cur);
            let pos = node.lower_bound(key);
            if pos < node.len as usize && node.key(pos) == *key {
                return true;
            }
            if node.leaf {
                return false;
            }
            let child = node.children[pos];
            // Couple: take the child's lock before letting go of the parent.
            let child_guard = self.locks[child as usize].lock();
            _guard = child_guard;
            cur = child;
        }
    }

    /// Remove one occurrence of `key` if present. Erasing an absent key is a
    /// normal `false` outcome, not an error.
    pub fn erase(&self, key: &K) -> bool {
        let latch = self.root_latch.lock();
        let root_idx = self.root.load(Ordering::Acquire);
        if root_idx == NIL {
            return false;
        }
        let mut cur = root_idx;
        let mut cur_guard = self.locks[cur as usize].lock();

        // Shrink check: a one-separator internal root with two minimal
        // children is the only shape a descent step could empty. Merging it
        // here, under the latch, keeps every deeper node's "more than
        // minimal or root" precondition intact.
        let root_node = self.node(cur);
        if !root_node.leaf && root_node.len == 1 {
            let left = root_node.children[0];
            let right = root_node.children[1];
            let left_guard = self.locks[left as usize].lock();
            let right_guard = self.locks[right as usize].lock();
            if self.node(left).len as usize == MIN_KEYS
                && self.node(right).len as usize == MIN_KEYS
            {
                let dead = self.merge_children(cur, 0);
                debug_assert_eq!(dead, right);
                self.root.store(left, Ordering::Release);
                drop(right_guard);
                unsafe { self.arena.release(dead) };
                let old_root = cur;
                drop(cur_guard);
                unsafe { self.arena.release(old_root) };
                cur = left;
                cur_guard = left_guard;
            } else {
                drop(left_guard);
                drop(right_guard);
            }
        }
        drop(latch);

        let removed = self.erase_at(cur, cur_guard, Target::Key(*key)).is_some();
        if removed {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Recursive erase step. The caller passes the lock on `idx`, which is
    /// guaranteed to hold more than `MIN_KEYS` keys (or to be the root).
    /// Returns the removed key, or `None` if no occurrence was found.
    fn erase_at(&self, idx: u32, guard: MutexGuard<'_, ()>, target: Target<K>) -> Option<K> {
        if self.node(idx).leaf {
            let node = unsafe { self.node_mut(idx) };
            let len = node.len as usize;
            let pos = match target {
                Target::Key(key) => {
                    let pos = node.lower_bound(&key);
                    if pos >= len || node.key(pos) != key {
                        return None;
                    }
                    pos
                }
                Target::Min => 0,
                Target::Max => {
                    if len == 0 {
                        return None;
                    }
                    len - 1
                }
            };
            if len == 0 {
                return None; // drained root leaf
            }
            return Some(node.remove_key_at(pos));
        }

        match target {
            Target::Key(key) => {
                let pos = self.node(idx).lower_bound(&key);
                let hit = pos < self.node(idx).len as usize && self.node(idx).key(pos) == key;
                if hit {
                    // An occurrence is anchored at this separator. Replace it
                    // with a neighbor from whichever child can spare one;
                    // this node stays locked until the replacement lands.
                    let left = self.node(idx).children[pos];
                    let left_guard = self.locks[left as usize].lock();
                    if self.node(left).len as usize > MIN_KEYS {
                        let pred = self
                            .erase_at(left, left_guard, Target::Max)
                            .expect("roomy child cannot be empty");
                        let node = unsafe { self.node_mut(idx) };
                        let out = node.key(pos);
                        node.set_key(pos, pred);
                        return Some(out);
                    }
                    let right = self.node(idx).children[pos + 1];
                    let right_guard = self.locks[right as usize].lock();
                    if self.node(right).len as usize > MIN_KEYS {
                        drop(left_guard);
                        let succ = self
                            .erase_at(right, right_guard, Target::Min)
                            .expect("roomy child cannot be empty");
                        let node = unsafe { self.node_mut(idx) };
                        let out = node.key(pos);
                        node.set_key(pos, succ);
                        return Some(out);
                    }
                    // Both neighbors minimal: fold them together around the
                    // separator and take the occurrence out of the merge.
                    let dead = self.merge_children(idx, pos);
                    drop(right_guard);
                    unsafe { self.arena.release(dead) };
                    drop(guard);
                    return self.erase_at(left, left_guard, Target::Key(key));
                }
                let (child, child_guard) = self.roomy_child(idx, pos);
                drop(guard);
                self.erase_at(child, child_guard, Target::Key(key))
            }
            Target::Min => {
                let (child, child_guard) = self.roomy_child(idx, 0);
                drop(guard);
                self.erase_at(child, child_guard, Target::Min)
            }
            Target::Max => {
                let pos = self.node(idx).len as usize;
                let (child, child_guard) = self.roomy_child(idx, pos);
                drop(guard);
                self.erase_at(child, child_guard, Target::Max)
            }
        }
    }

    /// Lock `children[pos]` of `idx` and make sure it has more than
    /// `MIN_KEYS` keys before the caller descends into it, borrowing from a
    /// sibling or merging with one if needed. Returns the (possibly merged)
    /// child and its lock. Caller holds the lock on `idx`.
    fn roomy_child<'a>(&'a self, idx: u32, pos: usize) -> (u32, MutexGuard<'a, ()>) {
        let child = self.node(idx).children[pos];
        let child_guard = self.locks[child as usize].lock();
        if self.node(child).len as usize > MIN_KEYS {
            return (child, child_guard);
        }

        if pos > 0 {
            let sib = self.node(idx).children[pos - 1];
            let sib_guard = self.locks[sib as usize].lock();
            if self.node(sib).len as usize > MIN_KEYS {
                self.rotate_from_left(idx, pos);
                drop(sib_guard);
                return (child, child_guard);
            }
            // Left sibling is minimal too: fold the child into it.
            let dead = self.merge_children(idx, pos - 1);
            debug_assert_eq!(dead, child);
            drop(child_guard);
            unsafe { self.arena.release(dead) };
            return (sib, sib_guard);
        }

        let sib = self.node(idx).children[pos + 1];
        let sib_guard = self.locks[sib as usize].lock();
        if self.node(sib).len as usize > MIN_KEYS {
            self.rotate_from_right(idx, pos);
            drop(sib_guard);
            return (child, child_guard);
        }
        let dead = self.merge_children(idx, pos);
        debug_assert_eq!(dead, sib);
        drop(sib_guard);
        unsafe { self.arena.release(dead) };
        (child, child_guard)
    }

    /// Move the last key of `children[pos - 1]` up and the separator down
    /// into `children[pos]`. Locks on `idx` and both children are held.
    fn rotate_from_left(&self, idx: u32, pos: usize) {
        let parent = unsafe { self.node_mut(idx) };
        let left_idx = parent.children[pos - 1];
        let child_idx = parent.children[pos];
        let left = unsafe { self.node_mut(left_idx) };
        let child = unsafe { self.node_mut(child_idx) };

        child.insert_key_at(0, parent.key(pos - 1));
        if !child.leaf {
            child.insert_child_at(0, left.children[left.len as usize]);
        }
        parent.set_key(pos - 1, left.key(left.len as usize - 1));
        left.len -= 1;
    }

    /// Mirror image: first key of `children[pos + 1]` up, separator down
    /// into `children[pos]`.
    fn rotate_from_right(&self, idx: u32, pos: usize) {
        let parent = unsafe { self.node_mut(idx) };
        let child_idx = parent.children[pos];
        let right_idx = parent.children[pos + 1];
        let child = unsafe { self.node_mut(child_idx) };
        let right = unsafe { self.node_mut(right_idx) };

        let clen = child.len as usize;
        child.keys[clen] = MaybeUninit::new(parent.key(pos));
        if !child.leaf {
            child.children[clen + 1] = right.children[0];
        }
        child.len += 1;
        parent.set_key(pos, right.key(0));
        right.remove_key_at(0);
        if !right.leaf {
            right.remove_child_at(0);
        }
    }

    /// Fold `children[i + 1]` and the separator at `i` into `children[i]`.
    /// Locks on the parent and both children are held. Returns the emptied
    /// right node's index; the caller drops its guard and releases the slot.
    fn merge_children(&self, idx: u32, i: usize) -> u32 {
        let parent = unsafe { self.node_mut(idx) };
        let left_idx = parent.children[i];
        let sep = parent.remove_key_at(i);
        let right_idx = parent.remove_child_at(i + 1);

        let right = *self.node(right_idx);
        let left = unsafe { self.node_mut(left_idx) };
        let llen = left.len as usize;
        let rlen = right.len as usize;
        debug_assert!(llen + 1 + rlen <= MAX_KEYS);

        left.keys[llen] = MaybeUninit::new(sep);
        left.keys[llen + 1..llen + 1 + rlen].copy_from_slice(&right.keys[..rlen]);
        if !left.leaf {
            left.children[llen + 1..llen + 2 + rlen].copy_from_slice(&right.children[..rlen + 1]);
        }
        left.len = (llen + 1 + rlen) as u8;
        right_idx
    }

    /// In-order iteration over all keys, duplicates included.
    ///
    /// Taking `&mut self` is the quiescence barrier: the exclusive borrow
    /// proves no insert or erase is in flight, so the walk takes no locks.
    /// The iterator is `Clone` (restartable).
    pub fn iter(&mut self) -> InOrderIter<'_, K> {
        let root = self.root.load(Ordering::Acquire);
        let mut iter = InOrderIter {
            arena: &self.arena,
            stack: Vec::new(),
        };
        if root != NIL {
            iter.push_left_spine(root);
        }
        iter
    }

    /// Insert every key of `keys` from parallel lanes.
    ///
    /// Returns how many were applied (all of them, absent exhaustion). On
    /// exhaustion the batch reports a single aggregated
    /// [`Error::CapacityExhausted`], not one failure per lane.
    pub fn par_insert(&self, keys: &[K]) -> Result<usize, Error>
    where
        K: Send + Sync,
    {
        let (applied, rejected) = keys
            .par_iter()
            .map(|key| match self.insert(*key) {
                Ok(()) => (1usize, 0usize),
                Err(_) => (0, 1),
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
        if rejected > 0 {
            Err(Error::CapacityExhausted { applied, rejected })
        } else {
            Ok(applied)
        }
    }

    /// Erase one occurrence per key of `keys` from parallel lanes; returns
    /// how many were actually removed.
    pub fn par_erase(&self, keys: &[K]) -> usize
    where
        K: Send + Sync,
    {
        keys.par_iter()
            .map(|key| usize::from(self.erase(key)))
            .sum()
    }
}

/// Lazy, restartable in-order walk over a quiescent [`FlatBtree`].
pub struct InOrderIter<'a, K: Copy + Ord> {
    arena: &'a SlotArena<Node<K>>,
    /// `(node, next key index)` for every node on the current path.
    stack: Vec<(u32, usize)>,
}

impl<K: Copy + Ord> Clone for InOrderIter<'_, K> {
    fn clone(&self) -> Self {
        Self {
            arena: self.arena,
            stack: self.stack.clone(),
        }
    }
}

impl<K: Copy + Ord> InOrderIter<'_, K> {
    fn node(&self, idx: u32) -> Node<K> {
        // Quiescent by construction (`iter` borrows the tree exclusively).
        unsafe { self.arena.read(idx) }
    }

    fn push_left_spine(&mut self, mut idx: u32) {
        loop {
            self.stack.push((idx, 0));
            let node = self.node(idx);
            if node.leaf {
                return;
            }
            idx = node.children[0];
        }
    }
}

impl<K: Copy + Ord> Iterator for InOrderIter<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        loop {
            let &(idx, pos) = self.stack.last()?;
            let node = self.node(idx);
            if pos < node.len as usize {
                self.stack.last_mut().unwrap().1 = pos + 1;
                let key = node.key(pos);
                if !node.leaf {
                    self.push_left_spine(node.children[pos + 1]);
                }
                return Some(key);
            }
            self.stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            FlatBtree::<u32>::with_capacity(0),
            Err(Error::InvalidCapacity)
        ));
    }

    #[test]
    fn insert_contains_erase() {
        let tree: FlatBtree<i32> = FlatBtree::with_capacity(16).unwrap();
        tree.insert(5).unwrap();
        tree.insert(3).unwrap();
        tree.insert(9).unwrap();
        assert_eq!(tree.len(), 3);
        assert!(tree.contains(&3));
        assert!(!tree.contains(&4));

        assert!(tree.erase(&3));
        assert!(!tree.contains(&3));
        assert!(!tree.erase(&3));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn duplicates_are_counted_individually() {
        let tree: FlatBtree<u32> = FlatBtree::with_capacity(16).unwrap();
        for _ in 0..5 {
            tree.insert(7).unwrap();
        }
        assert_eq!(tree.len(), 5);

        // Each erase takes out exactly one occurrence.
        for remaining in (0..5).rev() {
            assert!(tree.erase(&7));
            assert_eq!(tree.len(), remaining);
        }
        assert!(!tree.erase(&7));
    }

    #[test]
    fn in_order_traversal_is_sorted_and_complete() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut keys: Vec<i64> = (0..2_000).map(|i| i % 500).collect(); // dups
        keys.shuffle(&mut rng);

        let mut tree: FlatBtree<i64> = FlatBtree::with_capacity(keys.len()).unwrap();
        for &key in &keys {
            tree.insert(key).unwrap();
        }

        let walked: Vec<i64> = tree.iter().collect();
        assert_eq!(walked.len(), keys.len());
        assert!(walked.windows(2).all(|w| w[0] <= w[1]), "out of order");

        let mut expected = keys.clone();
        expected.sort_unstable();
        assert_eq!(walked, expected);

        let walked_sum: i64 = tree.iter().sum();
        let input_sum: i64 = keys.iter().sum();
        assert_eq!(walked_sum, input_sum);
    }

    #[test]
    fn erase_against_model_in_random_order() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut keys: Vec<u32> = (0..1_000).map(|i| i % 300).collect();
        keys.shuffle(&mut rng);

        let mut tree: FlatBtree<u32> = FlatBtree::with_capacity(keys.len()).unwrap();
        let mut model: Vec<u32> = Vec::new();
        for &key in &keys {
            tree.insert(key).unwrap();
            model.push(key);
        }

        let mut to_erase = keys.clone();
        to_erase.shuffle(&mut rng);
        for key in to_erase {
            assert!(tree.erase(&key));
            let at = model.iter().position(|&k| k == key).unwrap();
            model.swap_remove(at);
            assert_eq!(tree.len(), model.len());
        }
        assert!(tree.is_empty());
        assert_eq!(tree.iter().count(), 0);
    }

    #[test]
    fn round_trip_sum() {
        let n: i64 = 1_000;
        let mut tree: FlatBtree<i64> = FlatBtree::with_capacity(n as usize).unwrap();
        let keys: Vec<i64> = (1..=n).collect();
        assert_eq!(tree.par_insert(&keys).unwrap(), n as usize);

        let sum: i64 = tree.iter().sum();
        assert_eq!(sum, n * (n + 1) / 2);

        assert_eq!(tree.par_erase(&keys), n as usize);
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.iter().count(), 0);
    }

    #[test]
    fn capacity_boundary_is_loud() {
        const CAP: usize = 20;
        let tree: FlatBtree<u32> = FlatBtree::with_capacity(CAP).unwrap();
        let mut applied = 0;
        let mut rejected = 0;
        for key in 0..(CAP as u32 + 5) {
            match tree.insert(key) {
                Ok(()) => applied += 1,
                Err(Error::CapacityExhausted { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(applied, CAP);
        assert_eq!(rejected, 5);
        assert_eq!(tree.len(), CAP);
    }

    #[test]
    fn erase_of_separator_keys_keeps_order() {
        // Enough keys to force several levels, then remove keys that end up
        // as internal separators.
        let mut tree: FlatBtree<u32> = FlatBtree::with_capacity(512).unwrap();
        for key in 0..512 {
            tree.insert(key).unwrap();
        }
        for key in (0..512).step_by(2) {
            assert!(tree.erase(&key));
        }
        let walked: Vec<u32> = tree.iter().collect();
        let expected: Vec<u32> = (0..512).filter(|k| k % 2 == 1).collect();
        assert_eq!(walked, expected);
    }
}
