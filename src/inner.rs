//! Volatile inner nodes of the sharded skip list.
//!
//! An [`InnerNode`] indexes up to [`MAX_LEAF_CAPACITY`] consecutive leaf
//! groups through three parallel arrays: the groups' bounds (`keys`), their
//! pool offsets (`leaves`) and a working copy of their commit bitmaps
//! (`mem_bitmap`) used to hand out free slots without touching durable
//! memory.
//!
//! # Concurrency
//!
//! - `max_key`, `level` and `next` are read without any lock by traversals.
//! - The arrays and `n_keys` change only under the write lock and are read
//!   only under the read lock, except `mem_bitmap` slots which inserters
//!   claim by CAS while holding the read lock.
//! - At most one thread at a time may turn its read hold into a write hold,
//!   admitted by the `is_split` gate (see [`InnerNode::try_begin_split`]).

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize};

use crate::agg::AggIndex;
use crate::constants::{LEAF_FULL, MAX_L, MAX_LEAF_CAPACITY};
use crate::leaf::LeafGroup;
use crate::lock::{NodeLock, ReadGuard, WriteGuard};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::pool::DurableRef;

/// A volatile skip-list node over a run of leaf groups.
#[repr(C, align(64))]
pub struct InnerNode {
    max_key: AtomicU64,
    n_keys: AtomicUsize,
    level: AtomicUsize,
    is_split: AtomicBool,
    is_head: bool,
    lock: NodeLock,
    /// Aggregation snapshot. Only set on shard heads.
    pub(crate) agg: AtomicPtr<AggIndex>,
    next: [AtomicPtr<InnerNode>; MAX_L],
    keys: [AtomicU64; MAX_LEAF_CAPACITY],
    leaves: [AtomicU64; MAX_LEAF_CAPACITY],
    mem_bitmap: [AtomicU64; MAX_LEAF_CAPACITY],
}

impl fmt::Debug for InnerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerNode")
            .field("max_key", &self.max_key())
            .field("n_keys", &self.n_keys())
            .field("level", &self.level())
            .field("is_head", &self.is_head)
            .field("is_split", &self.is_split.load(RELAXED))
            .finish_non_exhaustive()
    }
}

impl InnerNode {
    fn blank(is_head: bool, max_key: u64, level: usize) -> Self {
        Self {
            max_key: AtomicU64::new(max_key),
            n_keys: AtomicUsize::new(0),
            level: AtomicUsize::new(level),
            is_split: AtomicBool::new(false),
            is_head,
            lock: NodeLock::new(),
            agg: AtomicPtr::new(ptr::null_mut()),
            next: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            keys: std::array::from_fn(|_| AtomicU64::new(0)),
            leaves: std::array::from_fn(|_| AtomicU64::new(0)),
            mem_bitmap: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Shard head sentinel. Its `level` is the shard height.
    #[must_use]
    pub fn new_head() -> Box<Self> {
        Box::new(Self::blank(true, 0, 0))
    }

    /// Empty node at `level` with bound `max_key`.
    #[must_use]
    pub fn new_node(max_key: u64, level: usize) -> Box<Self> {
        Box::new(Self::blank(false, max_key, level))
    }

    // ========================================================================
    //  Lock-free fields
    // ========================================================================

    /// Largest key this node covers.
    #[inline(always)]
    #[must_use]
    pub fn max_key(&self) -> u64 {
        self.max_key.load(READ_ORD)
    }

    #[inline(always)]
    pub(crate) fn set_max_key(&self, max_key: u64) {
        self.max_key.store(max_key, WRITE_ORD);
    }

    /// Number of leaf groups referenced.
    #[inline(always)]
    #[must_use]
    pub fn n_keys(&self) -> usize {
        self.n_keys.load(READ_ORD)
    }

    /// Highest level this node is linked at (shard height for heads).
    #[inline(always)]
    #[must_use]
    pub fn level(&self) -> usize {
        self.level.load(READ_ORD)
    }

    #[inline(always)]
    pub(crate) fn set_level(&self, level: usize) {
        self.level.store(level, WRITE_ORD);
    }

    /// CAS the level from `current` to `new`.
    #[inline]
    pub(crate) fn cas_level(&self, current: usize, new: usize) -> bool {
        self.level
            .compare_exchange(current, new, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Whether this node is a shard head sentinel.
    #[inline(always)]
    #[must_use]
    pub const fn is_head(&self) -> bool {
        self.is_head
    }

    /// The node's lock.
    #[inline(always)]
    #[must_use]
    pub const fn lock(&self) -> &NodeLock {
        &self.lock
    }

    /// Successor at `level`.
    #[inline(always)]
    #[must_use]
    pub fn next(&self, level: usize) -> Option<&Self> {
        let ptr = self.next[level].load(READ_ORD);
        // SAFETY: nodes are owned by the arena and freed only when the index
        // drops, which requires exclusive access.
        unsafe { ptr.as_ref() }
    }

    /// Successor at `level` unless it is absent or a head sentinel.
    #[inline(always)]
    #[must_use]
    pub fn next_in_shard(&self, level: usize) -> Option<&Self> {
        self.next(level).filter(|n| !n.is_head)
    }

    #[inline(always)]
    pub(crate) fn next_ptr(&self, level: usize) -> *mut Self {
        self.next[level].load(READ_ORD)
    }

    #[inline(always)]
    pub(crate) fn set_next(&self, level: usize, node: *mut Self) {
        self.next[level].store(node, WRITE_ORD);
    }

    /// CAS `next[level]` from `current` to `new`.
    #[inline]
    pub(crate) fn cas_next(&self, level: usize, current: *mut Self, new: *mut Self) -> bool {
        self.next[level]
            .compare_exchange(current, new, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    // ========================================================================
    //  Arrays (read lock held)
    // ========================================================================

    /// Bound of the `i`-th leaf group.
    #[inline(always)]
    #[must_use]
    pub fn key_at(&self, i: usize) -> u64 {
        self.keys[i].load(RELAXED)
    }

    /// The `i`-th leaf group.
    #[inline(always)]
    #[must_use]
    pub fn leaf_at(&self, i: usize) -> Option<DurableRef<LeafGroup>> {
        DurableRef::from_offset(self.leaves[i].load(RELAXED))
    }

    /// Index of the first leaf group whose bound is `>= key`, clamped to the
    /// last group.
    #[must_use]
    pub fn lower_bound(&self, key: u64) -> usize {
        let n = self.n_keys();
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = (lo + hi) >> 1;
            if self.key_at(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.min(n.saturating_sub(1))
    }

    /// Claim a free slot of leaf group `loc` in the working bitmap.
    ///
    /// Returns `None` when the group is full.
    pub fn claim_slot(&self, loc: usize) -> Option<usize> {
        let cell = &self.mem_bitmap[loc];
        let mut current = cell.load(READ_ORD);
        loop {
            if current & LEAF_FULL == LEAF_FULL {
                return None;
            }
            let slot = (!current).trailing_zeros() as usize;
            match cell.compare_exchange_weak(current, current | (1u64 << slot), CAS_SUCCESS, CAS_FAILURE) {
                Ok(_) => return Some(slot),
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the working bitmap of group `loc` is full.
    #[inline]
    #[must_use]
    pub fn is_leaf_full(&self, loc: usize) -> bool {
        self.mem_bitmap[loc].load(READ_ORD) & LEAF_FULL == LEAF_FULL
    }

    // ========================================================================
    //  Mutation (write lock held, or node not yet published)
    // ========================================================================

    /// Append a leaf group. Used while building nodes before publication.
    pub(crate) fn push_leaf(&self, key: u64, leaf: DurableRef<LeafGroup>, bitmap: u64) {
        let n = self.n_keys.load(RELAXED);
        debug_assert!(n < MAX_LEAF_CAPACITY);
        self.keys[n].store(key, RELAXED);
        self.leaves[n].store(leaf.offset(), RELAXED);
        self.mem_bitmap[n].store(bitmap, RELAXED);
        self.n_keys.store(n + 1, WRITE_ORD);
    }

    /// Overwrite the bound of the last leaf group.
    pub(crate) fn set_last_key(&self, key: u64) {
        let n = self.n_keys.load(RELAXED);
        if n > 0 {
            self.keys[n - 1].store(key, RELAXED);
        }
    }

    /// Replace the working bitmap of group `loc` with `bitmap`, handing
    /// withdrawn slots out again.
    ///
    /// With the write lock held no inserter is between claim and commit, so
    /// the commit bitmap is exactly the set of slots still in use.
    pub(crate) fn reset_slots(&self, guard: &WriteGuard<'_>, loc: usize, bitmap: u64) {
        guard.assert_holds(&self.lock);
        self.mem_bitmap[loc].store(bitmap, RELAXED);
    }

    /// Record a completed leaf split of group `loc`: the old group keeps
    /// `lower_max`, the new group is inserted right after it.
    pub(crate) fn insert_split(
        &self,
        guard: &WriteGuard<'_>,
        loc: usize,
        lower_max: u64,
        new_leaf: DurableRef<LeafGroup>,
        old_bitmap: u64,
        new_bitmap: u64,
    ) {
        guard.assert_holds(&self.lock);
        let n = self.n_keys.load(RELAXED);
        debug_assert!(n < MAX_LEAF_CAPACITY && loc < n);

        for i in (loc + 1..n).rev() {
            self.keys[i + 1].store(self.keys[i].load(RELAXED), RELAXED);
            self.leaves[i + 1].store(self.leaves[i].load(RELAXED), RELAXED);
            self.mem_bitmap[i + 1].store(self.mem_bitmap[i].load(RELAXED), RELAXED);
        }
        let upper_max = self.keys[loc].load(RELAXED);
        self.keys[loc].store(lower_max, RELAXED);
        self.mem_bitmap[loc].store(old_bitmap, RELAXED);
        self.keys[loc + 1].store(upper_max, RELAXED);
        self.leaves[loc + 1].store(new_leaf.offset(), RELAXED);
        self.mem_bitmap[loc + 1].store(new_bitmap, RELAXED);
        self.n_keys.store(n + 1, WRITE_ORD);
    }

    /// Build the right half of a full node: groups `from..n` move to a new
    /// level-0 node that inherits `max_key` and `next[0]`.
    pub(crate) fn split_off(&self, guard: &WriteGuard<'_>, from: usize) -> Box<Self> {
        guard.assert_holds(&self.lock);
        let n = self.n_keys.load(RELAXED);
        let right = Self::new_node(self.max_key(), 0);
        for i in from..n {
            let j = i - from;
            right.keys[j].store(self.keys[i].load(RELAXED), RELAXED);
            right.leaves[j].store(self.leaves[i].load(RELAXED), RELAXED);
            right.mem_bitmap[j].store(self.mem_bitmap[i].load(RELAXED), RELAXED);
        }
        right.n_keys.store(n - from, RELAXED);
        right.next[0].store(self.next_ptr(0), RELAXED);
        right
    }

    /// Shrink to the first `n` groups after [`split_off`](Self::split_off)
    /// has been linked in at level 0.
    pub(crate) fn truncate(&self, guard: &WriteGuard<'_>, n: usize) {
        guard.assert_holds(&self.lock);
        self.set_max_key(self.keys[n - 1].load(RELAXED));
        self.n_keys.store(n, WRITE_ORD);
    }

    // ========================================================================
    //  Split gate
    // ========================================================================

    /// Trade a read hold for a write hold if no other thread is doing so.
    ///
    /// The read guard is released either way. On success the returned guard
    /// holds the write lock and the gate; both are released on drop. The
    /// node may have changed between the two holds, so callers re-check
    /// their split decision.
    pub fn try_begin_split<'a>(&'a self, read: ReadGuard<'a>) -> Option<SplitGuard<'a>> {
        read.assert_holds(&self.lock);
        let admitted = self
            .is_split
            .compare_exchange(false, true, CAS_SUCCESS, CAS_FAILURE)
            .is_ok();
        drop(read);
        if !admitted {
            return None;
        }
        Some(SplitGuard {
            node: self,
            write: self.lock.write(),
        })
    }
}

/// Exclusive hold on a node being split.
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct SplitGuard<'a> {
    node: &'a InnerNode,
    write: WriteGuard<'a>,
}

impl<'a> SplitGuard<'a> {
    /// The write hold, as proof for mutating calls.
    #[inline]
    pub const fn write(&self) -> &WriteGuard<'a> {
        &self.write
    }

    /// The node being split.
    #[inline]
    #[must_use]
    pub const fn node(&self) -> &'a InnerNode {
        self.node
    }
}

impl Drop for SplitGuard<'_> {
    fn drop(&mut self) {
        // Gate opens before the write lock is released (field drop order).
        self.node.is_split.store(false, WRITE_ORD);
    }
}

impl fmt::Debug for SplitGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitGuard").field("node", self.node).finish()
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "fail fast in tests")]

    use super::*;
    use crate::leaf::LeafGroup;
    use crate::pool::{DurablePool, MIN_POOL_SIZE};

    fn node_with(pool: &DurablePool, bounds: &[u64]) -> Box<InnerNode> {
        let node = InnerNode::new_node(*bounds.last().unwrap(), 0);
        for &bound in bounds {
            let leaf = pool.allocate_zeroed::<LeafGroup>().unwrap();
            node.push_leaf(bound, leaf, 0);
        }
        node
    }

    #[test]
    fn test_lower_bound() {
        let pool = DurablePool::anonymous(MIN_POOL_SIZE).unwrap();
        let node = node_with(&pool, &[10, 20, 30]);
        assert_eq!(node.lower_bound(1), 0);
        assert_eq!(node.lower_bound(10), 0);
        assert_eq!(node.lower_bound(11), 1);
        assert_eq!(node.lower_bound(30), 2);
        assert_eq!(node.lower_bound(31), 2, "clamped to the last group");
    }

    #[test]
    fn test_claim_slot_until_full() {
        let pool = DurablePool::anonymous(MIN_POOL_SIZE).unwrap();
        let node = node_with(&pool, &[100]);
        let mut claimed = Vec::new();
        while let Some(slot) = node.claim_slot(0) {
            claimed.push(slot);
        }
        assert_eq!(claimed, (0..crate::constants::MAX_ENTRY_NUM).collect::<Vec<_>>());
        assert!(node.is_leaf_full(0));
    }

    #[test]
    fn test_insert_split_shifts_arrays() {
        let pool = DurablePool::anonymous(MIN_POOL_SIZE).unwrap();
        let node = node_with(&pool, &[10, 20, 30]);
        let new_leaf = pool.allocate_zeroed::<LeafGroup>().unwrap();
        let write = node.lock().write();
        node.insert_split(&write, 1, 15, new_leaf, 0b1, 0b11);
        drop(write);
        assert_eq!(node.n_keys(), 4);
        let keys: Vec<u64> = (0..4).map(|i| node.key_at(i)).collect();
        assert_eq!(keys, vec![10, 15, 20, 30]);
        assert_eq!(node.leaf_at(2), Some(new_leaf));
        assert!(!node.is_leaf_full(1));
    }

    #[test]
    fn test_reset_slots_reopens_withdrawn() {
        let pool = DurablePool::anonymous(MIN_POOL_SIZE).unwrap();
        let node = node_with(&pool, &[100]);
        while node.claim_slot(0).is_some() {}
        let write = node.lock().write();
        node.reset_slots(&write, 0, 0b101);
        drop(write);
        assert!(!node.is_leaf_full(0));
        assert_eq!(node.claim_slot(0), Some(1));
        assert_eq!(node.claim_slot(0), Some(3));
    }

    #[test]
    fn test_split_off_and_truncate() {
        let pool = DurablePool::anonymous(1 << 20).unwrap();
        let bounds: Vec<u64> = (1..=8).map(|k| k * 10).collect();
        let node = node_with(&pool, &bounds);
        let write = node.lock().write();
        let right = node.split_off(&write, 4);
        let right_ptr = Box::into_raw(right);
        node.set_next(0, right_ptr);
        node.truncate(&write, 4);
        drop(write);

        // SAFETY: just leaked above.
        let right = unsafe { Box::from_raw(right_ptr) };
        assert_eq!(node.max_key(), 40);
        assert_eq!(node.n_keys(), 4);
        assert_eq!(right.max_key(), 80);
        assert_eq!(right.n_keys(), 4);
        assert_eq!(right.key_at(0), 50);
        assert!(ptr::eq(node.next(0).unwrap(), &*right));
    }

    #[test]
    fn test_split_gate_admits_one() {
        let node = InnerNode::new_node(10, 0);
        let first = node.try_begin_split(node.lock().read()).unwrap();
        assert!(node.lock().is_locked_exclusive());
        drop(first);
        assert!(!node.lock().is_locked());
        assert!(!node.is_split.load(RELAXED));

        node.is_split.store(true, RELAXED);
        assert!(node.try_begin_split(node.lock().read()).is_none());
        assert!(!node.lock().is_locked(), "loser releases its read hold");
    }

    #[test]
    fn test_next_in_shard_skips_heads() {
        let head = Box::into_raw(InnerNode::new_head());
        let node = InnerNode::new_node(5, 0);
        node.set_next(0, head);
        assert!(node.next(0).is_some());
        assert!(node.next_in_shard(0).is_none());
        // SAFETY: leaked above.
        drop(unsafe { Box::from_raw(head) });
    }
}
