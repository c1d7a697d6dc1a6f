//! Aggregation cache: a flat snapshot of a shard's upper level.
//!
//! Each shard head carries a pointer to an immutable [`AggIndex`] listing
//! every node linked at [`AGG_UPDATE_LEVEL`] together with the bound it had
//! when the snapshot was taken. A lookup binary-searches the snapshot for
//! the closest node strictly left of the key and starts the skip-list
//! descent there instead of at the head.
//!
//! Snapshots are never mutated. A rebuild allocates a new one, swaps the
//! head's pointer and retires the old one through `seize`, so readers that
//! loaded the old pointer under a guard may keep using it.
//!
//! Stale bounds are harmless: a node's bound only ever shrinks, so a node
//! whose cached bound is below the key is still left of the key.

use std::fmt;
use std::sync::atomic::AtomicPtr;

use seize::{Guard, LocalGuard};

use crate::constants::{AGG_REDUNDANT_SPACE, AGG_SLOT_INIT_NUM, AGG_UPDATE_LEVEL};
use crate::inner::InnerNode;
use crate::ordering::{CAS_SUCCESS, READ_ORD};
use crate::tracing_helpers::trace_log;

/// Immutable sorted snapshot of `(bound, node)` pairs.
pub struct AggIndex {
    capacity: usize,
    keys: Vec<u64>,
    nodes: Vec<*const InnerNode>,
}

// SAFETY: the snapshot is immutable after construction, and the nodes it
// points to are owned by the index arena and outlive every snapshot.
unsafe impl Send for AggIndex {}
unsafe impl Sync for AggIndex {}

impl fmt::Debug for AggIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggIndex")
            .field("capacity", &self.capacity)
            .field("len", &self.keys.len())
            .finish_non_exhaustive()
    }
}

/// Capacity for a snapshot of `len` entries that previously had `capacity`.
#[must_use]
pub const fn next_capacity(len: usize, mut capacity: usize) -> usize {
    if capacity == 0 {
        capacity = AGG_SLOT_INIT_NUM;
    }
    while len + AGG_REDUNDANT_SPACE > capacity {
        capacity *= 2;
    }
    capacity
}

impl AggIndex {
    /// Snapshot the level-[`AGG_UPDATE_LEVEL`] chain starting after `head`.
    #[must_use]
    pub fn build(head: &InnerNode, previous_capacity: usize) -> Self {
        let mut keys = Vec::new();
        let mut nodes = Vec::new();
        let mut cursor = head.next_in_shard(AGG_UPDATE_LEVEL);
        while let Some(node) = cursor {
            keys.push(node.max_key());
            nodes.push(std::ptr::from_ref(node));
            cursor = node.next_in_shard(AGG_UPDATE_LEVEL);
        }
        Self::from_parts(keys, nodes, previous_capacity)
    }

    /// Snapshot from an explicit list, used by recovery.
    #[must_use]
    pub fn with_capacity(nodes: &[&InnerNode], capacity: usize) -> Self {
        let keys = nodes.iter().map(|n| n.max_key()).collect();
        let nodes = nodes.iter().map(|&n| std::ptr::from_ref(n)).collect();
        Self::from_parts(keys, nodes, capacity)
    }

    fn from_parts(mut keys: Vec<u64>, mut nodes: Vec<*const InnerNode>, capacity: usize) -> Self {
        let capacity = next_capacity(keys.len(), capacity);
        keys.reserve_exact(capacity - keys.len());
        nodes.reserve_exact(capacity - nodes.len());
        Self {
            capacity,
            keys,
            nodes,
        }
    }

    /// Number of sampled nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Slot budget of this snapshot.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Closest sampled node whose bound is strictly below `key`.
    #[must_use]
    pub fn find(&self, key: u64) -> Option<&InnerNode> {
        let pos = self.keys.partition_point(|&k| k < key);
        let idx = pos.checked_sub(1)?;
        // SAFETY: see the Send/Sync impls.
        unsafe { self.nodes[idx].as_ref() }
    }
}

/// Load the head's current snapshot under `guard`.
#[inline]
pub(crate) fn load<'g>(head: &InnerNode, guard: &'g LocalGuard<'_>) -> Option<&'g AggIndex> {
    let ptr = guard.protect(&head.agg, READ_ORD);
    // SAFETY: snapshots are retired through the collector, so the pointer
    // stays valid while `guard` is held.
    unsafe { ptr.as_ref() }
}

/// Install `snapshot` on `head` and retire whatever it replaces.
pub(crate) fn install(head: &InnerNode, snapshot: AggIndex, guard: &LocalGuard<'_>) {
    trace_log!(entries = snapshot.len(), capacity = snapshot.capacity(), "aggregation rebuilt");
    let new = Box::into_raw(Box::new(snapshot));
    let old = head.agg.swap(new, CAS_SUCCESS);
    retire(old, guard);
}

/// Rebuild the head's snapshot from its current level chain.
pub(crate) fn rebuild(head: &InnerNode, guard: &LocalGuard<'_>) {
    let previous = load(head, guard).map_or(0, AggIndex::capacity);
    install(head, AggIndex::build(head, previous), guard);
}

fn retire(old: *mut AggIndex, guard: &LocalGuard<'_>) {
    if old.is_null() {
        return;
    }
    // SAFETY: `old` came from Box::into_raw in `install` and was unlinked by
    // the swap, so no new reader can load it.
    unsafe {
        guard.defer_retire(old, |ptr, _| {
            drop(Box::from_raw(ptr));
        });
    }
}

/// Free the snapshot still installed on `head`. Requires exclusive access.
pub(crate) fn take(agg: &mut AtomicPtr<AggIndex>) {
    let ptr = std::mem::replace(agg.get_mut(), std::ptr::null_mut());
    if !ptr.is_null() {
        // SAFETY: installed snapshots come from Box::into_raw and nothing
        // else can reach them under `&mut`.
        drop(unsafe { Box::from_raw(ptr) });
    }
}
