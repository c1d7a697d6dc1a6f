//! Sharded skip list of inner nodes.
//!
//! The key space is cut into [`HEAD_COUNT`] shards, each a skip list rooted
//! at a head sentinel. A shard's height is its head's `level`. Heads are
//! chained to each other at every level: the last node of shard `i` at any
//! level points at head `i + 1`, which traversals treat as the end of the
//! shard.
//!
//! # Deterministic leveling
//!
//! Levels are not drawn at random. While a traversal walks right at level
//! `L`, it counts the nodes it passes; once more than [`SPAN_TH`] have gone
//! by and the node just reached sits exactly at `L`, that node is promoted
//! to `L + 1` and linked behind the last level-`L + 1` node the traversal
//! came down from. Long runs therefore grow upper levels on their own.
//!
//! ```text
//! L1  head ------------------------> C -----------> head'
//! L0  head -> A -> B -> C -> D -> E -> F -> head'
//!                  ^ span 2 here: B is promoted to L1 (between head and C)
//! ```

use std::fmt;
use std::ptr;

use parking_lot::Mutex;
use seize::LocalGuard;

use crate::agg::{self, AggIndex};
use crate::constants::{AGG_REDUNDANT_SPACE, AGG_UPDATE_LEVEL, HEAD_COUNT, MAX_L, SPAN_TH, shard_of};
use crate::inner::InnerNode;
use crate::lock::ReadGuard;
use crate::tracing_helpers::trace_log;

// ============================================================================
//  NodeArena
// ============================================================================

/// Owner of every inner node.
///
/// Nodes are never unlinked, so they are freed only when the arena drops.
/// Allocation goes through `Box::into_raw` and is tracked under a `Mutex` so
/// recovery threads can allocate concurrently.
pub struct NodeArena {
    nodes: Mutex<Vec<*mut InnerNode>>,
}

// SAFETY: raw pointers are owned by this arena and protected by the Mutex.
unsafe impl Send for NodeArena {}
unsafe impl Sync for NodeArena {}

impl NodeArena {
    /// Empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Take ownership of `node` and return its stable address.
    pub fn alloc(&self, node: Box<InnerNode>) -> *mut InnerNode {
        let ptr = Box::into_raw(node);
        self.nodes.lock().push(ptr);
        ptr
    }

    /// Number of tracked nodes, heads included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Whether the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NodeArena {
    fn drop(&mut self) {
        for ptr in self.nodes.get_mut().drain(..) {
            // SAFETY: ptr came from Box::into_raw in alloc
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

impl fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeArena").field("nodes", &self.len()).finish()
    }
}

// ============================================================================
//  ShardedSkipList
// ============================================================================

/// The volatile index over the leaf chain.
pub struct ShardedSkipList {
    heads: Vec<*mut InnerNode>,
    arena: NodeArena,
}

// SAFETY: head pointers are owned by the arena and never change.
unsafe impl Send for ShardedSkipList {}
unsafe impl Sync for ShardedSkipList {}

impl fmt::Debug for ShardedSkipList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedSkipList")
            .field("shards", &self.heads.len())
            .field("arena", &self.arena)
            .finish()
    }
}

impl Drop for ShardedSkipList {
    fn drop(&mut self) {
        for &head in &self.heads {
            // SAFETY: heads live in the arena, which drops after this.
            agg::take(unsafe { &mut (*head).agg });
        }
    }
}

impl Default for ShardedSkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedSkipList {
    /// Empty shards: every head links to the next head at every level.
    #[must_use]
    pub fn new() -> Self {
        let arena = NodeArena::new();
        let heads: Vec<*mut InnerNode> = (0..HEAD_COUNT).map(|_| arena.alloc(InnerNode::new_head())).collect();
        for pair in heads.windows(2) {
            // SAFETY: just allocated, not shared yet.
            let head = unsafe { &*pair[0] };
            for level in 0..MAX_L {
                head.set_next(level, pair[1]);
            }
        }
        Self { heads, arena }
    }

    /// Head sentinel of `shard`.
    #[inline(always)]
    #[must_use]
    pub fn head(&self, shard: usize) -> &InnerNode {
        // SAFETY: heads are owned by the arena for the list's lifetime.
        unsafe { &*self.heads[shard] }
    }

    fn head_ptr_after(&self, shard: usize) -> *mut InnerNode {
        self.heads.get(shard + 1).copied().unwrap_or(ptr::null_mut())
    }

    /// Inner nodes allocated so far, heads excluded.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.arena.len() - self.heads.len()
    }

    // ========================================================================
    //  Traversal
    // ========================================================================

    /// Descend the shard of `key` from its full height, promoting nodes
    /// along the way, and return the first node whose bound is `>= key`.
    pub fn find_for_insert<'a>(&'a self, key: u64, guard: &LocalGuard<'_>) -> Option<&'a InnerNode> {
        let head = self.head(shard_of(key));
        let mut x: &InnerNode = head;

        for level in (0..=head.level()).rev() {
            // Last node at `level + 1` left of the key: predecessor for promotions.
            let mut starter: &InnerNode = x;
            let mut span = 0usize;

            while let Some(next) = x.next_in_shard(level) {
                if next.max_key() >= key {
                    break;
                }
                x = next;
                if next.level() > level {
                    starter = next;
                    span = 0;
                    continue;
                }
                span += 1;
                if span > SPAN_TH && level + 1 < MAX_L && next.level() == level {
                    span = 0;
                    if self.promote(head, starter, next, level, guard) {
                        starter = next;
                    }
                }
            }
        }

        x.next_in_shard(0)
    }

    /// Promote `node` from `level` to `level + 1` behind `starter`.
    fn promote(&self, head: &InnerNode, starter: &InnerNode, node: &InnerNode, level: usize, guard: &LocalGuard<'_>) -> bool {
        let up = level + 1;
        if !node.cas_level(level, up) {
            return false;
        }

        let node_ptr = ptr::from_ref(node).cast_mut();
        loop {
            let succ_ptr = starter.next_ptr(up);
            // SAFETY: nodes live in the arena for the list's lifetime.
            let succ = unsafe { succ_ptr.as_ref() }.filter(|s| !s.is_head());
            if let Some(succ) = succ {
                if succ.max_key() <= node.max_key() {
                    // Something was promoted in between; give the level back.
                    let _ = node.cas_level(up, level);
                    return false;
                }
            }
            node.set_next(up, succ_ptr);
            if starter.cas_next(up, succ_ptr, node_ptr) {
                break;
            }
        }

        let mut height = head.level();
        while height < up {
            if head.cas_level(height, up) {
                break;
            }
            height = head.level();
        }

        trace_log!(max_key = node.max_key(), level = up, "promoted");
        if up == AGG_UPDATE_LEVEL {
            agg::rebuild(head, guard);
        }
        true
    }

    /// Read-only descent for `key`, started from the aggregation snapshot
    /// when it has an entry left of the key.
    pub fn locate<'a>(&'a self, key: u64, guard: &LocalGuard<'_>) -> Option<&'a InnerNode> {
        let head = self.head(shard_of(key));
        let (mut x, top): (&InnerNode, usize) = match agg::load(head, guard).and_then(|a| a.find(key)) {
            // SAFETY: snapshot nodes live in the arena, which outlives `self`.
            Some(node) => (unsafe { &*ptr::from_ref(node) }, AGG_UPDATE_LEVEL.min(node.level())),
            None => (head, head.level()),
        };

        for level in (0..=top).rev() {
            while let Some(next) = x.next_in_shard(level) {
                if next.max_key() >= key {
                    break;
                }
                x = next;
            }
        }

        if !x.is_head() && x.max_key() >= key {
            return Some(x);
        }
        x.next_in_shard(0)
    }

    /// Read-lock `node` and walk right at level 0, hand over hand, until
    /// reaching the node whose bound covers `key`.
    pub fn lock_owner<'a>(&'a self, mut node: &'a InnerNode, key: u64) -> (&'a InnerNode, ReadGuard<'a>) {
        let mut read = node.lock().read();
        while node.max_key() < key {
            let mut next = node.next(0);
            while let Some(head) = next.filter(|n| n.is_head()) {
                next = head.next(0);
            }
            let Some(next) = next else { break };
            let next_read = next.lock().read();
            drop(read);
            read = next_read;
            node = next;
        }
        (node, read)
    }

    /// Link a freshly split right sibling behind `node` at level 0.
    pub(crate) fn publish_split(&self, node: &InnerNode, right: Box<InnerNode>) -> *mut InnerNode {
        let right = self.arena.alloc(right);
        node.set_next(0, right);
        right
    }

    // ========================================================================
    //  Bulk construction
    // ========================================================================

    /// Builder appending nodes to an empty `shard`.
    pub(crate) fn builder(&self, shard: usize) -> ShardBuilder<'_> {
        let head = self.head(shard);
        ShardBuilder {
            list: self,
            shard,
            tails: [head; MAX_L],
            height: 0,
            upper: Vec::new(),
            nodes: 0,
        }
    }
}

/// Appends nodes to one shard before the index is shared.
pub(crate) struct ShardBuilder<'a> {
    list: &'a ShardedSkipList,
    shard: usize,
    tails: [&'a InnerNode; MAX_L],
    height: usize,
    upper: Vec<&'a InnerNode>,
    nodes: usize,
}

impl<'a> ShardBuilder<'a> {
    /// Link `node` at the end of every level up to its own.
    pub(crate) fn push(&mut self, node: Box<InnerNode>) -> &'a InnerNode {
        let level = node.level().min(MAX_L - 1);
        let ptr = self.list.arena.alloc(node);
        // SAFETY: owned by the arena for the list's lifetime.
        let node: &'a InnerNode = unsafe { &*ptr };
        for l in 0..=level {
            self.tails[l].set_next(l, ptr);
            self.tails[l] = node;
        }
        if level >= AGG_UPDATE_LEVEL {
            self.upper.push(node);
        }
        self.height = self.height.max(level);
        self.nodes += 1;
        node
    }

    /// Terminate every level at the next head, record the height and
    /// install the aggregation snapshot.
    pub(crate) fn finish(self, guard: &LocalGuard<'_>) -> usize {
        let end = self.list.head_ptr_after(self.shard);
        for (level, tail) in self.tails.iter().enumerate() {
            tail.set_next(level, end);
        }
        let head = self.list.head(self.shard);
        head.set_level(self.height);
        let snapshot = AggIndex::with_capacity(&self.upper, self.nodes + AGG_REDUNDANT_SPACE);
        agg::install(head, snapshot, guard);
        self.nodes
    }
}
