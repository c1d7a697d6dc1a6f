//! The index engine: [`Phast`].
//!
//! Every operation first maps its key to a shard, descends that shard's
//! skip list to the inner node owning the key, then works on the leaf group
//! the node points to.
//!
//! # Locking
//!
//! | Operation | Inner node | Leaf group |
//! |-----------|------------|------------|
//! | insert | read (write while splitting) | slot claim + bitmap CAS |
//! | search / get | read | none |
//! | update / delete | read | value swap |
//! | range scan | read, only to find the first leaf | none |
//!
//! # Durability
//!
//! An insert persists the entry, then the commit bitmap. An update persists
//! the value. Splits persist every durable step before the next one (see
//! [`LeafSplit`](crate::leaf::LeafSplit)); inner nodes are volatile and
//! rebuilt by [`Phast::recover`].

mod range;
mod split;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::thread;
use std::time::Duration;

use seize::{Collector, LocalGuard};

use crate::agg;
use crate::config::IndexConfig;
use crate::constants::{HEAD_COUNT, MAX_L, MAX_LEAF_CAPACITY, TOMBSTONE, shard_upper_bound};
use crate::error::IndexError;
use crate::inner::InnerNode;
use crate::leaf::LeafGroup;
use crate::ordering::RELAXED;
use crate::pool::{DurablePool, DurableRef};
use crate::skiplist::ShardedSkipList;
use crate::tracing_helpers::debug_log;

/// Backoff after losing the split gate of an inner node.
const NODE_SPLIT_BACKOFF: Duration = Duration::from_micros(5);

/// Backoff after losing the split gate for a leaf split.
const LEAF_SPLIT_BACKOFF: Duration = Duration::from_micros(1);

/// Key `0` means "absent" and `u64::MAX` is past the last shard bound.
#[inline(always)]
const fn is_reserved_key(key: u64) -> bool {
    key == 0 || key == u64::MAX
}

/// Value `0` means "absent" and `u64::MAX` is the tombstone.
#[inline(always)]
const fn is_reserved_value(value: u64) -> bool {
    value == 0 || value == TOMBSTONE
}

/// Outcome of one insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Published,
    Revived,
    /// A split ran (ours or one observed after the gate); retry now.
    Split,
    /// Another thread holds the gate for a leaf split.
    LeafBusy,
    /// Another thread holds the gate for an inner split.
    NodeBusy,
}

/// Counts gathered by [`Phast::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Entries published through this handle or found by recovery.
    pub entries: usize,
    /// Published slots found by walking the leaf chain.
    pub published: usize,
    /// Leaf groups in the chain.
    pub leaf_groups: usize,
    /// Inner nodes, heads excluded.
    pub inner_nodes: usize,
    /// Nodes linked at each level, summed over shards.
    pub nodes_per_level: Vec<usize>,
    /// Height of each shard.
    pub shard_heights: Vec<usize>,
    /// Entries in all aggregation snapshots.
    pub agg_entries: usize,
}

/// A crash-consistent ordered index from `u64` keys to `u64` values.
///
/// Keys `0` and `u64::MAX` and values `0` and `u64::MAX` are reserved;
/// `u64::MAX` is written by [`delete`](Self::delete) as a tombstone.
///
/// ```rust
/// use std::sync::Arc;
/// use phast::{DurablePool, Phast};
///
/// let pool = Arc::new(DurablePool::anonymous(16 << 20).unwrap());
/// let index = Phast::create(pool).unwrap();
/// index.insert(42, 7).unwrap();
/// assert_eq!(index.search(42), Some(7));
/// assert_eq!(index.update(42, 8).unwrap(), Some(7));
/// index.delete(42);
/// assert_eq!(index.get(42), None);
/// ```
pub struct Phast {
    pool: Arc<DurablePool>,
    list: ShardedSkipList,
    count: AtomicUsize,
    collector: Collector,
}

impl fmt::Debug for Phast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phast")
            .field("pool", &self.pool)
            .field("len", &self.len())
            .field("list", &self.list)
            .finish_non_exhaustive()
    }
}

impl Phast {
    // ========================================================================
    //  Construction
    // ========================================================================

    /// Build an empty index in `pool`: one head, one inner node and one
    /// leaf group per shard. The pool is marked initialised last.
    ///
    /// # Errors
    ///
    /// - [`IndexError::AlreadyInitialized`] if the pool already holds an index.
    /// - [`IndexError::Pool`] if the initial leaf groups do not fit.
    pub fn create(pool: Arc<DurablePool>) -> Result<Self, IndexError> {
        if pool.is_initialized() {
            return Err(IndexError::AlreadyInitialized);
        }

        let mut leaves: Vec<DurableRef<LeafGroup>> = Vec::with_capacity(HEAD_COUNT);
        for shard in 0..HEAD_COUNT {
            let leaf_ref = pool.allocate_zeroed::<LeafGroup>()?;
            let leaf = pool.get(leaf_ref);
            leaf.set_max_key(&pool, shard_upper_bound(shard));
            leaf.mark_head(&pool);
            leaves.push(leaf_ref);
        }
        for pair in leaves.windows(2) {
            pool.get(pair[0]).set_next(&pool, pair[1].offset());
        }

        let list = ShardedSkipList::new();
        let collector = Collector::new();
        {
            let guard = collector.enter();
            let root = pool.root();
            for (shard, &leaf_ref) in leaves.iter().enumerate() {
                root.set_head(shard, leaf_ref.offset());
                pool.persist(root.head_slot(shard));

                let bound = shard_upper_bound(shard);
                let node = InnerNode::new_node(bound, 0);
                node.push_leaf(bound, leaf_ref, 0);
                let mut builder = list.builder(shard);
                builder.push(node);
                builder.finish(&guard);
            }
        }
        pool.mark_initialized();
        debug_log!(shards = HEAD_COUNT, used = pool.used(), "index created");

        Ok(Self {
            pool,
            list,
            count: AtomicUsize::new(0),
            collector,
        })
    }

    /// Open the pool described by `config`, recovering the index it holds
    /// or creating a new one.
    ///
    /// # Errors
    ///
    /// Pool open failures and the errors of [`create`](Self::create) and
    /// [`recover`](Self::recover).
    pub fn open(config: &IndexConfig) -> Result<Self, IndexError> {
        let pool = Arc::new(DurablePool::from_config(&config.pool)?);
        if pool.is_initialized() {
            Self::recover(pool, config.recovery_threads)
        } else {
            Self::create(pool)
        }
    }

    pub(crate) fn from_parts(pool: Arc<DurablePool>, list: ShardedSkipList, collector: Collector, entries: usize) -> Self {
        Self {
            pool,
            list,
            count: AtomicUsize::new(entries),
            collector,
        }
    }

    /// Enter a protected region. Snapshots loaded under the guard stay
    /// valid until it drops.
    #[must_use]
    #[inline(always)]
    fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Publish `key -> value`.
    ///
    /// An existing entry is never overwritten, except that a tombstoned
    /// entry is revived with `value`.
    ///
    /// # Errors
    ///
    /// - [`IndexError::ReservedKey`] / [`IndexError::ReservedValue`] for
    ///   sentinel inputs.
    /// - [`IndexError::Duplicate`] if `key` is already present, or another
    ///   writer won the same slot.
    pub fn insert(&self, key: u64, value: u64) -> Result<(), IndexError> {
        if is_reserved_key(key) {
            return Err(IndexError::ReservedKey(key));
        }
        if is_reserved_value(value) {
            return Err(IndexError::ReservedValue(value));
        }

        let guard = self.guard();
        loop {
            match self.try_insert(key, value, &guard)? {
                Attempt::Published => {
                    self.count.fetch_add(1, RELAXED);
                    return Ok(());
                }
                Attempt::Revived => return Ok(()),
                Attempt::Split => {}
                Attempt::LeafBusy => thread::sleep(LEAF_SPLIT_BACKOFF),
                Attempt::NodeBusy => thread::sleep(NODE_SPLIT_BACKOFF),
            }
        }
    }

    fn try_insert(&self, key: u64, value: u64, guard: &LocalGuard<'_>) -> Result<Attempt, IndexError> {
        let pool = &*self.pool;
        let Some(start) = self.list.find_for_insert(key, guard) else {
            return Ok(Attempt::Split);
        };
        let (node, read) = self.list.lock_owner(start, key);
        let loc = node.lower_bound(key);
        let Some(leaf_ref) = node.leaf_at(loc) else {
            return Ok(Attempt::Split);
        };
        let leaf = pool.get(leaf_ref);

        if let Some(slot) = leaf.find(key) {
            if leaf.compare_swap_value(pool, slot, TOMBSTONE, value) {
                return Ok(Attempt::Revived);
            }
            return Err(IndexError::Duplicate);
        }

        if let Some(slot) = node.claim_slot(loc) {
            leaf.write_entry(pool, slot, key, value);
            leaf.try_commit(pool, slot)?;
            drop(read);
            return Ok(Attempt::Published);
        }

        let node_full = node.n_keys() >= MAX_LEAF_CAPACITY;
        let Some(split) = node.try_begin_split(read) else {
            return Ok(if node_full { Attempt::NodeBusy } else { Attempt::LeafBusy });
        };

        // Another split may have landed between the two holds.
        if node.max_key() < key {
            return Ok(Attempt::Split);
        }
        let loc = node.lower_bound(key);
        if !node.is_leaf_full(loc) {
            return Ok(Attempt::Split);
        }
        if node.n_keys() >= MAX_LEAF_CAPACITY {
            self.split_inner(&split);
        } else {
            self.split_leaf(&split, loc);
        }
        Ok(Attempt::Split)
    }

    // ========================================================================
    //  Point reads and writes
    // ========================================================================

    /// Run `f` on the leaf slot holding `key` under the owner's read lock.
    fn with_slot<R>(&self, key: u64, f: impl FnOnce(&LeafGroup, usize) -> R) -> Option<R> {
        if is_reserved_key(key) {
            return None;
        }
        let guard = self.guard();
        let start = self.list.locate(key, &guard)?;
        let (node, _read) = self.list.lock_owner(start, key);
        let mut leaf = self.pool.get(node.leaf_at(node.lower_bound(key))?);
        while leaf.max_key() < key {
            leaf = self.pool.get(leaf.next_ref()?);
        }
        let slot = leaf.find(key)?;
        Some(f(leaf, slot))
    }

    /// Value stored for `key`, the tombstone included.
    #[must_use]
    pub fn search(&self, key: u64) -> Option<u64> {
        self.with_slot(key, LeafGroup::value)
    }

    /// Live value stored for `key`; tombstoned keys read as absent.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<u64> {
        self.search(key).filter(|&v| v != TOMBSTONE)
    }

    /// Whether `key` has a live value.
    #[must_use]
    pub fn contains_key(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// Overwrite the value of an existing `key` and return the previous one
    /// (possibly the tombstone). `None` if the key is absent.
    ///
    /// # Errors
    ///
    /// [`IndexError::ReservedValue`] for value `0` or the tombstone.
    pub fn update(&self, key: u64, value: u64) -> Result<Option<u64>, IndexError> {
        if is_reserved_value(value) {
            return Err(IndexError::ReservedValue(value));
        }
        Ok(self.swap(key, value))
    }

    /// Tombstone `key` and return its previous value, `None` if absent.
    pub fn delete(&self, key: u64) -> Option<u64> {
        self.swap(key, TOMBSTONE)
    }

    fn swap(&self, key: u64, value: u64) -> Option<u64> {
        let pool = &*self.pool;
        self.with_slot(key, |leaf, slot| leaf.swap_value(pool, slot, value))
    }

    // ========================================================================
    //  Introspection
    // ========================================================================

    /// Published entries, tombstones included.
    #[must_use]
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.count.load(RELAXED)
    }

    /// Whether nothing has been published.
    #[must_use]
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The durable pool.
    #[must_use]
    pub const fn pool(&self) -> &Arc<DurablePool> {
        &self.pool
    }

    #[cfg(test)]
    pub(crate) const fn list(&self) -> &ShardedSkipList {
        &self.list
    }

    /// Flush the whole pool to media.
    ///
    /// # Errors
    ///
    /// [`IndexError::Pool`] if the flush fails.
    pub fn sync(&self) -> Result<(), IndexError> {
        self.pool.sync_all()?;
        Ok(())
    }

    /// Walk the structure and count what is in it. Linear in the index size;
    /// intended for tests and diagnostics.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let guard = self.guard();
        let mut stats = IndexStats {
            entries: self.len(),
            inner_nodes: self.list.node_count(),
            nodes_per_level: vec![0; MAX_L],
            shard_heights: Vec::with_capacity(HEAD_COUNT),
            ..IndexStats::default()
        };

        for shard in 0..HEAD_COUNT {
            let head = self.list.head(shard);
            let height = head.level();
            stats.shard_heights.push(height);
            for level in 0..=height {
                let mut cursor = head.next_in_shard(level);
                while let Some(node) = cursor {
                    stats.nodes_per_level[level] += 1;
                    cursor = node.next_in_shard(level);
                }
            }
            stats.agg_entries += agg::load(head, &guard).map_or(0, agg::AggIndex::len);
        }
        while stats.nodes_per_level.len() > 1 && stats.nodes_per_level.last() == Some(&0) {
            stats.nodes_per_level.pop();
        }

        let mut next = DurableRef::<LeafGroup>::from_offset(self.pool.root().head(0));
        while let Some(leaf_ref) = next {
            let leaf = self.pool.get(leaf_ref);
            stats.leaf_groups += 1;
            stats.published += leaf.published();
            next = leaf.next_ref();
        }
        stats
    }
}
