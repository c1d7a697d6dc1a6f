//! Rebuilding the volatile index from the leaf chain.
//!
//! Only leaf groups and the root are durable. Recovery walks each shard's
//! part of the chain, repairs what a crash may have left half done, and
//! rebuilds inner nodes and skip-list levels from scratch. Shards are
//! independent, so they are split into contiguous ranges and processed on
//! scoped threads.
//!
//! # Repairs
//!
//! - Fingerprints of published slots are recomputed.
//! - Two adjacent groups with the same `max_key` are the two halves of a
//!   leaf split that crashed after linking the new group. Every key of the
//!   new group is withdrawn from the old one and the old bound is lowered
//!   to its largest remaining key.
//!
//! # Levels
//!
//! Inner nodes are rebuilt with random levels (`p = 1/2`). Traversals will
//! keep promoting nodes deterministically from there.

use std::sync::Arc;
use std::thread;

use rand::Rng;
use seize::Collector;

use crate::constants::{HEAD_COUNT, MAX_L, MAX_LEAF_CAPACITY, shard_upper_bound};
use crate::error::{IndexError, PoolError};
use crate::index::Phast;
use crate::inner::InnerNode;
use crate::leaf::LeafGroup;
use crate::pool::DurablePool;
use crate::skiplist::ShardedSkipList;
use crate::tracing_helpers::{debug_log, warn_log};

/// What recovering one shard found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ShardSummary {
    entries: usize,
    leaves: usize,
    nodes: usize,
    repaired_splits: usize,
    repaired_fingerprints: usize,
}

impl std::ops::AddAssign for ShardSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.entries += rhs.entries;
        self.leaves += rhs.leaves;
        self.nodes += rhs.nodes;
        self.repaired_splits += rhs.repaired_splits;
        self.repaired_fingerprints += rhs.repaired_fingerprints;
    }
}

/// Level for a rebuilt node: geometric with `p = 1/2`, capped at `MAX_L - 1`.
fn random_level<R: Rng>(rng: &mut R) -> usize {
    let mut level = 0;
    while level < MAX_L - 1 && rng.gen_bool(0.5) {
        level += 1;
    }
    level
}

impl Phast {
    /// Rebuild the index held by `pool` using `parallelism` threads.
    ///
    /// # Errors
    ///
    /// - [`IndexError::Uninitialized`] if the pool never finished `create`.
    /// - [`IndexError::Pool`] if a durable offset is out of bounds or
    ///   misaligned.
    pub fn recover(pool: Arc<DurablePool>, parallelism: usize) -> Result<Self, IndexError> {
        if !pool.is_initialized() {
            return Err(IndexError::Uninitialized);
        }

        let list = ShardedSkipList::new();
        let collector = Collector::new();
        let threads = parallelism.clamp(1, HEAD_COUNT);
        let chunk = HEAD_COUNT / threads;

        let results: Vec<Result<ShardSummary, PoolError>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let first = t * chunk;
                    let last = if t + 1 == threads { HEAD_COUNT } else { first + chunk };
                    let (pool, list, collector) = (&*pool, &list, &collector);
                    scope.spawn(move || {
                        let mut rng = rand::thread_rng();
                        let mut total = ShardSummary::default();
                        for shard in first..last {
                            total += recover_shard(pool, list, collector, shard, &mut rng)?;
                        }
                        Ok(total)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut total = ShardSummary::default();
        for result in results {
            total += result?;
        }
        debug_log!(
            threads,
            entries = total.entries,
            leaves = total.leaves,
            nodes = total.nodes,
            repaired_splits = total.repaired_splits,
            repaired_fingerprints = total.repaired_fingerprints,
            "index recovered"
        );

        Ok(Self::from_parts(pool, list, collector, total.entries))
    }
}

/// Rebuild one shard from the chain segment starting at its root entry.
fn recover_shard<R: Rng>(
    pool: &DurablePool,
    list: &ShardedSkipList,
    collector: &Collector,
    shard: usize,
    rng: &mut R,
) -> Result<ShardSummary, PoolError> {
    let guard = collector.enter();
    let bound = shard_upper_bound(shard);
    let mut builder = list.builder(shard);
    let mut summary = ShardSummary::default();

    let mut node: Option<&InnerNode> = None;
    let mut prev: Option<&LeafGroup> = None;
    // Bound of the group before `prev`.
    let shard_floor = if shard == 0 { 0 } else { shard_upper_bound(shard - 1) };
    let mut floor = shard_floor;
    let mut offset = pool.root().head(shard);

    while offset != 0 {
        let (leaf_ref, leaf) = pool.try_get::<LeafGroup>(offset)?;
        let max_key = leaf.max_key();
        if max_key > bound {
            break;
        }

        summary.repaired_fingerprints += leaf.refresh_fingerprints(pool);

        if let Some(old) = prev.filter(|p| p.max_key() == max_key) {
            let withdrawn = old.withdraw_shared_keys(pool, leaf);
            let lower = old.max_published_key().unwrap_or(floor + 1);
            old.set_max_key(pool, lower);
            if let Some(n) = node {
                n.set_last_key(lower);
                n.set_max_key(lower);
            }
            summary.entries -= withdrawn;
            summary.repaired_splits += 1;
            warn_log!(shard, offset, withdrawn, lower, "repaired interrupted leaf split");
        }

        let current = match node {
            Some(n) if !leaf.is_head() && n.n_keys() < MAX_LEAF_CAPACITY => n,
            Some(_) | None => {
                if node.is_some() && !leaf.is_head() {
                    leaf.mark_head(pool);
                }
                let fresh = builder.push(InnerNode::new_node(max_key, random_level(rng)));
                node = Some(fresh);
                fresh
            }
        };
        current.push_leaf(max_key, leaf_ref, leaf.bitmap());
        current.set_max_key(max_key);

        summary.entries += leaf.published();
        summary.leaves += 1;
        floor = prev.map_or(shard_floor, LeafGroup::max_key);
        prev = Some(leaf);
        offset = leaf.next();
    }

    summary.nodes = builder.finish(&guard);
    debug_log!(
        shard,
        leaves = summary.leaves,
        nodes = summary.nodes,
        height = list.head(shard).level(),
        "shard recovered"
    );
    Ok(summary)
}
