//! Bounded range scans.
//!
//! The first leaf group is found like a point lookup, under the owner's
//! read lock. The lock is released before any entry is read; from then on
//! the scan follows the leaf chain without locks and detects concurrent
//! splits itself:
//!
//! - `next` is read before and after collecting a group. If it moved, or a
//!   slot seen in the bitmap was withdrawn, the group is rescanned.
//! - After each group the lower bound moves past the largest key taken, so
//!   the upper half of a group that split behind the scan is not counted
//!   twice.

use crate::constants::MAX_ENTRY_NUM;
use crate::leaf::LeafGroup;
use crate::pool::DurableRef;

use super::{Phast, is_reserved_key};

impl Phast {
    /// Fill `out` with the values of the first `count` keys `>= start`, in
    /// key order. Returns how many were written (at most `out.len()`).
    /// Tombstoned keys contribute the tombstone.
    pub fn range_search(&self, start: u64, count: usize, out: &mut [u64]) -> usize {
        let entries = self.scan(start, count.min(out.len()));
        for (dst, &(_, value)) in out.iter_mut().zip(&entries) {
            *dst = value;
        }
        entries.len()
    }

    /// The first `count` `(key, value)` pairs with `key >= start`, in key
    /// order.
    #[must_use]
    pub fn scan(&self, start: u64, count: usize) -> Vec<(u64, u64)> {
        let start = start.max(1);
        if count == 0 || is_reserved_key(start) {
            return Vec::new();
        }
        let Some(first) = self.first_leaf(start) else {
            return Vec::new();
        };

        let mut result: Vec<(u64, u64)> = Vec::with_capacity(count);
        let mut batch: Vec<(u64, u64)> = Vec::with_capacity(MAX_ENTRY_NUM);
        let mut lower = start;
        let mut cursor = Some(first);

        while let Some(leaf_ref) = cursor {
            if result.len() >= count {
                break;
            }
            let leaf = self.pool.get(leaf_ref);
            let next = collect_stable(leaf, lower, &mut batch);

            if let Some(max) = batch.iter().map(|&(k, _)| k).max() {
                lower = max.saturating_add(1);
            }

            let wanted = count - result.len();
            if batch.len() <= wanted {
                batch.sort_unstable_by_key(|&(k, _)| k);
                result.extend_from_slice(&batch);
            } else {
                batch.select_nth_unstable_by_key(wanted - 1, |&(k, _)| k);
                let head = &mut batch[..wanted];
                head.sort_unstable_by_key(|&(k, _)| k);
                result.extend_from_slice(head);
            }
            cursor = DurableRef::from_offset(next);
        }
        result
    }

    /// Leaf group owning `start`, located under the owner's read lock.
    fn first_leaf(&self, start: u64) -> Option<DurableRef<LeafGroup>> {
        let guard = self.guard();
        let node = self.list.locate(start, &guard)?;
        let (node, _read) = self.list.lock_owner(node, start);
        node.leaf_at(node.lower_bound(start))
    }
}

/// Collect `leaf` into `batch` until a pass sees no concurrent split.
/// Returns the `next` offset that pass observed.
fn collect_stable(leaf: &LeafGroup, lower: u64, batch: &mut Vec<(u64, u64)>) -> u64 {
    loop {
        batch.clear();
        let next = leaf.next();
        let seen = leaf.collect_from(lower, batch);
        if leaf.next() == next && seen & !leaf.bitmap() == 0 {
            return next;
        }
        std::hint::spin_loop();
    }
}
