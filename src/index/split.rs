//! Leaf and inner-node splits.
//!
//! Both run while holding a [`SplitGuard`]: the node's split gate plus its
//! write lock. Inserters into the node are therefore excluded, while
//! lock-free traversals and range scans keep running.

use crate::constants::{MAX_ENTRY_NUM, MIN_LEAF_CAPACITY};
use crate::inner::SplitGuard;
use crate::leaf::LeafSplit;
use crate::pool::fatal;
use crate::tracing_helpers::debug_log;

use super::Phast;

impl Phast {
    /// Split the full leaf group at `loc` and record both halves.
    ///
    /// Slots withdrawn by losing duplicate inserts stay claimed in the
    /// working bitmap, so a group can look full while holding few entries.
    /// Such a group gets its withdrawn slots back instead of being split.
    pub(super) fn split_leaf(&self, split: &SplitGuard<'_>, loc: usize) {
        let node = split.node();
        let pool = &*self.pool;
        let Some(leaf_ref) = node.leaf_at(loc) else {
            return;
        };
        let leaf = pool.get(leaf_ref);

        let prepared = if leaf.published() > MAX_ENTRY_NUM / 2 {
            LeafSplit::prepare(pool, leaf_ref).unwrap_or_else(|err| fatal(&err))
        } else {
            None
        };
        let Some(leaf_split) = prepared else {
            debug_log!(loc, published = leaf.published(), "reclaiming withdrawn leaf slots");
            node.reset_slots(split.write(), loc, leaf.bitmap());
            return;
        };
        leaf_split.complete();

        let new_bitmap = pool.get(leaf_split.new_group()).bitmap();
        node.insert_split(
            split.write(),
            loc,
            leaf_split.lower_max(),
            leaf_split.new_group(),
            leaf_split.lower_bitmap(),
            new_bitmap,
        );
    }

    /// Move the upper half of a full node into a new level-0 sibling.
    ///
    /// The sibling is linked at level 0 before the node's bound shrinks, so
    /// a traversal that sees the smaller bound always finds the sibling.
    pub(super) fn split_inner(&self, split: &SplitGuard<'_>) {
        let node = split.node();
        let right = node.split_off(split.write(), MIN_LEAF_CAPACITY);
        if let Some(first) = right.leaf_at(0) {
            self.pool.get(first).mark_head(&self.pool);
        }
        debug_log!(
            left_max = node.key_at(MIN_LEAF_CAPACITY - 1),
            right_max = right.max_key(),
            "inner node split"
        );
        self.list.publish_split(node, right);
        node.truncate(split.write(), MIN_LEAF_CAPACITY);
    }
}
