//! Loom tests for publication order in splits.
//!
//! Loom explores every interleaving, so the models stay tiny: one writer
//! performing the steps of a split and one lock-free reader.
//!
//! Run with: `RUSTFLAGS="--cfg loom" cargo test --lib loom_tests`

use loom::sync::Arc;
use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use loom::thread;

/// Two nodes of one level. Node 0 covers `(0, max[0]]`, node 1 the rest.
struct LoomLevel {
    max: [AtomicU64; 2],
    /// 0 = no successor, 1 = node 1 linked after node 0.
    next: AtomicUsize,
    /// Highest key owned by each node.
    owned: [AtomicU64; 2],
}

impl LoomLevel {
    fn new() -> Self {
        Self {
            max: [AtomicU64::new(100), AtomicU64::new(100)],
            next: AtomicUsize::new(0),
            owned: [AtomicU64::new(100), AtomicU64::new(0)],
        }
    }

    /// Inner split: fill the right node, link it, then shrink the left.
    fn split(&self) {
        self.owned[1].store(100, Ordering::Relaxed);
        self.next.store(1, Ordering::Release);
        self.max[0].store(50, Ordering::Release);
        self.owned[0].store(50, Ordering::Release);
    }

    /// Move right while `key` is beyond the node's bound.
    fn owner(&self, key: u64) -> usize {
        let mut node = 0;
        while key > self.max[node].load(Ordering::Acquire) {
            match self.next.load(Ordering::Acquire) {
                1 if node == 0 => node = 1,
                _ => break,
            }
        }
        node
    }
}

#[test]
fn test_loom_reader_never_loses_key_during_split() {
    loom::model(|| {
        let level = Arc::new(LoomLevel::new());

        let writer = {
            let level = Arc::clone(&level);
            thread::spawn(move || level.split())
        };

        // Reaching node 1 implies its contents were filled before linking.
        if level.owner(80) == 1 {
            assert_eq!(level.owned[1].load(Ordering::Relaxed), 100);
        }

        writer.join().expect("join");
        assert_eq!(level.owner(80), 1);
        assert_eq!(level.owner(20), 0);
    });
}

/// Durable steps of a leaf split, reduced to the fields a reader uses.
struct LoomLeaf {
    bitmap: [AtomicU64; 2],
    max: [AtomicU64; 2],
    next: AtomicUsize,
}

#[test]
fn test_loom_leaf_split_keeps_entries_reachable() {
    loom::model(|| {
        // Group 0 holds four entries; the upper two move to group 1.
        let leaf = Arc::new(LoomLeaf {
            bitmap: [AtomicU64::new(0b1111), AtomicU64::new(0b11)],
            max: [AtomicU64::new(40), AtomicU64::new(40)],
            next: AtomicUsize::new(0),
        });

        let writer = {
            let leaf = Arc::clone(&leaf);
            thread::spawn(move || {
                leaf.next.store(1, Ordering::Release);
                leaf.bitmap[0].store(0b0011, Ordering::Release);
                leaf.max[0].store(20, Ordering::Release);
            })
        };

        // Seeing entries withdrawn implies the new group is already linked,
        // so a scan that rechecks `next` finds them there.
        let old = leaf.bitmap[0].load(Ordering::Acquire);
        if old != 0b1111 {
            assert_eq!(leaf.next.load(Ordering::Acquire), 1);
        }
        // A shrunk bound implies the bitmap already shrank.
        if leaf.max[0].load(Ordering::Acquire) == 20 {
            assert_eq!(leaf.bitmap[0].load(Ordering::Acquire), 0b0011);
        }

        writer.join().expect("join");
        assert_eq!(leaf.bitmap[0].load(Ordering::Acquire) | (leaf.bitmap[1].load(Ordering::Acquire) << 2), 0b1111);
    });
}
