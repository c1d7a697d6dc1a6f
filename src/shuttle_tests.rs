//! Shuttle tests for the slot claim and commit protocol.
//!
//! Shuttle explores randomized thread schedules. The models here run the
//! same compare-exchange loops and orderings as [`InnerNode::claim_slot`]
//! and [`LeafGroup::try_commit`], on shuttle primitives so every
//! interleaving point is visible to the scheduler.
//!
//! Run with: `cargo test --lib shuttle_tests`
//!
//! [`InnerNode::claim_slot`]: crate::inner::InnerNode::claim_slot
//! [`LeafGroup::try_commit`]: crate::leaf::LeafGroup::try_commit

use shuttle::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use shuttle::sync::{Arc, RwLock};
use shuttle::thread;

use crate::constants::{LEAF_FULL, MAX_ENTRY_NUM};

const ITERATIONS: usize = 1_000;

/// One leaf group reduced to what the insert path touches.
struct ShuttleGroup {
    /// Working bitmap, claimed by CAS.
    working: AtomicU64,
    /// Commit bitmap, published by CAS.
    commit: AtomicU64,
    keys: Vec<AtomicU64>,
}

impl ShuttleGroup {
    fn new(prefilled: u64) -> Self {
        Self {
            working: AtomicU64::new(prefilled),
            commit: AtomicU64::new(prefilled),
            keys: (0..MAX_ENTRY_NUM).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn claim(&self) -> Option<usize> {
        let mut current = self.working.load(Ordering::Acquire);
        loop {
            if current & LEAF_FULL == LEAF_FULL {
                return None;
            }
            let slot = (!current).trailing_zeros() as usize;
            match self.working.compare_exchange_weak(
                current,
                current | (1 << slot),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(slot),
                Err(actual) => current = actual,
            }
        }
    }

    /// Publish `key` in `slot`; `false` if the key was committed first elsewhere.
    fn commit(&self, slot: usize, key: u64) -> bool {
        let bit = 1u64 << slot;
        self.keys[slot].store(key, Ordering::Relaxed);
        let mut previous = self.commit.load(Ordering::Acquire);
        loop {
            assert_eq!(previous & bit, 0, "slot {slot} committed twice");
            match self.commit.compare_exchange_weak(
                previous,
                previous | bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => previous = actual,
            }
        }
        let lost = (0..MAX_ENTRY_NUM)
            .any(|other| previous & (1 << other) != 0 && self.keys[other].load(Ordering::Relaxed) == key);
        if lost {
            self.commit.fetch_and(!bit, Ordering::AcqRel);
        }
        !lost
    }

    fn insert(&self, key: u64) -> bool {
        if self.find(key) {
            return false;
        }
        let slot = self.claim().expect("group has room");
        self.commit(slot, key)
    }

    fn find(&self, key: u64) -> bool {
        let bitmap = self.commit.load(Ordering::Acquire);
        (0..MAX_ENTRY_NUM).any(|slot| bitmap & (1 << slot) != 0 && self.keys[slot].load(Ordering::Relaxed) == key)
    }
}

#[test]
fn test_shuttle_claims_are_unique() {
    shuttle::check_random(
        || {
            let group = Arc::new(ShuttleGroup::new(0));
            let handles: Vec<_> = (0..3u64)
                .map(|t| {
                    let group = Arc::clone(&group);
                    thread::spawn(move || {
                        let slot = group.claim().expect("group has room");
                        assert!(group.commit(slot, t + 1));
                        slot
                    })
                })
                .collect();
            let mut slots: Vec<usize> = handles.into_iter().map(|h| h.join().expect("join")).collect();
            slots.sort_unstable();
            slots.dedup();
            assert_eq!(slots.len(), 3);
            assert_eq!(group.commit.load(Ordering::Acquire).count_ones(), 3);
            for key in 1..=3 {
                assert!(group.find(key), "key {key} lost");
            }
        },
        ITERATIONS,
    );
}

#[test]
fn test_shuttle_same_key_published_once() {
    shuttle::check_random(
        || {
            let group = Arc::new(ShuttleGroup::new(0));
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    let group = Arc::clone(&group);
                    thread::spawn(move || group.insert(42))
                })
                .collect();
            let wins = handles.into_iter().map(|h| h.join().expect("join")).filter(|&won| won).count();
            assert_eq!(wins, 1);
            let published = group.commit.load(Ordering::Acquire);
            assert_eq!(published.count_ones(), 1, "key published {} times", published.count_ones());
            assert!(group.find(42));
        },
        ITERATIONS,
    );
}

#[test]
fn test_shuttle_last_slot_goes_to_one_thread() {
    shuttle::check_random(
        || {
            // Every slot but the last is taken.
            let group = Arc::new(ShuttleGroup::new(LEAF_FULL & !(1 << (MAX_ENTRY_NUM - 1))));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let group = Arc::clone(&group);
                    thread::spawn(move || group.claim())
                })
                .collect();
            let claimed: Vec<Option<usize>> = handles.into_iter().map(|h| h.join().expect("join")).collect();
            assert_eq!(claimed.iter().flatten().count(), 1);
            assert!(claimed.contains(&Some(MAX_ENTRY_NUM - 1)));
        },
        ITERATIONS,
    );
}

/// A node lock plus its split gate.
struct ShuttleNode {
    lock: RwLock<()>,
    is_split: AtomicBool,
    splits: AtomicU64,
}

#[test]
fn test_shuttle_split_gate_admits_one() {
    shuttle::check_random(
        || {
            let node = Arc::new(ShuttleNode {
                lock: RwLock::new(()),
                is_split: AtomicBool::new(false),
                splits: AtomicU64::new(0),
            });
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    let node = Arc::clone(&node);
                    thread::spawn(move || {
                        let read = node.lock.read().expect("read");
                        let admitted = node
                            .is_split
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok();
                        drop(read);
                        if !admitted {
                            return;
                        }
                        let write = node.lock.write().expect("write");
                        let active = node.splits.fetch_add(1, Ordering::AcqRel);
                        assert_eq!(active % 2, 0, "two splitters inside the gate");
                        node.splits.fetch_add(1, Ordering::AcqRel);
                        node.is_split.store(false, Ordering::Release);
                        drop(write);
                    })
                })
                .collect();
            for h in handles {
                h.join().expect("join");
            }
            assert!(!node.is_split.load(Ordering::Acquire));
        },
        ITERATIONS,
    );
}
