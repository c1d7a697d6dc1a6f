//! Durable leaf groups.
//!
//! A [`LeafGroup`] is a 1 KiB pool object holding up to [`MAX_ENTRY_NUM`]
//! unsorted entries. Slot `i` is live iff bit `i` of the commit bitmap is
//! set; the bitmap is the only thing that makes an entry visible, and it is
//! persisted only after the entry itself.
//!
//! ```text
//! line 0    | commit bitmap (8) | fingerprints (56)          |
//! line 1    | max_key | next | is_head | padding             |
//! lines 2.. | entries: 56 x (key, value)                     |
//! ```
//!
//! Groups form a singly linked chain in key order. A group owns the keys in
//! `(previous.max_key, max_key]`. Splitting appends a new group after the
//! old one and then shrinks the old one; see [`LeafSplit`].

use std::fmt;
use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64};

use crate::constants::{MAX_ENTRY_NUM, mix64};
use crate::error::{IndexError, PoolError};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::pool::{Durable, DurablePool, DurableRef};
use crate::tracing_helpers::trace_log;

/// One-byte hash of `key`, stored per slot for negative probing.
#[inline(always)]
#[must_use]
#[expect(clippy::cast_possible_truncation, reason = "low byte is the fingerprint")]
pub const fn fingerprint(key: u64) -> u8 {
    mix64(key) as u8
}

/// Iterator over the set bits of a bitmap, lowest first.
#[derive(Clone, Copy)]
pub(crate) struct Slots(u64);

impl Iterator for Slots {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let slot = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(slot)
    }
}

// ============================================================================
//  Layout
// ============================================================================

/// Commit bitmap and fingerprints, persisted together.
#[repr(C, align(64))]
pub struct CommitLine {
    bitmap: AtomicU64,
    fingerprints: [AtomicU8; MAX_ENTRY_NUM],
}

#[repr(C, align(16))]
struct Entry {
    key: AtomicU64,
    value: AtomicU64,
}

/// A fixed-capacity group of durable entries.
#[repr(C, align(64))]
pub struct LeafGroup {
    commit: CommitLine,
    max_key: AtomicU64,
    next: AtomicU64,
    is_head: AtomicBool,
    _pad: [u8; 47],
    entries: [Entry; MAX_ENTRY_NUM],
}

const _: () = assert!(size_of::<CommitLine>() == 64);
const _: () = assert!(offset_of!(LeafGroup, entries) == 128);
const _: () = assert!(size_of::<LeafGroup>() == 1024);

// SAFETY: atomics and padding only; all-zero is an empty, unlinked group.
unsafe impl Durable for LeafGroup {}

impl fmt::Debug for LeafGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafGroup")
            .field("bitmap", &format_args!("{:#016x}", self.bitmap()))
            .field("max_key", &self.max_key())
            .field("next", &self.next())
            .field("is_head", &self.is_head())
            .finish_non_exhaustive()
    }
}

impl LeafGroup {
    /// Length of the header persisted with a freshly built group.
    const HEADER_LEN: usize = offset_of!(Self, entries);

    // ========================================================================
    //  Field access
    // ========================================================================

    /// Authoritative commit bitmap.
    #[inline(always)]
    #[must_use]
    pub fn bitmap(&self) -> u64 {
        self.commit.bitmap.load(READ_ORD)
    }

    /// Number of published entries.
    #[inline]
    #[must_use]
    pub fn published(&self) -> usize {
        self.bitmap().count_ones() as usize
    }

    /// Inclusive upper bound of the keys this group owns.
    #[inline(always)]
    #[must_use]
    pub fn max_key(&self) -> u64 {
        self.max_key.load(READ_ORD)
    }

    /// Offset of the next group, 0 at the end of the chain.
    #[inline(always)]
    #[must_use]
    pub fn next(&self) -> u64 {
        self.next.load(READ_ORD)
    }

    /// Next group as a typed reference.
    #[inline]
    #[must_use]
    pub fn next_ref(&self) -> Option<DurableRef<Self>> {
        DurableRef::from_offset(self.next())
    }

    /// Whether this group starts a new inner node on recovery.
    #[inline]
    #[must_use]
    pub fn is_head(&self) -> bool {
        self.is_head.load(READ_ORD)
    }

    /// Key stored in `slot`. Meaningful only for published slots.
    #[inline(always)]
    #[must_use]
    pub fn key(&self, slot: usize) -> u64 {
        self.entries[slot].key.load(RELAXED)
    }

    /// Value stored in `slot`.
    #[inline(always)]
    #[must_use]
    pub fn value(&self, slot: usize) -> u64 {
        self.entries[slot].value.load(READ_ORD)
    }

    /// Set `max_key` and persist it.
    pub fn set_max_key(&self, pool: &DurablePool, max_key: u64) {
        self.max_key.store(max_key, WRITE_ORD);
        pool.persist(&self.max_key);
    }

    /// Set `next` and persist it.
    pub fn set_next(&self, pool: &DurablePool, next: u64) {
        self.next.store(next, WRITE_ORD);
        pool.persist(&self.next);
    }

    /// Mark this group as the first of an inner node and persist the flag.
    pub fn mark_head(&self, pool: &DurablePool) {
        self.is_head.store(true, WRITE_ORD);
        pool.persist(&self.is_head);
    }

    /// Replace the commit bitmap and persist it.
    pub fn store_bitmap(&self, pool: &DurablePool, bitmap: u64) {
        self.commit.bitmap.store(bitmap, WRITE_ORD);
        pool.persist(&self.commit.bitmap);
    }

    // ========================================================================
    //  Publication
    // ========================================================================

    /// Write an entry into a claimed slot and persist it. The slot stays
    /// invisible until [`try_commit`](Self::try_commit).
    pub fn write_entry(&self, pool: &DurablePool, slot: usize, key: u64, value: u64) {
        let entry = &self.entries[slot];
        entry.key.store(key, RELAXED);
        entry.value.store(value, RELAXED);
        self.commit.fingerprints[slot].store(fingerprint(key), RELAXED);
        pool.persist(entry);
    }

    /// Set bit `slot` in the commit bitmap and persist the commit line.
    ///
    /// Commits to one group are totally ordered by the bitmap CAS. If a slot
    /// published before ours already holds the same key, ours is withdrawn
    /// again, so concurrent inserts of one key publish it once.
    ///
    /// # Errors
    ///
    /// [`IndexError::Duplicate`] if the bit is already set, or the key was
    /// committed first in another slot.
    pub fn try_commit(&self, pool: &DurablePool, slot: usize) -> Result<(), IndexError> {
        let bit = 1u64 << slot;
        let mut current = self.commit.bitmap.load(READ_ORD);
        loop {
            if current & bit != 0 {
                return Err(IndexError::Duplicate);
            }
            match self.commit.bitmap.compare_exchange_weak(
                current,
                current | bit,
                CAS_SUCCESS,
                CAS_FAILURE,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let key = self.key(slot);
        let fp = fingerprint(key);
        let lost = Slots(current).any(|other| {
            self.commit.fingerprints[other].load(RELAXED) == fp && self.key(other) == key
        });
        if lost {
            self.commit.bitmap.fetch_and(!bit, CAS_SUCCESS);
            pool.persist(&self.commit.bitmap);
            return Err(IndexError::Duplicate);
        }
        pool.persist(&self.commit);
        Ok(())
    }

    /// First published slot holding `key`.
    #[must_use]
    pub fn find(&self, key: u64) -> Option<usize> {
        let fp = fingerprint(key);
        Slots(self.bitmap()).find(|&slot| {
            self.commit.fingerprints[slot].load(RELAXED) == fp && self.key(slot) == key
        })
    }

    /// Overwrite the value in a published slot, persist it and return the
    /// previous value.
    pub fn swap_value(&self, pool: &DurablePool, slot: usize, value: u64) -> u64 {
        let entry = &self.entries[slot];
        let old = entry.value.swap(value, CAS_SUCCESS);
        pool.persist(&entry.value);
        old
    }

    /// Replace the value in `slot` only if it still equals `current`.
    /// Persists on success.
    pub fn compare_swap_value(
        &self,
        pool: &DurablePool,
        slot: usize,
        current: u64,
        value: u64,
    ) -> bool {
        let entry = &self.entries[slot];
        let swapped = entry
            .value
            .compare_exchange(current, value, CAS_SUCCESS, CAS_FAILURE)
            .is_ok();
        if swapped {
            pool.persist(&entry.value);
        }
        swapped
    }

    /// Append published entries with `key >= lower` to `out`.
    ///
    /// Returns the bitmap that was scanned so callers can detect slots
    /// withdrawn by a concurrent split.
    pub fn collect_from(&self, lower: u64, out: &mut Vec<(u64, u64)>) -> u64 {
        let bitmap = self.bitmap();
        for slot in Slots(bitmap) {
            let key = self.key(slot);
            if key >= lower {
                out.push((key, self.value(slot)));
            }
        }
        bitmap
    }

    /// Largest published key, if any.
    #[must_use]
    pub fn max_published_key(&self) -> Option<u64> {
        Slots(self.bitmap()).map(|slot| self.key(slot)).max()
    }

    /// Recompute the fingerprint of every published slot, persisting the
    /// commit line if any were stale. Returns the number repaired.
    pub fn refresh_fingerprints(&self, pool: &DurablePool) -> usize {
        let mut repaired = 0;
        for slot in Slots(self.bitmap()) {
            let expected = fingerprint(self.key(slot));
            if self.commit.fingerprints[slot].swap(expected, RELAXED) != expected {
                repaired += 1;
            }
        }
        if repaired > 0 {
            pool.persist(&self.commit);
        }
        repaired
    }

    /// Withdraw every published slot whose key is also published in
    /// `other`, then persist the bitmap. Returns the number withdrawn.
    pub fn withdraw_shared_keys(&self, pool: &DurablePool, other: &Self) -> usize {
        let bitmap = self.bitmap();
        let mut keep = bitmap;
        for slot in Slots(bitmap) {
            if other.find(self.key(slot)).is_some() {
                keep &= !(1u64 << slot);
            }
        }
        if keep != bitmap {
            self.store_bitmap(pool, keep);
        }
        (bitmap ^ keep).count_ones() as usize
    }
}

// ============================================================================
//  Split
// ============================================================================

/// A leaf split in progress.
///
/// The durable steps run in a fixed order, each persisted before the next:
///
/// 1. [`prepare`](Self::prepare): allocate the new group holding the upper
///    half, inheriting `next` and `max_key` from the old group.
/// 2. [`link`](Self::link): point the old group at the new one.
/// 3. [`shrink_bitmap`](Self::shrink_bitmap): withdraw the upper half from
///    the old group.
/// 4. [`shrink_max`](Self::shrink_max): lower the old group's bound.
///
/// A crash after step 2 leaves two adjacent groups with the same `max_key`,
/// which recovery detects and repairs. A crash before it leaks the new
/// group and nothing else.
pub struct LeafSplit<'p> {
    pool: &'p DurablePool,
    old: DurableRef<LeafGroup>,
    new: DurableRef<LeafGroup>,
    lower_bitmap: u64,
    lower_max: u64,
    upper_max: u64,
}

impl fmt::Debug for LeafSplit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafSplit")
            .field("old", &self.old)
            .field("new", &self.new)
            .field("lower_bitmap", &format_args!("{:#016x}", self.lower_bitmap))
            .field("lower_max", &self.lower_max)
            .field("upper_max", &self.upper_max)
            .finish_non_exhaustive()
    }
}

impl<'p> LeafSplit<'p> {
    /// Partition `old` around its median key and build the upper group.
    ///
    /// Returns `None` without touching the pool when `old` has no lower half
    /// to keep: fewer than two published entries, or a lower half that
    /// already reaches the bound.
    ///
    /// The caller must exclude concurrent publication into `old`.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] if the new group cannot be allocated.
    pub fn prepare(
        pool: &'p DurablePool,
        old_ref: DurableRef<LeafGroup>,
    ) -> Result<Option<Self>, PoolError> {
        let old = pool.get(old_ref);
        let bitmap = old.bitmap();

        let mut slots = [0usize; MAX_ENTRY_NUM];
        let mut n = 0;
        for slot in Slots(bitmap) {
            slots[n] = slot;
            n += 1;
        }
        let slots = &mut slots[..n];
        let mid = n / 2;
        if n > 1 {
            slots.select_nth_unstable_by_key(mid, |&slot| old.key(slot));
        }

        let Some(lower_max) = slots[..mid]
            .iter()
            .map(|&slot| old.key(slot))
            .max()
            .filter(|&max| max < old.max_key())
        else {
            return Ok(None);
        };
        let mut upper_bitmap = 0u64;
        for &slot in &slots[mid..] {
            if old.key(slot) > lower_max {
                upper_bitmap |= 1u64 << slot;
            }
        }
        if upper_bitmap == 0 {
            // Only reachable when the upper half repeats the lower maximum.
            for &slot in &slots[mid..] {
                upper_bitmap |= 1u64 << slot;
            }
        }
        let lower_bitmap = bitmap & !upper_bitmap;

        let new_ref = pool.allocate_zeroed::<LeafGroup>()?;
        let new = pool.get(new_ref);
        let mut count = 0;
        for slot in Slots(upper_bitmap) {
            let key = old.key(slot);
            let entry = &new.entries[count];
            entry.key.store(key, RELAXED);
            entry.value.store(old.value(slot), RELAXED);
            new.commit.fingerprints[count].store(fingerprint(key), RELAXED);
            count += 1;
        }
        new.commit.bitmap.store((1u64 << count) - 1, RELAXED);
        new.max_key.store(old.max_key(), RELAXED);
        new.next.store(old.next(), RELAXED);
        pool.persist_range(
            std::ptr::from_ref(new).cast::<u8>(),
            LeafGroup::HEADER_LEN + count * size_of::<Entry>(),
        );

        trace_log!(
            old = old_ref.offset(),
            new = new_ref.offset(),
            lower = lower_bitmap.count_ones(),
            upper = count,
            lower_max,
            "leaf split prepared"
        );

        Ok(Some(Self {
            pool,
            old: old_ref,
            new: new_ref,
            lower_bitmap,
            lower_max,
            upper_max: old.max_key(),
        }))
    }

    /// Step 2: link the new group after the old one.
    pub fn link(&self) {
        self.pool.get(self.old).set_next(self.pool, self.new.offset());
    }

    /// Step 3: withdraw the upper half from the old group.
    pub fn shrink_bitmap(&self) {
        self.pool.get(self.old).store_bitmap(self.pool, self.lower_bitmap);
    }

    /// Step 4: lower the old group's bound to its remaining maximum.
    pub fn shrink_max(&self) {
        self.pool.get(self.old).set_max_key(self.pool, self.lower_max);
    }

    /// Run steps 2 to 4.
    pub fn complete(&self) {
        self.link();
        self.shrink_bitmap();
        self.shrink_max();
    }

    /// The newly allocated upper group.
    #[must_use]
    pub const fn new_group(&self) -> DurableRef<LeafGroup> {
        self.new
    }

    /// Bound of the old group after the split.
    #[must_use]
    pub const fn lower_max(&self) -> u64 {
        self.lower_max
    }

    /// Bound of the new group (the old group's bound before the split).
    #[must_use]
    pub const fn upper_max(&self) -> u64 {
        self.upper_max
    }

    /// Bitmap the old group keeps.
    #[must_use]
    pub const fn lower_bitmap(&self) -> u64 {
        self.lower_bitmap
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "fail fast in tests")]

    use super::*;
    use crate::constants::LEAF_FULL;
    use crate::pool::MIN_POOL_SIZE;

    fn pool() -> DurablePool {
        DurablePool::anonymous(MIN_POOL_SIZE).unwrap()
    }

    fn fill(pool: &DurablePool, leaf: &LeafGroup, keys: impl IntoIterator<Item = u64>) {
        for (slot, key) in keys.into_iter().enumerate() {
            leaf.write_entry(pool, slot, key, key * 10);
            leaf.try_commit(pool, slot).unwrap();
        }
    }

    #[test]
    fn test_slots_iterates_set_bits() {
        assert_eq!(Slots(0b1010_0101).collect::<Vec<_>>(), vec![0, 2, 5, 7]);
        assert_eq!(Slots(0).count(), 0);
        assert_eq!(Slots(LEAF_FULL).count(), MAX_ENTRY_NUM);
    }

    #[test]
    fn test_publish_and_find() {
        let pool = pool();
        let r = pool.allocate_zeroed::<LeafGroup>().unwrap();
        let leaf = pool.get(r);
        leaf.write_entry(&pool, 3, 77, 700);
        assert_eq!(leaf.find(77), None, "unpublished slot must be invisible");
        leaf.try_commit(&pool, 3).unwrap();
        assert_eq!(leaf.find(77), Some(3));
        assert_eq!(leaf.value(3), 700);
        assert_eq!(leaf.find(78), None);
        assert!(matches!(leaf.try_commit(&pool, 3), Err(IndexError::Duplicate)));
    }

    #[test]
    fn test_later_commit_of_same_key_is_withdrawn() {
        let pool = pool();
        let leaf = pool.get(pool.allocate_zeroed::<LeafGroup>().unwrap());
        // Two inserters probed, missed, and claimed different slots.
        leaf.write_entry(&pool, 4, 9, 1);
        leaf.write_entry(&pool, 1, 9, 2);
        leaf.try_commit(&pool, 4).unwrap();
        assert!(matches!(leaf.try_commit(&pool, 1), Err(IndexError::Duplicate)));
        assert_eq!(leaf.bitmap(), 1 << 4);
        assert_eq!(leaf.value(leaf.find(9).unwrap()), 1);
    }

    #[test]
    fn test_swap_value() {
        let pool = pool();
        let leaf = pool.get(pool.allocate_zeroed::<LeafGroup>().unwrap());
        fill(&pool, leaf, [5]);
        assert_eq!(leaf.swap_value(&pool, 0, 99), 50);
        assert_eq!(leaf.value(0), 99);
        assert!(!leaf.compare_swap_value(&pool, 0, 50, 7));
        assert!(leaf.compare_swap_value(&pool, 0, 99, 7));
        assert_eq!(leaf.value(0), 7);
    }

    #[test]
    fn test_collect_from_filters_lower_bound() {
        let pool = pool();
        let leaf = pool.get(pool.allocate_zeroed::<LeafGroup>().unwrap());
        fill(&pool, leaf, [40, 10, 30, 20]);
        let mut out = Vec::new();
        let bitmap = leaf.collect_from(25, &mut out);
        out.sort_unstable();
        assert_eq!(out, vec![(30, 300), (40, 400)]);
        assert_eq!(bitmap, 0b1111);
    }

    #[test]
    fn test_split_partitions_at_median() {
        let pool = pool();
        let old_ref = pool.allocate_zeroed::<LeafGroup>().unwrap();
        let old = pool.get(old_ref);
        old.set_max_key(&pool, 1000);
        // Reverse order so slot order differs from key order.
        fill(&pool, old, (1..=MAX_ENTRY_NUM as u64).rev().map(|k| k * 10));

        let split = LeafSplit::prepare(&pool, old_ref).unwrap().unwrap();
        split.complete();

        let new = pool.get(split.new_group());
        assert_eq!(old.published(), MAX_ENTRY_NUM / 2);
        assert_eq!(new.published(), MAX_ENTRY_NUM / 2);
        assert_eq!(old.max_key(), 280);
        assert_eq!(new.max_key(), 1000);
        assert_eq!(old.next(), split.new_group().offset());
        assert_eq!(old.max_published_key(), Some(280));
        for key in (1..=28).map(|k| k * 10) {
            assert!(old.find(key).is_some());
            assert!(new.find(key).is_none());
        }
        for key in (29..=56).map(|k| k * 10) {
            assert_eq!(new.value(new.find(key).unwrap()), key * 10);
            assert!(old.find(key).is_none());
        }
    }

    #[test]
    fn test_split_keeps_equal_keys_together() {
        let pool = pool();
        let old_ref = pool.allocate_zeroed::<LeafGroup>().unwrap();
        let old = pool.get(old_ref);
        old.set_max_key(&pool, 100);
        // Repeated keys cannot be committed one by one; publish them at once.
        for (slot, key) in [1u64, 2, 2, 2, 3, 4].into_iter().enumerate() {
            old.write_entry(&pool, slot, key, key * 10);
        }
        old.store_bitmap(&pool, 0b11_1111);
        let split = LeafSplit::prepare(&pool, old_ref).unwrap().unwrap();
        split.complete();
        let new = pool.get(split.new_group());
        assert_eq!(split.lower_max(), 2);
        assert_eq!(old.published(), 4);
        assert_eq!(new.published(), 2);
        assert!(new.find(2).is_none());
    }

    #[test]
    fn test_split_needs_a_lower_half() {
        let pool = pool();
        let old_ref = pool.allocate_zeroed::<LeafGroup>().unwrap();
        let old = pool.get(old_ref);
        old.set_max_key(&pool, 1000);
        let used = pool.used();
        assert!(LeafSplit::prepare(&pool, old_ref).unwrap().is_none(), "empty group");

        fill(&pool, old, [500]);
        assert!(LeafSplit::prepare(&pool, old_ref).unwrap().is_none(), "single entry");
        assert_eq!(old.max_key(), 1000, "bound must not collapse");
        assert_eq!(old.bitmap(), 0b1);
        assert_eq!(pool.used(), used, "nothing allocated");

        old.write_entry(&pool, 1, 200, 2000);
        old.try_commit(&pool, 1).unwrap();
        let split = LeafSplit::prepare(&pool, old_ref).unwrap().unwrap();
        split.complete();
        assert_eq!(old.max_key(), 200);
        assert_eq!(pool.get(split.new_group()).max_key(), 1000);
    }

    #[test]
    fn test_withdraw_shared_keys_after_interrupted_split() {
        let pool = pool();
        let old_ref = pool.allocate_zeroed::<LeafGroup>().unwrap();
        let old = pool.get(old_ref);
        old.set_max_key(&pool, 500);
        fill(&pool, old, (1..=10).map(|k| k * 7));
        let split = LeafSplit::prepare(&pool, old_ref).unwrap().unwrap();
        split.link();
        // Crash here: bitmap and bound were never shrunk.
        let new = pool.get(split.new_group());
        assert_eq!(old.max_key(), new.max_key());
        assert_eq!(old.withdraw_shared_keys(&pool, new), 5);
        assert_eq!(old.bitmap(), split.lower_bitmap());
        assert_eq!(old.max_published_key(), Some(split.lower_max()));
    }

    #[test]
    fn test_refresh_fingerprints() {
        let pool = pool();
        let leaf = pool.get(pool.allocate_zeroed::<LeafGroup>().unwrap());
        fill(&pool, leaf, [11, 22]);
        assert_eq!(leaf.refresh_fingerprints(&pool), 0);
        leaf.commit.fingerprints[1].store(fingerprint(22) ^ 0xff, RELAXED);
        assert_eq!(leaf.find(22), None);
        assert_eq!(leaf.refresh_fingerprints(&pool), 1);
        assert_eq!(leaf.find(22), Some(1));
    }
}
