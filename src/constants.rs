//! Structural constants and shard arithmetic.
//!
//! Everything here is fixed at compile time. Changing any of the leaf
//! constants changes the durable layout, so [`LAYOUT_VERSION`] must be
//! bumped alongside them.

/// Number of shards the key space is divided into.
pub const HEAD_COUNT: usize = 128;

/// Width of a shard in key space.
pub const SHARD_WIDTH: u64 = u64::MAX / HEAD_COUNT as u64;

/// Entries per durable leaf group.
pub const MAX_ENTRY_NUM: usize = 56;

/// Commit bitmap value of a leaf group with every slot published.
pub const LEAF_FULL: u64 = (1u64 << MAX_ENTRY_NUM) - 1;

/// Leaf groups referenced by one inner node.
pub const MAX_LEAF_CAPACITY: usize = 128;

/// Split point of an inner node.
pub const MIN_LEAF_CAPACITY: usize = MAX_LEAF_CAPACITY / 2;

/// Number of skip-list levels.
pub const MAX_L: usize = 32;

/// Nodes passed at one level before the next one is promoted.
pub const SPAN_TH: usize = 1;

/// Level sampled by the aggregation cache.
pub const AGG_UPDATE_LEVEL: usize = 1;

/// Initial capacity of an aggregation snapshot.
pub const AGG_SLOT_INIT_NUM: usize = 8;

/// Headroom kept free in an aggregation snapshot before it grows.
pub const AGG_REDUNDANT_SPACE: usize = 4;

/// Value written by delete.
pub const TOMBSTONE: u64 = u64::MAX;

/// Durable layout revision stored in the pool header.
pub const LAYOUT_VERSION: u32 = 1;

/// Cache line size assumed by the durable layout.
pub const CACHE_LINE: usize = 64;

/// Shard owning `key`.
///
/// Keys at or above `HEAD_COUNT * SHARD_WIDTH` fold into the last shard.
#[inline(always)]
#[must_use]
#[expect(clippy::cast_possible_truncation, reason = "quotient is at most HEAD_COUNT")]
pub const fn shard_of(key: u64) -> usize {
    let shard = (key / SHARD_WIDTH) as usize;
    if shard >= HEAD_COUNT { HEAD_COUNT - 1 } else { shard }
}

/// Inclusive upper bound of the keys owned by `shard`.
#[inline(always)]
#[must_use]
pub const fn shard_upper_bound(shard: usize) -> u64 {
    if shard + 1 >= HEAD_COUNT {
        u64::MAX
    } else {
        (shard as u64 + 1) * SHARD_WIDTH
    }
}

/// Mixing function used for leaf fingerprints.
#[inline(always)]
#[must_use]
pub const fn mix64(mut key: u64) -> u64 {
    key = (!key).wrapping_add(key << 21);
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8);
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4);
    key ^= key >> 28;
    key.wrapping_add(key << 31)
}
