//! Memory orderings used for node and leaf access.
//!
//! Inner nodes are read by traversals that hold no lock on them, and leaf
//! groups are read by range scans that hold no lock at all, so every field a
//! writer publishes is stored with [`WRITE_ORD`] and loaded with [`READ_ORD`].

use std::sync::atomic::Ordering;

/// Loads of published fields (`max_key`, `next`, `n_keys`, commit bitmaps).
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Stores that publish a field to lock-free readers.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Successful CAS on a bitmap, a level or a `next` pointer.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Failed CAS. Only the current value is needed.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Loads and stores already ordered by a held lock or by a later fence.
pub const RELAXED: Ordering = Ordering::Relaxed;
