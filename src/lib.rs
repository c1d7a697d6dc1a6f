//! # PHAST
//!
//! A crash-consistent ordered index from `u64` keys to `u64` values, built
//! as a hybrid of a volatile skip list and durable leaf groups.
//!
//! - The key space is cut into [`HEAD_COUNT`] shards, each with its own
//!   skip list of inner nodes. Shards share nothing but the leaf chain.
//! - Inner nodes live in DRAM and point at leaf groups in a memory-mapped
//!   [`DurablePool`]. Only the leaf groups and the per-shard root entries
//!   are durable; everything else is rebuilt by [`Phast::recover`].
//! - A leaf group holds up to 56 unsorted entries behind a commit bitmap.
//!   Setting a bit publishes an entry; a split is a fixed sequence of
//!   persisted steps that recovery can finish or undo.
//!
//! ## Status
//!
//! | Feature | Status |
//! |---------|--------|
//! | Concurrent insert / search / update / delete | Works |
//! | Range scans | Works (lock-free after locating the first group) |
//! | Recovery | Works (parallel, repairs interrupted leaf splits) |
//! | Physical deletion | Not implemented (deletes write a tombstone) |
//! | Memory reclamation | Inner nodes live until the index drops |
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use phast::{DurablePool, Phast};
//!
//! let pool = Arc::new(DurablePool::anonymous(16 << 20).unwrap());
//! let index = Phast::create(pool).unwrap();
//!
//! for key in 1..=100 {
//!     index.insert(key, key * 10).unwrap();
//! }
//! assert_eq!(index.get(7), Some(70));
//! assert_eq!(index.scan(50, 3), vec![(50, 500), (51, 510), (52, 520)]);
//! ```
//!
//! File-backed indexes are opened through [`IndexConfig`], which recovers
//! an existing pool or creates a new one:
//!
//! ```rust,no_run
//! use phast::{IndexConfig, Phast};
//!
//! let config = IndexConfig::from_env().unwrap();
//! let index = Phast::open(&config).unwrap();
//! index.insert(1, 2).unwrap();
//! index.sync().unwrap();
//! ```
//!
//! ## Reserved inputs
//!
//! Keys `0` and `u64::MAX` and values `0` and [`TOMBSTONE`] are rejected.
//!
//! ## Logging
//!
//! With the `tracing` feature, structural events (splits, promotions,
//! recovery repairs) are emitted through the `tracing` crate. Without it
//! the logging macros compile to nothing.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::inline_always)]

pub mod agg;
pub mod config;
pub mod constants;
pub mod error;
pub mod index;
pub mod inner;
pub mod leaf;
pub mod lock;
pub mod ordering;
pub mod pool;
pub mod skiplist;

mod recovery;
mod tracing_helpers;

#[cfg(test)]
mod shuttle_tests;

#[cfg(loom)]
mod loom_tests;

pub use config::{FlushMode, IndexConfig, PoolConfig};
pub use constants::{HEAD_COUNT, TOMBSTONE};
pub use error::{ConfigError, IndexError, PoolError};
pub use index::{IndexStats, Phast};
pub use pool::{DurablePool, DurableRef};
