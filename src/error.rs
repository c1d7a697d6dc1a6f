//! Error types for the durable pool, the index and configuration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the durable pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Underlying file or mapping operation failed.
    #[error("pool I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested size cannot hold the header and root object.
    #[error("pool size {size} is below the minimum of {min} bytes")]
    TooSmall {
        /// Requested size.
        size: u64,
        /// Smallest usable size.
        min: u64,
    },

    /// File exists but was not written by this crate.
    #[error("pool file {} has no valid header", .path.display())]
    BadMagic {
        /// Offending file.
        path: PathBuf,
    },

    /// File was written with a different leaf layout.
    #[error("pool layout version {found} does not match {expected}")]
    LayoutMismatch {
        /// Version this build writes.
        expected: u32,
        /// Version found in the header.
        found: u32,
    },

    /// File length disagrees with the capacity recorded in its header.
    #[error("pool capacity mismatch: header says {header}, file is {actual} bytes")]
    SizeMismatch {
        /// Capacity recorded in the header.
        header: u64,
        /// Length of the file.
        actual: u64,
    },

    /// No space left for an allocation of `requested` bytes.
    #[error("pool exhausted: {requested} bytes requested, {remaining} remaining")]
    Exhausted {
        /// Bytes requested, including alignment padding.
        requested: u64,
        /// Bytes left in the pool.
        remaining: u64,
    },

    /// Offset points outside the allocated heap.
    #[error("durable offset {offset:#x} out of bounds")]
    OutOfBounds {
        /// Offending offset.
        offset: u64,
    },

    /// Offset is not aligned for the referenced type.
    #[error("durable offset {offset:#x} is not {align}-byte aligned")]
    Misaligned {
        /// Offending offset.
        offset: u64,
        /// Required alignment.
        align: usize,
    },
}

/// Errors returned by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Key `0` and key `u64::MAX` are reserved.
    #[error("key {0:#x} is reserved")]
    ReservedKey(u64),

    /// Value `0` and the tombstone `u64::MAX` are reserved.
    #[error("value {0:#x} is reserved")]
    ReservedValue(u64),

    /// Another writer published the same slot first.
    #[error("slot claim lost to a concurrent publish")]
    Duplicate,

    /// Recovery was asked to rebuild from a pool that never finished `create`.
    #[error("pool holds no index")]
    Uninitialized,

    /// `create` was called on a pool that already holds an index.
    #[error("pool already holds an index")]
    AlreadyInitialized,

    /// Durable pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Variable is set but cannot be parsed.
    #[error("invalid value {value:?} for {var}")]
    InvalidVar {
        /// Variable name.
        var: &'static str,
        /// Raw value found.
        value: String,
    },
}
