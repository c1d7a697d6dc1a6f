//! Runtime configuration for the durable pool and the index.
//!
//! Structural parameters (shard count, leaf capacity, level count) are
//! compile-time constants in [`crate::constants`]. What lives here is what
//! an operator picks per deployment: where the pool lives, how big it is,
//! how hard `persist` pushes data to media, and how many threads recovery
//! may use.
//!
//! # Environment
//!
//! [`IndexConfig::from_env`] reads:
//! - `PHAST_POOL_PATH`: pool file; unset means an anonymous (volatile) pool
//! - `PHAST_POOL_SIZE`: pool size in bytes, `K`/`M`/`G` suffixes accepted
//! - `PHAST_FLUSH`: `sync`, `async` or `fence`
//! - `PHAST_RECOVERY_THREADS`: recovery parallelism

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;

use crate::error::ConfigError;

/// Default pool size: 1 GiB.
pub const DEFAULT_POOL_SIZE: u64 = 1 << 30;

/// How [`DurablePool::persist`](crate::pool::DurablePool::persist) reaches media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Synchronous `msync` of the touched pages, then a fence.
    #[default]
    Sync,
    /// Schedules write-back of the touched pages and fences.
    Async,
    /// Store fence only. Durable only against process crashes.
    Fence,
}

impl FromStr for FlushMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "fence" => Ok(Self::Fence),
            _ => Err(ConfigError::InvalidVar {
                var: "PHAST_FLUSH",
                value: s.to_string(),
            }),
        }
    }
}

/// Where and how the durable pool is mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Backing file. `None` maps anonymous memory.
    pub path: Option<PathBuf>,
    /// Pool size in bytes when creating a new pool.
    pub size: u64,
    /// Flush policy.
    pub flush: FlushMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: None,
            size: DEFAULT_POOL_SIZE,
            flush: FlushMode::default(),
        }
    }
}

impl PoolConfig {
    /// File-backed pool at `path` with default size and flush mode.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Anonymous pool of `size` bytes.
    #[must_use]
    pub fn anonymous(size: u64) -> Self {
        Self {
            path: None,
            size,
            flush: FlushMode::Fence,
        }
    }

    /// Builder: set the flush mode.
    #[must_use]
    pub const fn with_flush(mut self, flush: FlushMode) -> Self {
        self.flush = flush;
        self
    }

    /// Builder: set the pool size.
    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// Configuration for [`Phast::open`](crate::Phast::open).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Pool configuration.
    pub pool: PoolConfig,
    /// Threads used by recovery. Clamped to `1..=HEAD_COUNT`.
    pub recovery_threads: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            recovery_threads: thread::available_parallelism().map_or(1, std::num::NonZero::get),
        }
    }
}

impl IndexConfig {
    /// Defaults overridden by any `PHAST_*` variables that are set.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidVar`] if a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = env::var("PHAST_POOL_PATH") {
            config.pool.path = Some(PathBuf::from(path));
        }

        if let Ok(raw) = env::var("PHAST_POOL_SIZE") {
            config.pool.size = parse_size(&raw).ok_or(ConfigError::InvalidVar {
                var: "PHAST_POOL_SIZE",
                value: raw,
            })?;
        }

        if let Ok(raw) = env::var("PHAST_FLUSH") {
            config.pool.flush = raw.parse()?;
        }

        if let Ok(raw) = env::var("PHAST_RECOVERY_THREADS") {
            config.recovery_threads = match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidVar {
                        var: "PHAST_RECOVERY_THREADS",
                        value: raw,
                    });
                }
            };
        }

        Ok(config)
    }
}

/// Parse a byte count with an optional binary `K`, `M` or `G` suffix.
fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, shift) = match raw.chars().last()? {
        'k' | 'K' => (&raw[..raw.len() - 1], 10),
        'm' | 'M' => (&raw[..raw.len() - 1], 20),
        'g' | 'G' => (&raw[..raw.len() - 1], 30),
        _ => (raw, 0),
    };
    let n: u64 = digits.trim().parse().ok()?;
    n.checked_mul(1u64 << shift).filter(|&size| size > 0)
}
