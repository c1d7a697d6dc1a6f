//! Shared helpers for integration tests: tracing setup and index fixtures.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     let index = common::fresh_index(64 << 20);
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Filter directives (e.g., `phast=debug,phast::recovery=trace`)
//! - `PHAST_LOG_DIR`: Log directory (default: `logs/`)
//! - `PHAST_LOG_CONSOLE`: Set to "0" to disable console output
//!
//! Library events are only emitted with `--features tracing`.
//!
//! # Log Files
//!
//! Logs are appended to `logs/phast.jsonl` as newline-delimited JSON:
//!
//! ```bash
//! # Recovery repairs only
//! cat logs/phast.jsonl | jq 'select(.fields.message == "repaired interrupted leaf split")'
//!
//! # Per-shard recovery summaries
//! cat logs/phast.jsonl | jq 'select(.target == "phast::recovery") | .fields'
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use phast::{DurablePool, FlushMode, Phast};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once per test binary.
static INIT: Once = Once::new();

/// Install console and file subscribers. Only the first call has effect.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

/// Where and how test logs are written.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Directory for log files.
    pub log_dir: PathBuf,
    /// Log file name.
    pub log_file: String,
    /// Enable console output.
    pub console_enabled: bool,
    /// Level used when `RUST_LOG` is unset.
    pub default_level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_file: "phast.jsonl".to_string(),
            console_enabled: true,
            default_level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Defaults overridden by `PHAST_LOG_DIR` and `PHAST_LOG_CONSOLE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = env::var("PHAST_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if env::var("PHAST_LOG_CONSOLE").is_ok_and(|v| v == "0") {
            config.console_enabled = false;
        }
        config
    }
}

fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

#[expect(clippy::expect_used)]
fn setup_tracing() {
    let config = TracingConfig::from_env();
    std::fs::create_dir_all(&config.log_dir).expect("Failed to create log directory");

    // Append: nextest runs each test in its own process.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_dir.join(&config.log_file))
        .expect("Failed to open log file");

    let console_layer = config.console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_names(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .compact()
            .with_filter(make_filter(config.default_level))
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_filter(make_filter(config.default_level));

    let _ = Registry::default().with(console_layer).with(file_layer).try_init();
}

/// A new index over an anonymous pool of `size` bytes.
#[expect(clippy::expect_used)]
pub fn fresh_index(size: u64) -> Phast {
    let pool = DurablePool::anonymous(size).expect("anonymous pool");
    Phast::create(Arc::new(pool)).expect("create index")
}

/// A file-backed pool at `dir/name`.
#[expect(clippy::expect_used)]
pub fn file_pool(dir: &Path, name: &str, size: u64, flush: FlushMode) -> Arc<DurablePool> {
    let pool = DurablePool::open_or_create(&dir.join(name), size, flush).expect("file pool");
    Arc::new(pool)
}

/// Distinct, well-spread keys for distinct `i`, avoiding the reserved 0 and
/// `u64::MAX` for any `i` in `1..2^32`.
pub fn spread_key(i: u64) -> u64 {
    i.wrapping_mul(0x9E37_79B9_7F4A_7C15).clamp(1, u64::MAX - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_init() {
        init_tracing();
        tracing::info!("tracing initialized");
        tracing::debug!(key = 42, "debug event");
    }

    #[test]
    fn test_spread_key_avoids_reserved() {
        for i in 1..10_000 {
            let k = spread_key(i);
            assert!(k != 0 && k != u64::MAX);
        }
    }
}
