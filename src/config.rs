//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::path::PathBuf;

/// Default number of entries committed per bulk insert transaction.
pub const DEFAULT_INSERT_CHUNK_SIZE: usize = 4096;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Path of the store file, created on first open
    pub path: PathBuf,
    /// Maximum number of entries written in one bulk insert transaction
    pub insert_chunk_size: usize,
    /// Background purge task interval in seconds
    pub purge_interval: u64,
    /// How long the store waits on a locked database before failing, in milliseconds
    pub busy_timeout_ms: u64,
}

impl CacheConfig {
    /// Creates a config for the given store path with every other value defaulted.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_PATH` - Store file path (default: blob.db)
    /// - `INSERT_CHUNK_SIZE` - Entries per bulk insert transaction (default: 4096)
    /// - `PURGE_INTERVAL` - Purge frequency in seconds (default: 60)
    /// - `BUSY_TIMEOUT_MS` - Store busy timeout in milliseconds (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            path: env::var("CACHE_PATH")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.path),
            insert_chunk_size: env::var("INSERT_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.insert_chunk_size),
            purge_interval: env::var("PURGE_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.purge_interval),
            busy_timeout_ms: env::var("BUSY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.busy_timeout_ms),
        }
    }

    /// Chunk size actually used by bulk inserts; never zero.
    pub fn effective_chunk_size(&self) -> usize {
        self.insert_chunk_size.max(1)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("blob.db"),
            insert_chunk_size: DEFAULT_INSERT_CHUNK_SIZE,
            purge_interval: 60,
            busy_timeout_ms: 5000,
        }
    }
}
