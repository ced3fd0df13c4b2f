//! Blob Cache - A persistent key-value blob cache
//!
//! Stores arbitrary byte payloads under string keys in a single SQLite file,
//! with optional expiration, batched writes and serialized store access.

pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;

pub use cache::{BlobCache, CacheEntry, CacheStats};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use lifecycle::spawn_purge_task;
