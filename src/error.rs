//! Error types for the blob cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the blob cache.
///
/// Every public operation resolves to either a value or exactly one of these.
#[derive(Error, Debug)]
pub enum CacheError {
    /// No live entry exists for the key (absent, invalidated or expired)
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// A persisted row could not be decoded into an entry
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// The underlying store reported an error; the enclosing transaction was rolled back
    #[error("Store I/O error: {0}")]
    StoreIo(#[from] rusqlite::Error),

    /// The store on disk was written by an incompatible schema version
    #[error("Incompatible schema: store is version {found}, expected {expected}")]
    IncompatibleSchema { found: i64, expected: i64 },

    /// The cache has been closed
    #[error("Cache is closed")]
    CacheClosed,

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Returns true for read misses, which callers usually treat as a fallback case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::KeyNotFound(_))
    }
}

// == Result Type Alias ==
/// Convenience Result type for the blob cache.
pub type Result<T> = std::result::Result<T, CacheError>;
