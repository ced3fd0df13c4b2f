//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with expiration support.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{CacheError, Result};

// == Liveness ==
/// Result of evaluating an entry's expiration against a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    Expired,
}

// == Cache Entry ==
/// Represents a single cache entry with payload and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Unique lookup key, never empty
    pub key: String,
    /// The stored bytes, may be empty
    pub payload: Vec<u8>,
    /// Opaque tag naming the payload's logical schema
    pub type_tag: Option<String>,
    /// Creation timestamp (millisecond precision)
    pub created_at: DateTime<Utc>,
    /// Expiration timestamp, None = never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new cache entry stamped with the current time.
    ///
    /// # Arguments
    /// * `key` - The lookup key (must be non-empty)
    /// * `payload` - The bytes to store
    /// * `type_tag` - Optional payload type tag
    /// * `ttl` - Optional time to live; `Some(Duration::ZERO)` expires immediately
    pub fn new(
        key: String,
        payload: Vec<u8>,
        type_tag: Option<String>,
        ttl: Option<Duration>,
    ) -> Result<Self> {
        Self::new_at(key, payload, type_tag, ttl, current_time())
    }

    /// Creates a new cache entry as if it were inserted at `now`.
    pub fn new_at(
        key: String,
        payload: Vec<u8>,
        type_tag: Option<String>,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        validate_key(&key)?;
        let expires_at = ttl.map(|ttl| expiry_after(now, ttl)).transpose()?;

        Ok(Self {
            key,
            payload,
            type_tag,
            created_at: now,
            expires_at,
        })
    }

    // == Expiration Check ==
    /// Evaluates the entry's expiration at `now`.
    ///
    /// An entry is expired once `now >= expires_at`; entries without an
    /// expiration are always live.
    pub fn expiration_check(&self, now: DateTime<Utc>) -> Liveness {
        match self.expires_at {
            Some(expires) if expires <= now => Liveness::Expired,
            _ => Liveness::Live,
        }
    }
}

// == Utility Functions ==
/// Returns the current UTC time truncated to millisecond precision.
///
/// Stored timestamps have millisecond resolution, so entries built from this
/// value survive an encode/decode cycle unchanged.
pub fn current_time() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Rejects keys the store cannot use as a primary key.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidRequest(
            "Key must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Computes `now + ttl`, rejecting lifetimes outside the representable range.
pub fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| CacheError::InvalidRequest(format!("TTL of {:?} is out of range", ttl)))
}
