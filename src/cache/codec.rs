//! Record Codec
//!
//! Pure mapping between [`CacheEntry`] and the row layout of the
//! `cache_entries` table. Timestamps are persisted as Unix milliseconds.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Row;

use crate::cache::CacheEntry;
use crate::error::{CacheError, Result};

// == Encoded Row ==
/// A row ready to be bound to an insert statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRow {
    pub key: String,
    pub type_tag: Option<String>,
    pub payload: Vec<u8>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

// == Raw Row ==
/// A row as read back from the store, before validation.
///
/// Columns are kept as dynamically typed values so that damaged rows surface
/// as [`CacheError::CorruptRecord`] instead of a driver type error.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub key: Value,
    pub type_tag: Value,
    pub payload: Value,
    pub created_at: Value,
    pub expires_at: Value,
}

impl RawRow {
    /// Reads a row selected as `key, type_tag, payload, created_at, expires_at`.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            type_tag: row.get(1)?,
            payload: row.get(2)?,
            created_at: row.get(3)?,
            expires_at: row.get(4)?,
        })
    }
}

impl From<EncodedRow> for RawRow {
    fn from(row: EncodedRow) -> Self {
        Self {
            key: Value::Text(row.key),
            type_tag: row.type_tag.map_or(Value::Null, Value::Text),
            payload: Value::Blob(row.payload),
            created_at: Value::Integer(row.created_at),
            expires_at: row.expires_at.map_or(Value::Null, Value::Integer),
        }
    }
}

// == Encode ==
/// Encodes an entry into its persisted row form. Deterministic.
pub fn encode(entry: &CacheEntry) -> EncodedRow {
    EncodedRow {
        key: entry.key.clone(),
        type_tag: entry.type_tag.clone(),
        payload: entry.payload.clone(),
        created_at: entry.created_at.timestamp_millis(),
        expires_at: entry.expires_at.map(|t| t.timestamp_millis()),
    }
}

// == Decode ==
/// Decodes a stored row into an entry.
///
/// Fails with `CorruptRecord` if a required column is missing or mistyped,
/// or if a timestamp is out of range. Never returns a partial entry.
pub fn decode(row: RawRow) -> Result<CacheEntry> {
    let key = match row.key {
        Value::Text(key) if !key.is_empty() => key,
        other => return Err(corrupt("<unknown>", format!("invalid key column {:?}", other))),
    };

    let type_tag = match row.type_tag {
        Value::Null => None,
        Value::Text(tag) => Some(tag),
        other => return Err(corrupt(&key, format!("invalid type_tag column {:?}", other))),
    };

    let payload = match row.payload {
        Value::Blob(bytes) => bytes,
        other => return Err(corrupt(&key, format!("invalid payload column {:?}", other))),
    };

    let created_at = match row.created_at {
        Value::Integer(ms) => timestamp(&key, "created_at", ms)?,
        other => return Err(corrupt(&key, format!("invalid created_at column {:?}", other))),
    };

    let expires_at = match row.expires_at {
        Value::Null => None,
        Value::Integer(ms) => Some(timestamp(&key, "expires_at", ms)?),
        other => return Err(corrupt(&key, format!("invalid expires_at column {:?}", other))),
    };

    Ok(CacheEntry {
        key,
        payload,
        type_tag,
        created_at,
        expires_at,
    })
}

fn timestamp(key: &str, column: &str, ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| corrupt(key, format!("{} of {} ms is out of range", column, ms)))
}

fn corrupt(key: &str, detail: String) -> CacheError {
    CacheError::CorruptRecord(format!("{}: {}", key, detail))
}
