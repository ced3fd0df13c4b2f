//! Store Schema
//!
//! Creates the schema on first open and refuses stores written by another
//! schema version. Also home to the SQL the rest of the crate runs.

use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{debug, info};

use crate::cache::StorageGateway;
use crate::error::{CacheError, Result};

/// Schema version written to `cache_meta` by this build.
pub const SCHEMA_VERSION: i64 = 1;

pub(crate) const UPSERT_ENTRY_SQL: &str = "INSERT OR REPLACE INTO cache_entries \
     (key, type_tag, payload, created_at, expires_at) VALUES (?1, ?2, ?3, ?4, ?5)";

pub(crate) const DELETE_ENTRY_SQL: &str = "DELETE FROM cache_entries WHERE key = ?1";

pub(crate) const SELECT_ENTRY_SQL: &str = "SELECT key, type_tag, payload, created_at, expires_at \
     FROM cache_entries WHERE key = ?1";

pub(crate) const SELECT_LIVE_KEYS_SQL: &str = "SELECT key, expires_at FROM cache_entries \
     WHERE expires_at IS NULL OR expires_at > ?1 ORDER BY key";

pub(crate) const SELECT_LIVE_KEYS_OF_TYPE_SQL: &str = "SELECT key FROM cache_entries \
     WHERE type_tag = ?1 AND (expires_at IS NULL OR expires_at > ?2) ORDER BY key";

pub(crate) const COUNT_LIVE_SQL: &str =
    "SELECT COUNT(*) FROM cache_entries WHERE expires_at IS NULL OR expires_at > ?1";

pub(crate) const DELETE_ALL_SQL: &str = "DELETE FROM cache_entries";

pub(crate) const DELETE_TYPE_SQL: &str = "DELETE FROM cache_entries WHERE type_tag = ?1";

pub(crate) const DELETE_EXPIRED_SQL: &str =
    "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1";

// == Schema State ==
/// What `ensure_schema` found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    /// The store was empty and the schema was created
    Created,
    /// The store already carried the current schema version
    Existing,
}

// == Ensure Schema ==
/// Creates the schema if absent, or validates the stored version.
///
/// Fails with `IncompatibleSchema` when the store was written by another
/// schema version, or holds a `cache_entries` table with no version row
/// (reported as version 0); nothing is migrated.
pub async fn ensure_schema(gateway: &StorageGateway) -> Result<SchemaState> {
    let state = gateway
        .enqueue(|tx| {
            tx.execute_batch("CREATE TABLE IF NOT EXISTS cache_meta (version INTEGER NOT NULL);")?;
            let version: Option<i64> = tx
                .query_row("SELECT version FROM cache_meta LIMIT 1", [], |row| row.get(0))
                .optional()?;

            match version {
                None if has_table(tx, "cache_entries")? => {
                    // Entries without a version row were not written by this engine
                    Err(CacheError::IncompatibleSchema {
                        found: 0,
                        expected: SCHEMA_VERSION,
                    })
                }
                None => {
                    tx.execute(
                        "INSERT INTO cache_meta (version) VALUES (?1)",
                        params![SCHEMA_VERSION],
                    )?;
                    tx.execute_batch(
                        "CREATE TABLE IF NOT EXISTS cache_entries (
                            key TEXT PRIMARY KEY NOT NULL,
                            type_tag TEXT,
                            payload BLOB NOT NULL,
                            created_at INTEGER NOT NULL,
                            expires_at INTEGER
                        );
                        CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at
                            ON cache_entries (expires_at);
                        CREATE INDEX IF NOT EXISTS idx_cache_entries_type_tag
                            ON cache_entries (type_tag);",
                    )?;
                    Ok(SchemaState::Created)
                }
                Some(found) if found == SCHEMA_VERSION => Ok(SchemaState::Existing),
                Some(found) => Err(CacheError::IncompatibleSchema {
                    found,
                    expected: SCHEMA_VERSION,
                }),
            }
        })
        .await?;

    match state {
        SchemaState::Created => info!("Created cache schema version {}", SCHEMA_VERSION),
        SchemaState::Existing => debug!("Found cache schema version {}", SCHEMA_VERSION),
    }
    Ok(state)
}

fn has_table(tx: &Transaction<'_>, name: &str) -> Result<bool> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn open(path: &std::path::Path) -> StorageGateway {
        StorageGateway::open(path, Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_schema_created_then_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema.db");

        let gateway = open(&path);
        assert_eq!(ensure_schema(&gateway).await.unwrap(), SchemaState::Created);
        assert_eq!(ensure_schema(&gateway).await.unwrap(), SchemaState::Existing);
        gateway.drain_and_close().await.unwrap();

        let reopened = open(&path);
        assert_eq!(ensure_schema(&reopened).await.unwrap(), SchemaState::Existing);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema.db");

        let gateway = open(&path);
        ensure_schema(&gateway).await.unwrap();
        gateway
            .enqueue(|tx| Ok(tx.execute("UPDATE cache_meta SET version = 99", [])?))
            .await
            .unwrap();

        let result = ensure_schema(&gateway).await;
        assert!(matches!(
            result,
            Err(CacheError::IncompatibleSchema {
                found: 99,
                expected: SCHEMA_VERSION
            })
        ));
    }

    #[tokio::test]
    async fn test_unversioned_entries_table_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema.db");

        let gateway = open(&path);
        gateway
            .enqueue(|tx| {
                tx.execute_batch("CREATE TABLE cache_entries (id INTEGER PRIMARY KEY, blob BLOB)")?;
                Ok(())
            })
            .await
            .unwrap();

        let result = ensure_schema(&gateway).await;
        assert!(matches!(
            result,
            Err(CacheError::IncompatibleSchema {
                found: 0,
                expected: SCHEMA_VERSION
            })
        ));

        // Nothing was written, so the refusal repeats
        let written: i64 = gateway
            .enqueue(|tx| {
                Ok(tx.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = 'cache_meta'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(ensure_schema(&gateway).await.is_err());
    }
}
