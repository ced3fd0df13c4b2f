//! Cache Store Module
//!
//! Main cache engine: the public blob cache surface, implemented on top of
//! the storage gateway and record codec.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::codec::{self, EncodedRow, RawRow};
use crate::cache::entry::current_time;
use crate::cache::{CacheEntry, CacheStats, KeyIndex, Liveness, StorageGateway, WriteOp};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::lifecycle::schema::{
    COUNT_LIVE_SQL, SELECT_ENTRY_SQL, SELECT_LIVE_KEYS_OF_TYPE_SQL, SELECT_LIVE_KEYS_SQL,
};
use crate::lifecycle::{self, ensure_schema};

// == Blob Cache ==
/// Persistent key-value blob cache backed by a single SQLite file.
///
/// All operations are async and may be called concurrently through an
/// `Arc<BlobCache>`; the gateway serializes them against the store in
/// submission order.
#[derive(Debug)]
pub struct BlobCache {
    gateway: StorageGateway,
    /// Snapshot of live keys, never the source of truth
    index: KeyIndex,
    stats: Mutex<CacheStats>,
    config: CacheConfig,
}

impl BlobCache {
    // == Open ==
    /// Opens the store at `config.path`, creating it and its schema if absent.
    ///
    /// Fails with `IncompatibleSchema` if the file was written by another
    /// schema version.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        let gateway = StorageGateway::open(
            &config.path,
            Duration::from_millis(config.busy_timeout_ms),
        )?;

        if let Err(err) = ensure_schema(&gateway).await {
            // Release the handle before refusing the store
            let _ = gateway.drain_and_close().await;
            return Err(err);
        }

        info!(
            "Blob cache ready at {} (insert chunk size {})",
            config.path.display(),
            config.effective_chunk_size()
        );

        Ok(Self {
            gateway,
            index: KeyIndex::new(),
            stats: Mutex::new(CacheStats::new()),
            config,
        })
    }

    /// Returns the configuration the cache was opened with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn gateway(&self) -> &StorageGateway {
        &self.gateway
    }

    // == Get ==
    /// Retrieves the payload stored under `key`.
    ///
    /// Fails with `KeyNotFound` if no live entry exists. Expired entries that
    /// have not been purged yet count as absent.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.get_entry(key).await.map(|entry| entry.payload)
    }

    /// Retrieves the full live entry stored under `key`.
    pub async fn get_entry(&self, key: &str) -> Result<CacheEntry> {
        let lookup = key.to_string();
        let raw = self
            .gateway
            .enqueue(move |tx| {
                Ok(tx
                    .prepare_cached(SELECT_ENTRY_SQL)?
                    .query_row(params![lookup], RawRow::from_row)
                    .optional()?)
            })
            .await?;

        let entry = raw.map(codec::decode).transpose()?;
        let now = current_time();

        let mut stats = self.stats.lock().await;
        match entry {
            Some(entry) if entry.expiration_check(now) == Liveness::Live => {
                stats.record_hit();
                Ok(entry)
            }
            _ => {
                stats.record_miss();
                Err(CacheError::KeyNotFound(key.to_string()))
            }
        }
    }

    /// Returns when the live entry under `key` was created, or None if there is none.
    pub async fn get_created_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match self.get_entry(key).await {
            Ok(entry) => Ok(Some(entry.created_at)),
            Err(CacheError::KeyNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    // == Insert ==
    /// Stores `payload` under `key`, replacing any previous entry.
    ///
    /// # Arguments
    /// * `key` - Non-empty key
    /// * `payload` - Bytes to store, may be empty
    /// * `ttl` - Optional lifetime; None means the entry never expires
    pub async fn insert(
        &self,
        key: impl Into<String>,
        payload: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.insert_entry(key, payload, None, ttl).await
    }

    /// Stores `payload` under `key` with a type tag.
    pub async fn insert_entry(
        &self,
        key: impl Into<String>,
        payload: Vec<u8>,
        type_tag: Option<String>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let entry = CacheEntry::new(key.into(), payload, type_tag, ttl)?;
        let op = WriteOp::Upsert(codec::encode(&entry));

        self.gateway.run_batch(vec![op]).await?;
        self.stats.lock().await.record_writes(1);
        Ok(())
    }

    /// Stores many entries without expiration.
    ///
    /// See [`insert_many_with_ttl`](Self::insert_many_with_ttl).
    pub async fn insert_many<I, K>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        self.insert_many_with_ttl(items, None).await
    }

    /// Stores many entries sharing one optional lifetime.
    ///
    /// Duplicate keys collapse to the last value given for them. Entries are
    /// written in transactions of at most `insert_chunk_size` rows; each chunk
    /// commits on its own, so an error on a later chunk leaves earlier chunks
    /// in place. Every key is validated before anything is written.
    pub async fn insert_many_with_ttl<I, K>(&self, items: I, ttl: Option<Duration>) -> Result<()>
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        self.ensure_open().await?;

        let now = current_time();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut rows: Vec<EncodedRow> = Vec::new();
        for (key, payload) in items {
            let entry = CacheEntry::new_at(key.into(), payload, None, ttl, now)?;
            let row = codec::encode(&entry);
            match positions.get(&row.key) {
                Some(&position) => rows[position] = row,
                None => {
                    positions.insert(row.key.clone(), rows.len());
                    rows.push(row);
                }
            }
        }

        let total = rows.len();
        let chunk_size = self.config.effective_chunk_size();
        let mut rows = rows.into_iter().peekable();
        let mut written = 0;

        while rows.peek().is_some() {
            let chunk: Vec<WriteOp> = rows.by_ref().take(chunk_size).map(WriteOp::Upsert).collect();
            let len = chunk.len();

            self.gateway.run_batch(chunk).await?;
            self.stats.lock().await.record_writes(len);

            written += len;
            debug!("Bulk insert progress: {}/{} entries", written, total);
        }

        Ok(())
    }

    // == Get All Keys ==
    /// Returns every live key, ordered by key.
    ///
    /// Served from the key snapshot when it is still valid, otherwise from a
    /// full scan of the store.
    pub async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.ensure_open().await?;

        let now = current_time();
        let current = self.gateway.write_generation();
        if let Some(keys) = self.index.lookup(now, current).await {
            return Ok(keys.as_ref().clone());
        }

        let cutoff = now.timestamp_millis();
        let ((keys, earliest_expiry), generation) = self
            .gateway
            .enqueue_observed(move |tx| {
                let mut statement = tx.prepare_cached(SELECT_LIVE_KEYS_SQL)?;
                let mut rows = statement.query(params![cutoff])?;
                let mut keys = Vec::new();
                let mut earliest: Option<i64> = None;
                while let Some(row) = rows.next()? {
                    keys.push(text_column(row.get(0)?)?);
                    if let Value::Integer(expires) = row.get::<_, Value>(1)? {
                        earliest = Some(earliest.map_or(expires, |e| e.min(expires)));
                    }
                }
                Ok((keys, earliest))
            })
            .await?;

        let valid_until = earliest_expiry.and_then(DateTime::from_timestamp_millis);
        let keys = Arc::new(keys);
        self.index.install(generation, keys.clone(), valid_until).await;

        debug!("Scanned {} live keys", keys.len());
        Ok(keys.as_ref().clone())
    }

    /// Returns every live key carrying `type_tag`, ordered by key.
    pub async fn keys_of_type(&self, type_tag: &str) -> Result<Vec<String>> {
        let tag = type_tag.to_string();
        let cutoff = current_time().timestamp_millis();
        self.gateway
            .enqueue(move |tx| {
                let mut statement = tx.prepare_cached(SELECT_LIVE_KEYS_OF_TYPE_SQL)?;
                let mut rows = statement.query(params![tag, cutoff])?;
                let mut keys = Vec::new();
                while let Some(row) = rows.next()? {
                    keys.push(text_column(row.get(0)?)?);
                }
                Ok(keys)
            })
            .await
    }

    /// Returns the number of live entries.
    pub async fn entry_count(&self) -> Result<usize> {
        let cutoff = current_time().timestamp_millis();
        let count: i64 = self
            .gateway
            .enqueue(move |tx| Ok(tx.query_row(COUNT_LIVE_SQL, params![cutoff], |row| row.get(0))?))
            .await?;
        Ok(count as usize)
    }

    // == Invalidate ==
    /// Removes the entry under `key`. Absent keys are not an error.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        let op = WriteOp::Delete(key.to_string());
        let removed = self.gateway.run_batch(vec![op]).await?;
        self.stats.lock().await.record_invalidations(removed);
        Ok(())
    }

    /// Removes every entry in one transaction.
    pub async fn invalidate_all(&self) -> Result<()> {
        let removed = self.gateway.run_batch(vec![WriteOp::DeleteAll]).await?;
        self.stats.lock().await.record_invalidations(removed);

        info!("Invalidated all {} entries", removed);
        Ok(())
    }

    /// Removes every entry tagged `type_tag` in one transaction.
    pub async fn invalidate_type(&self, type_tag: &str) -> Result<()> {
        let op = WriteOp::DeleteType(type_tag.to_string());
        let removed = self.gateway.run_batch(vec![op]).await?;
        self.stats.lock().await.record_invalidations(removed);
        Ok(())
    }

    // == Flush ==
    /// Waits for every earlier operation to commit, then checkpoints the
    /// write-ahead log into the main store file.
    pub async fn flush(&self) -> Result<()> {
        self.gateway
            .with_connection(|connection| {
                connection.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
                Ok(())
            })
            .await?;
        debug!("Flushed store");
        Ok(())
    }

    // == Maintenance ==
    /// Deletes every expired row now. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let removed = lifecycle::purge_expired(&self.gateway, current_time()).await?;
        self.stats.lock().await.record_purged(removed);
        Ok(removed)
    }

    /// Purges expired rows and compacts the store file.
    pub async fn vacuum(&self) -> Result<()> {
        let removed = lifecycle::vacuum(&self.gateway, current_time()).await?;
        self.stats.lock().await.record_purged(removed);
        Ok(())
    }

    /// Returns a copy of the activity counters.
    pub async fn stats(&self) -> CacheStats {
        self.stats.lock().await.clone()
    }

    // == Close ==
    /// Drains pending work and releases the store.
    ///
    /// Every later operation, including a second `close`, fails with `CacheClosed`.
    pub async fn close(&self) -> Result<()> {
        self.gateway.drain_and_close().await?;
        self.index.clear().await;
        Ok(())
    }

    /// Returns true once `close` has been called.
    pub async fn is_closed(&self) -> bool {
        self.gateway.is_closed().await
    }

    async fn ensure_open(&self) -> Result<()> {
        if self.gateway.is_closed().await {
            return Err(CacheError::CacheClosed);
        }
        Ok(())
    }
}

fn text_column(value: Value) -> Result<String> {
    match value {
        Value::Text(text) => Ok(text),
        other => Err(CacheError::CorruptRecord(format!(
            "invalid key column {:?}",
            other
        ))),
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    async fn open_cache() -> (TempDir, BlobCache) {
        let dir = tempdir().unwrap();
        let cache = BlobCache::open(CacheConfig::with_path(dir.path().join("blob.db")))
            .await
            .unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (_dir, cache) = open_cache().await;

        let result = cache.get("nonexistent").await;
        assert!(matches!(result, Err(CacheError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_dir, cache) = open_cache().await;

        cache.insert("key1", b"value1".to_vec(), None).await.unwrap();

        assert_eq!(cache.get("key1").await.unwrap(), b"value1");
        assert_eq!(cache.entry_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_payload_round_trips() {
        let (_dir, cache) = open_cache().await;

        cache.insert("empty", Vec::new(), None).await.unwrap();

        assert!(cache.get("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let (_dir, cache) = open_cache().await;

        let result = cache.insert("", b"v".to_vec(), None).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (_dir, cache) = open_cache().await;

        cache.insert("key1", b"value1".to_vec(), None).await.unwrap();
        cache.insert("key1", b"value2".to_vec(), None).await.unwrap();

        assert_eq!(cache.get("key1").await.unwrap(), b"value2");
        assert_eq!(cache.get_all_keys().await.unwrap(), vec!["key1".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_unreadable_before_purge() {
        let (_dir, cache) = open_cache().await;

        cache.insert("short", b"v".to_vec(), Some(Duration::ZERO)).await.unwrap();

        assert!(matches!(cache.get("short").await, Err(CacheError::KeyNotFound(_))));
        assert!(cache.get_all_keys().await.unwrap().is_empty());
        // Still physically present until purged
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let (_dir, cache) = open_cache().await;

        cache
            .insert("key1", b"v".to_vec(), Some(Duration::from_millis(300)))
            .await
            .unwrap();
        assert!(cache.get("key1").await.is_ok());
        assert_eq!(cache.get_all_keys().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(matches!(cache.get("key1").await, Err(CacheError::KeyNotFound(_))));
        // The snapshot taken before expiry must not be served
        assert!(cache.get_all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let (_dir, cache) = open_cache().await;

        cache.insert("key1", b"v".to_vec(), None).await.unwrap();

        cache.invalidate("key1").await.unwrap();
        assert!(matches!(cache.get("key1").await, Err(CacheError::KeyNotFound(_))));
        cache.invalidate("key1").await.unwrap();
        assert!(matches!(cache.get("key1").await, Err(CacheError::KeyNotFound(_))));

        assert_eq!(cache.stats().await.invalidations, 1);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let (_dir, cache) = open_cache().await;

        cache
            .insert_many(vec![("a", b"1".to_vec()), ("b", b"2".to_vec())])
            .await
            .unwrap();
        assert_eq!(cache.get_all_keys().await.unwrap().len(), 2);

        cache.invalidate_all().await.unwrap();

        assert!(cache.get_all_keys().await.unwrap().is_empty());
        assert!(cache.get("a").await.is_err());
        assert!(cache.get("b").await.is_err());
    }

    #[tokio::test]
    async fn test_insert_many_collapses_duplicates() {
        let (_dir, cache) = open_cache().await;

        cache
            .insert_many(vec![
                ("dup", b"first".to_vec()),
                ("other", b"x".to_vec()),
                ("dup", b"last".to_vec()),
            ])
            .await
            .unwrap();

        assert_eq!(cache.get("dup").await.unwrap(), b"last");
        assert_eq!(cache.get_all_keys().await.unwrap(), vec!["dup", "other"]);
        assert_eq!(cache.stats().await.writes, 2);
    }

    #[tokio::test]
    async fn test_insert_many_chunks() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            insert_chunk_size: 3,
            ..CacheConfig::with_path(dir.path().join("blob.db"))
        };
        let cache = BlobCache::open(config).await.unwrap();
        assert_eq!(cache.config().effective_chunk_size(), 3);

        let items: Vec<(String, Vec<u8>)> =
            (0..10).map(|i| (format!("key{:02}", i), vec![i as u8])).collect();
        cache.insert_many(items).await.unwrap();

        let keys = cache.get_all_keys().await.unwrap();
        assert_eq!(keys.len(), 10);
        assert_eq!(cache.get("key07").await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_insert_many_rejects_empty_key_before_writing() {
        let (_dir, cache) = open_cache().await;

        let result = cache
            .insert_many(vec![("good", b"1".to_vec()), ("", b"2".to_vec())])
            .await;

        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
        assert!(cache.get_all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_all_keys_snapshot_refreshes_after_write() {
        let (_dir, cache) = open_cache().await;

        cache.insert("b", b"2".to_vec(), None).await.unwrap();
        assert_eq!(cache.get_all_keys().await.unwrap(), vec!["b"]);
        assert!(cache.index.has_snapshot().await);

        cache.insert("a", b"1".to_vec(), None).await.unwrap();
        let generation = cache.gateway.write_generation();
        assert!(cache.index.lookup(current_time(), generation).await.is_none());
        assert_eq!(cache.get_all_keys().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_abandoned_insert_still_refreshes_key_listing() {
        let (_dir, cache) = open_cache().await;
        cache.insert("b", b"2".to_vec(), None).await.unwrap();

        // The scan is queued first; the insert behind it is dropped after one poll
        let (listed, abandoned) = tokio::join!(
            cache.get_all_keys(),
            tokio::time::timeout(Duration::ZERO, cache.insert("a", b"1".to_vec(), None)),
        );
        assert_eq!(listed.unwrap(), vec!["b"]);
        assert!(abandoned.is_err());

        assert_eq!(cache.get_all_keys().await.unwrap(), vec!["a", "b"]);
        assert_eq!(cache.get("a").await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_bulk_insert_failure_keeps_earlier_chunks() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            insert_chunk_size: 2,
            ..CacheConfig::with_path(dir.path().join("blob.db"))
        };
        let cache = BlobCache::open(config).await.unwrap();
        cache
            .gateway()
            .enqueue(|tx| {
                tx.execute_batch(
                    "CREATE TRIGGER reject_d BEFORE INSERT ON cache_entries
                     WHEN NEW.key = 'd' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let items = ["a", "b", "c", "d"].map(|key| (key, key.as_bytes().to_vec()));
        let result = cache.insert_many(items).await;

        assert!(matches!(result, Err(CacheError::StoreIo(_))));
        // [a, b] committed on its own; [c, d] rolled back as a unit
        assert_eq!(cache.get_all_keys().await.unwrap(), vec!["a", "b"]);
        assert!(cache.get("c").await.unwrap_err().is_not_found());
        assert_eq!(cache.stats().await.writes, 2);
    }

    #[tokio::test]
    async fn test_type_tags() {
        let (_dir, cache) = open_cache().await;

        cache
            .insert_entry("w1", b"1".to_vec(), Some("Widget".to_string()), None)
            .await
            .unwrap();
        cache
            .insert_entry("w2", b"2".to_vec(), Some("Widget".to_string()), None)
            .await
            .unwrap();
        cache
            .insert_entry("g1", b"3".to_vec(), Some("Gadget".to_string()), None)
            .await
            .unwrap();

        assert_eq!(cache.keys_of_type("Widget").await.unwrap(), vec!["w1", "w2"]);
        assert_eq!(
            cache.get_entry("g1").await.unwrap().type_tag.as_deref(),
            Some("Gadget")
        );

        cache.invalidate_type("Widget").await.unwrap();
        assert_eq!(cache.get_all_keys().await.unwrap(), vec!["g1"]);
    }

    #[tokio::test]
    async fn test_get_created_at() {
        let (_dir, cache) = open_cache().await;
        let before = current_time();

        cache.insert("key1", b"v".to_vec(), None).await.unwrap();

        let created = cache.get_created_at("key1").await.unwrap().unwrap();
        assert!(created >= before);
        assert!(cache.get_created_at("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_row_is_surfaced() {
        let (_dir, cache) = open_cache().await;

        cache
            .gateway()
            .enqueue(|tx| {
                Ok(tx.execute(
                    "INSERT INTO cache_entries (key, payload, created_at) VALUES ('bad', x'00', 'soon')",
                    [],
                )?)
            })
            .await
            .unwrap();

        assert!(matches!(cache.get("bad").await, Err(CacheError::CorruptRecord(_))));
    }

    #[tokio::test]
    async fn test_stats() {
        let (_dir, cache) = open_cache().await;

        cache.insert("key1", b"v".to_vec(), None).await.unwrap();
        cache.get("key1").await.unwrap(); // hit
        let _ = cache.get("nonexistent").await; // miss

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn test_flush_and_vacuum() {
        let (_dir, cache) = open_cache().await;

        cache.insert("key1", b"v".to_vec(), None).await.unwrap();
        cache.insert("gone", b"v".to_vec(), Some(Duration::ZERO)).await.unwrap();

        cache.flush().await.unwrap();
        cache.vacuum().await.unwrap();

        assert_eq!(cache.stats().await.purged, 1);
        assert_eq!(cache.get("key1").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let (_dir, cache) = open_cache().await;

        cache.insert("key1", b"v".to_vec(), None).await.unwrap();
        cache.get_all_keys().await.unwrap();
        cache.close().await.unwrap();

        assert!(cache.is_closed().await);
        assert!(matches!(cache.get("key1").await, Err(CacheError::CacheClosed)));
        assert!(matches!(cache.get_all_keys().await, Err(CacheError::CacheClosed)));
        assert!(matches!(
            cache.insert_many(Vec::<(String, Vec<u8>)>::new()).await,
            Err(CacheError::CacheClosed)
        ));
        assert!(matches!(cache.flush().await, Err(CacheError::CacheClosed)));
        assert!(matches!(cache.close().await, Err(CacheError::CacheClosed)));
    }
}
