//! Expired Entry Purge
//!
//! Physical removal of expired rows, plus a background task that runs it
//! periodically until the cache is closed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{BlobCache, StorageGateway};
use crate::error::{CacheError, Result};
use crate::lifecycle::schema::DELETE_EXPIRED_SQL;

/// Deletes every row with `expires_at <= now` in one transaction.
///
/// Returns the number of rows removed.
pub async fn purge_expired(gateway: &StorageGateway, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = now.timestamp_millis();
    let removed = gateway
        .enqueue(move |tx| Ok(tx.execute(DELETE_EXPIRED_SQL, params![cutoff])?))
        .await?;

    debug!("Purged {} expired rows", removed);
    Ok(removed)
}

/// Purges expired rows, then compacts the store file.
///
/// `VACUUM` cannot run inside a transaction, so it goes through the raw
/// connection after the purge has committed.
pub async fn vacuum(gateway: &StorageGateway, now: DateTime<Utc>) -> Result<usize> {
    let removed = purge_expired(gateway, now).await?;
    gateway
        .with_connection(|connection| Ok(connection.execute_batch("VACUUM;")?))
        .await?;

    info!("Vacuumed store after purging {} expired rows", removed);
    Ok(removed)
}

/// Spawns a background task that periodically purges expired entries.
///
/// The task runs until the cache is closed, sleeping for the specified
/// interval between runs. Store errors are logged and retried on the next tick.
///
/// # Arguments
/// * `cache` - Shared reference to the cache
/// * `purge_interval_secs` - Interval in seconds between purge runs (minimum 1)
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during shutdown.
///
/// # Example
/// ```ignore
/// let cache = Arc::new(BlobCache::open(CacheConfig::with_path("blob.db")).await?);
/// let purge_handle = spawn_purge_task(cache.clone(), 60);
/// // Later, during shutdown:
/// purge_handle.abort();
/// ```
pub fn spawn_purge_task(cache: Arc<BlobCache>, purge_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(purge_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting purge task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            tokio::time::sleep(interval).await;

            match cache.purge_expired().await {
                Ok(0) => debug!("Purge: no expired entries found"),
                Ok(removed) => info!("Purge: removed {} expired entries", removed),
                Err(CacheError::CacheClosed) => {
                    info!("Cache closed, stopping purge task");
                    break;
                }
                Err(err) => warn!("Purge failed: {}", err),
            }
        }
    })
}
