//! Key Index Module
//!
//! Optional in-memory snapshot of the live key set. The store stays the
//! source of truth: a missing or outdated snapshot just means the next
//! `get_all_keys` falls back to a full scan.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

#[derive(Debug)]
struct KeySnapshot {
    /// Store write generation the scan observed
    generation: u64,
    keys: Arc<Vec<String>>,
    /// Earliest expiration among the snapshot's keys; the snapshot is stale from then on
    valid_until: Option<DateTime<Utc>>,
}

// == Key Index ==
/// Cached snapshot of live keys, tied to the store write generation it was
/// scanned at.
#[derive(Debug, Default)]
pub struct KeyIndex {
    snapshot: RwLock<Option<KeySnapshot>>,
}

impl KeyIndex {
    /// Creates an empty index with no snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the snapshot if it was scanned at `generation` and none of its
    /// keys has expired by `now`.
    pub async fn lookup(&self, now: DateTime<Utc>, generation: u64) -> Option<Arc<Vec<String>>> {
        let state = self.snapshot.read().await;
        let snapshot = state.as_ref()?;
        if snapshot.generation != generation {
            return None;
        }
        match snapshot.valid_until {
            Some(until) if until <= now => None,
            _ => Some(snapshot.keys.clone()),
        }
    }

    /// Stores a scan result taken at `generation`.
    ///
    /// A snapshot from an older generation than the one held is ignored.
    /// Returns whether the snapshot was kept.
    pub async fn install(
        &self,
        generation: u64,
        keys: Arc<Vec<String>>,
        valid_until: Option<DateTime<Utc>>,
    ) -> bool {
        let mut state = self.snapshot.write().await;
        if matches!(state.as_ref(), Some(held) if held.generation > generation) {
            return false;
        }
        *state = Some(KeySnapshot {
            generation,
            keys,
            valid_until,
        });
        true
    }

    /// Drops the snapshot.
    pub async fn clear(&self) {
        *self.snapshot.write().await = None;
    }

    /// Returns true if a snapshot is currently held.
    pub async fn has_snapshot(&self) -> bool {
        self.snapshot.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::current_time;

    fn keys(list: &[&str]) -> Arc<Vec<String>> {
        Arc::new(list.iter().map(|k| k.to_string()).collect())
    }

    #[tokio::test]
    async fn test_empty_index_has_no_snapshot() {
        let index = KeyIndex::new();
        assert!(index.lookup(current_time(), 0).await.is_none());
        assert!(!index.has_snapshot().await);
    }

    #[tokio::test]
    async fn test_install_and_lookup() {
        let index = KeyIndex::new();

        assert!(index.install(3, keys(&["a", "b"]), None).await);

        let snapshot = index.lookup(current_time(), 3).await.unwrap();
        assert_eq!(*snapshot, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_ignored_once_generation_moves() {
        let index = KeyIndex::new();
        index.install(3, keys(&["a"]), None).await;

        // A write advanced the store; nobody told the index
        assert!(index.lookup(current_time(), 4).await.is_none());
        assert!(index.has_snapshot().await);
    }

    #[tokio::test]
    async fn test_older_scan_does_not_replace_newer_snapshot() {
        let index = KeyIndex::new();
        index.install(5, keys(&["a", "b"]), None).await;

        assert!(!index.install(4, keys(&["a"]), None).await);

        let snapshot = index.lookup(current_time(), 5).await.unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_drops_snapshot() {
        let index = KeyIndex::new();
        index.install(0, keys(&["a"]), None).await;

        index.clear().await;

        assert!(!index.has_snapshot().await);
    }

    #[tokio::test]
    async fn test_snapshot_goes_stale_at_first_expiry() {
        let index = KeyIndex::new();
        let now = current_time();
        let until = now + chrono::Duration::seconds(1);
        index.install(0, keys(&["a"]), Some(until)).await;

        assert!(index.lookup(now, 0).await.is_some());
        assert!(index.lookup(until, 0).await.is_none());
    }
}
