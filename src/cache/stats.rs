//! Cache Statistics Module
//!
//! Tracks cache activity counters: hits, misses, writes, invalidations and purges.

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache activity since the cache was opened.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of reads that returned a live entry
    pub hits: u64,
    /// Number of reads that found nothing live (absent, invalidated or expired)
    pub misses: u64,
    /// Number of entries written
    pub writes: u64,
    /// Number of rows removed by invalidation
    pub invalidations: u64,
    /// Number of expired rows physically removed
    pub purged: u64,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Increments the hit counter.
    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    /// Increments the miss counter.
    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// Adds `count` written entries.
    pub fn record_writes(&mut self, count: usize) {
        self.writes += count as u64;
    }

    /// Adds `count` invalidated rows.
    pub fn record_invalidations(&mut self, count: usize) {
        self.invalidations += count as u64;
    }

    /// Adds `count` purged rows.
    pub fn record_purged(&mut self, count: usize) {
        self.purged += count as u64;
    }
}
