//! Cache Memory Manager
//!
//! Statistics, TTL cleanup and LRU eviction over a shared [`CacheStore`].

use std::time::Duration;

use tracing::debug;

use crate::cache::{current_timestamp_ms, CacheKey, CacheStats, CacheStore};

// == Cache Memory Manager ==
#[derive(Debug, Clone)]
pub struct CacheMemoryManager {
    store: CacheStore,
}

impl CacheMemoryManager {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    // == Stats ==
    /// Counts by status, estimated footprint and access counters.
    pub fn get_cache_stats(&self) -> CacheStats {
        self.store.with_inner(|inner| {
            let mut stats = CacheStats {
                hits: inner.stats.hits,
                misses: inner.stats.misses,
                evictions: inner.stats.evictions,
                expirations: inner.stats.expirations,
                ..CacheStats::default()
            };
            for entry in inner.entries.values() {
                stats.count_entry(entry.status, entry.estimated_size());
            }
            stats
        })
    }

    // == Cleanup Stale Entries ==
    /// Removes entries older than `ttl` that nobody is subscribed to.
    ///
    /// Entries holding unconfirmed writes are never removed.
    pub fn cleanup_stale_entries(&self, ttl: Duration) -> Vec<CacheKey> {
        self.cleanup_stale_entries_at(current_timestamp_ms(), ttl)
    }

    /// [`Self::cleanup_stale_entries`] evaluated at an explicit clock reading.
    pub fn cleanup_stale_entries_at(&self, now_ms: u64, ttl: Duration) -> Vec<CacheKey> {
        let ttl_ms = ttl.as_millis() as u64;
        let removed = self.store.with_inner(|inner| {
            let expired: Vec<CacheKey> = inner
                .entries
                .values()
                .filter(|entry| {
                    entry.age_ms(now_ms) > ttl_ms
                        && !entry.is_pending()
                        && inner.subscriber_count(&entry.key) == 0
                })
                .map(|entry| entry.key.clone())
                .collect();
            for key in &expired {
                inner.remove_entry(key);
            }
            inner.stats.record_expirations(expired.len());
            expired
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "removed expired cache entries");
        }
        removed
    }

    // == LRU Eviction ==
    /// Trims the store to `max_entries`, least recently accessed first.
    ///
    /// Subscribed entries and entries with in-flight mutations are skipped,
    /// so the bound holds only when enough unprotected entries exist.
    pub fn implement_lru_eviction(&self, max_entries: usize) -> Vec<CacheKey> {
        let evicted = self.store.with_inner(|inner| {
            let excess = inner.entries.len().saturating_sub(max_entries);
            if excess == 0 {
                return Vec::new();
            }
            let victims: Vec<CacheKey> = inner
                .lru
                .oldest_first()
                .filter(|key| {
                    inner
                        .entries
                        .get(*key)
                        .is_some_and(|entry| !entry.is_pending())
                        && inner.subscriber_count(key) == 0
                })
                .take(excess)
                .cloned()
                .collect();
            for key in &victims {
                inner.remove_entry(key);
            }
            inner.stats.record_evictions(victims.len());
            victims
        });
        if !evicted.is_empty() {
            debug!(count = evicted.len(), max_entries, "evicted least recently used entries");
        }
        evicted
    }

    pub fn cache_size(&self) -> usize {
        self.store.len()
    }
}
