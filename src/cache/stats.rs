//! Cache Statistics Module
//!
//! Access counters kept by the store plus the per-status snapshot reported by
//! the memory manager.

use serde::Serialize;

use crate::cache::EntryStatus;

// == Cache Stats ==
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads that found an entry
    pub hits: u64,
    /// Reads that found nothing
    pub misses: u64,
    /// Entries removed by the LRU pass
    pub evictions: u64,
    /// Entries removed by the TTL pass
    pub expirations: u64,
    pub total_entries: usize,
    pub fresh: usize,
    pub stale: usize,
    pub pending: usize,
    pub error: usize,
    /// Sum of serialized entry sizes
    pub memory_bytes: usize,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// hits / (hits + misses), or 0.0 before any read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    pub fn record_expirations(&mut self, count: usize) {
        self.expirations += count as u64;
    }

    /// Adds one entry to the per-status counts.
    pub fn count_entry(&mut self, status: EntryStatus, size: usize) {
        self.total_entries += 1;
        self.memory_bytes += size;
        match status {
            EntryStatus::Fresh => self.fresh += 1,
            EntryStatus::Stale => self.stale += 1,
            EntryStatus::Pending => self.pending += 1,
            EntryStatus::Error => self.error += 1,
        }
    }
}
