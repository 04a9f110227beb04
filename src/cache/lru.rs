//! LRU Tracker Module
//!
//! Access-order bookkeeping used by LRU eviction.

use std::collections::{BTreeMap, HashMap};

use crate::cache::CacheKey;

// == LRU Tracker ==
/// Tracks access order for the eviction pass.
///
/// Every touch stamps the key with a strictly increasing tick; the smallest
/// tick is the least recently used key.
#[derive(Debug, Default)]
pub struct LruTracker {
    next_tick: u64,
    ticks: HashMap<CacheKey, u64>,
    order: BTreeMap<u64, CacheKey>,
}

impl LruTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // == Touch ==
    /// Marks a key as most recently used.
    pub fn touch(&mut self, key: &CacheKey) {
        if let Some(old) = self.ticks.remove(key) {
            self.order.remove(&old);
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.ticks.insert(key.clone(), tick);
        self.order.insert(tick, key.clone());
    }

    // == Remove ==
    pub fn remove(&mut self, key: &CacheKey) {
        if let Some(tick) = self.ticks.remove(key) {
            self.order.remove(&tick);
        }
    }

    // == Rename ==
    /// Moves a key's position to a new name, keeping its recency.
    pub fn rename(&mut self, from: &CacheKey, to: &CacheKey) {
        if let Some(tick) = self.ticks.remove(from) {
            self.order.insert(tick, to.clone());
            if let Some(stale) = self.ticks.insert(to.clone(), tick) {
                self.order.remove(&stale);
            }
        }
    }

    // == Oldest First ==
    /// Keys from least to most recently used.
    pub fn oldest_first(&self) -> impl Iterator<Item = &CacheKey> {
        self.order.values()
    }

    pub fn peek_oldest(&self) -> Option<&CacheKey> {
        self.order.values().next()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.ticks.contains_key(key)
    }
}
