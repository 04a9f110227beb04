//! Cache Store Module
//!
//! The single shared, versioned entity cache. Every component writes through
//! these methods, which are the only place version conflicts are arbitrated.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::cache::{
    current_timestamp_ms, shallow_merge, CacheEntry, CacheKey, CacheStats, EntryStatus,
    LruTracker,
};
use crate::error::{Result, SyncError};

/// Observer invoked after a key changes.
pub type Callback = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

// == Cache Event ==
/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
    pub key: CacheKey,
    /// New state, or `None` when the entry was removed
    pub entry: Option<CacheEntry>,
}

// == Set Outcome ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Value and version replaced
    Applied,
    /// Same version on a stale entry; freshness renewed, value untouched
    Refreshed,
    /// Version not newer than the applied one
    Rejected { current: u64 },
}

impl SetOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, SetOutcome::Applied)
    }
}

// == Store Internals ==
#[derive(Default)]
pub(crate) struct StoreInner {
    pub(crate) entries: HashMap<CacheKey, CacheEntry>,
    pub(crate) lru: LruTracker,
    pub(crate) stats: CacheStats,
    subscribers: HashMap<CacheKey, Vec<(u64, Callback)>>,
    subscription_keys: HashMap<u64, CacheKey>,
    next_subscription: u64,
}

impl StoreInner {
    pub(crate) fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.subscribers.get(key).map(Vec::len).unwrap_or(0)
    }

    pub(crate) fn remove_entry(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.lru.remove(key);
        self.entries.remove(key)
    }

    fn insert_entry(&mut self, entry: CacheEntry) {
        self.lru.touch(&entry.key);
        self.entries.insert(entry.key.clone(), entry);
    }
}

// == Cache Store ==
/// Cheaply cloneable handle; all clones share the same entries.
#[derive(Clone, Default)]
pub struct CacheStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .finish()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    // == Get ==
    /// Reads an entry, counting a hit or miss and refreshing its recency.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key).cloned() {
            Some(entry) => {
                inner.stats.record_hit();
                inner.lru.touch(key);
                Some(entry)
            }
            None => {
                inner.stats.record_miss();
                None
            }
        }
    }

    /// Reads an entry without touching recency or counters.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    // == Set ==
    /// Stores a server-confirmed value at `version`.
    ///
    /// A version at or below the applied one is rejected, except that the
    /// same version on a stale or errored entry renews its freshness.
    pub fn set(&self, key: CacheKey, value: Value, version: u64) -> SetOutcome {
        let (outcome, event) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let now = current_timestamp_ms();
            match inner.entries.get_mut(&key) {
                Some(existing) if version < existing.version => {
                    (SetOutcome::Rejected { current: existing.version }, None)
                }
                Some(existing) if version == existing.version => {
                    if matches!(existing.status, EntryStatus::Stale | EntryStatus::Error) {
                        existing.status = EntryStatus::Fresh;
                        existing.fetched_at = now;
                        existing.stale_at = None;
                        let entry = existing.clone();
                        inner.lru.touch(&key);
                        (SetOutcome::Refreshed, Some(entry))
                    } else {
                        (SetOutcome::Rejected { current: existing.version }, None)
                    }
                }
                _ => {
                    let entry = CacheEntry::confirmed(key.clone(), value, version);
                    inner.insert_entry(entry.clone());
                    (SetOutcome::Applied, Some(entry))
                }
            }
        };
        if let Some(entry) = event {
            self.emit(key, Some(entry));
        }
        outcome
    }

    // == Set Layered ==
    /// Writes a confirmed baseline with unconfirmed local writes on top.
    ///
    /// The entry stays `pending` at `version`; rejected only when `version`
    /// would move backwards.
    pub fn set_layered(&self, key: CacheKey, value: Value, version: u64) -> SetOutcome {
        let (outcome, event) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.entries.get_mut(&key) {
                Some(existing) if version < existing.version => {
                    (SetOutcome::Rejected { current: existing.version }, None)
                }
                Some(existing) => {
                    if existing.version != version {
                        existing.fetched_at = current_timestamp_ms();
                    }
                    existing.value = value;
                    existing.version = version;
                    existing.local_revision += 1;
                    existing.status = EntryStatus::Pending;
                    existing.stale_at = None;
                    let entry = existing.clone();
                    inner.lru.touch(&key);
                    (SetOutcome::Applied, Some(entry))
                }
                None => {
                    let mut entry = CacheEntry::optimistic(key.clone(), value);
                    entry.version = version;
                    inner.insert_entry(entry.clone());
                    (SetOutcome::Applied, Some(entry))
                }
            }
        };
        if let Some(entry) = event {
            self.emit(key, Some(entry));
        }
        outcome
    }

    // == Set Optimistic ==
    /// Forces a local write in the unconfirmed band.
    ///
    /// The confirmed version is left alone, so any later confirmed version
    /// outranks this value.
    pub fn set_optimistic(&self, key: CacheKey, value: Value) -> CacheEntry {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = match inner.entries.get_mut(&key) {
                Some(existing) => {
                    existing.value = value;
                    existing.local_revision += 1;
                    existing.status = EntryStatus::Pending;
                    existing.clone()
                }
                None => CacheEntry::optimistic(key.clone(), value),
            };
            inner.insert_entry(entry.clone());
            entry
        };
        self.emit(key, Some(entry.clone()));
        entry
    }

    // == Patch ==
    /// Shallow-merges `partial` into the current value, keeping the status.
    pub fn patch(&self, key: &CacheKey, partial: &Value) -> Result<CacheEntry> {
        let entry = {
            let mut inner = self.inner.lock();
            let existing = inner
                .entries
                .get_mut(key)
                .ok_or_else(|| SyncError::NotFound(key.to_string()))?;
            existing.value = shallow_merge(&existing.value, partial);
            existing.clone()
        };
        self.emit(key.clone(), Some(entry.clone()));
        Ok(entry)
    }

    // == Invalidate ==
    /// Marks an entry stale, keeping its last known value.
    ///
    /// Entries carrying unconfirmed writes are left alone.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.invalidate_where(|k| k == key).len() == 1
    }

    /// Marks every matching non-pending entry stale in one pass.
    pub fn invalidate_where(&self, mut pred: impl FnMut(&CacheKey) -> bool) -> Vec<CacheKey> {
        let changed: Vec<CacheEntry> = {
            let mut inner = self.inner.lock();
            let now = current_timestamp_ms();
            inner
                .entries
                .iter_mut()
                .filter(|(key, entry)| {
                    pred(*key) && matches!(entry.status, EntryStatus::Fresh | EntryStatus::Error)
                })
                .map(|(_, entry)| {
                    entry.status = EntryStatus::Stale;
                    entry.stale_at = Some(now);
                    entry.clone()
                })
                .collect()
        };
        let keys = changed.iter().map(|e| e.key.clone()).collect();
        for entry in changed {
            self.emit(entry.key.clone(), Some(entry));
        }
        keys
    }

    // == Mark Error ==
    pub fn mark_error(&self, key: &CacheKey) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(key) {
                Some(entry) if entry.status != EntryStatus::Pending => {
                    entry.status = EntryStatus::Error;
                    Some(entry.clone())
                }
                _ => None,
            }
        };
        let marked = entry.is_some();
        if let Some(entry) = entry {
            self.emit(key.clone(), Some(entry));
        }
        marked
    }

    // == Remove ==
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.inner.lock().remove_entry(key);
        if removed.is_some() {
            self.emit(key.clone(), None);
        }
        removed
    }

    // == Restore ==
    /// Puts back an exact snapshot, or removes the key when there was none.
    ///
    /// Used only to undo local writes; bypasses version arbitration.
    pub fn restore(&self, key: &CacheKey, snapshot: Option<CacheEntry>) {
        {
            let mut inner = self.inner.lock();
            match &snapshot {
                Some(entry) => {
                    inner.entries.insert(key.clone(), entry.clone());
                    if !inner.lru.contains(key) {
                        inner.lru.touch(key);
                    }
                }
                None => {
                    inner.remove_entry(key);
                }
            }
        }
        self.emit(key.clone(), snapshot);
    }

    // == Rekey ==
    /// Replaces a placeholder key with the server-assigned one.
    ///
    /// Moves the entry, its recency and its subscribers, and rewrites every
    /// string equal to the old id inside other cached values, all under one
    /// lock. If the target already holds a newer version it wins.
    pub fn rekey(&self, from: &CacheKey, to: &CacheKey) -> Option<CacheEntry> {
        let (events, result) = {
            let mut inner = self.inner.lock();
            let mut events = Vec::new();
            let moved = inner.entries.remove(from);
            let Some(mut moved) = moved else {
                return inner.entries.get(to).cloned();
            };

            moved.key = to.clone();
            let keep_existing = inner
                .entries
                .get(to)
                .is_some_and(|existing| existing.version > moved.version);
            if keep_existing {
                inner.lru.remove(from);
            } else {
                inner.lru.rename(from, to);
                inner.entries.insert(to.clone(), moved);
            }

            if let Some(subs) = inner.subscribers.remove(from) {
                for (id, _) in &subs {
                    inner.subscription_keys.insert(*id, to.clone());
                }
                inner.subscribers.entry(to.clone()).or_default().extend(subs);
            }

            if let (Some(old_id), Some(new_id)) = (from.id(), to.id()) {
                let (old_id, new_id) = (old_id.to_string(), new_id.to_string());
                for (key, entry) in inner.entries.iter_mut() {
                    if rewrite_references(&mut entry.value, &old_id, &new_id) && key != to {
                        events.push(CacheEvent {
                            key: key.clone(),
                            entry: Some(entry.clone()),
                        });
                    }
                }
            }

            let result = inner.entries.get(to).cloned();
            events.push(CacheEvent {
                key: to.clone(),
                entry: result.clone(),
            });
            (events, result)
        };
        for event in events {
            self.emit(event.key, event.entry);
        }
        result
    }

    // == Subscribe ==
    /// Registers `callback` for changes to `key`.
    ///
    /// The subscription ends when the returned guard is dropped or
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, key: &CacheKey, callback: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner
            .subscribers
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        inner.subscription_keys.insert(id, key.clone());
        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner.lock().subscriber_count(key)
    }

    // == Introspection ==
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Keys whose entity type matches.
    pub fn keys_for_type(&self, entity_type: &str) -> Vec<CacheKey> {
        self.inner
            .lock()
            .entries
            .keys()
            .filter(|k| k.entity_type() == entity_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Access counters only; see the memory manager for the full picture.
    pub fn counters(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Runs `f` with the store locked. Callers must not call back into the
    /// store from inside `f`.
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut StoreInner) -> R) -> R {
        f(&mut self.inner.lock())
    }

    // == Notify ==
    /// Delivers an event with the lock released, so callbacks may read the store.
    fn emit(&self, key: CacheKey, entry: Option<CacheEntry>) {
        let callbacks: Vec<Callback> = {
            let inner = self.inner.lock();
            match inner.subscribers.get(&key) {
                Some(subs) => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };
        let event = CacheEvent { key, entry };
        for callback in callbacks {
            callback(&event);
        }
    }
}

/// Replaces every JSON string equal to `old` with `new`. Returns whether
/// anything changed.
fn rewrite_references(value: &mut Value, old: &str, new: &str) -> bool {
    match value {
        Value::String(s) if s == old => {
            *s = new.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| rewrite_references(item, old, new) | changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, item| rewrite_references(item, old, new) | changed),
        _ => false,
    }
}

// == Subscription ==
/// Guard for a store subscription.
pub struct Subscription {
    store: Weak<Mutex<StoreInner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let mut inner = store.lock();
        if let Some(key) = inner.subscription_keys.remove(&self.id) {
            if let Some(subs) = inner.subscribers.get_mut(&key) {
                subs.retain(|(id, _)| *id != self.id);
                if subs.is_empty() {
                    inner.subscribers.remove(&key);
                }
            }
        }
    }
}
