//! Reconciliation
//!
//! The one path by which confirmed server state enters the cache: mutation
//! acknowledgements, drained offline actions, realtime pushes, cross-tab
//! updates and refetches all land here.
//!
//! Keys with unconfirmed local writes are kept as a *lane*: the last
//! confirmed entry plus the ordered local writes layered on top of it.
//! Confirmed changes replace the lane's base and the writes are re-applied,
//! so local intent is never lost and versions never move backwards.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{
    current_timestamp_ms, shallow_merge, CacheEntry, CacheKey, CacheStore, EntryStatus, SetOutcome,
};
use crate::transport::ServerAck;

const CHANGE_CAPACITY: usize = 256;

// == Origin ==
/// Where a confirmed change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Acknowledgement of a write made by this instance
    Server,
    Realtime,
    CrossTab,
    Refetch,
}

// == Remote Change ==
/// A confirmed entity state; `value: None` means the entity was deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub key: CacheKey,
    #[serde(default)]
    pub value: Option<Value>,
    pub version: u64,
}

impl RemoteChange {
    pub fn upsert(key: impl Into<CacheKey>, value: Value, version: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            version,
        }
    }

    pub fn delete(key: impl Into<CacheKey>, version: u64) -> Self {
        Self {
            key: key.into(),
            value: None,
            version,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// A change that was accepted into the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub change: RemoteChange,
    pub origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    /// Same version as held; only freshness renewed
    Refreshed,
    /// Not newer than what is held; dropped
    Obsolete,
}

// == Lanes ==
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LocalEffect {
    Merge(Value),
    Delete,
}

#[derive(Debug, Clone)]
pub(crate) struct LocalWrite {
    pub(crate) mutation_id: Uuid,
    pub(crate) effect: LocalEffect,
}

#[derive(Debug, Default)]
pub(crate) struct Lane {
    /// Last confirmed state, or `None` when the entity has none yet
    pub(crate) base: Option<CacheEntry>,
    pub(crate) writes: Vec<LocalWrite>,
}

impl Lane {
    fn base_version(&self) -> u64 {
        self.base.as_ref().map(|b| b.version).unwrap_or(0)
    }
}

/// Result of confirming one local write.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Confirmation {
    Confirmed {
        /// Final key; differs from the write's key when a placeholder was replaced
        key: CacheKey,
    },
    /// The acknowledged version is older than state already applied
    Superseded {
        server_version: u64,
        server_value: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    version: u64,
    recorded_at: u64,
}

// == Reconciler ==
pub struct Reconciler {
    store: CacheStore,
    lanes: Mutex<HashMap<CacheKey, Lane>>,
    /// Version at which each deleted key died, and when it was recorded
    tombstones: Mutex<HashMap<CacheKey, Tombstone>>,
    changes: broadcast::Sender<AppliedChange>,
}

impl Reconciler {
    pub fn new(store: CacheStore) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            store,
            lanes: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
            changes,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Stream of every change accepted into the cache.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<AppliedChange> {
        self.changes.subscribe()
    }

    /// Keys currently carrying unconfirmed local writes.
    pub fn pending_keys(&self) -> Vec<CacheKey> {
        self.lanes.lock().keys().cloned().collect()
    }

    pub fn tombstone(&self, key: &CacheKey) -> Option<u64> {
        self.tombstones.lock().get(key).map(|t| t.version)
    }

    fn bury(&self, key: CacheKey, version: u64) {
        let tombstone = Tombstone {
            version,
            recorded_at: current_timestamp_ms(),
        };
        self.tombstones.lock().insert(key, tombstone);
    }

    /// Forgets deletes recorded more than `max_age_ms` ago. Returns how many
    /// were dropped.
    pub fn prune_tombstones(&self, max_age_ms: u64) -> usize {
        let cutoff = current_timestamp_ms().saturating_sub(max_age_ms);
        let mut tombstones = self.tombstones.lock();
        let before = tombstones.len();
        tombstones.retain(|_, t| t.recorded_at > cutoff);
        before - tombstones.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.lock().len()
    }

    // == Apply Remote ==
    /// Applies a confirmed change if it is newer than what is held.
    ///
    /// Safe to call any number of times with the same change.
    pub fn apply_remote(&self, change: RemoteChange, origin: Origin) -> ReconcileOutcome {
        if self
            .tombstone(&change.key)
            .is_some_and(|dead| change.version <= dead)
        {
            debug!(key = %change.key, version = change.version, "change predates delete");
            return ReconcileOutcome::Obsolete;
        }

        let outcome = {
            let mut lanes = self.lanes.lock();
            match lanes.get_mut(&change.key) {
                Some(lane) => self.apply_to_lane(lane, &change),
                None => self.apply_to_store(&change),
            }
        };

        if outcome == ReconcileOutcome::Applied {
            if change.is_delete() {
                self.bury(change.key.clone(), change.version);
            }
            self.publish(change, origin);
        }
        outcome
    }

    fn apply_to_lane(&self, lane: &mut Lane, change: &RemoteChange) -> ReconcileOutcome {
        let current = lane.base_version();
        if lane.base.is_some() && change.version < current {
            return ReconcileOutcome::Obsolete;
        }
        if let Some(base) = lane.base.as_mut().filter(|_| change.version == current) {
            if !matches!(base.status, EntryStatus::Stale | EntryStatus::Error) {
                return ReconcileOutcome::Obsolete;
            }
            base.status = EntryStatus::Fresh;
            base.stale_at = None;
            return ReconcileOutcome::Refreshed;
        }

        lane.base = change
            .value
            .clone()
            .map(|value| CacheEntry::confirmed(change.key.clone(), value, change.version));
        relayer(&self.store, &change.key, lane);
        ReconcileOutcome::Applied
    }

    fn apply_to_store(&self, change: &RemoteChange) -> ReconcileOutcome {
        match &change.value {
            Some(value) => match self
                .store
                .set(change.key.clone(), value.clone(), change.version)
            {
                SetOutcome::Applied => ReconcileOutcome::Applied,
                SetOutcome::Refreshed => ReconcileOutcome::Refreshed,
                SetOutcome::Rejected { .. } => ReconcileOutcome::Obsolete,
            },
            None => {
                let held = self.store.peek(&change.key).map(|e| e.version);
                if held.is_some_and(|v| v > change.version) {
                    return ReconcileOutcome::Obsolete;
                }
                self.store.remove(&change.key);
                ReconcileOutcome::Applied
            }
        }
    }

    fn publish(&self, change: RemoteChange, origin: Origin) {
        // No receivers is fine.
        let _ = self.changes.send(AppliedChange { change, origin });
    }

    // == Local Writes ==
    /// Layers a local write over `key`, opening a lane if needed.
    ///
    /// Returns the confirmed version the write was computed against.
    pub(crate) fn push_write(
        &self,
        key: &CacheKey,
        mutation_id: Uuid,
        effect: LocalEffect,
    ) -> Option<u64> {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(key.clone()).or_insert_with(|| Lane {
            base: self.store.peek(key),
            writes: Vec::new(),
        });
        lane.writes.push(LocalWrite { mutation_id, effect });
        relayer(&self.store, key, lane);
        lane.base.as_ref().map(|b| b.version)
    }

    /// Removes a local write and re-applies the rest; with none left the
    /// confirmed base is restored exactly.
    pub(crate) fn drop_write(&self, key: &CacheKey, mutation_id: Uuid) -> bool {
        let mut lanes = self.lanes.lock();
        let Some(lane) = lanes.get_mut(key) else {
            return false;
        };
        let before = lane.writes.len();
        lane.writes.retain(|w| w.mutation_id != mutation_id);
        if lane.writes.len() == before {
            return false;
        }
        relayer(&self.store, key, lane);
        if lane.writes.is_empty() {
            lanes.remove(key);
        }
        true
    }

    /// Drops a local write in favour of the server's state.
    ///
    /// When the server state is unknown the key is left stale so the next
    /// read refetches it. Returns whether the server state was adopted.
    pub(crate) fn adopt_server(
        &self,
        key: &CacheKey,
        mutation_id: Uuid,
        server_version: Option<u64>,
        server_value: Option<Value>,
    ) -> bool {
        let known = server_version.zip(server_value);
        let resolved = known.is_some();
        let mut lanes = self.lanes.lock();
        if !lanes.contains_key(key) {
            drop(lanes);
            return match known {
                Some((version, value)) => {
                    self.apply_remote(RemoteChange::upsert(key.clone(), value, version), Origin::Server);
                    true
                }
                None => {
                    self.store.invalidate(key);
                    false
                }
            };
        }

        let mut adopted = None;
        if let Some(lane) = lanes.get_mut(key) {
            lane.writes.retain(|w| w.mutation_id != mutation_id);
            match known {
                Some((version, value)) => {
                    if lane.base.is_none() || version > lane.base_version() {
                        lane.base = Some(CacheEntry::confirmed(key.clone(), value.clone(), version));
                        adopted = Some(RemoteChange::upsert(key.clone(), value, version));
                    }
                }
                None => {
                    if let Some(base) = lane.base.as_mut() {
                        base.status = EntryStatus::Stale;
                        base.stale_at = Some(current_timestamp_ms());
                    }
                    debug!(%key, "server state unknown after conflict; marked stale");
                }
            }
            relayer(&self.store, key, lane);
            if lane.writes.is_empty() {
                lanes.remove(key);
            }
        }
        drop(lanes);

        if let Some(change) = adopted {
            self.publish(change, Origin::Server);
        }
        resolved
    }

    /// Folds a server acknowledgement for one local write into the lane.
    ///
    /// Placeholder keys are replaced by the server id across the cache.
    pub(crate) fn confirm_write(
        &self,
        key: &CacheKey,
        mutation_id: Uuid,
        ack: &ServerAck,
    ) -> Confirmation {
        let target = confirmed_key(key, ack);
        let change = match ack.deleted {
            true => RemoteChange::delete(target.clone(), ack.version),
            false => RemoteChange::upsert(target.clone(), ack.value.clone(), ack.version),
        };

        {
            let mut lanes = self.lanes.lock();
            let Some(mut lane) = lanes.remove(key) else {
                drop(lanes);
                self.apply_remote(change, Origin::Server);
                return Confirmation::Confirmed { key: target };
            };

            if lane.base.is_some() && ack.version < lane.base_version() {
                let confirmation = Confirmation::Superseded {
                    server_version: lane.base_version(),
                    server_value: lane.base.as_ref().map(|b| b.value.clone()),
                };
                lanes.insert(key.clone(), lane);
                return confirmation;
            }

            lane.writes.retain(|w| w.mutation_id != mutation_id);
            if ack.version > lane.base_version() || lane.base.is_none() {
                lane.base = (!ack.deleted)
                    .then(|| CacheEntry::confirmed(target.clone(), ack.value.clone(), ack.version));
            }

            if &target != key {
                if let Some(moved) = self.store.rekey(key, &target) {
                    if moved.version > lane.base_version() && !moved.is_pending() {
                        lane.base = Some(moved);
                    }
                }
                if let Some(base) = lane.base.as_mut() {
                    base.key = target.clone();
                }
            }

            relayer(&self.store, &target, &lane);
            if !lane.writes.is_empty() {
                lanes.insert(target.clone(), lane);
            }
        }

        if ack.deleted {
            self.bury(target.clone(), ack.version);
        }
        self.publish(change, Origin::Server);
        Confirmation::Confirmed { key: target }
    }
}

/// The key an acknowledged write lives under.
pub(crate) fn confirmed_key(key: &CacheKey, ack: &ServerAck) -> CacheKey {
    match (&ack.id, key.is_temp()) {
        (Some(id), true) => CacheKey::entity(key.entity_type(), id),
        _ => key.clone(),
    }
}

/// Writes the lane's composed value into the store.
fn relayer(store: &CacheStore, key: &CacheKey, lane: &Lane) {
    if lane.writes.is_empty() {
        store.restore(key, lane.base.clone());
        return;
    }

    let mut value = Some(
        lane.base
            .as_ref()
            .map(|b| b.value.clone())
            .unwrap_or(Value::Null),
    );
    for write in &lane.writes {
        value = match &write.effect {
            LocalEffect::Merge(patch) => {
                Some(shallow_merge(value.as_ref().unwrap_or(&Value::Null), patch))
            }
            LocalEffect::Delete => None,
        };
    }

    match (value, &lane.base) {
        (None, _) => {
            store.remove(key);
        }
        (Some(value), Some(base)) => {
            if let SetOutcome::Rejected { current } =
                store.set_layered(key.clone(), value, base.version)
            {
                warn!(%key, base = base.version, current, "cache ahead of lane base");
            }
        }
        (Some(value), None) => {
            store.set_optimistic(key.clone(), value);
        }
    }
}
