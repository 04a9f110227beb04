//! Read-only view of in-flight mutations and unresolved conflicts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::mutation::{Conflict, MutationStatus, PendingMutation};

/// Cheap to clone; all clones observe the same engine.
#[derive(Debug, Clone, Default)]
pub struct MutationMonitor {
    pending: Arc<Mutex<HashMap<Uuid, PendingMutation>>>,
    /// Kept until acknowledged, ordered by detection
    conflicts: Arc<Mutex<BTreeMap<(i64, Uuid), Conflict>>>,
}

impl MutationMonitor {
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        let mut pending: Vec<_> = self.pending.lock().values().cloned().collect();
        pending.sort_by_key(|m| m.created_at);
        pending
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.lock().values().cloned().collect()
    }

    pub fn conflict_count(&self) -> usize {
        self.conflicts.lock().len()
    }

    /// Removes a conflict once the UI has dealt with it.
    pub fn acknowledge(&self, mutation_id: Uuid) -> bool {
        let mut conflicts = self.conflicts.lock();
        let before = conflicts.len();
        conflicts.retain(|(_, id), _| *id != mutation_id);
        conflicts.len() != before
    }

    pub fn clear_conflicts(&self) -> usize {
        let mut conflicts = self.conflicts.lock();
        let count = conflicts.len();
        conflicts.clear();
        count
    }

    // == Engine Side ==
    pub(crate) fn track(&self, mutation: PendingMutation) {
        self.pending.lock().insert(mutation.id, mutation);
    }

    pub(crate) fn update(&self, id: Uuid, f: impl FnOnce(&mut PendingMutation)) {
        if let Some(mutation) = self.pending.lock().get_mut(&id) {
            f(mutation);
        }
    }

    pub(crate) fn get(&self, id: Uuid) -> Option<PendingMutation> {
        self.pending.lock().get(&id).cloned()
    }

    pub(crate) fn settle(&self, id: Uuid, status: MutationStatus) -> Option<PendingMutation> {
        let mut settled = self.pending.lock().remove(&id)?;
        settled.status = status;
        Some(settled)
    }

    pub(crate) fn record_conflict(&self, conflict: Conflict) {
        let order = conflict.detected_at.timestamp_nanos_opt().unwrap_or_default();
        self.conflicts
            .lock()
            .insert((order, conflict.mutation_id), conflict);
    }
}
