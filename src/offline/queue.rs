//! Offline Action Queue
//!
//! Durable, ordered list of writes waiting for the server. Every change is
//! written through to [`QueuePersistence`]; a failed save is logged and the
//! action is kept in memory.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::offline::{ActionStatus, QueuePersistence, QueuedAction};

#[derive(Default)]
struct QueueState {
    actions: Vec<QueuedAction>,
    next_seq: u64,
}

pub struct OfflineActionQueue {
    state: Mutex<QueueState>,
    persistence: Arc<dyn QueuePersistence>,
    default_max_retries: u32,
    changed: Notify,
}

impl OfflineActionQueue {
    /// Opens the queue, reloading whatever was persisted before.
    pub fn new(persistence: Arc<dyn QueuePersistence>, default_max_retries: u32) -> Self {
        let actions = persistence.load().unwrap_or_else(|e| {
            warn!(error = %e, "could not load offline queue; starting empty");
            Vec::new()
        });
        let next_seq = actions.iter().map(|a| a.seq + 1).max().unwrap_or(0);
        if !actions.is_empty() {
            info!(count = actions.len(), "restored offline actions");
        }
        Self {
            state: Mutex::new(QueueState { actions, next_seq }),
            persistence,
            default_max_retries,
            changed: Notify::new(),
        }
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    // == Queue Action ==
    /// Appends an action and persists the queue. Never blocks on the network.
    pub fn queue_action(&self, mut action: QueuedAction) -> Uuid {
        let id = action.id;
        {
            let mut state = self.state.lock();
            action.seq = state.next_seq;
            state.next_seq += 1;
            debug!(
                action = %id,
                entity = %action.entity_ref(),
                method = %action.method,
                "action queued"
            );
            state.actions.push(action);
            self.persist(&state.actions);
        }
        self.changed.notify_one();
        id
    }

    // == Introspection ==
    pub fn len(&self) -> usize {
        self.state.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().actions.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.count(ActionStatus::Pending)
    }

    pub fn failed_count(&self) -> usize {
        self.count(ActionStatus::Failed)
    }

    fn count(&self, status: ActionStatus) -> usize {
        self.state
            .lock()
            .actions
            .iter()
            .filter(|a| a.status == status)
            .count()
    }

    /// Snapshot of every action in insertion order.
    pub fn actions(&self) -> Vec<QueuedAction> {
        self.state.lock().actions.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<QueuedAction> {
        self.state.lock().actions.iter().find(|a| a.id == id).cloned()
    }

    pub fn has_pending_for(&self, entity_ref: &str) -> bool {
        self.state
            .lock()
            .actions
            .iter()
            .any(|a| a.is_pending() && a.entity_ref() == entity_ref)
    }

    /// Earliest scheduled retry among pending actions.
    pub(crate) fn next_retry_at(&self) -> Option<Instant> {
        self.state
            .lock()
            .actions
            .iter()
            .filter(|a| a.is_pending())
            .filter_map(|a| a.next_attempt_at)
            .min()
    }

    // == Drain Order ==
    /// Pending actions in the order they should be sent.
    ///
    /// Highest priority first, then `created_at`. Each entity's actions take
    /// the highest priority found among them, which keeps them in order.
    pub(crate) fn drain_order(&self) -> Vec<QueuedAction> {
        let mut pending: Vec<QueuedAction> = self
            .state
            .lock()
            .actions
            .iter()
            .filter(|a| a.is_pending())
            .cloned()
            .collect();

        let mut group_priority: HashMap<String, i32> = HashMap::new();
        for action in &pending {
            let slot = group_priority.entry(action.entity_ref()).or_insert(action.priority);
            *slot = (*slot).max(action.priority);
        }
        pending.sort_by_key(|a| {
            let priority = group_priority.get(&a.entity_ref()).copied().unwrap_or(a.priority);
            (Reverse(priority), a.created_at, a.seq)
        });
        pending
    }

    // == Outcomes ==
    /// Removes a finished action.
    pub(crate) fn complete(&self, id: Uuid) -> Option<QueuedAction> {
        let mut state = self.state.lock();
        let index = state.actions.iter().position(|a| a.id == id)?;
        let action = state.actions.remove(index);
        self.persist(&state.actions);
        Some(action)
    }

    /// Counts a failed attempt; the action turns `failed` once out of retries.
    pub(crate) fn record_failure(
        &self,
        id: Uuid,
        error: &SyncError,
        retry_at: impl FnOnce(u32) -> Instant,
    ) -> Option<ActionStatus> {
        let mut state = self.state.lock();
        let action = state.actions.iter_mut().find(|a| a.id == id)?;
        action.attempt += 1;
        action.last_error = Some(error.to_string());
        if action.attempt >= action.max_retries {
            action.status = ActionStatus::Failed;
            action.next_attempt_at = None;
            warn!(action = %id, attempts = action.attempt, error = %error, "action out of retries");
        } else {
            action.next_attempt_at = Some(retry_at(action.attempt));
        }
        let status = action.status;
        self.persist(&state.actions);
        Some(status)
    }

    /// Marks an action terminally failed without retrying.
    pub(crate) fn mark_failed(&self, id: Uuid, error: &SyncError) -> bool {
        let mut state = self.state.lock();
        let Some(action) = state.actions.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        action.status = ActionStatus::Failed;
        action.last_error = Some(error.to_string());
        action.next_attempt_at = None;
        warn!(action = %id, error = %error, "action rejected");
        self.persist(&state.actions);
        true
    }

    /// Later pending actions on the entity now apply on top of `version`.
    pub(crate) fn rebase(&self, entity_ref: &str, version: u64) {
        let mut state = self.state.lock();
        let mut changed = false;
        for action in state
            .actions
            .iter_mut()
            .filter(|a| a.is_pending() && a.entity_ref() == entity_ref)
        {
            action.base_version = Some(version);
            changed = true;
        }
        if changed {
            self.persist(&state.actions);
        }
    }

    /// Points actions aimed at a placeholder id at the server-assigned one.
    pub(crate) fn rewrite_entity(&self, entity_type: &str, old_id: &str, new_id: &str) -> usize {
        let mut state = self.state.lock();
        let mut rewritten = 0;
        for action in state
            .actions
            .iter_mut()
            .filter(|a| a.entity_type == entity_type && a.entity_id.as_deref() == Some(old_id))
        {
            action.entity_id = Some(new_id.to_string());
            action.endpoint = action.endpoint.replace(old_id, new_id);
            rewritten += 1;
        }
        if rewritten > 0 {
            self.persist(&state.actions);
        }
        rewritten
    }

    // == Failed Actions ==
    /// Puts every failed action back in line with a fresh retry budget.
    pub fn retry_failed(&self) -> usize {
        let count = {
            let mut state = self.state.lock();
            let mut count = 0;
            for action in state
                .actions
                .iter_mut()
                .filter(|a| a.status == ActionStatus::Failed)
            {
                action.status = ActionStatus::Pending;
                action.attempt = 0;
                action.next_attempt_at = None;
                count += 1;
            }
            if count > 0 {
                self.persist(&state.actions);
            }
            count
        };
        if count > 0 {
            self.changed.notify_one();
        }
        count
    }

    /// Drops every failed action; returns what was removed.
    pub fn clear_failed(&self) -> Vec<QueuedAction> {
        let mut state = self.state.lock();
        let (failed, kept): (Vec<_>, Vec<_>) = state
            .actions
            .drain(..)
            .partition(|a| a.status == ActionStatus::Failed);
        state.actions = kept;
        if !failed.is_empty() {
            self.persist(&state.actions);
        }
        failed
    }

    /// Resolves when actions were added or re-armed.
    pub(crate) async fn changed(&self) {
        self.changed.notified().await;
    }

    fn persist(&self, actions: &[QueuedAction]) {
        if let Err(e) = self.persistence.save(actions) {
            warn!(error = %e, "queue persistence failed; keeping actions in memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{ActionKind, MemoryPersistence};
    use crate::transport::Method;
    use serde_json::json;
    use std::time::Duration;

    fn update(entity: &str, priority: i32) -> QueuedAction {
        let (kind, id) = entity.split_once(':').unwrap();
        QueuedAction::new(
            ActionKind::Update,
            kind,
            Some(id.to_string()),
            Method::Patch,
            format!("/{}s/{}", kind, id),
            json!({}),
        )
        .with_priority(priority)
        .with_max_retries(2)
    }

    fn queue() -> (MemoryPersistence, OfflineActionQueue) {
        let persistence = MemoryPersistence::new();
        let queue = OfflineActionQueue::new(Arc::new(persistence.clone()), 3);
        (persistence, queue)
    }

    #[test]
    fn test_queue_persists_and_reloads_in_order() {
        let (persistence, queue) = queue();
        let first = queue.queue_action(update("client:1", 0));
        let second = queue.queue_action(update("client:2", 0));
        assert_eq!(persistence.saved_len(), 2);

        let reopened = OfflineActionQueue::new(Arc::new(persistence), 3);
        let ids: Vec<_> = reopened.drain_order().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![first, second]);

        let third = reopened.queue_action(update("client:3", 0));
        assert_eq!(reopened.get(third).unwrap().seq, 2);
    }

    #[test]
    fn test_drain_order_priority_with_entity_groups() {
        let (_, queue) = queue();
        let low_a1 = queue.queue_action(update("client:1", 0));
        let other = queue.queue_action(update("deal:9", 1));
        let high_a2 = queue.queue_action(update("client:1", 5));

        let ids: Vec<_> = queue.drain_order().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![low_a1, high_a2, other]);
    }

    #[test]
    fn test_failure_retries_then_fails() {
        let (_, queue) = queue();
        let id = queue.queue_action(update("client:1", 0));
        let error = SyncError::Network("down".into());
        let later = |attempt: u32| Instant::now() + Duration::from_secs(attempt as u64);

        assert_eq!(queue.record_failure(id, &error, later), Some(ActionStatus::Pending));
        assert!(queue.next_retry_at().is_some());
        assert_eq!(queue.record_failure(id, &error, later), Some(ActionStatus::Failed));
        assert_eq!(queue.failed_count(), 1);
        assert!(queue.drain_order().is_empty());
        assert_eq!(queue.get(id).unwrap().last_error.as_deref(), Some("Network error: down"));

        assert_eq!(queue.retry_failed(), 1);
        let action = queue.get(id).unwrap();
        assert_eq!(action.attempt, 0);
        assert!(action.is_pending());
    }

    #[test]
    fn test_clear_failed_keeps_pending() {
        let (_, queue) = queue();
        let bad = queue.queue_action(update("client:1", 0));
        queue.queue_action(update("client:2", 0));
        queue.mark_failed(bad, &SyncError::Validation("nope".into()));

        let removed = queue.clear_failed();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, bad);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_persistence_failure_keeps_action_in_memory() {
        let (persistence, queue) = queue();
        persistence.set_failing(true);
        queue.queue_action(update("client:1", 0));
        assert_eq!(queue.len(), 1);
        assert_eq!(persistence.saved_len(), 0);
    }

    #[test]
    fn test_rewrite_and_rebase() {
        let (_, queue) = queue();
        let id = queue.queue_action(
            QueuedAction::new(
                ActionKind::Update,
                "client",
                Some("tmp-1".into()),
                Method::Patch,
                "/clients/tmp-1",
                json!({}),
            )
            .with_base_version(0),
        );
        assert!(queue.has_pending_for("client:tmp-1"));
        assert_eq!(queue.rewrite_entity("client", "tmp-1", "42"), 1);
        queue.rebase("client:42", 1);

        let action = queue.get(id).unwrap();
        assert_eq!(action.endpoint, "/clients/42");
        assert_eq!(action.entity_ref(), "client:42");
        assert_eq!(action.base_version, Some(1));
    }
}
