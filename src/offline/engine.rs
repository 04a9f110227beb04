//! Background Sync Engine
//!
//! Drains the offline queue whenever the network is up: on reconnect, when
//! actions are added, on a fixed interval and when a backoff expires.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::backoff_delay;
use crate::cache::CacheKey;
use crate::error::{Result, SyncError};
use crate::monitor::PerformanceMonitor;
use crate::mutation::OptimisticMutationEngine;
use crate::offline::{ActionKind, ActionStatus, NetworkStatus, OfflineActionQueue, QueuedAction};
use crate::reconcile::{Origin, Reconciler, RemoteChange};
use crate::transport::{complete_conflict, request_with_timeout, ServerAck, Transport};

// == Status Types ==
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Pending plus failed
    pub total_actions: usize,
    pub pending: usize,
    pub failed: usize,
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub progress: SyncProgress,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub completed: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Will be retried after a backoff
    pub retried: usize,
    /// Waiting on a backoff or on an earlier action of the same entity
    pub deferred: usize,
}

struct SyncInner {
    queue: Arc<OfflineActionQueue>,
    transport: Arc<dyn Transport>,
    reconciler: Arc<Reconciler>,
    mutations: OptimisticMutationEngine,
    network: NetworkStatus,
    perf: Arc<PerformanceMonitor>,
    timeout: Duration,
    interval: Duration,
    drain_lock: tokio::sync::Mutex<()>,
    syncing: AtomicBool,
    progress: Mutex<SyncProgress>,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
}

// == Background Sync Engine ==
pub struct BackgroundSyncEngine {
    inner: Arc<SyncInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundSyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<OfflineActionQueue>,
        transport: Arc<dyn Transport>,
        reconciler: Arc<Reconciler>,
        mutations: OptimisticMutationEngine,
        network: NetworkStatus,
        perf: Arc<PerformanceMonitor>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                queue,
                transport,
                reconciler,
                mutations,
                network,
                perf,
                timeout,
                interval,
                drain_lock: tokio::sync::Mutex::new(()),
                syncing: AtomicBool::new(false),
                progress: Mutex::new(SyncProgress::default()),
                last_sync_at: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Starts the watch loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move { inner.watch().await }));
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Drains now, ignoring connectivity and pending backoffs.
    pub async fn sync_now(&self) -> SyncReport {
        self.inner.drain(true).await
    }

    pub fn queue_status(&self) -> QueueStatus {
        let pending = self.inner.queue.pending_count();
        let failed = self.inner.queue.failed_count();
        QueueStatus {
            total_actions: pending + failed,
            pending,
            failed,
            is_syncing: self.inner.syncing.load(Ordering::SeqCst),
            last_sync_at: *self.inner.last_sync_at.lock(),
            progress: *self.inner.progress.lock(),
        }
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.inner.network
    }
}

impl Drop for BackgroundSyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SyncInner {
    async fn watch(self: Arc<Self>) {
        let mut online = self.network.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_ms = self.interval.as_millis() as u64, "background sync started");

        loop {
            let retry_at = self.queue.next_retry_at();
            tokio::select! {
                _ = self.queue.changed() => {}
                changed = online.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = ticker.tick() => {}
                _ = sleep_until(retry_at), if retry_at.is_some() => {}
            }
            if self.network.is_online() && self.queue.pending_count() > 0 {
                self.drain(false).await;
            }
        }
    }

    // == Drain ==
    async fn drain(&self, force: bool) -> SyncReport {
        let _guard = self.drain_lock.lock().await;
        let actions = self.queue.drain_order();
        let mut report = SyncReport::default();
        if actions.is_empty() {
            return report;
        }

        self.syncing.store(true, Ordering::SeqCst);
        *self.progress.lock() = SyncProgress {
            completed: 0,
            total: actions.len(),
        };
        let now = Instant::now();
        let mut blocked: HashSet<String> = HashSet::new();

        for planned in actions {
            self.settle(planned, force, now, &mut blocked, &mut report).await;
            self.progress.lock().completed += 1;
        }

        self.syncing.store(false, Ordering::SeqCst);
        *self.last_sync_at.lock() = Some(Utc::now());
        info!(
            completed = report.completed,
            failed = report.failed,
            conflicts = report.conflicts,
            retried = report.retried,
            deferred = report.deferred,
            "offline queue drained"
        );
        report
    }

    /// Sends one planned action unless it is blocked, waiting or gone.
    async fn settle(
        &self,
        planned: QueuedAction,
        force: bool,
        now: Instant,
        blocked: &mut HashSet<String>,
        report: &mut SyncReport,
    ) {
        if blocked.contains(&planned.entity_ref()) {
            report.deferred += 1;
            return;
        }
        // Earlier completions may have rewritten or rebased it.
        let Some(action) = self.queue.get(planned.id).filter(QueuedAction::is_pending) else {
            return;
        };
        if !force && action.next_attempt_at.is_some_and(|at| at > now) {
            blocked.insert(action.entity_ref());
            report.deferred += 1;
            return;
        }

        match self.send(&action).await {
            Ok(ack) => {
                self.queue.complete(action.id);
                self.on_success(&action, ack);
                report.completed += 1;
            }
            Err(SyncError::Conflict {
                server_version,
                server_value,
            }) => {
                self.queue.complete(action.id);
                self.on_conflict(&action, server_version, server_value);
                report.conflicts += 1;
            }
            Err(err) if err.is_retryable() => {
                let status = self.queue.record_failure(action.id, &err, |attempt| {
                    Instant::now() + backoff_delay(attempt)
                });
                if status == Some(ActionStatus::Failed) {
                    self.on_failure(&action, err);
                    report.failed += 1;
                } else {
                    debug!(action = %action.id, error = %err, "action will be retried");
                    blocked.insert(action.entity_ref());
                    report.retried += 1;
                }
            }
            Err(err) => {
                self.queue.mark_failed(action.id, &err);
                self.on_failure(&action, err);
                report.failed += 1;
            }
        }
    }

    async fn send(&self, action: &QueuedAction) -> Result<ServerAck> {
        let operation = format!("{} {}", action.method, action.endpoint);
        let response = self
            .perf
            .track(
                &operation,
                request_with_timeout(self.transport.as_ref(), action.to_request(), self.timeout),
            )
            .await;
        match response {
            Ok(response) if action.kind == ActionKind::Delete => {
                ServerAck::from_delete_response(response, action.base_version)
            }
            Ok(response) => ServerAck::from_response(response),
            Err(err @ SyncError::Conflict { .. }) if action.kind != ActionKind::Create => {
                Err(complete_conflict(self.transport.as_ref(), &action.endpoint, self.timeout, err).await)
            }
            Err(err) => Err(err),
        }
    }

    fn on_success(&self, action: &QueuedAction, ack: ServerAck) {
        if let Some(mutation) = action.mutation_id {
            if self.mutations.complete_offline(mutation, Ok(ack.clone())) {
                return;
            }
        }

        // Nobody is waiting on it (e.g. queued before a restart).
        let key = action.cache_key();
        let target = match (&ack.id, &key) {
            (Some(id), Some(key)) if key.is_temp() => {
                let target = CacheKey::entity(&action.entity_type, id);
                self.reconciler.store().rekey(key, &target);
                self.queue.rewrite_entity(&action.entity_type, key.id().unwrap_or_default(), id);
                Some(target)
            }
            (Some(id), None) => Some(CacheKey::entity(&action.entity_type, id)),
            _ => key.clone(),
        };
        if let Some(target) = target {
            let change = match (ack.deleted, action.kind) {
                (true, _) | (_, ActionKind::Delete) => RemoteChange::delete(target.clone(), ack.version),
                _ => RemoteChange::upsert(target.clone(), ack.value, ack.version),
            };
            self.reconciler.apply_remote(change, Origin::Server);
            self.queue.rebase(target.as_str(), ack.version);
        }
    }

    fn on_conflict(
        &self,
        action: &QueuedAction,
        server_version: Option<u64>,
        server_value: Option<serde_json::Value>,
    ) {
        if let Some(mutation) = action.mutation_id {
            let error = SyncError::Conflict {
                server_version,
                server_value: server_value.clone(),
            };
            if self.mutations.complete_offline(mutation, Err(error)) {
                return;
            }
        }
        warn!(action = %action.id, ?server_version, "queued action conflicted; server wins");
        let Some(key) = action.cache_key() else {
            return;
        };
        match server_version.zip(server_value) {
            Some((version, value)) => {
                self.reconciler
                    .apply_remote(RemoteChange::upsert(key, value, version), Origin::Server);
            }
            None => {
                self.reconciler.store().invalidate(&key);
            }
        }
    }

    fn on_failure(&self, action: &QueuedAction, error: SyncError) {
        if let Some(mutation) = action.mutation_id {
            if self.mutations.complete_offline(mutation, Err(error)) {
                return;
            }
        }
        if let Some(key) = action.cache_key() {
            self.reconciler.store().invalidate(&key);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
