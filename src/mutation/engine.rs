//! Optimistic Mutation Engine
//!
//! Applies a local patch immediately and settles it against the server
//! afterwards. Server calls for one key run strictly one at a time, in call
//! order; their results are folded back through the reconciler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{current_timestamp_ms, CacheKey, CacheStore};
use crate::error::{Result, SyncError};
use crate::monitor::PerformanceMonitor;
use crate::mutation::{
    Conflict, ConflictResolver, MutationHandle, MutationMonitor, MutationState, MutationStatus,
    PendingMutation, Resolution, ServerWins,
};
use crate::offline::{ActionKind, ActionTemplate, NetworkStatus, OfflineActionQueue, QueuedAction};
use crate::reconcile::{Confirmation, LocalEffect, Reconciler};
use crate::transport::{complete_conflict, request_with_timeout, Request, ServerAck, Transport};

/// Upper bound on resolver-driven resubmissions of one mutation.
const MAX_RESOLVE_ROUNDS: u32 = 3;

// == Server Call ==
/// What a custom server call receives.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub key: CacheKey,
    pub payload: Value,
    pub base_version: Option<u64>,
    /// Stable for the mutation; lets the server drop replays
    pub idempotency_key: String,
}

pub type CustomCall = Arc<dyn Fn(WriteRequest) -> BoxFuture<'static, Result<ServerAck>> + Send + Sync>;

#[derive(Clone)]
pub enum ServerCall {
    /// Sent through the transport; parked in the offline queue when the
    /// network is down
    Request(ActionTemplate),
    /// Caller-supplied; any failure rolls back
    Custom(CustomCall),
}

impl ServerCall {
    pub fn custom<F, Fut>(call: F) -> Self
    where
        F: Fn(WriteRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServerAck>> + Send + 'static,
    {
        ServerCall::Custom(Arc::new(
            move |request| -> BoxFuture<'static, Result<ServerAck>> { Box::pin(call(request)) },
        ))
    }

    fn is_delete(&self) -> bool {
        matches!(self, ServerCall::Request(t) if t.kind == ActionKind::Delete)
    }
}

impl std::fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerCall::Request(template) => f.debug_tuple("Request").field(template).finish(),
            ServerCall::Custom(_) => f.write_str("Custom"),
        }
    }
}

// == Engine Internals ==
struct Job {
    key: CacheKey,
    payload: Value,
    base_version: Option<u64>,
    call: ServerCall,
    state: watch::Sender<MutationState>,
}

/// Call order for one key.
#[derive(Default)]
struct KeyQueue {
    waiting: VecDeque<Uuid>,
}

struct Alias {
    target: CacheKey,
    created_at: u64,
}

/// What happens after a server reply has been folded in.
enum Step {
    Done(CacheKey),
    Resubmit { payload: Value, base_version: u64 },
}

pub(crate) struct EngineInner {
    reconciler: Arc<Reconciler>,
    transport: Arc<dyn Transport>,
    perf: Arc<PerformanceMonitor>,
    queue: Arc<OfflineActionQueue>,
    network: NetworkStatus,
    resolver: RwLock<Arc<dyn ConflictResolver>>,
    monitor: MutationMonitor,
    jobs: Mutex<HashMap<Uuid, Job>>,
    /// Keys with a running driver, and what waits behind it
    lanes: Mutex<HashMap<CacheKey, KeyQueue>>,
    /// Placeholder keys already replaced by server ids
    aliases: Mutex<HashMap<CacheKey, Alias>>,
    timeout: Duration,
    weak: Weak<EngineInner>,
}

// == Optimistic Mutation Engine ==
#[derive(Clone)]
pub struct OptimisticMutationEngine {
    inner: Arc<EngineInner>,
}

impl OptimisticMutationEngine {
    pub fn new(
        reconciler: Arc<Reconciler>,
        transport: Arc<dyn Transport>,
        perf: Arc<PerformanceMonitor>,
        queue: Arc<OfflineActionQueue>,
        network: NetworkStatus,
        timeout: Duration,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| EngineInner {
            reconciler,
            transport,
            perf,
            queue,
            network,
            resolver: RwLock::new(Arc::new(ServerWins)),
            monitor: MutationMonitor::default(),
            jobs: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
            timeout,
            weak: weak.clone(),
        });
        Self { inner }
    }

    /// Replaces the server-wins default.
    pub fn set_resolver(&self, resolver: impl ConflictResolver + 'static) {
        *self.inner.resolver.write() = Arc::new(resolver);
    }

    pub fn monitor(&self) -> MutationMonitor {
        self.inner.monitor.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.monitor.pending_count()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.inner.monitor.conflicts()
    }

    /// Forgets replaced placeholders older than `max_age_ms` that no live
    /// mutation still refers to. Returns how many were dropped.
    pub fn prune_aliases(&self, max_age_ms: u64) -> usize {
        self.inner.prune_aliases(max_age_ms)
    }

    pub fn alias_count(&self) -> usize {
        self.inner.aliases.lock().len()
    }

    // == Mutate ==
    /// Applies `patch` to `key` now and settles it with `call` in the
    /// background. Must be called inside a Tokio runtime; never fails
    /// synchronously.
    ///
    /// Store subscribers are notified while the key's lane is held, so a
    /// callback must not call `mutate` directly.
    pub fn mutate(&self, key: CacheKey, patch: Value, call: ServerCall) -> MutationHandle {
        self.inner.mutate(key, patch, call)
    }

    /// Settles a mutation whose action was drained from the offline queue.
    ///
    /// Returns `false` when no such mutation is alive (e.g. after a restart).
    pub(crate) fn complete_offline(&self, mutation_id: Uuid, result: Result<ServerAck>) -> bool {
        self.inner.complete_offline(mutation_id, result)
    }
}

impl EngineInner {
    fn store(&self) -> &CacheStore {
        self.reconciler.store()
    }

    fn resolve_alias(&self, key: CacheKey) -> CacheKey {
        self.aliases
            .lock()
            .get(&key)
            .map(|alias| alias.target.clone())
            .unwrap_or(key)
    }

    fn prune_aliases(&self, max_age_ms: u64) -> usize {
        let cutoff = current_timestamp_ms().saturating_sub(max_age_ms);
        let live: HashSet<CacheKey> = self.jobs.lock().values().map(|j| j.key.clone()).collect();
        let mut aliases = self.aliases.lock();
        let before = aliases.len();
        aliases.retain(|_, alias| alias.created_at > cutoff || live.contains(&alias.target));
        before - aliases.len()
    }

    fn mutate(&self, key: CacheKey, patch: Value, call: ServerCall) -> MutationHandle {
        let key = self.resolve_alias(key);
        let id = Uuid::new_v4();
        let effect = if call.is_delete() {
            LocalEffect::Delete
        } else {
            LocalEffect::Merge(patch.clone())
        };
        let base_version = self.reconciler.push_write(&key, id, effect);

        let (state, rx) = watch::channel(MutationState::applied(key.clone()));
        let handle = MutationHandle::new(id, rx, self.weak.clone());
        self.monitor.track(PendingMutation {
            id,
            key: key.clone(),
            entity_type: key.entity_type().to_string(),
            patch: patch.clone(),
            base_version,
            status: MutationStatus::Applied,
            retries: 0,
            queued: false,
            created_at: Utc::now(),
        });
        self.jobs.lock().insert(
            id,
            Job {
                key: key.clone(),
                payload: patch,
                base_version,
                call,
                state,
            },
        );
        debug!(mutation = %id, %key, "mutation applied");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.rollback(id, SyncError::Internal("no async runtime".to_string()));
            return handle;
        };
        let start_driver = {
            let mut lanes = self.lanes.lock();
            let start = !lanes.contains_key(&key);
            lanes.entry(key.clone()).or_default().waiting.push_back(id);
            start
        };
        if start_driver {
            if let Some(engine) = self.weak.upgrade() {
                runtime.spawn(engine.drive(key));
            }
        }
        handle
    }

    // == Driver ==
    /// Runs the calls queued on one key, one at a time.
    async fn drive(self: Arc<Self>, mut key: CacheKey) {
        loop {
            let next = {
                let mut lanes = self.lanes.lock();
                match lanes.get_mut(&key).and_then(|q| q.waiting.pop_front()) {
                    Some(id) => id,
                    None => {
                        lanes.remove(&key);
                        return;
                    }
                }
            };
            let Some(settled_key) = self.run(next).await else {
                continue;
            };
            if settled_key != key {
                if !self.move_lane(&key, &settled_key) {
                    return;
                }
                key = settled_key;
            }
        }
    }

    /// Carries waiting calls over to a replaced key. Returns whether this
    /// driver should keep serving them.
    fn move_lane(&self, from: &CacheKey, to: &CacheKey) -> bool {
        let mut lanes = self.lanes.lock();
        let moved = lanes.remove(from).unwrap_or_default();
        match lanes.get_mut(to) {
            Some(existing) => {
                existing.waiting.extend(moved.waiting);
                false
            }
            None => {
                lanes.insert(to.clone(), moved);
                true
            }
        }
    }

    /// Settles one job; returns the key it ended up under, or `None` if it
    /// was cancelled before starting.
    async fn run(&self, id: Uuid) -> Option<CacheKey> {
        let (key, call, mut payload, mut base_version) = self.begin(id)?;

        if let ServerCall::Request(template) = &call {
            let entity_ref = key.as_str().to_string();
            if !self.network.is_online() || self.queue.has_pending_for(&entity_ref) {
                self.park(id, template, &key, payload, base_version);
                return Some(key);
            }
        }

        let mut round = 0;
        loop {
            let result = match self.send(id, &key, &call, payload.clone(), base_version).await {
                Err(err @ SyncError::Conflict { .. }) => Err(self.complete(&call, err).await),
                result => result,
            };
            let step = match result {
                Ok(ack) => self.on_ack(id, &key, ack, round < MAX_RESOLVE_ROUNDS),
                Err(SyncError::Conflict {
                    server_version,
                    server_value,
                }) => self.on_conflict(id, &key, server_version, server_value, round < MAX_RESOLVE_ROUNDS),
                Err(err) if err.is_retryable() => match &call {
                    ServerCall::Request(template) => {
                        warn!(mutation = %id, error = %err, "server unreachable; queueing");
                        self.park(id, template, &key, payload, base_version);
                        Step::Done(key.clone())
                    }
                    ServerCall::Custom(_) => {
                        self.rollback(id, err);
                        Step::Done(key.clone())
                    }
                },
                Err(err) => {
                    self.rollback(id, err);
                    Step::Done(key.clone())
                }
            };
            match step {
                Step::Done(settled) => return Some(settled),
                Step::Resubmit {
                    payload: resolved,
                    base_version: version,
                } => {
                    round += 1;
                    payload = resolved;
                    base_version = Some(version);
                    self.monitor.update(id, |m| m.retries += 1);
                }
            }
        }
    }

    /// Marks a job started; `None` if it was cancelled meanwhile.
    fn begin(&self, id: Uuid) -> Option<(CacheKey, ServerCall, Value, Option<u64>)> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&id)?;
        let key = self.resolve_alias(job.key.clone());
        if key != job.key {
            if let ServerCall::Request(template) = &mut job.call {
                if let (Some(old), Some(new)) = (job.key.id(), key.id()) {
                    template.endpoint = template.endpoint.replace(old, new);
                }
            }
            job.key = key.clone();
        }
        Some((key, job.call.clone(), job.payload.clone(), job.base_version))
    }

    async fn send(
        &self,
        id: Uuid,
        key: &CacheKey,
        call: &ServerCall,
        payload: Value,
        base_version: Option<u64>,
    ) -> Result<ServerAck> {
        match call {
            ServerCall::Request(template) => {
                let mut request = Request::new(template.method, template.endpoint.clone())
                    .with_base_version(base_version)
                    .with_idempotency_key(id.to_string());
                if template.kind != ActionKind::Delete {
                    request = request.with_body(payload);
                }
                let operation = format!("{} {}", template.method, template.endpoint);
                self.perf
                    .track(
                        &operation,
                        request_with_timeout(self.transport.as_ref(), request, self.timeout),
                    )
                    .await
                    .and_then(|response| match template.kind {
                        ActionKind::Delete => ServerAck::from_delete_response(response, base_version),
                        _ => ServerAck::from_response(response),
                    })
            }
            ServerCall::Custom(custom) => {
                let request = WriteRequest {
                    key: key.clone(),
                    payload,
                    base_version,
                    idempotency_key: id.to_string(),
                };
                let operation = format!("mutate {}", key.entity_type());
                let timeout = self.timeout;
                self.perf
                    .track(&operation, async {
                        tokio::time::timeout(timeout, custom(request))
                            .await
                            .unwrap_or(Err(SyncError::Timeout(timeout.as_millis() as u64)))
                    })
                    .await
            }
        }
    }

    /// Re-reads the entity when a conflict left out the server's state.
    async fn complete(&self, call: &ServerCall, err: SyncError) -> SyncError {
        match call {
            ServerCall::Request(template) if template.kind != ActionKind::Create => {
                complete_conflict(self.transport.as_ref(), &template.endpoint, self.timeout, err).await
            }
            _ => err,
        }
    }

    // == Outcomes ==
    fn on_ack(&self, id: Uuid, key: &CacheKey, ack: ServerAck, may_resubmit: bool) -> Step {
        match self.reconciler.confirm_write(key, id, &ack) {
            Confirmation::Confirmed { key: settled } => {
                if &settled != key {
                    self.replace_key(key, &settled);
                }
                self.rebase_waiting(&settled, id, ack.version);
                self.queue.rebase(settled.as_str(), ack.version);
                self.finish(id, MutationStatus::Confirmed, Some(ack), None);
                Step::Done(settled)
            }
            Confirmation::Superseded {
                server_version,
                server_value,
            } => self.on_conflict(id, key, Some(server_version), server_value, may_resubmit),
        }
    }

    fn on_conflict(
        &self,
        id: Uuid,
        key: &CacheKey,
        server_version: Option<u64>,
        server_value: Option<Value>,
        may_resubmit: bool,
    ) -> Step {
        let key = key.clone();
        let patch = self
            .monitor
            .get(id)
            .map(|m| m.patch)
            .unwrap_or(Value::Null);
        self.set_status(id, MutationStatus::Conflicted);

        let conflict = Conflict {
            mutation_id: id,
            key: key.clone(),
            patch,
            local_value: self.store().peek(&key).map(|e| e.value),
            server_version,
            server_value: server_value.clone(),
            detected_at: Utc::now(),
        };
        warn!(mutation = %id, %key, ?server_version, "write conflict");
        self.monitor.record_conflict(conflict.clone());

        let resolver = Arc::clone(&self.resolver.read());
        let mut resolution = resolver.resolve(&conflict);
        if matches!(resolution, Resolution::Accept(_)) {
            if !may_resubmit {
                warn!(mutation = %id, "conflict persists after resubmission; server wins");
                resolution = Resolution::KeepServer;
            } else if server_version.is_none() {
                warn!(mutation = %id, "server version unknown; cannot resubmit");
                resolution = Resolution::KeepServer;
            }
        }

        self.reconciler
            .adopt_server(&key, id, server_version, server_value);
        match (resolution, server_version) {
            (Resolution::Accept(value), Some(server_version)) => {
                info!(mutation = %id, %key, "resubmitting resolved value");
                self.reconciler
                    .push_write(&key, id, LocalEffect::Merge(value.clone()));
                if let Some(job) = self.jobs.lock().get_mut(&id) {
                    job.payload = value.clone();
                    job.base_version = Some(server_version);
                }
                self.monitor.update(id, |m| {
                    m.patch = value.clone();
                    m.base_version = Some(server_version);
                });
                Step::Resubmit {
                    payload: value,
                    base_version: server_version,
                }
            }
            _ => {
                self.finish(
                    id,
                    MutationStatus::RolledBack,
                    None,
                    Some(SyncError::Conflict {
                        server_version,
                        server_value: conflict.server_value,
                    }),
                );
                Step::Done(key)
            }
        }
    }

    fn rollback(&self, id: Uuid, error: SyncError) {
        if let Some(key) = self.job_key(id) {
            self.reconciler.drop_write(&key, id);
            warn!(mutation = %id, %key, error = %error, "mutation rolled back");
        }
        self.finish(id, MutationStatus::RolledBack, None, Some(error));
    }

    fn finish(&self, id: Uuid, status: MutationStatus, ack: Option<ServerAck>, error: Option<SyncError>) {
        let Some(job) = self.jobs.lock().remove(&id) else {
            return;
        };
        self.monitor.settle(id, status);
        job.state.send_replace(MutationState {
            status,
            key: job.key,
            ack,
            error,
        });
        debug!(mutation = %id, ?status, "mutation settled");
    }

    fn set_status(&self, id: Uuid, status: MutationStatus) {
        self.monitor.update(id, |m| m.status = status);
        if let Some(job) = self.jobs.lock().get(&id) {
            job.state.send_modify(|s| s.status = status);
        }
    }

    fn job_key(&self, id: Uuid) -> Option<CacheKey> {
        self.jobs.lock().get(&id).map(|j| j.key.clone())
    }

    /// Later writes on the same key now sit on top of `version`.
    fn rebase_waiting(&self, key: &CacheKey, settled: Uuid, version: u64) {
        let mut jobs = self.jobs.lock();
        for (id, job) in jobs.iter_mut() {
            if *id != settled && &job.key == key {
                job.base_version = Some(version);
            }
        }
    }

    /// Points every live reference to a placeholder key at the server key.
    fn replace_key(&self, from: &CacheKey, to: &CacheKey) {
        self.aliases.lock().insert(
            from.clone(),
            Alias {
                target: to.clone(),
                created_at: current_timestamp_ms(),
            },
        );
        for job in self.jobs.lock().values_mut() {
            if &job.key != from {
                continue;
            }
            if let (ServerCall::Request(template), Some(old), Some(new)) =
                (&mut job.call, from.id(), to.id())
            {
                template.endpoint = template.endpoint.replace(old, new);
            }
            job.key = to.clone();
            job.state.send_modify(|s| s.key = to.clone());
        }
        if let (Some(old), Some(new)) = (from.id(), to.id()) {
            self.queue.rewrite_entity(from.entity_type(), old, new);
        }
        info!(%from, %to, "placeholder replaced by server id");
    }

    // == Offline ==
    fn park(
        &self,
        id: Uuid,
        template: &ActionTemplate,
        key: &CacheKey,
        payload: Value,
        base_version: Option<u64>,
    ) {
        let mut action = QueuedAction::from_template(
            template,
            key,
            payload,
            base_version,
            self.queue.default_max_retries(),
        );
        action.mutation_id = Some(id);
        if self.monitor.get(id).is_some_and(|m| m.queued) {
            // Resubmissions must not reuse the idempotency key of the rejected attempt.
            action.id = Uuid::new_v4();
        } else {
            action.id = id;
        }
        self.queue.queue_action(action);
        self.monitor.update(id, |m| m.queued = true);
        debug!(mutation = %id, %key, "mutation parked in offline queue");
    }

    fn complete_offline(&self, id: Uuid, result: Result<ServerAck>) -> bool {
        let Some(key) = self.job_key(id) else {
            return false;
        };
        let step = match result {
            Ok(ack) => self.on_ack(id, &key, ack, true),
            Err(SyncError::Conflict {
                server_version,
                server_value,
            }) => self.on_conflict(id, &key, server_version, server_value, true),
            Err(err) => {
                self.rollback(id, err);
                return true;
            }
        };
        if let Step::Resubmit {
            payload,
            base_version,
        } = step
        {
            let parked = {
                let jobs = self.jobs.lock();
                jobs.get(&id).and_then(|job| match &job.call {
                    ServerCall::Request(template) => Some((template.clone(), job.key.clone())),
                    ServerCall::Custom(_) => None,
                })
            };
            if let Some((template, key)) = parked {
                self.park(id, &template, &key, payload, Some(base_version));
            }
        }
        true
    }

    // == Cancel ==
    pub(crate) fn cancel(&self, id: Uuid) -> bool {
        let removed = {
            let mut lanes = self.lanes.lock();
            lanes.values_mut().any(|queue| {
                let before = queue.waiting.len();
                queue.waiting.retain(|waiting| *waiting != id);
                queue.waiting.len() != before
            })
        };
        if !removed {
            return false;
        }
        if let Some(key) = self.job_key(id) {
            self.reconciler.drop_write(&key, id);
        }
        self.finish(id, MutationStatus::RolledBack, None, Some(SyncError::Cancelled));
        info!(mutation = %id, "mutation cancelled");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntryStatus;
    use crate::offline::MemoryPersistence;
    use crate::transport::fake::FakeServer;
    use crate::transport::Response;
    use async_trait::async_trait;
    use serde_json::json;

    /// Answers every DELETE with an empty 204.
    struct NoContentDeletes;

    #[async_trait]
    impl Transport for NoContentDeletes {
        async fn request(&self, _request: Request) -> Result<Response> {
            Ok(Response {
                status: 204,
                body: Value::Null,
                version: None,
            })
        }
    }

    struct Harness {
        store: CacheStore,
        server: Arc<FakeServer>,
        network: NetworkStatus,
        queue: Arc<OfflineActionQueue>,
        engine: OptimisticMutationEngine,
    }

    fn harness() -> Harness {
        let server = Arc::new(FakeServer::new());
        harness_with(server.clone(), server)
    }

    fn harness_with(server: Arc<FakeServer>, transport: Arc<dyn Transport>) -> Harness {
        let store = CacheStore::new();
        let network = NetworkStatus::new(true);
        let queue = Arc::new(OfflineActionQueue::new(Arc::new(MemoryPersistence::new()), 3));
        let engine = OptimisticMutationEngine::new(
            Arc::new(Reconciler::new(store.clone())),
            transport,
            Arc::new(PerformanceMonitor::default()),
            queue.clone(),
            network.clone(),
            Duration::from_secs(5),
        );
        Harness {
            store,
            server,
            network,
            queue,
            engine,
        }
    }

    fn key(raw: &str) -> CacheKey {
        CacheKey::from(raw)
    }

    #[tokio::test]
    async fn test_patch_visible_immediately_then_confirmed() {
        let h = harness();
        h.server.seed("/clients/1", json!({"name": "A", "tier": 1}), 1);
        h.store.set(key("client:1"), json!({"id": "1", "name": "A", "tier": 1, "version": 1}), 1);

        let mut handle = h.engine.mutate(
            key("client:1"),
            json!({"name": "B"}),
            ServerCall::Request(ActionTemplate::update("/clients/1")),
        );
        assert_eq!(handle.status(), MutationStatus::Applied);
        let entry = h.store.peek(&key("client:1")).unwrap();
        assert_eq!(entry.value["name"], "B");
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(h.engine.pending_count(), 1);

        let ack = handle.outcome().await.unwrap();
        assert_eq!(ack.version, 2);
        let entry = h.store.peek(&key("client:1")).unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.status, EntryStatus::Fresh);
        assert_eq!(entry.value["name"], "B");
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_restores_snapshot_exactly() {
        let h = harness();
        h.server.seed("/clients/1", json!({"name": "A"}), 4);
        h.store.set(key("client:1"), json!({"name": "A"}), 4);
        let before = h.store.peek(&key("client:1"));
        h.server.fail_next(SyncError::Validation("name taken".into()));

        let mut handle = h.engine.mutate(
            key("client:1"),
            json!({"name": "Taken"}),
            ServerCall::Request(ActionTemplate::update("/clients/1")),
        );
        let result = handle.outcome().await;
        assert_eq!(result, Err(SyncError::Validation("name taken".into())));
        assert_eq!(handle.status(), MutationStatus::RolledBack);
        assert_eq!(h.store.peek(&key("client:1")), before);
    }

    #[tokio::test]
    async fn test_same_key_calls_are_serialized_in_order() {
        let h = harness();
        h.server.seed("/deals/1", json!({"stage": "lead"}), 1);
        h.store.set(key("deal:1"), json!({"stage": "lead"}), 1);
        h.server.set_latency(Some(Duration::from_millis(5)));

        let mut handles: Vec<_> = ["qualified", "proposal", "won"]
            .iter()
            .map(|stage| {
                h.engine.mutate(
                    key("deal:1"),
                    json!({ "stage": stage }),
                    ServerCall::Request(ActionTemplate::update("/deals/1")),
                )
            })
            .collect();
        assert_eq!(h.store.peek(&key("deal:1")).unwrap().value["stage"], "won");

        for handle in handles.iter_mut() {
            handle.outcome().await.unwrap();
        }
        let entry = h.store.peek(&key("deal:1")).unwrap();
        assert_eq!(entry.value["stage"], "won");
        assert_eq!(entry.version, 4);
        let stages: Vec<_> = h
            .server
            .requests()
            .iter()
            .map(|r| r.body.as_ref().unwrap()["stage"].clone())
            .collect();
        assert_eq!(stages, vec![json!("qualified"), json!("proposal"), json!("won")]);
    }

    #[tokio::test]
    async fn test_create_replaces_placeholder_everywhere() {
        let h = harness();
        let temp = CacheKey::temp("client");
        let temp_id = temp.id().unwrap().to_string();
        h.store.set(key("deal:7"), json!({"client_id": temp_id}), 1);

        let mut handle = h.engine.mutate(
            temp.clone(),
            json!({"name": "Newco"}),
            ServerCall::Request(ActionTemplate::create("/clients")),
        );
        assert!(h.store.contains(&temp));

        let ack = handle.outcome().await.unwrap();
        let real = CacheKey::entity("client", ack.id.unwrap());
        assert!(!h.store.contains(&temp));
        assert_eq!(h.store.peek(&real).unwrap().value["name"], "Newco");
        assert_eq!(h.store.peek(&key("deal:7")).unwrap().value["client_id"], json!(real.id().unwrap()));
        assert_eq!(handle.state().key, real);
    }

    #[tokio::test]
    async fn test_offline_mutation_is_parked() {
        let h = harness();
        h.store.set(key("client:1"), json!({"name": "A"}), 1);
        h.network.set_online(false);

        let handle = h.engine.mutate(
            key("client:1"),
            json!({"name": "B"}),
            ServerCall::Request(ActionTemplate::update("/clients/1")),
        );
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.queue.pending_count(), 1);
        let action = &h.queue.actions()[0];
        assert_eq!(action.mutation_id, Some(handle.id()));
        assert_eq!(action.base_version, Some(1));
        assert_eq!(handle.status(), MutationStatus::Applied);
        assert_eq!(h.store.peek(&key("client:1")).unwrap().status, EntryStatus::Pending);
        assert!(h.server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_server_wins_by_default() {
        let h = harness();
        h.server.seed("/clients/1", json!({"name": "Server"}), 3);
        h.store.set(key("client:1"), json!({"name": "Old"}), 2);

        let mut handle = h.engine.mutate(
            key("client:1"),
            json!({"name": "Mine"}),
            ServerCall::Request(ActionTemplate::update("/clients/1")),
        );
        let result = handle.outcome().await;
        assert!(matches!(result, Err(SyncError::Conflict { server_version: Some(3), .. })));

        let entry = h.store.peek(&key("client:1")).unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.value["name"], "Server");
        assert_eq!(h.engine.conflicts().len(), 1);
    }

    #[tokio::test]
    async fn test_custom_resolver_resubmits() {
        let h = harness();
        h.server.seed("/clients/1", json!({"name": "Server", "phone": "1"}), 3);
        h.store.set(key("client:1"), json!({"name": "Old", "phone": "1"}), 2);
        h.engine.set_resolver(|c: &Conflict| {
            let server = c.server_value.clone().unwrap_or(Value::Null);
            Resolution::Accept(crate::cache::shallow_merge(&server, &c.patch))
        });

        let mut handle = h.engine.mutate(
            key("client:1"),
            json!({"phone": "2"}),
            ServerCall::Request(ActionTemplate::update("/clients/1")),
        );
        let ack = handle.outcome().await.unwrap();
        assert_eq!(ack.version, 4);
        let entry = h.store.peek(&key("client:1")).unwrap();
        assert_eq!(entry.value["name"], "Server");
        assert_eq!(entry.value["phone"], "2");
        assert_eq!(entry.status, EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn test_custom_call_failure_rolls_back() {
        let h = harness();
        let mut handle = h.engine.mutate(
            key("note:1"),
            json!({"text": "hi"}),
            ServerCall::custom(|_req| async { Err(SyncError::Network("down".into())) }),
        );
        assert!(h.store.contains(&key("note:1")));
        assert_eq!(handle.outcome().await, Err(SyncError::Network("down".into())));
        assert!(!h.store.contains(&key("note:1")));
    }

    #[tokio::test]
    async fn test_cancel_before_start_relayers() {
        let h = harness();
        h.server.seed("/deals/1", json!({"a": 0}), 1);
        h.store.set(key("deal:1"), json!({"a": 0}), 1);
        h.server.set_latency(Some(Duration::from_millis(20)));

        let mut first = h.engine.mutate(
            key("deal:1"),
            json!({"a": 1}),
            ServerCall::Request(ActionTemplate::update("/deals/1")),
        );
        tokio::task::yield_now().await;
        let second = h.engine.mutate(
            key("deal:1"),
            json!({"b": 2}),
            ServerCall::Request(ActionTemplate::update("/deals/1")),
        );
        assert!(second.cancel());
        assert!(!first.cancel());
        assert_eq!(second.status(), MutationStatus::RolledBack);
        assert_eq!(h.store.peek(&key("deal:1")).unwrap().value, json!({"a": 1}));

        first.outcome().await.unwrap();
        assert!(h.store.peek(&key("deal:1")).unwrap().value.get("b").is_none());
    }

    #[test]
    fn test_mutate_without_runtime_rolls_back() {
        let h = harness();
        h.store.set(key("client:1"), json!({"name": "A"}), 1);
        let handle = h.engine.mutate(
            key("client:1"),
            json!({"name": "B"}),
            ServerCall::Request(ActionTemplate::update("/clients/1")),
        );
        assert_eq!(handle.status(), MutationStatus::RolledBack);
        assert_eq!(h.store.peek(&key("client:1")).unwrap().value["name"], "A");
    }

    #[tokio::test]
    async fn test_bare_conflict_rereads_server_state() {
        let h = harness();
        h.server.seed("/clients/1", json!({"name": "Winner"}), 5);
        h.store.set(key("client:1"), json!({"name": "Old"}), 3);
        h.server.fail_next(SyncError::Conflict {
            server_version: None,
            server_value: None,
        });

        let mut handle = h.engine.mutate(
            key("client:1"),
            json!({"name": "Mine"}),
            ServerCall::Request(ActionTemplate::update("/clients/1")),
        );
        let result = handle.outcome().await;
        assert!(matches!(result, Err(SyncError::Conflict { server_version: Some(5), .. })));

        let entry = h.store.peek(&key("client:1")).unwrap();
        assert_eq!(entry.version, 5);
        assert_eq!(entry.value["name"], "Winner");
        assert_eq!(entry.status, EntryStatus::Fresh);
        assert_eq!(h.engine.conflicts()[0].server_version, Some(5));
    }

    #[tokio::test]
    async fn test_bare_conflict_from_custom_call_leaves_entry_stale() {
        let h = harness();
        h.store.set(key("note:1"), json!({"text": "old"}), 2);
        h.engine.set_resolver(|c: &Conflict| Resolution::Accept(c.patch.clone()));

        let mut handle = h.engine.mutate(
            key("note:1"),
            json!({"text": "mine"}),
            ServerCall::custom(|_req| async {
                Err(SyncError::Conflict {
                    server_version: None,
                    server_value: None,
                })
            }),
        );
        let result = handle.outcome().await;
        assert!(matches!(result, Err(SyncError::Conflict { server_version: None, .. })));

        let entry = h.store.peek(&key("note:1")).unwrap();
        assert_eq!(entry.value["text"], "old");
        assert_eq!(entry.version, 2);
        assert_eq!(entry.status, EntryStatus::Stale);
    }

    #[tokio::test]
    async fn test_empty_delete_reply_confirms_and_tombstones() {
        let server = Arc::new(FakeServer::new());
        let h = harness_with(server, Arc::new(NoContentDeletes));
        h.store.set(key("client:1"), json!({"name": "A"}), 3);
        let reconciler = h.engine.inner.reconciler.clone();

        let mut handle = h.engine.mutate(
            key("client:1"),
            Value::Null,
            ServerCall::Request(ActionTemplate::delete("/clients/1")),
        );
        assert!(!h.store.contains(&key("client:1")));

        let ack = handle.outcome().await.unwrap();
        assert!(ack.deleted);
        assert_eq!(ack.version, 4);
        assert_eq!(handle.status(), MutationStatus::Confirmed);
        assert!(!h.store.contains(&key("client:1")));
        assert_eq!(reconciler.tombstone(&key("client:1")), Some(4));
    }

    #[tokio::test]
    async fn test_aliases_pruned_once_unreferenced() {
        let h = harness();
        let temp = CacheKey::temp("client");
        let mut handle = h.engine.mutate(
            temp,
            json!({"name": "Newco"}),
            ServerCall::Request(ActionTemplate::create("/clients")),
        );
        handle.outcome().await.unwrap();
        assert_eq!(h.engine.alias_count(), 1);

        assert_eq!(h.engine.prune_aliases(60_000), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.engine.prune_aliases(0), 1);
        assert_eq!(h.engine.alias_count(), 0);
    }
}
