//! Sync Client
//!
//! Wires the cache, mutation engine, offline queue, cross-tab bus and
//! realtime channel around one shared [`CacheStore`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::cache::{
    CacheEntry, CacheEvent, CacheInvalidator, CacheKey, CacheMemoryManager, CacheStats,
    CacheStore, CacheWarmer, EndpointResolver, Fetcher, Subscription, WarmPlan, WarmReport,
};
use crate::config::Config;
use crate::crosstab::{invalidate_payload, CacheBridge, CrossTabHub, CrossTabSyncBus, MessageKind};
use crate::error::Result;
use crate::monitor::{Alert, MetricsSnapshot, PerformanceMonitor, Thresholds};
use crate::mutation::{Conflict, ConflictResolver, MutationHandle, OptimisticMutationEngine, ServerCall};
use crate::offline::{
    BackgroundSyncEngine, NetworkStatus, OfflineActionQueue, QueuePersistence, QueueStatus,
    QueuedAction, SyncReport,
};
use crate::realtime::{ConnectionStatus, RealtimeChannel, RealtimeMetrics, Socket};
use crate::reconcile::Reconciler;
use crate::transport::Transport;

// == Builder ==
pub struct SyncClientBuilder {
    config: Config,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn QueuePersistence>,
    network: NetworkStatus,
    resolver: Option<EndpointResolver>,
    hub: Option<CrossTabHub>,
    realtime: Option<(String, Arc<dyn Socket>)>,
}

impl SyncClientBuilder {
    /// Shares connectivity state with whatever detects it.
    pub fn network(mut self, network: NetworkStatus) -> Self {
        self.network = network;
        self
    }

    /// Endpoint lookup for keys never fetched through a warm plan.
    pub fn endpoint_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&CacheKey) -> Option<String> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn cross_tab(mut self, hub: CrossTabHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn realtime(mut self, url: impl Into<String>, socket: Arc<dyn Socket>) -> Self {
        self.realtime = Some((url.into(), socket));
        self
    }

    pub fn build(self) -> SyncClient {
        let config = self.config;
        let store = CacheStore::new();
        let reconciler = Arc::new(Reconciler::new(store.clone()));
        let perf = Arc::new(PerformanceMonitor::new(
            config.metrics_window(),
            Thresholds {
                max_avg_latency_ms: Some(config.latency_alert_ms),
                max_error_rate: Some(config.error_rate_alert),
                ..Thresholds::default()
            },
        ));
        let timeout = config.request_timeout();

        let fetcher = Arc::new(Fetcher::new(
            reconciler.clone(),
            self.transport.clone(),
            perf.clone(),
            timeout,
            self.resolver,
        ));
        let queue = Arc::new(OfflineActionQueue::new(
            self.persistence,
            config.default_max_retries,
        ));
        let mutations = OptimisticMutationEngine::new(
            reconciler.clone(),
            self.transport.clone(),
            perf.clone(),
            queue.clone(),
            self.network.clone(),
            timeout,
        );
        let sync = BackgroundSyncEngine::new(
            queue.clone(),
            self.transport,
            reconciler.clone(),
            mutations.clone(),
            self.network.clone(),
            perf.clone(),
            timeout,
            config.sync_interval(),
        );
        let cross_tab = self
            .hub
            .map(|hub| CrossTabSyncBus::new(hub, config.heartbeat_interval()));
        let realtime = self
            .realtime
            .map(|(url, socket)| {
                RealtimeChannel::new(url, socket, reconciler.clone()).with_connect_timeout(timeout)
            });

        SyncClient {
            memory: CacheMemoryManager::new(store.clone()),
            warmer: CacheWarmer::new(fetcher.clone()),
            invalidator: CacheInvalidator::new(fetcher, perf.clone()),
            config,
            store,
            reconciler,
            mutations,
            queue,
            sync,
            network: self.network,
            perf,
            cross_tab,
            bridge: parking_lot::Mutex::new(None),
            realtime,
        }
    }
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub evicted: usize,
    pub tombstones: usize,
    pub aliases: usize,
}

impl MaintenanceReport {
    pub fn total(&self) -> usize {
        self.expired + self.evicted + self.tombstones + self.aliases
    }
}

// == Sync Client ==
pub struct SyncClient {
    config: Config,
    store: CacheStore,
    reconciler: Arc<Reconciler>,
    memory: CacheMemoryManager,
    warmer: CacheWarmer,
    invalidator: CacheInvalidator,
    mutations: OptimisticMutationEngine,
    queue: Arc<OfflineActionQueue>,
    sync: BackgroundSyncEngine,
    network: NetworkStatus,
    perf: Arc<PerformanceMonitor>,
    cross_tab: Option<CrossTabSyncBus>,
    bridge: parking_lot::Mutex<Option<CacheBridge>>,
    realtime: Option<RealtimeChannel>,
}

impl SyncClient {
    pub fn builder(
        config: Config,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn QueuePersistence>,
    ) -> SyncClientBuilder {
        SyncClientBuilder {
            config,
            transport,
            persistence,
            network: NetworkStatus::default(),
            resolver: None,
            hub: None,
            realtime: None,
        }
    }

    /// Starts background sync, the cross-tab bus and the realtime channel.
    /// Must be called inside a tokio runtime.
    pub fn start(&self) {
        self.sync.start();
        if let Some(bus) = &self.cross_tab {
            bus.start();
            let mut bridge = self.bridge.lock();
            if bridge.is_none() {
                *bridge = Some(CacheBridge::attach(bus, self.reconciler.clone()));
            }
        }
        if let Some(realtime) = &self.realtime {
            realtime.start();
        }
    }

    pub fn shutdown(&self) {
        self.sync.shutdown();
        if let Some(realtime) = &self.realtime {
            realtime.shutdown();
        }
        self.bridge.lock().take();
        if let Some(bus) = &self.cross_tab {
            bus.close();
        }
    }

    // == Reads ==
    /// Stale-while-revalidate read.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.invalidator.get(key)
    }

    pub fn subscribe<F>(&self, key: &CacheKey, callback: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(key, callback)
    }

    pub fn register_warm_plan(&self, target: impl Into<String>, plans: Vec<WarmPlan>) {
        self.warmer.register(target, plans);
    }

    pub async fn warm(&self, target: &str) -> Result<WarmReport> {
        self.warmer.warm(target).await
    }

    /// Marks an entity type stale here and in every other instance.
    pub fn invalidate(&self, entity_type: &str) -> Vec<CacheKey> {
        let keys = self.invalidator.invalidate(entity_type);
        if let Some(bus) = &self.cross_tab {
            bus.broadcast(MessageKind::CacheInvalidate, invalidate_payload(entity_type));
        }
        keys
    }

    // == Writes ==
    pub fn mutate(&self, key: CacheKey, patch: Value, call: ServerCall) -> MutationHandle {
        self.mutations.mutate(key, patch, call)
    }

    pub fn queue_action(&self, action: QueuedAction) -> Uuid {
        self.queue.queue_action(action)
    }

    pub fn set_conflict_resolver(&self, resolver: impl ConflictResolver + 'static) {
        self.mutations.set_resolver(resolver);
    }

    pub async fn sync_now(&self) -> SyncReport {
        self.sync.sync_now().await
    }

    // == Monitors ==
    pub fn pending_count(&self) -> usize {
        self.mutations.pending_count()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.mutations.conflicts()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.sync.queue_status()
    }

    pub fn network_status(&self) -> bool {
        self.network.is_online()
    }

    pub fn realtime_status(&self) -> Option<ConnectionStatus> {
        self.realtime.as_ref().map(RealtimeChannel::status)
    }

    pub fn realtime_metrics(&self) -> Option<RealtimeMetrics> {
        self.realtime.as_ref().map(RealtimeChannel::metrics)
    }

    pub fn other_tabs_count(&self) -> usize {
        self.cross_tab
            .as_ref()
            .map(CrossTabSyncBus::other_tabs_count)
            .unwrap_or(0)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.memory.get_cache_stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.perf.metrics()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.perf.alerts()
    }

    // == Maintenance ==
    /// Drops expired entries, trims the cache to its cap and forgets delete
    /// tombstones and replaced placeholders older than the stale TTL.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let ttl = self.config.stale_ttl();
        let ttl_ms = ttl.as_millis() as u64;
        MaintenanceReport {
            expired: self.memory.cleanup_stale_entries(ttl).len(),
            evicted: self.memory.implement_lru_eviction(self.config.max_entries).len(),
            tombstones: self.reconciler.prune_tombstones(ttl_ms),
            aliases: self.mutations.prune_aliases(ttl_ms),
        }
    }

    // == Components ==
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn memory(&self) -> &CacheMemoryManager {
        &self.memory
    }

    pub fn invalidator(&self) -> &CacheInvalidator {
        &self.invalidator
    }

    pub fn mutations(&self) -> &OptimisticMutationEngine {
        &self.mutations
    }

    pub fn queue(&self) -> &Arc<OfflineActionQueue> {
        &self.queue
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    pub fn perf(&self) -> &Arc<PerformanceMonitor> {
        &self.perf
    }

    pub fn realtime(&self) -> Option<&RealtimeChannel> {
        self.realtime.as_ref()
    }

    pub fn cross_tab(&self) -> Option<&CrossTabSyncBus> {
        self.cross_tab.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{ActionTemplate, MemoryPersistence};
    use crate::realtime::MemorySocket;
    use crate::transport::fake::FakeServer;
    use serde_json::json;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn client(server: &Arc<FakeServer>, hub: &CrossTabHub) -> SyncClient {
        SyncClient::builder(
            Config::default(),
            server.clone(),
            Arc::new(MemoryPersistence::new()),
        )
        .endpoint_resolver(|key| key.id().map(|id| format!("/{}s/{}", key.entity_type(), id)))
        .cross_tab(hub.clone())
        .build()
    }

    #[tokio::test]
    async fn test_confirmed_write_reaches_other_tab() {
        let server = Arc::new(FakeServer::new());
        server.seed("/clients/1", json!({"name": "A"}), 1);
        let hub = CrossTabHub::default();
        let a = client(&server, &hub);
        let b = client(&server, &hub);
        a.start();
        b.start();
        a.store().set(CacheKey::from("client:1"), json!({"name": "A", "version": 1}), 1);

        let mut handle = a.mutate(
            CacheKey::from("client:1"),
            json!({"name": "B"}),
            ServerCall::Request(ActionTemplate::update("/clients/1")),
        );
        handle.outcome().await.unwrap();
        settle().await;

        let seen = b.store().peek(&CacheKey::from("client:1")).unwrap();
        assert_eq!(seen.value["name"], "B");
        assert_eq!(seen.version, 2);
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_warm_then_read() {
        let server = Arc::new(FakeServer::new());
        server.seed("/deals/7", json!({"stage": "open"}), 4);
        let hub = CrossTabHub::default();
        let client = client(&server, &hub);
        client.register_warm_plan("pipeline", vec![WarmPlan::new("deal:7", "/deals/7")]);

        let report = client.warm("pipeline").await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(client.get(&CacheKey::from("deal:7")).unwrap().version, 4);
        assert_eq!(client.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_realtime_wiring() {
        let server = Arc::new(FakeServer::new());
        let socket = Arc::new(MemorySocket::new());
        let client = SyncClient::builder(
            Config::default(),
            server,
            Arc::new(MemoryPersistence::new()),
        )
        .realtime("mem://events", socket.clone())
        .build();
        client.start();
        settle().await;
        assert_eq!(client.realtime_status(), Some(ConnectionStatus::Connected));

        socket.push(json!({"type": "change", "key": "client:9", "value": {}, "version": 3}).to_string());
        settle().await;
        assert_eq!(client.store().peek(&CacheKey::from("client:9")).unwrap().version, 3);
        assert_eq!(client.realtime_metrics().unwrap().messages_applied, 1);
        client.shutdown();
    }
}
