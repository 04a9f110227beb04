//! Cache Warming and Invalidation
//!
//! Prefetch of declared key sets ahead of navigation, and stale-while-
//! revalidate reads after an entity type has been invalidated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{current_timestamp_ms, CacheEntry, CacheKey, CacheStore, EntryStatus};
use crate::error::{Result, SyncError};
use crate::monitor::PerformanceMonitor;
use crate::reconcile::{Origin, ReconcileOutcome, Reconciler, RemoteChange};
use crate::transport::{request_with_timeout, Request, Transport};

/// Maps a key to the endpoint that serves it, for keys never fetched before.
pub type EndpointResolver = Arc<dyn Fn(&CacheKey) -> Option<String> + Send + Sync>;

// == Warm Plan ==
/// One prefetch: where to read and which key to fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmPlan {
    pub key: CacheKey,
    pub endpoint: String,
}

impl WarmPlan {
    pub fn new(key: impl Into<CacheKey>, endpoint: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub fetched: usize,
    /// Already fresh, not refetched
    pub skipped: usize,
    pub failed: usize,
}

// == Fetcher ==
/// Shared read path: GET an endpoint and reconcile the result by version.
pub(crate) struct Fetcher {
    reconciler: Arc<Reconciler>,
    transport: Arc<dyn Transport>,
    monitor: Arc<PerformanceMonitor>,
    timeout: Duration,
    endpoints: RwLock<HashMap<CacheKey, String>>,
    resolver: Option<EndpointResolver>,
}

impl Fetcher {
    pub(crate) fn new(
        reconciler: Arc<Reconciler>,
        transport: Arc<dyn Transport>,
        monitor: Arc<PerformanceMonitor>,
        timeout: Duration,
        resolver: Option<EndpointResolver>,
    ) -> Self {
        Self {
            reconciler,
            transport,
            monitor,
            timeout,
            endpoints: RwLock::new(HashMap::new()),
            resolver,
        }
    }

    fn store(&self) -> &CacheStore {
        self.reconciler.store()
    }

    fn endpoint_for(&self, key: &CacheKey) -> Option<String> {
        self.endpoints
            .read()
            .get(key)
            .cloned()
            .or_else(|| self.resolver.as_ref().and_then(|resolve| resolve(key)))
    }

    async fn fetch(&self, key: &CacheKey, endpoint: &str) -> Result<ReconcileOutcome> {
        self.endpoints
            .write()
            .insert(key.clone(), endpoint.to_string());

        let operation = format!("GET {}", endpoint);
        let fetched = self
            .monitor
            .track(
                &operation,
                request_with_timeout(self.transport.as_ref(), Request::get(endpoint), self.timeout),
            )
            .await;

        match fetched {
            Ok(response) => {
                // Query results without a version are ordered by fetch time.
                let version = response
                    .entity_version()
                    .unwrap_or_else(current_timestamp_ms);
                let change = RemoteChange::upsert(key.clone(), response.body, version);
                Ok(self.reconciler.apply_remote(change, Origin::Refetch))
            }
            Err(err) => {
                self.store().mark_error(key);
                Err(err)
            }
        }
    }
}

// == Cache Warmer ==
pub struct CacheWarmer {
    fetcher: Arc<Fetcher>,
    targets: RwLock<HashMap<String, Vec<WarmPlan>>>,
}

impl CacheWarmer {
    pub(crate) fn new(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Declares the keys to prefetch for a route or entity type.
    pub fn register(&self, target: impl Into<String>, plans: Vec<WarmPlan>) {
        self.targets.write().insert(target.into(), plans);
    }

    // == Warm ==
    /// Prefetches every declared key for `target` that is missing or not fresh.
    pub async fn warm(&self, target: &str) -> Result<WarmReport> {
        let plans = self
            .targets
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| SyncError::InvalidRequest(format!("no warm plan for '{}'", target)))?;

        let mut report = WarmReport::default();
        let mut due = Vec::new();
        for plan in plans {
            let fresh = self
                .fetcher
                .store()
                .peek(&plan.key)
                .is_some_and(|e| matches!(e.status, EntryStatus::Fresh | EntryStatus::Pending));
            if fresh {
                report.skipped += 1;
            } else {
                due.push(plan);
            }
        }

        let results = join_all(
            due.iter()
                .map(|plan| self.fetcher.fetch(&plan.key, &plan.endpoint)),
        )
        .await;
        for (plan, result) in due.iter().zip(results) {
            match result {
                Ok(_) => report.fetched += 1,
                Err(err) => {
                    warn!(key = %plan.key, error = %err, "prefetch failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            target,
            fetched = report.fetched,
            skipped = report.skipped,
            failed = report.failed,
            "cache warmed"
        );
        Ok(report)
    }
}

// == Cache Invalidator ==
pub struct CacheInvalidator {
    fetcher: Arc<Fetcher>,
    monitor: Arc<PerformanceMonitor>,
    refreshing: Arc<Mutex<HashSet<CacheKey>>>,
}

impl CacheInvalidator {
    pub(crate) fn new(fetcher: Arc<Fetcher>, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            fetcher,
            monitor,
            refreshing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    // == Invalidate ==
    /// Marks every key of `entity_type` stale.
    pub fn invalidate(&self, entity_type: &str) -> Vec<CacheKey> {
        let keys = self
            .fetcher
            .store()
            .invalidate_where(|key| key.entity_type() == entity_type);
        debug!(entity_type, count = keys.len(), "invalidated entity type");
        keys
    }

    // == Get ==
    /// Returns the cached entry immediately; a stale or errored entry also
    /// starts one background refetch for its key.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.fetcher.store().get(key);
        self.monitor.record_cache_access(entry.is_some());
        if let Some(entry) = &entry {
            if matches!(entry.status, EntryStatus::Stale | EntryStatus::Error) {
                self.revalidate(key);
            }
        }
        entry
    }

    /// Spawns a refetch unless one is already running for `key`.
    pub fn revalidate(&self, key: &CacheKey) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(%key, "no runtime; skipping revalidation");
            return false;
        };
        let Some(endpoint) = self.fetcher.endpoint_for(key) else {
            debug!(%key, "no endpoint known; skipping revalidation");
            return false;
        };
        if !self.refreshing.lock().insert(key.clone()) {
            return false;
        }

        let fetcher = Arc::clone(&self.fetcher);
        let refreshing = Arc::clone(&self.refreshing);
        let key = key.clone();
        runtime.spawn(async move {
            if let Err(err) = fetcher.fetch(&key, &endpoint).await {
                warn!(%key, error = %err, "background refetch failed");
            }
            refreshing.lock().remove(&key);
        });
        true
    }

    /// Refetches `key` and waits for the result.
    pub async fn refetch(&self, key: &CacheKey) -> Result<ReconcileOutcome> {
        let endpoint = self
            .fetcher
            .endpoint_for(key)
            .ok_or_else(|| SyncError::NotFound(format!("no endpoint for {}", key)))?;
        self.fetcher.fetch(key, &endpoint).await
    }
}
