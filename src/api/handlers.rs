//! API Handlers
//!
//! HTTP request handlers for each inspection endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::cache::{CacheEntry, CacheKey};
use crate::client::SyncClient;
use crate::error::{Result, SyncError};
use crate::models::{
    ClearFailedResponse, ConflictsResponse, HealthResponse, InvalidateResponse, MetricsResponse,
    NetworkRequest, QueueResponse, RealtimeResponse, RetryResponse, StatsResponse,
};
use crate::offline::SyncReport;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<SyncClient>,
}

impl AppState {
    pub fn new(client: Arc<SyncClient>) -> Self {
        Self { client }
    }
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::healthy(
        state.client.network_status(),
        state.client.other_tabs_count(),
    ))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(state.client.cache_stats()))
}

/// Handler for GET /cache/:key
///
/// Reads without touching access order or hit counters.
pub async fn entry_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<CacheEntry>> {
    let key = CacheKey::new(key);
    state
        .client
        .store()
        .peek(&key)
        .map(Json)
        .ok_or_else(|| SyncError::NotFound(key.to_string()))
}

/// Handler for GET /queue
pub async fn queue_handler(State(state): State<AppState>) -> Json<QueueResponse> {
    Json(QueueResponse {
        status: state.client.queue_status(),
        actions: state.client.queue().actions(),
    })
}

/// Handler for POST /sync
pub async fn sync_handler(State(state): State<AppState>) -> Json<SyncReport> {
    Json(state.client.sync_now().await)
}

/// Handler for POST /queue/retry
pub async fn retry_failed_handler(State(state): State<AppState>) -> Json<RetryResponse> {
    Json(RetryResponse {
        requeued: state.client.queue().retry_failed(),
    })
}

/// Handler for DELETE /queue/failed
pub async fn clear_failed_handler(State(state): State<AppState>) -> Json<ClearFailedResponse> {
    Json(ClearFailedResponse {
        cleared: state.client.queue().clear_failed().len(),
    })
}

/// Handler for GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        metrics: state.client.metrics(),
        alerts: state.client.alerts(),
    })
}

/// Handler for GET /conflicts
pub async fn conflicts_handler(State(state): State<AppState>) -> Json<ConflictsResponse> {
    let monitor = state.client.mutations().monitor();
    Json(ConflictsResponse {
        pending_count: monitor.pending_count(),
        pending: monitor.pending(),
        conflicts: monitor.conflicts(),
    })
}

/// Handler for GET /realtime
pub async fn realtime_handler(State(state): State<AppState>) -> Json<RealtimeResponse> {
    let response = match state.client.realtime() {
        Some(channel) => RealtimeResponse {
            enabled: true,
            status: Some(channel.status()),
            metrics: Some(channel.metrics()),
            last_message: channel.last_message(),
        },
        None => RealtimeResponse::disabled(),
    };
    Json(response)
}

/// Handler for POST /invalidate/:entity_type
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
) -> Result<Json<InvalidateResponse>> {
    if entity_type.trim().is_empty() {
        return Err(SyncError::InvalidRequest("entity type cannot be empty".to_string()));
    }
    let invalidated = state.client.invalidate(&entity_type);
    Ok(Json(InvalidateResponse {
        entity_type,
        invalidated,
    }))
}

/// Handler for POST /network
pub async fn network_handler(
    State(state): State<AppState>,
    Json(req): Json<NetworkRequest>,
) -> Json<HealthResponse> {
    state.client.network().set_online(req.online);
    Json(HealthResponse::healthy(
        state.client.network_status(),
        state.client.other_tabs_count(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::offline::{ActionKind, MemoryPersistence, QueuedAction};
    use crate::transport::fake::FakeServer;
    use crate::transport::Method;
    use serde_json::json;

    fn state() -> AppState {
        let client = SyncClient::builder(
            Config::default(),
            Arc::new(FakeServer::new()),
            Arc::new(MemoryPersistence::new()),
        )
        .build();
        AppState::new(Arc::new(client))
    }

    #[tokio::test]
    async fn test_entry_handler() {
        let state = state();
        state
            .client
            .store()
            .set(CacheKey::from("client:1"), json!({"name": "A"}), 3);

        let entry = entry_handler(State(state.clone()), Path("client:1".to_string()))
            .await
            .unwrap();
        assert_eq!(entry.version, 3);

        let missing = entry_handler(State(state), Path("client:2".to_string())).await;
        assert!(matches!(missing, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalidate_handler() {
        let state = state();
        state.client.store().set(CacheKey::from("deal:1"), json!({}), 1);

        let response = invalidate_handler(State(state.clone()), Path("deal".to_string()))
            .await
            .unwrap();
        assert_eq!(response.invalidated, vec![CacheKey::from("deal:1")]);

        let empty = invalidate_handler(State(state), Path(" ".to_string())).await;
        assert!(matches!(empty, Err(SyncError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_network_and_queue_handlers() {
        let state = state();
        let health = network_handler(State(state.clone()), Json(NetworkRequest { online: false })).await;
        assert!(!health.online);

        state.client.queue_action(QueuedAction::new(
            ActionKind::Create,
            "client",
            None,
            Method::Post,
            "/clients",
            json!({"name": "Acme"}),
        ));
        let queue = queue_handler(State(state.clone())).await;
        assert_eq!(queue.status.pending, 1);

        let report = sync_handler(State(state.clone())).await;
        assert_eq!(report.completed, 1);
        assert_eq!(queue_handler(State(state)).await.status.total_actions, 0);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler(State(state())).await;
        assert_eq!(response.status, "healthy");
        assert!(response.online);
    }
}
