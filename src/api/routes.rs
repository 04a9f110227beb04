//! API Routes
//!
//! Configures the Axum router with all inspection endpoints.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    clear_failed_handler, conflicts_handler, entry_handler, health_handler, invalidate_handler,
    metrics_handler, network_handler, queue_handler, realtime_handler, retry_failed_handler,
    stats_handler, sync_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/cache/:key", get(entry_handler))
        .route("/queue", get(queue_handler))
        .route("/queue/retry", post(retry_failed_handler))
        .route("/queue/failed", delete(clear_failed_handler))
        .route("/sync", post(sync_handler))
        .route("/metrics", get(metrics_handler))
        .route("/conflicts", get(conflicts_handler))
        .route("/realtime", get(realtime_handler))
        .route("/invalidate/:entity_type", post(invalidate_handler))
        .route("/network", post(network_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SyncClient;
    use crate::config::Config;
    use crate::offline::MemoryPersistence;
    use crate::transport::fake::FakeServer;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn create_test_app() -> Router {
        let client = SyncClient::builder(
            Config::default(),
            Arc::new(FakeServer::new()),
            Arc::new(MemoryPersistence::new()),
        )
        .build();
        create_router(AppState::new(Arc::new(client)))
    }

    async fn status_of(app: Router, method: &str, uri: &str) -> StatusCode {
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        assert_eq!(status_of(create_test_app(), "GET", "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        assert_eq!(status_of(create_test_app(), "GET", "/stats").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cache_entry_not_found() {
        assert_eq!(
            status_of(create_test_app(), "GET", "/cache/client:404").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_sync_requires_post() {
        assert_eq!(
            status_of(create_test_app(), "GET", "/sync").await,
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(status_of(create_test_app(), "POST", "/sync").await, StatusCode::OK);
    }
}
