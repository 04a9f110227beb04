//! entity_sync - sync layer host with an inspection API
//!
//! Runs the cache, offline queue and realtime channel against a backend and
//! exposes their state over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use entity_sync::api::{create_router, AppState};
use entity_sync::offline::JsonFilePersistence;
use entity_sync::realtime::WsSocket;
use entity_sync::transport::HttpTransport;
use entity_sync::{spawn_cleanup_task, Config, SyncClient};

/// Main entry point.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Build the sync client (HTTP transport, file-backed queue, optional realtime)
/// 4. Start background sync, realtime and cache maintenance
/// 5. Serve the inspection API until SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "entity_sync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting entity sync host");

    let config = Config::from_env();
    info!(
        "Configuration loaded: backend={}, max_entries={}, port={}, queue={}",
        config.backend_url, config.max_entries, config.server_port, config.queue_path
    );

    let transport = Arc::new(HttpTransport::new(
        config.backend_url.clone(),
        config.request_timeout(),
    ));
    let persistence = Arc::new(JsonFilePersistence::new(config.queue_path.clone()));
    let mut builder = SyncClient::builder(config.clone(), transport, persistence);
    if let Some(url) = &config.realtime_url {
        builder = builder.realtime(url.clone(), Arc::new(WsSocket));
        info!("Realtime channel enabled at {}", url);
    }
    let client = Arc::new(builder.build());
    client.start();

    let cleanup_handle = spawn_cleanup_task(client.clone(), config.cleanup_interval);
    info!("Background maintenance task started");

    let app = create_router(AppState::new(client.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Inspection API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving inspection API")?;

    cleanup_handle.abort();
    client.shutdown();
    warn!("Background tasks stopped");
    info!("Shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
