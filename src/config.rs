//! Configuration Module
//!
//! Loads sync-layer settings from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::offline::DEFAULT_MAX_RETRIES;

/// Sync-layer configuration.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Entry cap enforced by LRU eviction
    pub max_entries: usize,
    /// Age after which unobserved entries are dropped
    pub stale_ttl_ms: u64,
    /// Maintenance task interval in seconds
    pub cleanup_interval: u64,
    /// Inspection API port
    pub server_port: u16,
    pub backend_url: String,
    /// Push endpoint; realtime is off when unset
    pub realtime_url: Option<String>,
    /// Where the offline queue is persisted
    pub queue_path: String,
    pub request_timeout_ms: u64,
    /// Periodic drain even without a connectivity change
    pub sync_interval_ms: u64,
    pub default_max_retries: u32,
    pub heartbeat_interval_ms: u64,
    pub latency_alert_ms: f64,
    pub error_rate_alert: f64,
    pub metrics_window_ms: u64,
}

fn var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MAX_ENTRIES` - LRU cap (default: 1000)
    /// - `STALE_TTL_MS` - TTL cleanup age (default: 300000)
    /// - `CLEANUP_INTERVAL` - Maintenance frequency in seconds (default: 30)
    /// - `SERVER_PORT` - Inspection API port (default: 3000)
    /// - `BACKEND_URL` - Entity API base URL (default: http://localhost:8080)
    /// - `REALTIME_URL` - WebSocket push endpoint (default: unset)
    /// - `QUEUE_PATH` - Offline queue file (default: offline_queue.json)
    /// - `REQUEST_TIMEOUT_MS` - Per-request deadline (default: 10000)
    /// - `SYNC_INTERVAL_MS` - Periodic drain (default: 30000)
    /// - `DEFAULT_MAX_RETRIES` - Attempts per queued action (default: 5)
    /// - `HEARTBEAT_INTERVAL_MS` - Cross-tab heartbeat (default: 5000)
    /// - `LATENCY_ALERT_MS` - Average latency alert threshold (default: 1000)
    /// - `ERROR_RATE_ALERT` - Error rate alert threshold (default: 0.25)
    /// - `METRICS_WINDOW_MS` - Rolling metrics window (default: 300000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_entries: var("MAX_ENTRIES", defaults.max_entries),
            stale_ttl_ms: var("STALE_TTL_MS", defaults.stale_ttl_ms),
            cleanup_interval: var("CLEANUP_INTERVAL", defaults.cleanup_interval),
            server_port: var("SERVER_PORT", defaults.server_port),
            backend_url: var("BACKEND_URL", defaults.backend_url),
            realtime_url: env::var("REALTIME_URL").ok().filter(|url| !url.is_empty()),
            queue_path: var("QUEUE_PATH", defaults.queue_path),
            request_timeout_ms: var("REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            sync_interval_ms: var("SYNC_INTERVAL_MS", defaults.sync_interval_ms),
            default_max_retries: var("DEFAULT_MAX_RETRIES", defaults.default_max_retries),
            heartbeat_interval_ms: var("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval_ms),
            latency_alert_ms: var("LATENCY_ALERT_MS", defaults.latency_alert_ms),
            error_rate_alert: var("ERROR_RATE_ALERT", defaults.error_rate_alert),
            metrics_window_ms: var("METRICS_WINDOW_MS", defaults.metrics_window_ms),
        }
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_millis(self.stale_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_millis(self.metrics_window_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            stale_ttl_ms: 300_000,
            cleanup_interval: 30,
            server_port: 3000,
            backend_url: "http://localhost:8080".to_string(),
            realtime_url: None,
            queue_path: "offline_queue.json".to_string(),
            request_timeout_ms: 10_000,
            sync_interval_ms: 30_000,
            default_max_retries: DEFAULT_MAX_RETRIES,
            heartbeat_interval_ms: 5_000,
            latency_alert_ms: 1000.0,
            error_rate_alert: 0.25,
            metrics_window_ms: 300_000,
        }
    }
}
