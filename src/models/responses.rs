//! Response DTOs for the inspection API
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;

use crate::cache::{CacheKey, CacheStats};
use crate::monitor::{Alert, MetricsSnapshot};
use crate::mutation::{Conflict, PendingMutation};
use crate::offline::{QueueStatus, QueuedAction};
use crate::realtime::{ConnectionStatus, RealtimeMetrics, ServerEvent};

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

impl StatsResponse {
    pub fn new(stats: CacheStats) -> Self {
        Self {
            hit_rate: stats.hit_rate(),
            stats,
        }
    }
}

/// Response body for GET /queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueResponse {
    pub status: QueueStatus,
    pub actions: Vec<QueuedAction>,
}

/// Response body for GET /metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub metrics: MetricsSnapshot,
    pub alerts: Vec<Alert>,
}

/// Response body for GET /conflicts
#[derive(Debug, Clone, Serialize)]
pub struct ConflictsResponse {
    pub pending_count: usize,
    pub pending: Vec<PendingMutation>,
    pub conflicts: Vec<Conflict>,
}

/// Response body for GET /realtime
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeResponse {
    pub enabled: bool,
    pub status: Option<ConnectionStatus>,
    pub metrics: Option<RealtimeMetrics>,
    pub last_message: Option<ServerEvent>,
}

impl RealtimeResponse {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            status: None,
            metrics: None,
            last_message: None,
        }
    }
}

/// Response body for POST /invalidate/:entity_type
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    pub entity_type: String,
    pub invalidated: Vec<CacheKey>,
}

/// Response body for DELETE /queue/failed
#[derive(Debug, Clone, Serialize)]
pub struct ClearFailedResponse {
    pub cleared: usize,
}

/// Response body for POST /queue/retry
#[derive(Debug, Clone, Serialize)]
pub struct RetryResponse {
    pub requeued: usize,
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    pub online: bool,
    pub other_tabs: usize,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy(online: bool, other_tabs: usize) -> Self {
        Self {
            status: "healthy".to_string(),
            online,
            other_tabs,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    /// Creates a new ErrorResponse
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
