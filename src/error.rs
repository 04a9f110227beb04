//! Error types for the sync layer
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use thiserror::Error;

use crate::models::ErrorResponse;

// == Sync Error Enum ==
/// Unified error type for cache, mutation, queue and transport failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Connection failure or server-side fault, retryable with backoff
    #[error("Network error: {0}")]
    Network(String),

    /// A network-bound operation exceeded its deadline
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Server rejected the payload; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Server state moved past the version the write was computed against
    #[error("Conflict on version {}", version_label(.server_version))]
    Conflict {
        /// Version the server currently holds, when it said
        server_version: Option<u64>,
        /// Current server representation, when the server returned one
        server_value: Option<Value>,
    },

    /// Durable queue storage failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Key not present in the cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Caller supplied an unusable argument
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Mutation was cancelled before its server call started
    #[error("Mutation cancelled")]
    Cancelled,

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

fn version_label(version: &Option<u64>) -> String {
    version.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

impl SyncError {
    /// Whether the failure should be retried with backoff.
    ///
    /// Timeouts fold into network handling; unclassified internal errors are
    /// requeued rather than dropped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::Internal(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Internal(format!("serialization: {}", err))
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidRequest(_) | SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::Conflict { .. } => StatusCode::CONFLICT,
            SyncError::Network(_) | SyncError::Timeout(_) => StatusCode::BAD_GATEWAY,
            SyncError::Persistence(_) | SyncError::Cancelled | SyncError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the sync layer.
pub type Result<T> = std::result::Result<T, SyncError>;
