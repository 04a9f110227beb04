//! API Module
//!
//! HTTP handlers and routing for the read-mostly inspection API.
//!
//! # Endpoints
//! - `GET /health` - Liveness, connectivity and peer count
//! - `GET /stats` - Cache statistics
//! - `GET /cache/:key` - One cache entry
//! - `GET /queue` - Offline queue status and contents
//! - `POST /sync` - Drain the offline queue now
//! - `POST /queue/retry` - Requeue failed actions
//! - `DELETE /queue/failed` - Drop failed actions
//! - `GET /metrics` - Rolling performance metrics and alerts
//! - `GET /conflicts` - In-flight mutations and unresolved conflicts
//! - `GET /realtime` - Push channel status
//! - `POST /invalidate/:entity_type` - Mark an entity type stale
//! - `POST /network` - Report connectivity

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
