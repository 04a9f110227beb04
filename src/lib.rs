//! entity_sync - client-side entity cache and synchronization layer
//!
//! Keeps a local, versioned cache of server entities correct under
//! concurrent optimistic writes, intermittent connectivity and several
//! instances sharing one session.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod crosstab;
pub mod error;
pub mod models;
pub mod monitor;
pub mod mutation;
pub mod offline;
pub mod realtime;
pub mod reconcile;
pub mod tasks;
pub mod transport;

pub use api::AppState;
pub use client::{MaintenanceReport, SyncClient, SyncClientBuilder};
pub use config::Config;
pub use error::{Result, SyncError};
pub use tasks::spawn_cleanup_task;
