//! Offline Support
//!
//! A durable queue of server-bound writes, connectivity tracking and the
//! background engine that replays the queue once the network returns.

mod action;
mod engine;
mod network;
mod persistence;
mod queue;

pub use action::{ActionKind, ActionStatus, ActionTemplate, QueuedAction, DEFAULT_MAX_RETRIES};
pub use engine::{BackgroundSyncEngine, QueueStatus, SyncProgress, SyncReport};
pub use network::NetworkStatus;
pub use persistence::{JsonFilePersistence, MemoryPersistence, QueuePersistence};
pub use queue::OfflineActionQueue;
