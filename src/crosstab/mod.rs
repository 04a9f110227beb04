//! Cross-Tab Sync
//!
//! Propagates confirmed cache changes between instances sharing a session,
//! without re-fetching from the server.

mod bridge;
mod bus;

pub use bridge::{invalidate_payload, CacheBridge};
pub use bus::{CrossTabHub, CrossTabSyncBus, MessageKind, MessageListener, SyncMessage};
