//! Realtime
//!
//! Server-push changes over a reconnecting socket, applied through the same
//! reconciliation path as every other confirmed change.

mod channel;
mod socket;

pub use channel::{ConnectionStatus, RealtimeChannel, RealtimeMetrics, ServerEvent};
pub use socket::{MemorySocket, Socket, SocketConnection, SocketEvent, WsSocket};
