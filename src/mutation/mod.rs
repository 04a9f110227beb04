//! Optimistic Mutations
//!
//! Local-first writes with per-key serialized server calls, rollback and
//! conflict resolution.

mod engine;
mod monitor;
mod resolver;
mod state;

pub use engine::{CustomCall, OptimisticMutationEngine, ServerCall, WriteRequest};
pub use monitor::MutationMonitor;
pub use resolver::{Conflict, ConflictResolver, Resolution, ServerWins};
pub use state::{MutationHandle, MutationState, MutationStatus, PendingMutation};
