//! Mutation lifecycle types.

use std::sync::Weak;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::error::{Result, SyncError};
use crate::mutation::engine::EngineInner;
use crate::transport::ServerAck;

// == Mutation Status ==
/// `applied` → `confirmed` | `rolled_back` | `conflicted`;
/// `conflicted` → `confirmed` | `rolled_back` once the resolver has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Applied,
    Confirmed,
    RolledBack,
    Conflicted,
}

impl MutationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationStatus::Confirmed | MutationStatus::RolledBack)
    }
}

/// What a handle observes.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationState {
    pub status: MutationStatus,
    /// Current key; changes when a placeholder is replaced by the server id
    pub key: CacheKey,
    pub ack: Option<ServerAck>,
    pub error: Option<SyncError>,
}

impl MutationState {
    pub(crate) fn applied(key: CacheKey) -> Self {
        Self {
            status: MutationStatus::Applied,
            key,
            ack: None,
            error: None,
        }
    }
}

// == Pending Mutation ==
/// A local write that the server has not settled yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub key: CacheKey,
    pub entity_type: String,
    pub patch: Value,
    /// Confirmed version the patch was computed against
    pub base_version: Option<u64>,
    pub status: MutationStatus,
    pub retries: u32,
    /// Waiting in the offline queue
    pub queued: bool,
    pub created_at: DateTime<Utc>,
}

// == Mutation Handle ==
/// Returned by `mutate`; reports how the write settles.
#[derive(Debug)]
pub struct MutationHandle {
    id: Uuid,
    state: watch::Receiver<MutationState>,
    engine: Weak<EngineInner>,
}

impl MutationHandle {
    pub(crate) fn new(id: Uuid, state: watch::Receiver<MutationState>, engine: Weak<EngineInner>) -> Self {
        Self { id, state, engine }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> MutationStatus {
        self.state.borrow().status
    }

    pub fn state(&self) -> MutationState {
        self.state.borrow().clone()
    }

    /// Waits until the mutation is confirmed or rolled back.
    ///
    /// Resolves with the server acknowledgement, or the error that caused
    /// the rollback.
    pub async fn outcome(&mut self) -> Result<ServerAck> {
        let state = self
            .state
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| SyncError::Internal("mutation engine dropped".to_string()))?
            .clone();
        match (state.status, state.ack, state.error) {
            (MutationStatus::Confirmed, Some(ack), _) => Ok(ack),
            (_, _, Some(error)) => Err(error),
            _ => Err(SyncError::Internal("mutation settled without result".to_string())),
        }
    }

    /// Drops the mutation if its server call has not started.
    pub fn cancel(&self) -> bool {
        match self.engine.upgrade() {
            Some(engine) => engine.cancel(self.id),
            None => false,
        }
    }
}
