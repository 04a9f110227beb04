//! Queued write actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::transport::{Method, Request};

pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Pending,
    /// Out of retries or rejected; kept until cleared
    Failed,
}

// == Action Template ==
/// How a mutation reaches the server: endpoint, method and queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionTemplate {
    pub kind: ActionKind,
    pub endpoint: String,
    pub method: Method,
    pub priority: i32,
    pub max_retries: Option<u32>,
}

impl ActionTemplate {
    pub fn new(kind: ActionKind, method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            method,
            priority: 0,
            max_retries: None,
        }
    }

    /// `POST` to a collection.
    pub fn create(endpoint: impl Into<String>) -> Self {
        Self::new(ActionKind::Create, Method::Post, endpoint)
    }

    /// `PATCH` of a single resource.
    pub fn update(endpoint: impl Into<String>) -> Self {
        Self::new(ActionKind::Update, Method::Patch, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(ActionKind::Delete, Method::Delete, endpoint)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

// == Queued Action ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: Uuid,
    pub kind: ActionKind,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: Value,
    pub endpoint: String,
    pub method: Method,
    /// Higher drains first
    pub priority: i32,
    pub max_retries: u32,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    /// Insertion order; breaks `created_at` ties
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub base_version: Option<u64>,
    /// Optimistic mutation waiting on this action
    #[serde(default)]
    pub mutation_id: Option<Uuid>,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(skip)]
    pub(crate) next_attempt_at: Option<Instant>,
}

impl QueuedAction {
    pub fn new(
        kind: ActionKind,
        entity_type: impl Into<String>,
        entity_id: Option<String>,
        method: Method,
        endpoint: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            entity_type: entity_type.into(),
            entity_id,
            payload,
            endpoint: endpoint.into(),
            method,
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            attempt: 0,
            created_at: Utc::now(),
            seq: 0,
            base_version: None,
            mutation_id: None,
            status: ActionStatus::Pending,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Builds the action for a mutation routed through the queue.
    pub(crate) fn from_template(
        template: &ActionTemplate,
        key: &CacheKey,
        payload: Value,
        base_version: Option<u64>,
        default_max_retries: u32,
    ) -> Self {
        let mut action = Self::new(
            template.kind,
            key.entity_type(),
            key.id().map(str::to_string),
            template.method,
            template.endpoint.clone(),
            payload,
        );
        action.priority = template.priority;
        action.max_retries = template.max_retries.unwrap_or(default_max_retries);
        action.base_version = base_version;
        action
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    /// Grouping identity: actions on the same entity keep their order.
    pub fn entity_ref(&self) -> String {
        match &self.entity_id {
            Some(id) => format!("{}:{}", self.entity_type, id),
            None => format!("{}:{}", self.entity_type, self.id),
        }
    }

    /// Cache key of the target entity, when it has one.
    pub fn cache_key(&self) -> Option<CacheKey> {
        self.entity_id
            .as_ref()
            .map(|id| CacheKey::entity(&self.entity_type, id))
    }

    pub fn is_pending(&self) -> bool {
        self.status == ActionStatus::Pending
    }

    /// The request to send; the action id doubles as the idempotency key.
    pub fn to_request(&self) -> Request {
        let request = Request::new(self.method, self.endpoint.clone())
            .with_base_version(self.base_version)
            .with_idempotency_key(self.id.to_string());
        match self.kind {
            ActionKind::Delete => request,
            _ => request.with_body(self.payload.clone()),
        }
    }
}
