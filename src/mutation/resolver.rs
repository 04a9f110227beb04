//! Conflict resolution.
//!
//! A conflict is a write the server did not accept as-is because its state
//! moved on. The default resolver lets the server win; callers can install
//! their own to merge and resubmit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::cache::CacheKey;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub mutation_id: Uuid,
    pub key: CacheKey,
    /// The local patch that lost
    pub patch: Value,
    /// What the cache showed locally when the conflict was detected
    pub local_value: Option<Value>,
    /// `None` when the server did not say and the entity could not be re-read
    pub server_version: Option<u64>,
    pub server_value: Option<Value>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Discard the local write; the cache converges to the server state
    KeepServer,
    /// Resubmit this value against the server's current version
    Accept(Value),
}

pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Server wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerWins;

impl ConflictResolver for ServerWins {
    fn resolve(&self, _conflict: &Conflict) -> Resolution {
        Resolution::KeepServer
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> Resolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        self(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::shallow_merge;
    use serde_json::json;

    fn conflict() -> Conflict {
        Conflict {
            mutation_id: Uuid::new_v4(),
            key: CacheKey::from("client:1"),
            patch: json!({"phone": "555"}),
            local_value: Some(json!({"name": "A", "phone": "555"})),
            server_version: Some(3),
            server_value: Some(json!({"name": "B", "phone": "111"})),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_server_wins_by_default() {
        assert_eq!(ServerWins.resolve(&conflict()), Resolution::KeepServer);
    }

    #[test]
    fn test_closure_resolver() {
        let merge = |c: &Conflict| {
            let server = c.server_value.clone().unwrap_or(Value::Null);
            Resolution::Accept(shallow_merge(&server, &c.patch))
        };
        assert_eq!(
            merge.resolve(&conflict()),
            Resolution::Accept(json!({"name": "B", "phone": "555"}))
        );
    }
}
