//! Cache Entry Module
//!
//! Defines cache keys and versioned entity snapshots.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Prefix marking a client-generated placeholder id.
const TEMP_ID_PREFIX: &str = "tmp-";

// == Cache Key ==
/// Identifies a cached entity (`client:42`) or query (`client:list?page=2`).
///
/// The segment before the first `:` is the entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Builds `entity_type:id`.
    pub fn entity(entity_type: &str, id: impl fmt::Display) -> Self {
        Self(format!("{}:{}", entity_type, id))
    }

    /// Builds a fresh placeholder key for an entity not yet created server-side.
    pub fn temp(entity_type: &str) -> Self {
        Self(format!("{}:{}{}", entity_type, TEMP_ID_PREFIX, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn entity_type(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }

    /// Id segment after the entity type, if any.
    pub fn id(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, id)| id)
    }

    pub fn is_temp(&self) -> bool {
        self.id().is_some_and(|id| id.starts_with(TEMP_ID_PREFIX))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

// == Entry Status ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Confirmed by the server and within its freshness window
    Fresh,
    /// Last known value, due for revalidation
    Stale,
    /// Carries unconfirmed local writes
    Pending,
    /// Last refresh failed
    Error,
}

// == Cache Entry ==
/// A versioned snapshot of one server entity or query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Opaque payload
    pub value: Value,
    /// Last confirmed server version; never decreases
    pub version: u64,
    /// Unconfirmed-band counter, non-zero while local writes sit on top of `version`
    pub local_revision: u64,
    /// When the confirmed state was fetched (Unix milliseconds)
    pub fetched_at: u64,
    /// When the entry was marked stale (Unix milliseconds)
    pub stale_at: Option<u64>,
    pub status: EntryStatus,
}

impl CacheEntry {
    // == Constructors ==
    /// Creates a fresh entry confirmed by the server at `version`.
    pub fn confirmed(key: CacheKey, value: Value, version: u64) -> Self {
        Self {
            key,
            value,
            version,
            local_revision: 0,
            fetched_at: current_timestamp_ms(),
            stale_at: None,
            status: EntryStatus::Fresh,
        }
    }

    /// Creates an entry that exists only as a local optimistic write.
    pub fn optimistic(key: CacheKey, value: Value) -> Self {
        Self {
            key,
            value,
            version: 0,
            local_revision: 1,
            fetched_at: current_timestamp_ms(),
            stale_at: None,
            status: EntryStatus::Pending,
        }
    }

    /// Milliseconds since the confirmed state was fetched.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.fetched_at)
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }

    /// Serialized size in bytes, used for the memory estimate.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Shallow-merges `patch` into `base`.
///
/// Object patches overwrite top-level fields; any other shape replaces the
/// base outright.
pub fn shallow_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (field, value) in patch_map {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}
