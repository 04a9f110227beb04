//! Transport Module
//!
//! The outward seam for every server-bound read and write. The hosting
//! application supplies an implementation; [`HttpTransport`] speaks JSON over
//! HTTP and [`fake::FakeServer`] is an in-memory versioned backend.

pub mod fake;
mod http;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, SyncError};

pub use http::HttpTransport;

// == Method ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

// == Request ==
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub endpoint: String,
    pub method: Method,
    pub body: Option<Value>,
    /// Version the write was computed against
    pub base_version: Option<u64>,
    /// Stable across replays so the server can drop duplicates
    pub idempotency_key: Option<String>,
}

impl Request {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            body: None,
            base_version: None,
            idempotency_key: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Get, endpoint)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_base_version(mut self, version: Option<u64>) -> Self {
        self.base_version = version;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

// == Response ==
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
    /// Version reported out of band (e.g. an `ETag`), if any
    pub version: Option<u64>,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            version: None,
        }
    }

    /// Version from the envelope or the body's `version` field.
    pub fn entity_version(&self) -> Option<u64> {
        self.version
            .or_else(|| self.body.get("version").and_then(Value::as_u64))
    }
}

// == Transport Trait ==
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one round trip. Non-success statuses come back as the
    /// matching [`SyncError`] variant.
    async fn request(&self, request: Request) -> Result<Response>;
}

/// Runs a request under a deadline; expiry is reported as [`SyncError::Timeout`].
pub async fn request_with_timeout(
    transport: &dyn Transport,
    request: Request,
    timeout: Duration,
) -> Result<Response> {
    match tokio::time::timeout(timeout, transport.request(request)).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(timeout.as_millis() as u64)),
    }
}

// == Status Classification ==
/// Maps an HTTP status and body onto the error taxonomy. A plain-text body
/// arrives as a JSON string and becomes the error message.
pub fn classify_status(status: u16, body: &Value) -> Result<()> {
    let message = || {
        body.get("error")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .or_else(|| body.as_str().filter(|text| !text.trim().is_empty()))
            .map(|text| text.trim().to_string())
            .unwrap_or_else(|| format!("status {}", status))
    };
    match status {
        200..=299 => Ok(()),
        409 => {
            let current = body.get("current").filter(|c| c.is_object()).cloned();
            Err(SyncError::Conflict {
                server_version: body
                    .get("version")
                    .or_else(|| current.as_ref().and_then(|c| c.get("version")))
                    .and_then(Value::as_u64),
                server_value: current,
            })
        }
        404 => Err(SyncError::NotFound(message())),
        408 | 429 | 500..=599 => Err(SyncError::Network(message())),
        _ => Err(SyncError::Validation(message())),
    }
}

/// Reads the server's current state of an entity, for conflicts that came
/// back without it.
pub async fn fetch_current(
    transport: &dyn Transport,
    endpoint: &str,
    timeout: Duration,
) -> Result<ServerAck> {
    let response = request_with_timeout(transport, Request::get(endpoint), timeout).await?;
    ServerAck::from_response(response)
}

/// Completes a conflict that did not say what the server holds by reading
/// `endpoint`. Other errors, and conflicts that cannot be completed, come
/// back unchanged.
pub async fn complete_conflict(
    transport: &dyn Transport,
    endpoint: &str,
    timeout: Duration,
    error: SyncError,
) -> SyncError {
    let SyncError::Conflict {
        server_version,
        server_value: None,
    } = error
    else {
        return error;
    };
    match fetch_current(transport, endpoint, timeout).await {
        Ok(ack) if !ack.deleted => SyncError::Conflict {
            server_version: Some(ack.version),
            server_value: Some(ack.value),
        },
        Ok(_) => SyncError::Conflict {
            server_version,
            server_value: None,
        },
        Err(err) => {
            warn!(endpoint, error = %err, "could not re-read entity after conflict");
            SyncError::Conflict {
                server_version,
                server_value: None,
            }
        }
    }
}

// == Server Acknowledgement ==
/// A confirmed entity returned by a write or read.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerAck {
    /// Server-assigned identity, when the body carries one
    pub id: Option<String>,
    pub version: u64,
    pub value: Value,
    /// The entity no longer exists server-side
    pub deleted: bool,
}

impl ServerAck {
    pub fn new(value: Value, version: u64) -> Self {
        Self {
            id: entity_id(&value),
            version,
            value,
            deleted: false,
        }
    }

    /// Reads identity and version from a write response.
    pub fn from_response(response: Response) -> Result<Self> {
        let version = response.entity_version().ok_or_else(|| {
            SyncError::Internal("response carries no entity version".to_string())
        })?;
        let deleted = response
            .body
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            id: entity_id(&response.body),
            version,
            value: response.body,
            deleted,
        })
    }

    /// Reads the reply to a DELETE. An empty success (e.g. `204 No Content`)
    /// means the entity is gone at the version after `base_version`.
    pub fn from_delete_response(response: Response, base_version: Option<u64>) -> Result<Self> {
        match response.entity_version() {
            Some(_) => {
                let mut ack = Self::from_response(response)?;
                ack.deleted = true;
                Ok(ack)
            }
            None => Ok(Self {
                id: entity_id(&response.body),
                version: base_version.map_or(1, |v| v + 1),
                value: Value::Null,
                deleted: true,
            }),
        }
    }
}

/// The `id` field as a string, accepting numeric ids.
pub fn entity_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
