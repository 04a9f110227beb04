//! JSON-over-HTTP transport backed by reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MATCH};
use serde_json::Value;
use tracing::debug;

use super::{classify_status, Method, Request, Response, Transport};
use crate::error::{Result, SyncError};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Sends requests to `base_url + endpoint`.
///
/// The base version travels as `If-Match`, the idempotency key as
/// `Idempotency-Key`, and an `ETag` holding an integer is read back as the
/// entity version.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: Request) -> Result<Response> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let url = self.url(&request.endpoint);
        debug!(%url, method = %request.method, "sending request");

        let mut builder = self.client.request(method, &url).timeout(self.timeout);
        if let Some(version) = request.base_version {
            builder = builder.header(IF_MATCH, version.to_string());
        }
        if let Some(key) = &request.idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                SyncError::Timeout(self.timeout.as_millis() as u64)
            } else {
                SyncError::Network(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let etag_version = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim_matches('"').parse::<u64>().ok());
        let bytes = response
            .bytes()
            .await
            .map_err(|err| SyncError::Network(err.to_string()))?;
        let body = decode_body(status, &bytes)?;

        classify_status(status, &body)?;
        Ok(Response {
            status,
            body,
            version: etag_version,
        })
    }
}

/// Success bodies must be JSON; error bodies may be plain text or HTML.
fn decode_body(status: u16, bytes: &[u8]) -> Result<Value> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_slice(bytes) {
        Ok(body) => Ok(body),
        Err(_) if !(200..300).contains(&status) => {
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        Err(err) => Err(err.into()),
    }
}
