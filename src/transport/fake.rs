//! In-memory versioned backend.
//!
//! Behaves like a small REST server: `POST /things` creates, `PUT`/`PATCH
//! /things/{id}` update with optimistic concurrency on the base version,
//! `DELETE /things/{id}` removes, `GET` reads a record or lists a collection.
//! Connectivity, latency and one-off failures can be scripted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use super::{Method, Request, Response, Transport};
use crate::cache::shallow_merge;
use crate::error::{Result, SyncError};

#[derive(Default)]
struct FakeState {
    /// Records by resource path, e.g. `/clients/1`
    records: BTreeMap<String, Value>,
    next_id: u64,
    /// Responses already produced, by idempotency key
    replies: HashMap<String, Response>,
    scripted: VecDeque<SyncError>,
    log: Vec<Request>,
    latency: Option<Duration>,
}

#[derive(Default)]
pub struct FakeServer {
    state: Mutex<FakeState>,
    offline: AtomicBool,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record at `path` with the given version.
    pub fn seed(&self, path: &str, value: Value, version: u64) {
        let mut state = self.state.lock();
        let id = path.rsplit('/').next().unwrap_or_default().to_string();
        if let Ok(numeric) = id.parse::<u64>() {
            state.next_id = state.next_id.max(numeric);
        }
        let record = stamp(value, &id, version);
        state.records.insert(path.to_string(), record);
    }

    pub fn record(&self, path: &str) -> Option<Value> {
        self.state.lock().records.get(path).cloned()
    }

    /// Every request that reached the server, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().log.clone()
    }

    /// Requests that actually changed state (duplicates excluded).
    pub fn write_count(&self) -> usize {
        let state = self.state.lock();
        let mut seen = std::collections::HashSet::new();
        state
            .log
            .iter()
            .filter(|r| r.method != Method::Get)
            .filter(|r| match &r.idempotency_key {
                Some(key) => seen.insert(key.clone()),
                None => true,
            })
            .count()
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// The next request fails with `error` instead of being handled.
    pub fn fail_next(&self, error: SyncError) {
        self.state.lock().scripted.push_back(error);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    fn handle(&self, request: &Request) -> Result<Response> {
        let mut state = self.state.lock();
        state.log.push(request.clone());

        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }
        if let Some(key) = &request.idempotency_key {
            if let Some(reply) = state.replies.get(key) {
                return Ok(reply.clone());
            }
        }

        let path = request.endpoint.trim_end_matches('/').to_string();
        let response = match request.method {
            Method::Get => read(&state, &path)?,
            Method::Post => {
                state.next_id += 1;
                let id = state.next_id.to_string();
                let body = request.body.clone().unwrap_or_else(|| json!({}));
                let record = stamp(body, &id, 1);
                state.records.insert(format!("{}/{}", path, id), record.clone());
                Response {
                    status: 201,
                    body: record,
                    version: None,
                }
            }
            Method::Put | Method::Patch => {
                let current = state
                    .records
                    .get(&path)
                    .cloned()
                    .ok_or_else(|| SyncError::NotFound(path.clone()))?;
                let version = current["version"].as_u64().unwrap_or(0);
                check_base(request.base_version, version, &current)?;
                let body = request.body.clone().unwrap_or_else(|| json!({}));
                let merged = if request.method == Method::Patch {
                    shallow_merge(&current, &body)
                } else {
                    body
                };
                let id = current["id"].as_str().unwrap_or_default().to_string();
                let record = stamp(merged, &id, version + 1);
                state.records.insert(path, record.clone());
                Response::ok(record)
            }
            Method::Delete => {
                let current = state
                    .records
                    .get(&path)
                    .cloned()
                    .ok_or_else(|| SyncError::NotFound(path.clone()))?;
                let version = current["version"].as_u64().unwrap_or(0);
                check_base(request.base_version, version, &current)?;
                state.records.remove(&path);
                Response::ok(json!({
                    "id": current["id"].clone(),
                    "version": version + 1,
                    "deleted": true,
                }))
            }
        };

        if let Some(key) = &request.idempotency_key {
            state.replies.insert(key.clone(), response.clone());
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn request(&self, request: Request) -> Result<Response> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Network("server unreachable".to_string()));
        }
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.handle(&request)
    }
}

fn read(state: &FakeState, path: &str) -> Result<Response> {
    if let Some(record) = state.records.get(path) {
        return Ok(Response::ok(record.clone()));
    }
    let prefix = format!("{}/", path);
    let items: Vec<Value> = state
        .records
        .iter()
        .filter(|(p, _)| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
        .map(|(_, v)| v.clone())
        .collect();
    if items.is_empty() {
        return Err(SyncError::NotFound(path.to_string()));
    }
    let version = items
        .iter()
        .filter_map(|v| v["version"].as_u64())
        .sum::<u64>();
    Ok(Response::ok(json!({ "items": items, "version": version })))
}

fn check_base(base: Option<u64>, version: u64, current: &Value) -> Result<()> {
    match base {
        Some(base) if base != version => Err(SyncError::Conflict {
            server_version: Some(version),
            server_value: Some(current.clone()),
        }),
        _ => Ok(()),
    }
}

fn stamp(value: Value, id: &str, version: u64) -> Value {
    let mut map = match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    map.insert("id".to_string(), Value::String(id.to_string()));
    map.insert("version".to_string(), json!(version));
    Value::Object(map)
}
