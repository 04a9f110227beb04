//! Resilient server-push connection feeding the reconciler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::backoff_delay;
use crate::cache::CacheKey;
use crate::error::SyncError;
use crate::realtime::{Socket, SocketConnection, SocketEvent};
use crate::reconcile::{Origin, ReconcileOutcome, Reconciler, RemoteChange};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// A change pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Change {
        key: CacheKey,
        value: Value,
        version: u64,
    },
    Delete {
        key: CacheKey,
        version: u64,
    },
    Invalidate {
        entity_type: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RealtimeMetrics {
    pub messages_received: u64,
    /// Changes that were newer than the cache and got applied
    pub messages_applied: u64,
    pub decode_errors: u64,
    pub reconnect_attempts: u64,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
}

struct ChannelInner {
    url: String,
    socket: Arc<dyn Socket>,
    reconciler: Arc<Reconciler>,
    connect_timeout: Duration,
    status: watch::Sender<ConnectionStatus>,
    last_message: Mutex<Option<ServerEvent>>,
    metrics: Mutex<RealtimeMetrics>,
    reconnect_now: Notify,
}

// == Realtime Channel ==
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(url: impl Into<String>, socket: Arc<dyn Socket>, reconciler: Arc<Reconciler>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                url: url.into(),
                socket,
                reconciler,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                status,
                last_message: Mutex::new(None),
                metrics: Mutex::new(RealtimeMetrics::default()),
                reconnect_now: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// How long one connect attempt may take before it counts as failed.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.connect_timeout = timeout;
        }
        self
    }

    /// Connects and keeps reconnecting until shut down.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move { inner.run().await }));
    }

    /// Drops the current connection, or skips the pending backoff, and
    /// connects again at once.
    pub fn reconnect(&self) {
        self.inner.reconnect_now.notify_one();
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.status.send_replace(ConnectionStatus::Disconnected);
        self.inner.metrics.lock().connected_since = None;
        info!(url = %self.inner.url, "realtime channel shut down");
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn last_message(&self) -> Option<ServerEvent> {
        self.inner.last_message.lock().clone()
    }

    pub fn metrics(&self) -> RealtimeMetrics {
        self.inner.metrics.lock().clone()
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl ChannelInner {
    async fn run(&self) {
        let mut attempt: u32 = 0;
        let mut first = true;
        loop {
            self.status.send_replace(if first {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting
            });
            first = false;

            let connected = tokio::time::timeout(self.connect_timeout, self.socket.connect(&self.url))
                .await
                .unwrap_or(Err(SyncError::Timeout(self.connect_timeout.as_millis() as u64)));
            match connected {
                Ok(connection) => {
                    attempt = 0;
                    self.status.send_replace(ConnectionStatus::Connected);
                    self.metrics.lock().connected_since = Some(Utc::now());
                    info!(url = %self.url, "realtime connected");

                    let manual = self.pump(connection).await;
                    self.status.send_replace(ConnectionStatus::Disconnected);
                    self.metrics.lock().connected_since = None;
                    if manual {
                        continue;
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, attempt, error = %err, "realtime connect failed");
                    self.status.send_replace(ConnectionStatus::Disconnected);
                }
            }

            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            self.metrics.lock().reconnect_attempts += 1;
            debug!(delay_ms = delay.as_millis() as u64, "realtime reconnect scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.reconnect_now.notified() => attempt = 0,
            }
        }
    }

    /// Reads until the connection ends. Returns true when a manual reconnect
    /// cut it short.
    async fn pump(&self, mut connection: SocketConnection) -> bool {
        loop {
            let event = tokio::select! {
                event = connection.next() => event,
                _ = self.reconnect_now.notified() => return true,
            };
            match event {
                Some(SocketEvent::Message(text)) => self.handle(&text),
                Some(SocketEvent::Closed(reason)) => {
                    info!(url = %self.url, ?reason, "realtime connection closed");
                    return false;
                }
                Some(SocketEvent::Error(err)) => {
                    warn!(url = %self.url, error = %err, "realtime connection error");
                    return false;
                }
                None => return false,
            }
        }
    }

    fn handle(&self, text: &str) {
        self.metrics.lock().messages_received += 1;
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "undecodable realtime message");
                self.metrics.lock().decode_errors += 1;
                return;
            }
        };

        let applied = match &event {
            ServerEvent::Change {
                key,
                value,
                version,
            } => self.reconciler.apply_remote(
                RemoteChange::upsert(key.clone(), value.clone(), *version),
                Origin::Realtime,
            ) == ReconcileOutcome::Applied,
            ServerEvent::Delete { key, version } => {
                self.reconciler
                    .apply_remote(RemoteChange::delete(key.clone(), *version), Origin::Realtime)
                    == ReconcileOutcome::Applied
            }
            ServerEvent::Invalidate { entity_type } => !self
                .reconciler
                .store()
                .invalidate_where(|key| key.entity_type() == entity_type)
                .is_empty(),
        };

        let mut metrics = self.metrics.lock();
        metrics.last_message_at = Some(Utc::now());
        if applied {
            metrics.messages_applied += 1;
        }
        drop(metrics);
        *self.last_message.lock() = Some(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::realtime::MemorySocket;
    use serde_json::json;
    use std::time::Duration;

    fn channel() -> (CacheStore, Arc<MemorySocket>, RealtimeChannel) {
        let store = CacheStore::new();
        let socket = Arc::new(MemorySocket::new());
        let reconciler = Arc::new(Reconciler::new(store.clone()));
        let channel = RealtimeChannel::new("mem://events", socket.clone(), reconciler);
        (store, socket, channel)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn change(id: u32, name: &str, version: u64) -> String {
        json!({"type": "change", "key": format!("client:{}", id), "value": {"name": name}, "version": version})
            .to_string()
    }

    #[tokio::test]
    async fn test_changes_apply_once() {
        let (store, socket, channel) = channel();
        channel.start();
        settle().await;
        assert_eq!(channel.status(), ConnectionStatus::Connected);

        socket.push(change(1, "A", 2));
        socket.push(change(1, "A", 2));
        socket.push(change(1, "old", 1));
        settle().await;

        let entry = store.peek(&CacheKey::from("client:1")).unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.value["name"], "A");
        let metrics = channel.metrics();
        assert_eq!(metrics.messages_received, 3);
        assert_eq!(metrics.messages_applied, 1);
        assert!(matches!(channel.last_message(), Some(ServerEvent::Change { version: 1, .. })));
    }

    #[tokio::test]
    async fn test_delete_and_bad_frames() {
        let (store, socket, channel) = channel();
        store.set(CacheKey::from("client:1"), json!({}), 1);
        channel.start();
        settle().await;

        socket.push("not json");
        socket.push(json!({"type": "delete", "key": "client:1", "version": 2}).to_string());
        settle().await;
        assert!(store.peek(&CacheKey::from("client:1")).is_none());
        assert_eq!(channel.metrics().decode_errors, 1);

        // A late update cannot resurrect it.
        socket.push(change(1, "ghost", 2));
        settle().await;
        assert!(store.peek(&CacheKey::from("client:1")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff() {
        let (_store, socket, channel) = channel();
        socket.refuse_next(2);
        channel.start();
        settle().await;
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);

        // Attempts wait 1s then 2s.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(socket.connect_count(), 0);
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        settle().await;
        assert_eq!(channel.status(), ConnectionStatus::Connected);
        assert_eq!(socket.connect_count(), 1);
        assert_eq!(channel.metrics().reconnect_attempts, 2);

        socket.drop_connection();
        settle().await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(socket.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_manual_reconnect_and_shutdown() {
        let (_store, socket, channel) = channel();
        channel.start();
        settle().await;
        assert_eq!(socket.connect_count(), 1);

        channel.reconnect();
        settle().await;
        assert_eq!(socket.connect_count(), 2);
        assert_eq!(channel.status(), ConnectionStatus::Connected);

        channel.shutdown();
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);
    }

    struct HangingSocket {
        attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Socket for HangingSocket {
        async fn connect(&self, _url: &str) -> crate::error::Result<SocketConnection> {
            self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_connect_times_out_and_retries() {
        let socket = Arc::new(HangingSocket {
            attempts: Default::default(),
        });
        let reconciler = Arc::new(Reconciler::new(CacheStore::new()));
        let channel = RealtimeChannel::new("ws://blackhole", socket.clone(), reconciler)
            .with_connect_timeout(Duration::from_secs(2));
        channel.start();
        settle().await;
        assert_eq!(channel.status(), ConnectionStatus::Connecting);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        settle().await;
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);
        assert_eq!(channel.metrics().reconnect_attempts, 1);

        // 1s backoff, then a second attempt that also hangs.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(socket.attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(channel.status(), ConnectionStatus::Reconnecting);
        channel.shutdown();
    }
}
