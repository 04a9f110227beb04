//! Same-origin message bus between instances sharing one session.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HUB_CAPACITY: usize = 256;

/// Peers silent for this many heartbeat intervals are dropped.
const PEER_TIMEOUT_INTERVALS: u32 = 3;

// == Messages ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Payload is a confirmed entity change
    CacheUpdate,
    /// Payload is `{"entity_type": ...}`
    CacheInvalidate,
    Heartbeat,
    TabClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: MessageKind,
    pub payload: Value,
    pub origin_tab_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

// == Hub ==
/// The shared channel. Every bus created from clones of one hub sees the
/// others' messages.
#[derive(Debug, Clone)]
pub struct CrossTabHub {
    sender: broadcast::Sender<SyncMessage>,
}

impl CrossTabHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    fn publish(&self, message: SyncMessage) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.sender.subscribe()
    }
}

impl Default for CrossTabHub {
    fn default() -> Self {
        Self::new(HUB_CAPACITY)
    }
}

type MessageCallback = Arc<dyn Fn(&SyncMessage) + Send + Sync>;

struct BusInner {
    tab_id: Uuid,
    hub: CrossTabHub,
    heartbeat: Duration,
    peers: Mutex<HashMap<Uuid, Instant>>,
    listeners: Mutex<Vec<(u64, MessageCallback)>>,
    next_listener: Mutex<u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

// == Cross-Tab Sync Bus ==
/// One instance's endpoint on the hub. Clones share the endpoint.
#[derive(Clone)]
pub struct CrossTabSyncBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for CrossTabSyncBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossTabSyncBus")
            .field("tab_id", &self.inner.tab_id)
            .finish()
    }
}

impl CrossTabSyncBus {
    pub fn new(hub: CrossTabHub, heartbeat: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                tab_id: Uuid::new_v4(),
                hub,
                heartbeat,
                peers: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener: Mutex::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn tab_id(&self) -> Uuid {
        self.inner.tab_id
    }

    /// Starts receiving and heartbeating. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let receiver = self.inner.hub.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tasks.push(tokio::spawn(receive_loop(weak.clone(), receiver)));
        tasks.push(tokio::spawn(heartbeat_loop(weak, self.inner.heartbeat)));
        debug!(tab = %self.inner.tab_id, "cross-tab bus started");
    }

    /// Sends to every other instance. Returns the number of receivers reached.
    pub fn broadcast(&self, kind: MessageKind, payload: Value) -> usize {
        self.inner.broadcast(kind, payload)
    }

    /// Registers `callback` for messages from other instances.
    pub fn on_message<F>(&self, callback: F) -> MessageListener
    where
        F: Fn(&SyncMessage) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.inner.next_listener.lock();
            *next += 1;
            *next
        };
        self.inner.listeners.lock().push((id, Arc::new(callback)));
        MessageListener {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Live peers, after pruning the silent ones.
    pub fn other_tabs_count(&self) -> usize {
        self.inner.prune_peers();
        self.inner.peers.lock().len()
    }

    /// Announces the close and stops the background tasks.
    pub fn close(&self) {
        self.inner.broadcast(MessageKind::TabClosed, Value::Null);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(tab = %self.inner.tab_id, "cross-tab bus closed");
    }
}

impl BusInner {
    fn broadcast(&self, kind: MessageKind, payload: Value) -> usize {
        self.hub.publish(SyncMessage {
            kind,
            payload,
            origin_tab_id: self.tab_id,
            timestamp: Utc::now(),
        })
    }

    fn prune_peers(&self) {
        let limit = self.heartbeat * PEER_TIMEOUT_INTERVALS;
        let now = Instant::now();
        self.peers
            .lock()
            .retain(|_, seen| now.duration_since(*seen) <= limit);
    }

    fn receive(&self, message: &SyncMessage) {
        if message.origin_tab_id == self.tab_id {
            return;
        }
        match message.kind {
            MessageKind::TabClosed => {
                self.peers.lock().remove(&message.origin_tab_id);
            }
            _ => {
                self.peers
                    .lock()
                    .insert(message.origin_tab_id, Instant::now());
            }
        }
        let listeners: Vec<MessageCallback> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for listener in listeners {
            listener(message);
        }
    }
}

async fn receive_loop(bus: Weak<BusInner>, mut receiver: broadcast::Receiver<SyncMessage>) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                let Some(bus) = bus.upgrade() else {
                    return;
                };
                bus.receive(&message);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cross-tab receiver lagged, messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn heartbeat_loop(bus: Weak<BusInner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let Some(bus) = bus.upgrade() else {
            return;
        };
        bus.broadcast(MessageKind::Heartbeat, Value::Null);
        bus.prune_peers();
    }
}

// == Listener Guard ==
/// Stops delivery to its callback when dropped.
pub struct MessageListener {
    bus: Weak<BusInner>,
    id: u64,
}

impl MessageListener {
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageListener").field("id", &self.id).finish()
    }
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
