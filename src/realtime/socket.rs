//! The push-connection seam and its implementations.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{Result, SyncError};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(String),
    Closed(Option<String>),
    Error(String),
}

/// An open connection, read as a stream of events. `None` once the
/// connection has gone away.
#[derive(Debug)]
pub struct SocketConnection {
    events: mpsc::Receiver<SocketEvent>,
}

impl SocketConnection {
    /// A connection fed through the returned sender.
    pub fn channel() -> (mpsc::Sender<SocketEvent>, Self) {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        (tx, Self { events })
    }

    pub async fn next(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }
}

#[async_trait]
pub trait Socket: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SocketConnection>;
}

// == WebSocket ==
/// WebSocket connections via `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsSocket;

#[async_trait]
impl Socket for WsSocket {
    async fn connect(&self, url: &str) -> Result<SocketConnection> {
        let (mut stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let (tx, connection) = SocketConnection::channel();

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => SocketEvent::Message(text),
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = tx.send(SocketEvent::Closed(reason)).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = tx.send(SocketEvent::Error(err.to_string())).await;
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    debug!("socket reader dropped, closing websocket");
                    return;
                }
            }
            let _ = tx.send(SocketEvent::Closed(None)).await;
        });
        Ok(connection)
    }
}

// == In-Memory Socket ==
/// A socket whose server side is driven by hand.
#[derive(Debug, Default)]
pub struct MemorySocket {
    current: Mutex<Option<mpsc::Sender<SocketEvent>>>,
    refuse: AtomicUsize,
    connects: AtomicUsize,
}

impl MemorySocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` connection attempts fail.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.current.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Sends a text frame on the open connection.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.send(SocketEvent::Message(text.into()))
    }

    /// Closes the open connection from the server side.
    pub fn drop_connection(&self) -> bool {
        let sent = self.send(SocketEvent::Closed(Some("server closed".to_string())));
        self.current.lock().take();
        sent
    }

    fn send(&self, event: SocketEvent) -> bool {
        match self.current.lock().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Socket for MemorySocket {
    async fn connect(&self, _url: &str) -> Result<SocketConnection> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::Network("connection refused".to_string()));
        }
        let (tx, connection) = SocketConnection::channel();
        *self.current.lock() = Some(tx);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }
}
