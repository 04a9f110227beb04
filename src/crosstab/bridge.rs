//! Wires the bus to the reconciler: confirmed local changes go out, changes
//! from other instances come in through the version-checked path.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crosstab::{CrossTabSyncBus, MessageKind, MessageListener, SyncMessage};
use crate::reconcile::{Origin, Reconciler, RemoteChange};

pub struct CacheBridge {
    _listener: MessageListener,
    forward: JoinHandle<()>,
}

impl CacheBridge {
    pub fn attach(bus: &CrossTabSyncBus, reconciler: Arc<Reconciler>) -> Self {
        let mut changes = reconciler.subscribe_changes();
        let outgoing = bus.clone();
        let forward = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    // Re-broadcasting these would bounce them between tabs.
                    Ok(applied) if applied.origin == Origin::CrossTab => {}
                    Ok(applied) => match serde_json::to_value(&applied.change) {
                        Ok(payload) => {
                            outgoing.broadcast(MessageKind::CacheUpdate, payload);
                        }
                        Err(err) => warn!(error = %err, "unserializable cache change"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "cache change stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        let listener = bus.on_message(move |message| apply_message(&reconciler, message));
        Self {
            _listener: listener,
            forward,
        }
    }
}

impl Drop for CacheBridge {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

/// Tells other instances to mark an entity type stale.
pub fn invalidate_payload(entity_type: &str) -> Value {
    json!({ "entity_type": entity_type })
}

fn apply_message(reconciler: &Reconciler, message: &SyncMessage) {
    match message.kind {
        MessageKind::CacheUpdate => {
            match serde_json::from_value::<RemoteChange>(message.payload.clone()) {
                Ok(change) => {
                    let outcome = reconciler.apply_remote(change, Origin::CrossTab);
                    debug!(from = %message.origin_tab_id, ?outcome, "cross-tab update");
                }
                Err(err) => warn!(error = %err, "malformed cross-tab update"),
            }
        }
        MessageKind::CacheInvalidate => {
            if let Some(entity_type) = message.payload.get("entity_type").and_then(Value::as_str) {
                reconciler
                    .store()
                    .invalidate_where(|key| key.entity_type() == entity_type);
            }
        }
        MessageKind::Heartbeat | MessageKind::TabClosed => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, CacheStore, EntryStatus};
    use crate::crosstab::CrossTabHub;
    use std::time::Duration;

    struct Tab {
        store: CacheStore,
        reconciler: Arc<Reconciler>,
        bus: CrossTabSyncBus,
        _bridge: CacheBridge,
    }

    fn tab(hub: &CrossTabHub) -> Tab {
        let store = CacheStore::new();
        let reconciler = Arc::new(Reconciler::new(store.clone()));
        let bus = CrossTabSyncBus::new(hub.clone(), Duration::from_secs(5));
        bus.start();
        let bridge = CacheBridge::attach(&bus, reconciler.clone());
        Tab {
            store,
            reconciler,
            bus,
            _bridge: bridge,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_server_change_reaches_other_tab() {
        let hub = CrossTabHub::default();
        let a = tab(&hub);
        let b = tab(&hub);
        settle().await;

        a.reconciler.apply_remote(
            RemoteChange::upsert("client:1", json!({"name": "A"}), 3),
            Origin::Realtime,
        );
        settle().await;
        let entry = b.store.peek(&CacheKey::from("client:1")).unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.value["name"], "A");
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_messages_are_noops() {
        let hub = CrossTabHub::default();
        let a = tab(&hub);
        let b = tab(&hub);
        b.store.set(CacheKey::from("client:1"), json!({"name": "new"}), 5);

        let old = serde_json::to_value(RemoteChange::upsert("client:1", json!({"name": "old"}), 4)).unwrap();
        a.bus.broadcast(MessageKind::CacheUpdate, old.clone());
        a.bus.broadcast(MessageKind::CacheUpdate, old);
        settle().await;
        let entry = b.store.peek(&CacheKey::from("client:1")).unwrap();
        assert_eq!(entry.version, 5);
        assert_eq!(entry.value["name"], "new");
    }

    #[tokio::test]
    async fn test_invalidate_marks_other_tab_stale() {
        let hub = CrossTabHub::default();
        let a = tab(&hub);
        let b = tab(&hub);
        b.store.set(CacheKey::from("deal:1"), json!({}), 1);
        b.store.set(CacheKey::from("client:1"), json!({}), 1);

        a.bus.broadcast(MessageKind::CacheInvalidate, invalidate_payload("deal"));
        settle().await;
        assert_eq!(b.store.peek(&CacheKey::from("deal:1")).unwrap().status, EntryStatus::Stale);
        assert_eq!(b.store.peek(&CacheKey::from("client:1")).unwrap().status, EntryStatus::Fresh);
    }
}
