//! Connectivity signal shared by the mutation and sync engines.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone)]
pub struct NetworkStatus {
    online: Arc<watch::Sender<bool>>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self {
            online: Arc::new(tx),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            info!(online, "network status changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_notify_subscribers() {
        let status = NetworkStatus::new(false);
        let mut rx = status.subscribe();
        assert!(!status.is_online());

        status.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        status.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }
}
