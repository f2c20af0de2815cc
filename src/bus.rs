use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Authentication state changes observed by a gateway, possibly caused by
/// another client sharing the same backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthChange {
    SignedIn,
    SignedOut,
}

pub struct EventBus {
    tx: broadcast::Sender<AuthChange>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.tx.subscribe()
    }

    pub fn publish(&self, change: AuthChange) {
        // No receivers is fine
        let _ = self.tx.send(change);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
