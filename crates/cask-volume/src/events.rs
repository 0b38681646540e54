//! Volume lifecycle events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Volume event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VolumeEvent {
    /// A volume was created.
    Created {
        volume: String,
        driver: String,
        timestamp: i64,
    },
    /// A volume was attached for a container.
    Mounted {
        volume: String,
        driver: String,
        container: String,
        destination: String,
        writable: bool,
        timestamp: i64,
    },
    /// A volume was detached from a container.
    Unmounted {
        volume: String,
        driver: String,
        container: String,
        timestamp: i64,
    },
    /// A volume was removed.
    Removed {
        volume: String,
        driver: String,
        timestamp: i64,
    },
}

/// Event bus for volume events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<VolumeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: VolumeEvent) {
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event);
    }
}
