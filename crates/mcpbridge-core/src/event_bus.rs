//! Event Bus - bounded distribution of bridge events
//!
//! Producers (registry, connection manager, bridge) emit `BridgeEvent`s;
//! consumers (daemon logging, tests, future UI) subscribe independently.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                Event Bus (bounded broadcast channel)            │
//! │                                                                 │
//! │  Producers:                    Consumers:                       │
//! │  ├─ DiscoveryRegistry          ├─ Daemon event log              │
//! │  ├─ ConnectionManager          ├─ Test harnesses                │
//! │  └─ Bridge (tasks, lifecycle)  └─ Future consumers...           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Emission never blocks: with no receivers the event is dropped, and a
//! receiver that falls more than `capacity` events behind skips ahead.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::BridgeEvent;

/// Default channel capacity for the event bus
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Get a sender for emitting events
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Subscribe to all events emitted after this call
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheaply cloneable handle used by components to emit events
#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventSender {
    /// Emit an event, returning the number of receivers reached.
    ///
    /// Returns 0 if there are no subscribers (not an error).
    pub fn emit(&self, event: BridgeEvent) -> usize {
        let type_name = event.type_name();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(
                    event_type = type_name,
                    receivers = count,
                    "[EventBus] Emitted event"
                );
                count
            }
            Err(_) => {
                debug!(event_type = type_name, "[EventBus] No receivers for event");
                0
            }
        }
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// A new receiver on the same channel
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<BridgeEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once every sender is gone. Lag is logged and skipped.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        skipped_events = skipped,
                        "[EventBus] Receiver lagged, skipped {} events", skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("[EventBus] Channel closed");
                    return None;
                }
            }
        }
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(
                        skipped_events = skipped,
                        "[EventBus] Receiver lagged on try_recv"
                    );
                }
                Err(_) => return None,
            }
        }
    }

    /// Everything currently buffered for this receiver
    pub fn drain(&mut self) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
