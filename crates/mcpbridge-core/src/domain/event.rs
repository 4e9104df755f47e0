//! Bridge Events - unified event stream for McpBridge
//!
//! Every observable change in the bridge is one variant of `BridgeEvent`.
//! Producers (registry, connection manager, bridge orchestrator) emit through
//! the `EventBus`; consumers subscribe and pick the variants they care about.
//!
//! Events serialize with a `type` field containing the snake_case variant name:
//! ```json
//! { "type": "client_connected", "client_id": "claude-1", "client_type": "claude" }
//! ```

use serde::{Deserialize, Serialize};

use super::client::{ClientType, ConnectionState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    // ════════════════════════════════════════════════════════════════════════
    // DISCOVERY
    // ════════════════════════════════════════════════════════════════════════

    /// First time an id was inserted into the registry
    ClientFound {
        client_id: String,
        client_type: ClientType,
    },

    /// A client was removed from the registry
    ClientLost { client_id: String },

    // ════════════════════════════════════════════════════════════════════════
    // CONNECTION LIFECYCLE
    // ════════════════════════════════════════════════════════════════════════

    /// Registration or handshake completed
    ClientConnected {
        client_id: String,
        client_type: ClientType,
    },

    /// A connected client went away
    ClientDisconnected {
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// State changed for a client that never fully connected
    ClientUpdated {
        client_id: String,
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Every transition, in order, for one client
    ClientStateChanged {
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionState>,
        to: ConnectionState,
    },

    /// A retry timer was armed
    ReconnectScheduled {
        client_id: String,
        attempt: u32,
        delay_ms: u64,
    },

    /// Reconnection cap reached; record discarded
    ClientAbandoned { client_id: String, attempts: u32 },

    /// Session notification received from a client (list changes, progress)
    ClientNotification { client_id: String, method: String },

    // ════════════════════════════════════════════════════════════════════════
    // TASKS
    // ════════════════════════════════════════════════════════════════════════

    TaskCreated {
        task_id: String,
        client_id: String,
        target_client_id: String,
    },

    TaskCompleted { task_id: String, client_id: String },

    TaskFailed {
        task_id: String,
        client_id: String,
        error: String,
    },

    // ════════════════════════════════════════════════════════════════════════
    // BRIDGE
    // ════════════════════════════════════════════════════════════════════════

    BridgeStarted { socket_path: String },

    BridgeStopped,
}

impl BridgeEvent {
    /// Get the event type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ClientFound { .. } => "client_found",
            Self::ClientLost { .. } => "client_lost",
            Self::ClientConnected { .. } => "client_connected",
            Self::ClientDisconnected { .. } => "client_disconnected",
            Self::ClientUpdated { .. } => "client_updated",
            Self::ClientStateChanged { .. } => "client_state_changed",
            Self::ReconnectScheduled { .. } => "reconnect_scheduled",
            Self::ClientAbandoned { .. } => "client_abandoned",
            Self::ClientNotification { .. } => "client_notification",
            Self::TaskCreated { .. } => "task_created",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::BridgeStarted { .. } => "bridge_started",
            Self::BridgeStopped => "bridge_stopped",
        }
    }

    /// Get the client_id if this event is client-scoped
    ///
    /// Task events report the origin client.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::ClientFound { client_id, .. }
            | Self::ClientLost { client_id }
            | Self::ClientConnected { client_id, .. }
            | Self::ClientDisconnected { client_id, .. }
            | Self::ClientUpdated { client_id, .. }
            | Self::ClientStateChanged { client_id, .. }
            | Self::ReconnectScheduled { client_id, .. }
            | Self::ClientAbandoned { client_id, .. }
            | Self::ClientNotification { client_id, .. }
            | Self::TaskCreated { client_id, .. }
            | Self::TaskCompleted { client_id, .. }
            | Self::TaskFailed { client_id, .. } => Some(client_id),
            Self::BridgeStarted { .. } | Self::BridgeStopped => None,
        }
    }

    /// The target state if this is a state transition
    pub fn new_state(&self) -> Option<ConnectionState> {
        match self {
            Self::ClientStateChanged { to, .. } => Some(*to),
            _ => None,
        }
    }
}
