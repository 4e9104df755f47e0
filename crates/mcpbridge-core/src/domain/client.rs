//! Client Record - one entry per remote client known to the bridge

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// CLIENT TYPE
// ============================================================================

/// Kind of client process. The default routing dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Claude,
    Cline,
    Other,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Cline => "cline",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "cline" => Ok(Self::Cline),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown client type '{}'", other)),
        }
    }
}

// ============================================================================
// TRANSPORT KIND
// ============================================================================

/// Transport a client declares it speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportKind {
    #[serde(rename = "stdio")]
    Stdio,
    #[serde(rename = "http")]
    Http,
    #[default]
    #[serde(rename = "unix-socket")]
    UnixSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::UnixSocket => "unix-socket",
        }
    }
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Feature flags a client declares at registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientFeatures {
    pub auto_start: bool,
    /// Sole trigger for automatic reconnection after loss
    pub reconnect: bool,
    pub health_check: bool,
}

/// Declared method/transport support and feature flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientCapabilities {
    pub supported_methods: Vec<String>,
    pub supported_transports: Vec<TransportKind>,
    pub features: ClientFeatures,
}

impl ClientCapabilities {
    /// Capabilities with only the reconnect flag set
    pub fn reconnecting() -> Self {
        Self {
            features: ClientFeatures {
                reconnect: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn supports_method(&self, method: &str) -> bool {
        self.supported_methods.iter().any(|m| m == method)
    }
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Lifecycle of a client connection
///
/// `Discovered → Discovering → Connecting → Handshaking → Connected → Disconnected`,
/// with `Error` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Discovered,
    Discovering,
    Connecting,
    Handshaking,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Discovering => "discovering",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// A connection attempt is underway
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Connecting | Self::Handshaking)
    }

    /// Terminal unless a reconnection attempt recreates the record
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Whether the handshake-driven path may move from `self` to `next`.
    ///
    /// Inbound registration is the one trigger allowed to jump straight to
    /// `Connected`; it does not go through this check.
    pub fn can_advance_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if next == Error {
            return !self.is_terminal() && *self != Error;
        }
        matches!(
            (self, next),
            (Discovered, Discovering)
                | (Discovered, Connecting)
                | (Discovering, Connecting)
                | (Discovering, Disconnected)
                | (Connecting, Handshaking)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Handshaking, Connected)
                | (Handshaking, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Connecting)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CLIENT RECORD
// ============================================================================

/// Canonical representation of one remote client
///
/// Invariant: `connected == true` implies `state == Connected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    /// Stable identifier, immutable once assigned
    pub id: String,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    /// True only once the handshake (or registration) has fully completed
    pub connected: bool,
    pub state: ConnectionState,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    /// Set only for clients the bridge itself spawned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
}

impl ClientRecord {
    /// New record in the `Discovered` state
    pub fn new(id: impl Into<String>, client_type: ClientType, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            client_type,
            transport,
            socket_path: None,
            connected: false,
            state: ConnectionState::Discovered,
            last_seen: Utc::now(),
            capabilities: ClientCapabilities::default(),
            process_id: None,
        }
    }

    /// Derive a fresh id of the form `{type}-{uuid}`
    pub fn generate_id(client_type: ClientType) -> String {
        format!("{}-{}", client_type, Uuid::new_v4())
    }

    pub fn with_socket_path(mut self, path: impl Into<String>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_process_id(mut self, pid: u32) -> Self {
        self.process_id = Some(pid);
        self
    }

    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.set_state(state);
        self
    }

    /// Set state and keep `connected` consistent with it
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.connected = state.is_connected();
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn wants_reconnect(&self) -> bool {
        self.capabilities.features.reconnect
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.state.is_connected()
    }
}
