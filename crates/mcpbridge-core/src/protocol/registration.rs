//! Registration Protocol Codec
//!
//! Stateless translation between wire text and typed registration messages,
//! plus conversion of messages into `ClientRecord`s.
//!
//! ```json
//! {"type":"register","timestamp":"2026-01-22T10:00:00Z","clientId":"c1","clientType":"claude",
//!  "capabilities":{"features":{"reconnect":true}},"transport":"unix-socket"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{ClientCapabilities, ClientRecord, ClientType, ConnectionState, TransportKind};

/// Registration wire message family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistrationMessage {
    Register(RegisterMessage),
    RegisterResponse(RegisterResponseMessage),
    Heartbeat(HeartbeatMessage),
    HeartbeatResponse(HeartbeatResponseMessage),
    Disconnect(DisconnectMessage),
}

impl RegistrationMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::RegisterResponse(_) => "register_response",
            Self::Heartbeat(_) => "heartbeat",
            Self::HeartbeatResponse(_) => "heartbeat_response",
            Self::Disconnect(_) => "disconnect",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Register(m) => m.timestamp,
            Self::RegisterResponse(m) => m.timestamp,
            Self::Heartbeat(m) => m.timestamp,
            Self::HeartbeatResponse(m) => m.timestamp,
            Self::Disconnect(m) => m.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMessage {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub client_type: ClientType,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
}

/// What the bridge advertises back to a registering client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerCapabilities {
    pub protocol_version: String,
    pub supported_methods: Vec<String>,
    pub supported_transports: Vec<TransportKind>,
    pub routing: bool,
    pub reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponseMessage {
    pub timestamp: DateTime<Utc>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_capabilities: Option<ServerCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponseMessage {
    pub timestamp: DateTime<Utc>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectMessage {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ============================================================================
// PARSE / SERIALIZE
// ============================================================================

/// Parse a registration message. Never fails loudly: malformed JSON, an
/// unknown `type`, or a missing `timestamp` yields `None`.
pub fn parse_message(text: &str) -> Option<RegistrationMessage> {
    match serde_json::from_str::<RegistrationMessage>(text) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "[Registration] Discarding malformed message");
            None
        }
    }
}

/// As `parse_message`, from an already-decoded JSON value
pub fn parse_value(value: serde_json::Value) -> Option<RegistrationMessage> {
    let kind = value
        .get("type")
        .and_then(|kind| kind.as_str())
        .map(str::to_owned);
    match serde_json::from_value::<RegistrationMessage>(value) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(
                message_type = ?kind,
                error = %e,
                "[Registration] Discarding malformed message"
            );
            None
        }
    }
}

pub fn serialize_message(message: &RegistrationMessage) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

// ============================================================================
// BUILDERS
// ============================================================================

pub fn create_register_message(
    client_type: ClientType,
    client_id: Option<String>,
    capabilities: ClientCapabilities,
    transport: TransportKind,
    socket_path: Option<String>,
) -> RegistrationMessage {
    RegistrationMessage::Register(RegisterMessage {
        timestamp: Utc::now(),
        client_id,
        client_type,
        capabilities,
        transport,
        socket_path,
    })
}

pub fn create_register_response_message(
    client_id: &str,
    server_capabilities: ServerCapabilities,
) -> RegistrationMessage {
    RegistrationMessage::RegisterResponse(RegisterResponseMessage {
        timestamp: Utc::now(),
        status: ResponseStatus::Success,
        client_id: Some(client_id.to_string()),
        server_capabilities: Some(server_capabilities),
        error: None,
    })
}

pub fn create_register_error_message(
    client_id: Option<String>,
    error: impl Into<String>,
) -> RegistrationMessage {
    RegistrationMessage::RegisterResponse(RegisterResponseMessage {
        timestamp: Utc::now(),
        status: ResponseStatus::Error,
        client_id,
        server_capabilities: None,
        error: Some(error.into()),
    })
}

pub fn create_heartbeat_message(client_id: &str) -> RegistrationMessage {
    RegistrationMessage::Heartbeat(HeartbeatMessage {
        timestamp: Utc::now(),
        client_id: client_id.to_string(),
    })
}

pub fn create_heartbeat_response_message(
    client_id: &str,
    status: ResponseStatus,
    error: Option<String>,
) -> RegistrationMessage {
    RegistrationMessage::HeartbeatResponse(HeartbeatResponseMessage {
        timestamp: Utc::now(),
        status,
        client_id: Some(client_id.to_string()),
        error,
    })
}

pub fn create_disconnect_message(client_id: &str, reason: Option<String>) -> RegistrationMessage {
    RegistrationMessage::Disconnect(DisconnectMessage {
        timestamp: Utc::now(),
        client_id: client_id.to_string(),
        reason,
    })
}

// ============================================================================
// MESSAGE → RECORD
// ============================================================================

/// Build the record for a registering client: `Connected`, with an id
/// derived as `{type}-{uuid}` when the client did not supply one.
pub fn handle_register_message(message: &RegisterMessage) -> ClientRecord {
    let id = message
        .client_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| ClientRecord::generate_id(message.client_type));

    let mut record = ClientRecord::new(id, message.client_type, message.transport)
        .with_capabilities(message.capabilities.clone())
        .with_state(ConnectionState::Connected);
    record.socket_path = message.socket_path.clone();
    record
}

/// Copy of `record` with a refreshed `last_seen`
pub fn handle_heartbeat_message(_message: &HeartbeatMessage, record: &ClientRecord) -> ClientRecord {
    let mut updated = record.clone();
    updated.touch();
    updated
}

/// Copy of `record` marked disconnected
pub fn handle_disconnect_message(
    _message: &DisconnectMessage,
    record: &ClientRecord,
) -> ClientRecord {
    let mut updated = record.clone();
    updated.set_state(ConnectionState::Disconnected);
    updated
}
