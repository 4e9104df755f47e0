//! JSON-RPC frames for established sessions
//!
//! One struct covers requests, notifications, results, and errors; `kind()`
//! classifies a decoded frame. Routed requests may carry a top-level
//! `targetClientId` naming the destination client explicitly.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method names the bridge itself understands
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const NOTIFICATION_PREFIX: &str = "notifications/";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PROGRESS: &str = "notifications/progress";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";

    /// Notifications that need no response and are surfaced as events
    pub const KNOWN_NOTIFICATIONS: &[&str] = &[
        INITIALIZED,
        CANCELLED,
        PROGRESS,
        TOOLS_LIST_CHANGED,
        RESOURCES_LIST_CHANGED,
        PROMPTS_LIST_CHANGED,
    ];

    /// Methods handled by the connection layer rather than routed
    pub fn is_session_method(method: &str) -> bool {
        method == INITIALIZE || method == PING || method.starts_with(NOTIFICATION_PREFIX)
    }
}

/// Standard and bridge-specific error codes
pub mod error_codes {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// No connected client could take the request
    pub const ROUTING_FAILED: i64 = -32000;
    /// Delivery retries exhausted
    pub const DELIVERY_FAILED: i64 = -32001;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcFrame {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<String>,
}

/// Shape of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind<'a> {
    Request { id: &'a RequestId, method: &'a str },
    Notification { method: &'a str },
    Response { id: &'a RequestId },
    Invalid,
}

impl JsonRpcFrame {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
            target_client_id: None,
        }
    }

    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Error response; `id` is `None` when the request id is unknown
    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::empty()
        }
    }

    pub fn with_target(mut self, client_id: impl Into<String>) -> Self {
        self.target_client_id = Some(client_id.into());
        self
    }

    pub fn kind(&self) -> FrameKind<'_> {
        match (&self.id, &self.method) {
            (Some(id), Some(method)) => FrameKind::Request { id, method },
            (None, Some(method)) => FrameKind::Notification { method },
            (Some(id), None) if self.result.is_some() || self.error.is_some() => {
                FrameKind::Response { id }
            }
            _ => FrameKind::Invalid,
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind(), FrameKind::Response { .. })
    }

    /// Serialized bytes without framing; the transport adds delimiters
    pub fn encode(&self) -> Vec<u8> {
        // A struct of strings, numbers, and JSON values always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
