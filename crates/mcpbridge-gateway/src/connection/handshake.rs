//! MCP-style handshake payloads
//!
//! The bridge acts as the client side of `initialize` when it dials a
//! reconnect-capable client, and as the server side when a client sends
//! `initialize` to it. Payloads use the rmcp model types.

use mcpbridge_core::branding::{APP_NAME, DISPLAY_NAME};
use mcpbridge_core::protocol::methods;
use mcpbridge_core::{JsonRpcFrame, RequestId};
use rmcp::model::{
    ClientInfo, Implementation, InitializeResult, ProtocolVersion, ServerCapabilities,
    ToolsCapability,
};
use serde_json::Value;

fn implementation() -> Implementation {
    Implementation {
        name: APP_NAME.to_string(),
        title: Some(DISPLAY_NAME.to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ..Default::default()
    }
}

/// Protocol version the bridge requests and answers with
pub fn protocol_version() -> String {
    ProtocolVersion::LATEST.to_string()
}

pub fn client_info() -> ClientInfo {
    ClientInfo {
        meta: None,
        protocol_version: ProtocolVersion::LATEST,
        capabilities: Default::default(),
        client_info: implementation(),
    }
}

pub fn server_info() -> InitializeResult {
    InitializeResult {
        protocol_version: ProtocolVersion::LATEST,
        capabilities: ServerCapabilities::builder()
            .enable_tools_with(ToolsCapability {
                list_changed: Some(true),
            })
            .build(),
        server_info: implementation(),
        instructions: Some(
            "McpBridge routes method calls between registered clients.".to_string(),
        ),
    }
}

/// The `initialize` request sent when dialing a client
pub fn initialize_request(id: RequestId) -> JsonRpcFrame {
    JsonRpcFrame::request(
        id,
        methods::INITIALIZE,
        serde_json::to_value(client_info()).ok(),
    )
}

/// Reply to an inbound `initialize`
pub fn initialize_response(id: RequestId) -> JsonRpcFrame {
    let result = serde_json::to_value(server_info()).unwrap_or(Value::Null);
    JsonRpcFrame::result(id, result)
}

/// Empty-result reply to `ping`
pub fn ping_response(id: RequestId) -> JsonRpcFrame {
    JsonRpcFrame::result(id, Value::Object(Default::default()))
}

pub fn initialized_notification() -> JsonRpcFrame {
    JsonRpcFrame::notification(methods::INITIALIZED, None)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted {
        protocol_version: String,
        server_name: Option<String>,
    },
    Rejected(String),
}

impl HandshakeOutcome {
    /// Whether the peer answered with the version the bridge asked for
    pub fn version_matches(&self) -> bool {
        match self {
            Self::Accepted {
                protocol_version: version,
                ..
            } => *version == protocol_version(),
            Self::Rejected(_) => false,
        }
    }
}

/// Judge an `initialize` response frame
pub fn evaluate_response(frame: &JsonRpcFrame) -> HandshakeOutcome {
    if let Some(error) = &frame.error {
        return HandshakeOutcome::Rejected(format!("{} ({})", error.message, error.code));
    }
    let Some(result) = &frame.result else {
        return HandshakeOutcome::Rejected("initialize response carried no result".to_string());
    };

    if let Ok(parsed) = serde_json::from_value::<InitializeResult>(result.clone()) {
        return HandshakeOutcome::Accepted {
            protocol_version: parsed.protocol_version.to_string(),
            server_name: Some(parsed.server_info.name),
        };
    }

    // Peers with capability shapes rmcp does not model still only need a version
    match result.get("protocolVersion").and_then(Value::as_str) {
        Some(version) => HandshakeOutcome::Accepted {
            protocol_version: version.to_string(),
            server_name: result
                .pointer("/serverInfo/name")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        None => HandshakeOutcome::Rejected("initialize result missing protocolVersion".to_string()),
    }
}
