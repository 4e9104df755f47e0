//! Wire protocol
//!
//! Two message families share one connection:
//! - registration messages (`{"type": "register", ...}`), see `registration`
//! - JSON-RPC session frames (`{"jsonrpc": "2.0", ...}`), see `jsonrpc`

pub mod jsonrpc;
pub mod registration;

pub use jsonrpc::{error_codes, methods, FrameKind, JsonRpcError, JsonRpcFrame, RequestId};
pub use registration::{RegistrationMessage, ResponseStatus, ServerCapabilities};

use serde_json::Value;
use tracing::warn;

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Registration(RegistrationMessage),
    Rpc(JsonRpcFrame),
}

impl InboundFrame {
    /// Decode one frame; `None` for anything malformed
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "[Protocol] Frame is not JSON");
                return None;
            }
        };

        if value.get("jsonrpc").is_some() {
            return match serde_json::from_value::<JsonRpcFrame>(value) {
                Ok(frame) => Some(Self::Rpc(frame)),
                Err(e) => {
                    warn!(error = %e, "[Protocol] Invalid JSON-RPC frame");
                    None
                }
            };
        }

        registration::parse_value(value).map(Self::Registration)
    }
}
