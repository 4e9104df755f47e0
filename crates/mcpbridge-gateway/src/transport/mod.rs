//! Transport abstraction for client connections
//!
//! The core never touches sockets. A transport delivers framed bytes to a
//! client id, dials clients that declared a socket path, and reports inbound
//! frames and connection loss as `TransportEvent`s on an mpsc channel.
//!
//! Accepted connections start out anonymous (identified only by `PeerId`);
//! after a successful registration the bridge binds the peer to the client id.

#[cfg(unix)]
pub mod unix;

use async_trait::async_trait;
use mcpbridge_core::ClientRecord;
use thiserror::Error;

/// Transport-local connection identifier
pub type PeerId = u64;

/// Maximum accepted frame size in bytes
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete inbound frame
    Message {
        peer: PeerId,
        client_id: Option<String>,
        payload: Vec<u8>,
    },
    /// The connection is gone; `client_id` is set if it was still bound
    Closed {
        peer: PeerId,
        client_id: Option<String>,
    },
}

impl TransportEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            Self::Message { peer, .. } | Self::Closed { peer, .. } => *peer,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::Message { client_id, .. } | Self::Closed { client_id, .. } => {
                client_id.as_deref()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("client '{0}' has no live connection")]
    NotConnected(String),
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("client '{0}' declared no socket path")]
    NoSocketPath(String),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one frame to a bound client
    async fn send(&self, client_id: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Deliver one frame to a peer, bound or not (registration replies)
    async fn reply(&self, peer: PeerId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Ensure a live connection to `record`, dialing its `socket_path` if needed
    async fn open(&self, record: &ClientRecord) -> Result<(), TransportError>;

    /// Associate an accepted peer with a registered client id
    fn bind(&self, peer: PeerId, client_id: &str);

    /// Drop the client's connection, if any. No `Closed` event is reported.
    async fn close(&self, client_id: &str);

    /// Stop accepting and drop every connection
    async fn shutdown(&self) {}

    /// Description for logging
    fn description(&self) -> String;
}
