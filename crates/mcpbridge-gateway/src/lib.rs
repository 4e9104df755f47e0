//! McpBridge Gateway
//!
//! The connection lifecycle and message-routing subsystem:
//! - `registry` - authoritative map of known clients (Discovery Registry)
//! - `connection` - per-client state machine, handshake, reconnection
//! - `router` - method-based target resolution and delivery
//! - `tasks` - bookkeeping for routed requests
//! - `transport` - framed byte delivery (Unix-domain socket)
//! - `process` - spawning bridge-managed client processes
//! - `bridge` - orchestrator wiring the above together and running the timers

pub mod bridge;
pub mod connection;
pub mod process;
pub mod registry;
pub mod router;
pub mod tasks;
pub mod transport;

pub use bridge::{Bridge, BridgeDependencies};
pub use connection::{ConnectionError, ConnectionManager, ConnectionSettings};
pub use process::{ProcessEvent, ProcessHandle, ProcessSpawner, ProcessSpec, TokioProcessSpawner};
pub use registry::DiscoveryRegistry;
pub use router::{
    determine_target_type, OutboundMessage, RoutedMessage, Router, RouterChannels, RoutingError,
    RoutingFailure, RoutingTable,
};
pub use tasks::{CleanupReport, TaskStore};
pub use transport::{PeerId, Transport, TransportError, TransportEvent};

#[cfg(unix)]
pub use transport::unix::UnixSocketTransport;
