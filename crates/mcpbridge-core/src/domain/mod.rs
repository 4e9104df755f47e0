//! Domain entities for McpBridge

pub mod client;
pub mod event;
pub mod task;

pub use client::{
    ClientCapabilities, ClientFeatures, ClientRecord, ClientType, ConnectionState, TransportKind,
};
pub use event::BridgeEvent;
pub use task::{Task, TaskStatus, TaskUpdate};
