//! # McpBridge Core Library
//!
//! Domain model, configuration, and wire protocol for the McpBridge daemon.
//!
//! ## Modules
//!
//! - `branding` - Product naming and default file locations
//! - `config` - Bridge configuration (`BridgeConfig`) and routing rules
//! - `domain` - Client records, connection states, tasks, bridge events
//! - `event_bus` - Bounded broadcast distribution of `BridgeEvent`s
//! - `protocol` - Registration codec and JSON-RPC session frames
//! - `repository` - Collaborator traits (snapshot storage)

pub mod branding;
pub mod config;
pub mod domain;
pub mod event_bus;
pub mod protocol;
pub mod repository;

pub use config::{AutoStartClient, BridgeConfig, ConfigError, RoutingRule};
pub use domain::*;
pub use event_bus::{EventBus, EventReceiver, EventSender};
pub use protocol::{InboundFrame, JsonRpcError, JsonRpcFrame, RegistrationMessage, RequestId};
pub use repository::{SnapshotStore, StorageError};
