//! Connection lifecycle
//!
//! `ConnectionManager` is the only component that moves a client through its
//! `ConnectionState`s, drives the `initialize` handshake, and arms reconnection
//! timers. `handshake` builds and judges the handshake payloads.

pub mod handshake;
mod manager;

use std::time::Duration;

use mcpbridge_core::BridgeConfig;
use thiserror::Error;

pub use manager::ConnectionManager;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection manager has been disposed")]
    Disposed,
}

/// Timing and retry policy for the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Fixed delay between reconnection attempts
    pub reconnect_interval: Duration,
    /// Attempts before a client is abandoned
    pub max_reconnect_attempts: u32,
    /// Deadline for an `initialize` response
    pub handshake_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for ConnectionSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            reconnect_interval: config.reconnect_interval(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            handshake_timeout: config.handshake_timeout(),
        }
    }
}
