//! Bridge configuration
//!
//! Field names match the recognized JSON option names (`reconnectIntervalMs`,
//! `maxReconnectAttempts`, `routingRules`, ...). Every field has a default, so
//! an empty object is a valid config file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::branding;
use crate::domain::ClientType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Method → client-type routing rule
///
/// Keys in `routingRules` are exact method names, or prefixes ending in `*`
/// (`"tools/*"`). Exact keys always win; among prefix keys the highest
/// `priority` wins, then the longest prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub target_type: ClientType,
    #[serde(default)]
    pub priority: i32,
}

impl RoutingRule {
    pub fn new(target_type: ClientType) -> Self {
        Self {
            target_type,
            priority: 0,
        }
    }
}

/// A client process the bridge starts itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoStartClient {
    pub client_type: ClientType,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub socket_path: PathBuf,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub handshake_timeout_ms: u64,
    /// Legacy heartbeat-interval liveness mode. Accepted, not acted upon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
    /// Legacy heartbeat-interval liveness mode. Accepted, not acted upon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<u64>,
    pub cleanup_interval_ms: u64,
    pub task_expiration_ms: u64,
    pub scan_interval_ms: u64,
    pub task_max_attempts: u32,
    pub default_target_type: Option<ClientType>,
    pub routing_rules: HashMap<String, RoutingRule>,
    pub event_capacity: usize,
    pub snapshot_path: Option<PathBuf>,
    pub autostart: Vec<AutoStartClient>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: branding::default_socket_path(),
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 5,
            handshake_timeout_ms: 10_000,
            heartbeat_interval: None,
            heartbeat_timeout: None,
            cleanup_interval_ms: 60_000,
            task_expiration_ms: 3_600_000,
            scan_interval_ms: 30_000,
            task_max_attempts: 3,
            default_target_type: None,
            routing_rules: HashMap::new(),
            event_capacity: crate::event_bus::DEFAULT_CAPACITY,
            snapshot_path: None,
            autostart: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        if config.heartbeat_interval.is_some() || config.heartbeat_timeout.is_some() {
            warn!("[Config] heartbeatInterval/heartbeatTimeout are ignored; liveness uses the initialize/ping handshake");
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("reconnectIntervalMs", self.reconnect_interval_ms),
            ("handshakeTimeoutMs", self.handshake_timeout_ms),
            ("cleanupIntervalMs", self.cleanup_interval_ms),
            ("taskExpirationMs", self.task_expiration_ms),
            ("scanIntervalMs", self.scan_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "maxReconnectAttempts must be greater than 0".to_string(),
            ));
        }
        if self.task_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "taskMaxAttempts must be greater than 0".to_string(),
            ));
        }
        if let Some(key) = self.routing_rules.keys().find(|k| k.is_empty() || k.as_str() == "*") {
            return Err(ConfigError::Invalid(format!(
                "routing rule key '{}' is not a method or method prefix; use defaultTargetType instead",
                key
            )));
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn task_expiration(&self) -> Duration {
        Duration::from_millis(self.task_expiration_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}
