//! Centralized branding constants
//!
//! All product naming and default locations come from this module.

use std::path::PathBuf;

/// Machine-readable product name (binary, directories, implementation name)
pub const APP_NAME: &str = "mcpbridge";

/// Human-readable product name
pub const DISPLAY_NAME: &str = "McpBridge";

/// File name of the bridge's Unix-domain socket
pub const SOCKET_FILE_NAME: &str = "mcpbridge.sock";

/// Prefix for rolling log files (`mcpbridge.2026-01-22.log`)
pub const LOG_PREFIX: &str = "mcpbridge";

/// Environment variable handed to spawned clients carrying their assigned id
pub const CLIENT_ID_ENV: &str = "MCPBRIDGE_CLIENT_ID";

/// Environment variable handed to spawned clients carrying the socket path
pub const SOCKET_ENV: &str = "MCPBRIDGE_SOCKET";

/// Environment variable naming the config file to load
pub const CONFIG_ENV: &str = "MCPBRIDGE_CONFIG";

/// Application data directory (`~/.local/share/mcpbridge` on Linux)
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Default socket location: the user runtime dir when available, else the data dir
pub fn default_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join(SOCKET_FILE_NAME),
        None => data_dir().join(SOCKET_FILE_NAME),
    }
}

/// Logs directory under the data dir
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}
