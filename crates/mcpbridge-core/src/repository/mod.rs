//! Collaborator traits
//!
//! The bridge persists only optional snapshots of its registry. The storage
//! backend is injected; see `mcpbridge-storage` for the file implementation.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checksum mismatch for '{path}'")]
    ChecksumMismatch { path: String },
    #[error("encryption error: {0}")]
    Crypto(String),
    #[error("invalid storage path '{0}'")]
    InvalidPath(String),
}

/// Key/value store for JSON snapshots with atomic-replace semantics
///
/// `path` is a relative key (`"clients.json"`, `"state/clients.json"`).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Write `value` at `path`, replacing any previous value atomically
    async fn write(&self, path: &str, value: &Value) -> Result<(), StorageError>;

    /// Read the value at `path`; `Ok(None)` if nothing was written
    async fn read(&self, path: &str) -> Result<Option<Value>, StorageError>;

    /// Remove the value at `path`; removing a missing value succeeds
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}
