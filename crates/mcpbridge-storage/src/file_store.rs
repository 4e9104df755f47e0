//! File-backed `SnapshotStore`
//!
//! Each key maps to one file under the store root holding an envelope:
//!
//! ```json
//! {"version": 1, "checksum": "<sha256 hex of payload>", "encrypted": false, "payload": {...}}
//! ```
//!
//! Writes go to a temp file in the destination directory which is then renamed
//! over the target, so readers see either the old or the new snapshot.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use mcpbridge_core::{SnapshotStore, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::{sha256_hex, SnapshotCipher};

const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: String,
    #[serde(default)]
    encrypted: bool,
    /// The value itself, or its sealed form when encrypted
    payload: Value,
}

pub struct FileSnapshotStore {
    root: PathBuf,
    cipher: Option<Arc<SnapshotCipher>>,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cipher: None,
        }
    }

    /// Encrypt payloads written from now on; encrypted snapshots need it to be read
    pub fn with_cipher(mut self, cipher: Arc<SnapshotCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative key to a file under the root
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn seal(&self, path: &str, value: &Value) -> Result<Envelope, StorageError> {
        let (payload, encrypted) = match &self.cipher {
            Some(cipher) => (Value::String(cipher.seal(path, value)?), true),
            None => (value.clone(), false),
        };
        Ok(Envelope {
            version: ENVELOPE_VERSION,
            checksum: sha256_hex(&serde_json::to_vec(&payload)?),
            encrypted,
            payload,
        })
    }

    fn open(&self, path: &str, envelope: Envelope) -> Result<Value, StorageError> {
        if envelope.version != ENVELOPE_VERSION {
            warn!(
                path = %path,
                version = envelope.version,
                "[Storage] Unexpected snapshot envelope version"
            );
        }
        if sha256_hex(&serde_json::to_vec(&envelope.payload)?) != envelope.checksum {
            return Err(StorageError::ChecksumMismatch {
                path: path.to_string(),
            });
        }
        if !envelope.encrypted {
            return Ok(envelope.payload);
        }

        let cipher = self.cipher.as_ref().ok_or_else(|| {
            StorageError::Crypto(format!("'{}' is encrypted but no key is configured", path))
        })?;
        let sealed = envelope.payload.as_str().ok_or_else(|| {
            StorageError::Crypto(format!("'{}' has a non-string encrypted payload", path))
        })?;
        cipher.open(path, sealed)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn write(&self, path: &str, value: &Value) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        let envelope = self.seal(path, value)?;
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let dir = target.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

        let result = async {
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            options.mode(0o600);
            let mut file = options.open(&temp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, &target).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        debug!(path = %path, bytes = bytes.len(), "[Storage] Snapshot written");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, StorageError> {
        let target = self.resolve(path)?;
        let bytes = match tokio::fs::read(&target).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        self.open(path, envelope).map(Some)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
