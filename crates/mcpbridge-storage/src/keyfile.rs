//! Master key storage for snapshot encryption.
//!
//! The key lives hex-encoded in a `0600` file under the data directory, or is
//! supplied through `MCPBRIDGE_SNAPSHOT_KEY`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mcpbridge_core::branding;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{generate_master_key, KEY_SIZE};

/// Environment variable carrying a hex-encoded master key
pub const SNAPSHOT_KEY_ENV: &str = "MCPBRIDGE_SNAPSHOT_KEY";

const KEY_FILE_NAME: &str = "snapshot.key";

pub trait MasterKeyProvider: Send + Sync {
    /// Get the master key, creating one if it doesn't exist.
    fn get_or_create_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>>;

    fn key_exists(&self) -> bool;

    /// Delete the master key (for testing or reset).
    fn delete_key(&self) -> Result<()>;
}

/// Key kept in a file readable only by the current user
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/snapshot.key`
    pub fn in_data_dir() -> Self {
        Self::new(branding::data_dir().join(KEY_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_key(&self, hex_key: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.path, hex_key)
            .with_context(|| format!("Failed to write key file {}", self.path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict key file permissions")?;
        }
        Ok(())
    }
}

impl MasterKeyProvider for FileKeyProvider {
    fn get_or_create_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        match std::fs::read_to_string(&self.path) {
            Ok(hex_key) => {
                debug!(path = %self.path.display(), "[Storage] Loaded master key");
                let hex_key = Zeroizing::new(hex_key);
                decode_key(hex_key.trim())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "[Storage] No master key found, generating");
                let key = generate_master_key()?;
                let hex_key = Zeroizing::new(hex::encode(&key[..]));
                self.write_key(&hex_key)?;
                Ok(key)
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read key file {}: {}",
                self.path.display(),
                e
            )),
        }
    }

    fn key_exists(&self) -> bool {
        self.path.exists()
    }

    fn delete_key(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("[Storage] Master key deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to delete key file: {}", e)),
        }
    }
}

/// Key taken from `MCPBRIDGE_SNAPSHOT_KEY`; never generated or deleted
pub struct EnvKeyProvider;

impl MasterKeyProvider for EnvKeyProvider {
    fn get_or_create_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let hex_key = Zeroizing::new(
            std::env::var(SNAPSHOT_KEY_ENV)
                .with_context(|| format!("{} is not set", SNAPSHOT_KEY_ENV))?,
        );
        decode_key(hex_key.trim())
    }

    fn key_exists(&self) -> bool {
        std::env::var_os(SNAPSHOT_KEY_ENV).is_some()
    }

    fn delete_key(&self) -> Result<()> {
        anyhow::bail!("{} cannot be deleted by the bridge", SNAPSHOT_KEY_ENV)
    }
}

fn decode_key(hex_key: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let bytes = Zeroizing::new(hex::decode(hex_key).context("Invalid master key encoding")?);
    if bytes.len() != KEY_SIZE {
        anyhow::bail!(
            "Invalid master key size: expected {}, got {}",
            KEY_SIZE,
            bytes.len()
        );
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&bytes);
    Ok(key)
}
