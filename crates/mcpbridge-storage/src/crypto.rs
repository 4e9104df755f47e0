//! Snapshot encryption at rest.
//!
//! Payloads are sealed with AES-256-GCM. The snapshot key (`"clients.json"`)
//! is bound as associated data, so a sealed payload only opens under the key
//! it was written to. Sealed form: hex(nonce || ciphertext || tag).

use mcpbridge_core::StorageError;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use zeroize::Zeroizing;

/// Master key length (AES-256)
pub const KEY_SIZE: usize = 32;

pub struct SnapshotCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SnapshotCipher {
    pub fn new(master_key: &[u8; KEY_SIZE]) -> Result<Self, StorageError> {
        let key = UnboundKey::new(&AES_256_GCM, master_key)
            .map_err(|_| crypto_error("invalid master key"))?;
        Ok(Self {
            key: LessSafeKey::new(key),
            rng: SystemRandom::new(),
        })
    }

    /// Serialize `value` and seal it for `path`
    pub fn seal(&self, path: &str, value: &Value) -> Result<String, StorageError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| crypto_error("nonce generation failed"))?;

        let mut buffer = Zeroizing::new(serde_json::to_vec(value)?);
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(path.as_bytes()),
                &mut *buffer,
            )
            .map_err(|_| crypto_error("sealing failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + buffer.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&buffer);
        Ok(hex::encode(sealed))
    }

    /// Open a payload sealed for `path` and parse it back into JSON
    pub fn open(&self, path: &str, sealed: &str) -> Result<Value, StorageError> {
        let bytes = hex::decode(sealed).map_err(|_| crypto_error("payload is not hex"))?;
        if bytes.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(crypto_error("payload too short"));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| crypto_error("invalid nonce"))?;
        // Plaintext holds client socket paths; wipe it once parsed
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(path.as_bytes()), &mut *buffer)
            .map_err(|_| {
                crypto_error(&format!("cannot open '{}': wrong key or tampered payload", path))
            })?;
        Ok(serde_json::from_slice(plaintext)?)
    }
}

fn crypto_error(message: &str) -> StorageError {
    StorageError::Crypto(message.to_string())
}

/// Fresh random master key
pub fn generate_master_key() -> anyhow::Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    SystemRandom::new()
        .fill(&mut key[..])
        .map_err(|_| anyhow::anyhow!("Failed to generate random key"))?;
    Ok(key)
}

/// Hex-encoded SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(digest(&SHA256, bytes).as_ref())
}
