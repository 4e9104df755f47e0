//! McpBridge Storage Layer
//!
//! File-backed snapshots of bridge state with integrity checks and optional
//! encryption at rest.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            SnapshotStore (core trait)        │
//! ├──────────────────────────────────────────────┤
//! │              FileSnapshotStore               │
//! │   (envelope + SHA-256 checksum, atomic swap) │
//! ├──────────────────────────────────────────────┤
//! │         SnapshotCipher (AES-256-GCM)         │
//! ├──────────────────────────────────────────────┤
//! │    MasterKeyProvider (key file / env var)    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use mcpbridge_storage::{SnapshotCipher, FileKeyProvider, FileSnapshotStore, MasterKeyProvider};
//! use std::sync::Arc;
//!
//! let key = FileKeyProvider::in_data_dir().get_or_create_key()?;
//! let store = FileSnapshotStore::new(snapshot_dir)
//!     .with_cipher(Arc::new(SnapshotCipher::new(&key)?));
//! ```

pub mod crypto;
mod file_store;
pub mod keyfile;

pub use crypto::{generate_master_key, SnapshotCipher, KEY_SIZE};
pub use file_store::FileSnapshotStore;
pub use keyfile::{EnvKeyProvider, FileKeyProvider, MasterKeyProvider, SNAPSHOT_KEY_ENV};
