//! Master key providers

use mcpbridge_storage::{FileKeyProvider, MasterKeyProvider, SnapshotCipher, KEY_SIZE};
use pretty_assertions::assert_eq;
use serde_json::json;

#[test]
fn test_file_key_is_created_once_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileKeyProvider::new(dir.path().join("keys").join("snapshot.key"));
    assert!(!provider.key_exists());

    let first = provider.get_or_create_key().unwrap();
    assert!(provider.key_exists());
    let second = provider.get_or_create_key().unwrap();
    assert_eq!(&first[..], &second[..]);

    let on_disk = std::fs::read_to_string(provider.path()).unwrap();
    assert_eq!(on_disk.trim().len(), KEY_SIZE * 2);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(provider.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn test_deleted_key_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileKeyProvider::new(dir.path().join("snapshot.key"));
    let original = provider.get_or_create_key().unwrap();

    provider.delete_key().unwrap();
    assert!(!provider.key_exists());
    // Deleting twice is fine
    provider.delete_key().unwrap();

    let replacement = provider.get_or_create_key().unwrap();
    assert_ne!(&original[..], &replacement[..]);
}

#[test]
fn test_malformed_key_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.key");
    std::fs::write(&path, "not-hex").unwrap();
    assert!(FileKeyProvider::new(&path).get_or_create_key().is_err());

    std::fs::write(&path, "abcd").unwrap();
    assert!(FileKeyProvider::new(&path).get_or_create_key().is_err());
}

#[test]
fn test_key_from_file_drives_cipher() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileKeyProvider::new(dir.path().join("snapshot.key"));
    let key = provider.get_or_create_key().unwrap();

    let sealed = SnapshotCipher::new(&key)
        .unwrap()
        .seal("clients.json", &json!({"id": "claude-1"}))
        .unwrap();
    let reloaded = provider.get_or_create_key().unwrap();
    let opened = SnapshotCipher::new(&reloaded)
        .unwrap()
        .open("clients.json", &sealed)
        .unwrap();
    assert_eq!(opened, json!({"id": "claude-1"}));
}
