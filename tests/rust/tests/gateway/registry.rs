//! DiscoveryRegistry tests across threads and lifecycle states

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mcpbridge_core::{BridgeEvent, EventBus};
use mcpbridge_gateway::DiscoveryRegistry;
use pretty_assertions::assert_eq;
use serde_json::json;
use tests::fixtures::connected_client;
use tests::{ClientRecord, ClientType, ConnectionState, TransportKind};

fn registry() -> (Arc<DiscoveryRegistry>, mcpbridge_core::EventReceiver) {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    (Arc::new(DiscoveryRegistry::new(bus.sender())), rx)
}

fn in_state(id: &str, state: ConnectionState) -> ClientRecord {
    ClientRecord::new(id, ClientType::Claude, TransportKind::UnixSocket).with_state(state)
}

#[test]
fn test_purge_spares_connected_and_in_flight() {
    let (registry, _rx) = registry();
    let now = Utc::now();
    let long_ago = now - chrono::Duration::hours(2);

    for (id, state) in [
        ("connected", ConnectionState::Connected),
        ("connecting", ConnectionState::Connecting),
        ("handshaking", ConnectionState::Handshaking),
        ("disconnected", ConnectionState::Disconnected),
        ("error", ConnectionState::Error),
        ("discovered", ConnectionState::Discovered),
    ] {
        registry.register_client(in_state(id, state));
        registry.update_client(id, |r| r.last_seen = long_ago);
    }

    let mut purged = registry.purge_disconnected(now, Duration::from_secs(3_600));
    purged.sort();
    assert_eq!(purged, vec!["disconnected", "discovered", "error"]);

    let mut remaining: Vec<String> = registry.all_clients().into_iter().map(|r| r.id).collect();
    remaining.sort();
    assert_eq!(remaining, vec!["connected", "connecting", "handshaking"]);
}

#[test]
fn test_found_then_lost_events() {
    let (registry, mut rx) = registry();
    registry.register_client(connected_client("claude-1", ClientType::Claude));
    registry.update_client("claude-1", |r| r.touch());
    registry.remove_client("claude-1");

    let types: Vec<&str> = rx.drain().iter().map(BridgeEvent::type_name).collect();
    assert_eq!(types, vec!["client_found", "client_lost"]);
}

#[test]
fn test_update_unknown_client_is_none() {
    let (registry, _rx) = registry();
    assert!(registry
        .update_client("ghost", |r| r.set_state(ConnectionState::Connected))
        .is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_concurrent_registration() {
    let (registry, _rx) = registry();

    std::thread::scope(|scope| {
        for worker in 0..8 {
            let registry = registry.clone();
            scope.spawn(move || {
                for n in 0..50 {
                    let id = format!("client-{}-{}", worker, n);
                    registry.register_client(connected_client(&id, ClientType::Cline));
                    // Second registration of the same id is a refresh
                    registry.register_client(connected_client(&id, ClientType::Cline));
                }
            });
        }
    });

    assert_eq!(registry.len(), 400);
    assert_eq!(registry.connected_clients_by_type(ClientType::Cline).len(), 400);
    assert!(registry.connected_clients_by_type(ClientType::Claude).is_empty());
}

#[test]
fn test_record_wire_shape() {
    let record = connected_client("claude-1", ClientType::Claude)
        .with_socket_path("/tmp/claude-1.sock")
        .with_process_id(4242);
    let value = serde_json::to_value(&record).unwrap();

    assert_eq!(value["id"], json!("claude-1"));
    assert_eq!(value["type"], json!("claude"));
    assert_eq!(value["socketPath"], json!("/tmp/claude-1.sock"));
    assert_eq!(value["connected"], json!(true));
    assert_eq!(value["processId"], json!(4242));

    let parsed: ClientRecord = serde_json::from_value(value).unwrap();
    assert_eq!(parsed, record);
}
