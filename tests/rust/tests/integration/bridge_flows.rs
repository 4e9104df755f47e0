//! Bridge flows through mock transport, spawner, and snapshot store
//!
//! Tests cover:
//! - Registration replies, heartbeats, and peer binding
//! - Request routing, response forwarding, and routing failures
//! - Delivery retries and target loss
//! - Spawned clients, snapshots, and shutdown

use std::collections::HashMap;

use mcpbridge_core::branding::{CLIENT_ID_ENV, SOCKET_ENV};
use mcpbridge_core::protocol::registration::ResponseStatus;
use mcpbridge_core::protocol::error_codes;
use mcpbridge_core::{AutoStartClient, BridgeEvent, RegistrationMessage};
use mcpbridge_gateway::bridge::SNAPSHOT_KEY;
use mcpbridge_gateway::TransportEvent;
use pretty_assertions::assert_eq;
use serde_json::json;
use tests::events::{assert_legal_transitions, count_type};
use tests::fixtures::{
    disconnect_json, eventually, heartbeat_json, register_json, request_json, routed_config,
    test_config,
};
use tests::{
    BridgeConfig, BridgeTestHarness, ClientType, ConnectionState, JsonRpcFrame, MemorySnapshotStore,
    RequestId, TaskStatus,
};

const CLAUDE_PEER: u64 = 1;
const CLINE_PEER: u64 = 2;
const CLAUDE_2_PEER: u64 = 3;

fn tools_config() -> BridgeConfig {
    routed_config(&[("tools/call", ClientType::Claude)])
}

/// Register claude-1 and cline-1 on their own peers
async fn two_clients(config: BridgeConfig) -> BridgeTestHarness {
    let harness = BridgeTestHarness::new(config).await;
    harness
        .register(CLAUDE_PEER, "claude-1", ClientType::Claude, false)
        .await;
    harness
        .register(CLINE_PEER, "cline-1", ClientType::Cline, false)
        .await;
    harness
}

/// The single routed frame delivered to `client_id`, waiting for it
async fn delivered_to(harness: &BridgeTestHarness, client_id: &str) -> JsonRpcFrame {
    assert!(
        eventually(|| !harness.transport.frames_sent_to(client_id).is_empty()).await,
        "nothing delivered to {}",
        client_id
    );
    harness.transport.frames_sent_to(client_id).remove(0)
}

fn task_id_of(frame: &JsonRpcFrame) -> String {
    match &frame.id {
        Some(RequestId::String(task_id)) => task_id.clone(),
        other => panic!("routed frame carries no task id: {:?}", other),
    }
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_replies_and_binds_peer() {
    let mut harness = BridgeTestHarness::new(test_config()).await;
    harness
        .register(CLAUDE_PEER, "claude-1", ClientType::Claude, false)
        .await;

    let replies = harness.transport.registration_replies_to(CLAUDE_PEER);
    assert_eq!(replies.len(), 1);
    match &replies[0] {
        RegistrationMessage::RegisterResponse(response) => {
            assert_eq!(response.status, ResponseStatus::Success);
            assert_eq!(response.client_id.as_deref(), Some("claude-1"));
            assert!(response.server_capabilities.is_some());
            assert!(response.error.is_none());
        }
        other => panic!("unexpected reply {}", other.type_name()),
    }
    assert_eq!(
        harness.transport.bound_client(CLAUDE_PEER).as_deref(),
        Some("claude-1")
    );

    let record = harness.bridge.registry().get_client("claude-1").unwrap();
    assert_eq!(record.state, ConnectionState::Connected);
    assert!(record.connected);

    let events = harness.drain_events();
    assert_eq!(count_type(&events, "bridge_started"), 1);
    assert_eq!(count_type(&events, "client_connected"), 1);
    assert_legal_transitions(&events);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_known_and_unknown() {
    let harness = BridgeTestHarness::new(test_config()).await;
    harness
        .register(CLAUDE_PEER, "claude-1", ClientType::Claude, false)
        .await;

    harness
        .send(CLAUDE_PEER, Some("claude-1"), &heartbeat_json("claude-1"))
        .await;
    harness.send(9, None, &heartbeat_json("ghost")).await;

    let statuses: Vec<_> = harness
        .transport
        .registration_replies_to(CLAUDE_PEER)
        .into_iter()
        .filter_map(|m| match m {
            RegistrationMessage::HeartbeatResponse(r) => Some(r.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![ResponseStatus::Success]);

    match &harness.transport.registration_replies_to(9)[..] {
        [RegistrationMessage::HeartbeatResponse(r)] => {
            assert_eq!(r.status, ResponseStatus::Error);
            assert!(r.error.is_some());
        }
        other => panic!("unexpected replies {:?}", other),
    }
    harness.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let harness = BridgeTestHarness::new(test_config()).await;
    harness
        .bridge
        .handle_transport_event(TransportEvent::Message {
            peer: 4,
            client_id: None,
            payload: b"this is not json".to_vec(),
        })
        .await;
    harness
        .send(4, None, &json!({"type": "register", "clientType": "claude"}))
        .await;

    assert!(harness.transport.replies_to(4).is_empty());
    assert!(harness.bridge.registry().is_empty());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_inbound_channel_feeds_bridge() {
    let harness = BridgeTestHarness::new(test_config()).await;
    harness
        .inbound
        .send(TransportEvent::Message {
            peer: CLINE_PEER,
            client_id: None,
            payload: register_json("cline-1", ClientType::Cline, false)
                .to_string()
                .into_bytes(),
        })
        .await
        .unwrap();

    assert!(eventually(|| harness.bridge.registry().contains("cline-1")).await);
    harness.shutdown().await;
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_request_routed_and_response_forwarded() {
    let mut harness = two_clients(tools_config()).await;

    harness
        .send(CLINE_PEER, Some("cline-1"), &request_json(42, "tools/call"))
        .await;

    let delivered = delivered_to(&harness, "claude-1").await;
    assert_eq!(delivered.method(), Some("tools/call"));
    assert_eq!(delivered.target_client_id.as_deref(), Some("claude-1"));
    let task_id = task_id_of(&delivered);

    assert!(eventually(|| harness.bridge.in_flight_count() == 1).await);
    assert_eq!(
        harness.bridge.tasks().get_task(&task_id).unwrap().status,
        TaskStatus::Processing
    );

    let response = JsonRpcFrame::result(
        RequestId::String(task_id.clone()),
        json!({"content": [{"type": "text", "text": "done"}]}),
    );
    harness.send_frame(CLAUDE_PEER, "claude-1", &response).await;

    let forwarded = harness.transport.frames_sent_to("cline-1");
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].id, Some(RequestId::Number(42)));
    assert_eq!(forwarded[0].result, response.result);
    assert!(forwarded[0].target_client_id.is_none());

    let task = harness.bridge.tasks().get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(harness.bridge.in_flight_count(), 0);

    let events = harness.drain_events();
    assert_eq!(count_type(&events, "task_created"), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        BridgeEvent::TaskCompleted { task_id: id, client_id } if *id == task_id && client_id == "cline-1"
    )));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_error_response_completes_task_with_error() {
    let harness = two_clients(tools_config()).await;
    harness
        .send(CLINE_PEER, Some("cline-1"), &request_json(7, "tools/call"))
        .await;
    let task_id = task_id_of(&delivered_to(&harness, "claude-1").await);
    assert!(eventually(|| harness.bridge.in_flight_count() == 1).await);

    let response = JsonRpcFrame::error(
        Some(RequestId::String(task_id.clone())),
        mcpbridge_core::JsonRpcError::new(-32602, "unknown tool"),
    );
    harness.send_frame(CLAUDE_PEER, "claude-1", &response).await;

    let task = harness.bridge.tasks().get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.error.as_deref(), Some("unknown tool"));

    let forwarded = harness.transport.frames_sent_to("cline-1");
    assert_eq!(forwarded[0].id, Some(RequestId::Number(7)));
    assert_eq!(forwarded[0].error.as_ref().map(|e| e.code), Some(-32602));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_response_from_other_client_is_ignored() {
    let harness = two_clients(tools_config()).await;
    harness
        .register(CLAUDE_2_PEER, "claude-2", ClientType::Claude, false)
        .await;
    harness
        .send(CLINE_PEER, Some("cline-1"), &request_json(1, "tools/call"))
        .await;
    let task_id = task_id_of(&delivered_to(&harness, "claude-1").await);
    assert!(eventually(|| harness.bridge.in_flight_count() == 1).await);

    let forged = JsonRpcFrame::result(RequestId::String(task_id.clone()), json!({}));
    harness.send_frame(CLAUDE_2_PEER, "claude-2", &forged).await;

    assert!(harness.transport.frames_sent_to("cline-1").is_empty());
    assert_eq!(
        harness.bridge.tasks().get_task(&task_id).unwrap().status,
        TaskStatus::Processing
    );
    harness.shutdown().await;
}

#[tokio::test]
async fn test_no_connected_target_returns_routing_error() {
    let mut harness = BridgeTestHarness::new(tools_config()).await;
    harness
        .register(CLINE_PEER, "cline-1", ClientType::Cline, false)
        .await;

    harness
        .send(CLINE_PEER, Some("cline-1"), &request_json(5, "tools/call"))
        .await;

    let error = delivered_to(&harness, "cline-1").await;
    assert_eq!(error.id, Some(RequestId::Number(5)));
    assert_eq!(
        error.error.as_ref().map(|e| e.code),
        Some(error_codes::ROUTING_FAILED)
    );
    assert!(harness.bridge.tasks().is_empty());
    assert_eq!(count_type(&harness.drain_events(), "task_created"), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_session_methods_answered_locally() {
    let harness = two_clients(tools_config()).await;

    harness
        .send(CLINE_PEER, Some("cline-1"), &request_json(1, "ping"))
        .await;
    harness
        .send(CLINE_PEER, Some("cline-1"), &request_json(2, "sampling/createMessage"))
        .await;
    harness
        .send(
            CLINE_PEER,
            Some("cline-1"),
            &json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
        )
        .await;

    let replies = harness.transport.rpc_replies_to(CLINE_PEER);
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].id, Some(RequestId::Number(1)));
    assert_eq!(replies[0].result, Some(json!({})));
    assert_eq!(replies[1].id, Some(RequestId::Number(2)));
    assert_eq!(
        replies[1].error.as_ref().map(|e| e.code),
        Some(error_codes::METHOD_NOT_FOUND)
    );
    assert!(harness.transport.frames_sent_to("claude-1").is_empty());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_peer_must_register_first() {
    let harness = BridgeTestHarness::new(tools_config()).await;
    harness.send(7, None, &request_json(3, "tools/call")).await;

    let replies = harness.transport.rpc_replies_to(7);
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].error.as_ref().map(|e| e.code),
        Some(error_codes::INVALID_REQUEST)
    );
    harness.shutdown().await;
}

// ============================================================================
// Retries and target loss
// ============================================================================

#[tokio::test]
async fn test_delivery_failures_exhaust_attempts() {
    let mut harness = two_clients(tools_config()).await;
    harness.transport.make_unreachable("claude-1");

    harness
        .send(CLINE_PEER, Some("cline-1"), &request_json(11, "tools/call"))
        .await;

    let failure = delivered_to(&harness, "cline-1").await;
    assert_eq!(failure.id, Some(RequestId::Number(11)));
    assert_eq!(
        failure.error.as_ref().map(|e| e.code),
        Some(error_codes::DELIVERY_FAILED)
    );

    let events = harness.drain_events();
    let failed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            BridgeEvent::TaskFailed { task_id, .. } => Some(task_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    let task = harness.bridge.tasks().get_task(&failed[0]).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(harness.bridge.in_flight_count(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_disconnected_target_hands_request_to_next_client() {
    let mut harness = two_clients(tools_config()).await;
    harness
        .register(CLAUDE_2_PEER, "claude-2", ClientType::Claude, false)
        .await;

    harness
        .send(CLINE_PEER, Some("cline-1"), &request_json(42, "tools/call"))
        .await;
    let task_id = task_id_of(&delivered_to(&harness, "claude-1").await);
    assert!(eventually(|| harness.bridge.in_flight_count() == 1).await);

    harness
        .send(
            CLAUDE_PEER,
            Some("claude-1"),
            &disconnect_json("claude-1", "user closed window"),
        )
        .await;
    assert!(!harness.bridge.registry().contains("claude-1"));
    assert!(harness
        .transport
        .closed()
        .contains(&"claude-1".to_string()));

    let redelivered = delivered_to(&harness, "claude-2").await;
    assert_eq!(task_id_of(&redelivered), task_id);
    let task = harness.bridge.tasks().get_task(&task_id).unwrap();
    assert_eq!(task.target_client_id.as_deref(), Some("claude-2"));
    assert_eq!(task.attempts, 1);

    assert!(eventually(|| harness.bridge.in_flight_count() == 1).await);
    harness
        .send_frame(
            CLAUDE_2_PEER,
            "claude-2",
            &JsonRpcFrame::result(RequestId::String(task_id.clone()), json!({"ok": true})),
        )
        .await;
    let forwarded = harness.transport.frames_sent_to("cline-1");
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].id, Some(RequestId::Number(42)));

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        BridgeEvent::ClientDisconnected { client_id, reason: Some(r) }
            if client_id == "claude-1" && r == "user closed window"
    )));
    assert_legal_transitions(&events);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_transport_loss_keeps_reconnecting_client() {
    let harness = BridgeTestHarness::new(test_config()).await;
    harness
        .register(CLAUDE_PEER, "claude-1", ClientType::Claude, true)
        .await;

    harness.close(CLAUDE_PEER, Some("claude-1")).await;

    let record = harness.bridge.registry().get_client("claude-1").unwrap();
    assert_eq!(record.state, ConnectionState::Disconnected);
    assert!(!record.connected);
    assert!(harness.bridge.connections().has_reconnect_timer("claude-1"));
    harness.shutdown().await;
}

// ============================================================================
// Spawned clients
// ============================================================================

fn autostart_config() -> BridgeConfig {
    BridgeConfig {
        autostart: vec![AutoStartClient {
            client_type: ClientType::Cline,
            command: "cline-agent".to_string(),
            args: vec!["--bridge".to_string()],
            env: HashMap::from([("LOG_LEVEL".to_string(), "debug".to_string())]),
            cwd: None,
        }],
        ..test_config()
    }
}

#[tokio::test]
async fn test_autostart_spawns_and_preregisters() {
    let harness = BridgeTestHarness::new(autostart_config()).await;

    let specs = harness.spawner.specs();
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];
    assert_eq!(spec.command, "cline-agent");
    assert_eq!(spec.args, vec!["--bridge".to_string()]);
    assert_eq!(spec.env.get("LOG_LEVEL").map(String::as_str), Some("debug"));
    assert_eq!(
        spec.env.get(SOCKET_ENV).map(String::as_str),
        Some(harness.bridge.config().socket_path.to_str().unwrap())
    );
    let client_id = spec.env.get(CLIENT_ID_ENV).cloned().unwrap();
    assert!(client_id.starts_with("cline-"));

    let record = harness.bridge.registry().get_client(&client_id).unwrap();
    assert_eq!(record.state, ConnectionState::Discovered);
    assert_eq!(record.process_id, Some(4000));

    // Registering under the assigned id keeps the process link
    harness
        .register(CLINE_PEER, &client_id, ClientType::Cline, false)
        .await;
    let record = harness.bridge.registry().get_client(&client_id).unwrap();
    assert_eq!(record.state, ConnectionState::Connected);
    assert_eq!(record.process_id, Some(4000));

    // Exit is treated as connection loss
    harness.spawner.exit(0, Some(0)).await;
    assert!(eventually(|| !harness.bridge.registry().contains(&client_id)).await);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_child_exit_removes_record() {
    let harness = BridgeTestHarness::new(autostart_config()).await;
    let client_id = harness.spawner.specs()[0]
        .env
        .get(CLIENT_ID_ENV)
        .cloned()
        .unwrap();
    assert!(harness.bridge.registry().contains(&client_id));

    harness.spawner.exit(0, Some(1)).await;
    assert!(eventually(|| !harness.bridge.registry().contains(&client_id)).await);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_does_not_block_start() {
    let harness = BridgeTestHarness::new(test_config()).await;
    harness.spawner.fail_spawns(true);

    let result = harness
        .bridge
        .spawn_client(&autostart_config().autostart[0])
        .await;
    assert!(result.is_err());
    assert!(harness.bridge.registry().is_empty());
    assert!(harness.bridge.is_running());
    harness.shutdown().await;
}

// ============================================================================
// Snapshots and shutdown
// ============================================================================

#[tokio::test]
async fn test_snapshot_written_and_restored() {
    let first = two_clients(test_config()).await;
    first
        .register(CLAUDE_2_PEER, "claude-2", ClientType::Claude, true)
        .await;
    first.bridge.run_cleanup_once().await;

    let snapshot = first.snapshots.get(SNAPSHOT_KEY).unwrap();
    assert_eq!(snapshot["version"], json!(1));
    let ids: Vec<&str> = snapshot["clients"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["claude-1", "cline-1", "claude-2"]);
    first.shutdown().await;

    let second = BridgeTestHarness::with_snapshots(
        test_config(),
        MemorySnapshotStore::new().with_value(SNAPSHOT_KEY, snapshot),
    )
    .await;
    let registry = second.bridge.registry();
    assert_eq!(registry.len(), 3);
    assert_eq!(
        registry.get_client("claude-1").unwrap().state,
        ConnectionState::Discovered
    );

    // Only the reconnect-capable client is dialed
    assert!(eventually(|| second.transport.opened() == vec!["claude-2".to_string()]).await);
    assert!(
        eventually(|| second.bridge.connections().state_of("claude-2")
            == Some(ConnectionState::Handshaking))
        .await
    );
    second.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let mut harness = two_clients(autostart_config()).await;
    harness.drain_events();

    harness.shutdown().await;
    harness.shutdown().await;

    assert!(!harness.bridge.is_running());
    assert!(harness.transport.was_shut_down());
    assert!(harness.spawner.was_killed(0));
    assert!(harness.bridge.registry().is_empty());
    assert!(harness.snapshots.write_count() >= 1);

    let events = harness.drain_events();
    assert_eq!(count_type(&events, "bridge_stopped"), 1);
    let reasons: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            BridgeEvent::ClientDisconnected { reason, .. } => reason.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec!["bridge shutting down"; 2]);

    let (_tx, rx) = tokio::sync::mpsc::channel(1);
    assert!(harness.bridge.start(rx).await.is_err());
}
