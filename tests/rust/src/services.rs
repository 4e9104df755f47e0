//! Test harnesses
//!
//! Wire the real gateway components to in-memory mocks so tests can inject
//! transport events and assert on what went out over the wire.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use mcpbridge_core::{BridgeConfig, ClientType, EventBus, EventReceiver, JsonRpcFrame};
use mcpbridge_gateway::connection::handshake;
use mcpbridge_gateway::{
    Bridge, BridgeDependencies, ConnectionManager, ConnectionSettings, DiscoveryRegistry, PeerId,
    TransportEvent,
};

use crate::fixtures;
use crate::mocks::{MemorySnapshotStore, MockSpawner, MockTransport};

/// Test harness for the full bridge
///
/// Inbound frames are dispatched with `Bridge::handle_transport_event`
/// directly, so registration replies are recorded before the call returns.
/// Routed deliveries still pass through the bridge's workers; wait for them
/// with `fixtures::eventually`.
pub struct BridgeTestHarness {
    /// The bridge under test, already started
    pub bridge: Arc<Bridge>,

    /// Records every frame the bridge writes
    pub transport: Arc<MockTransport>,

    pub spawner: Arc<MockSpawner>,

    pub snapshots: Arc<MemorySnapshotStore>,

    /// Feeds the bridge's inbound loop; kept so the loop stays open
    pub inbound: mpsc::Sender<TransportEvent>,

    /// Subscribed before start, so nothing is missed
    pub events: EventReceiver,
}

impl BridgeTestHarness {
    /// Started bridge with `config` and an empty snapshot store
    pub async fn new(config: BridgeConfig) -> Self {
        Self::with_snapshots(config, MemorySnapshotStore::new()).await
    }

    /// Started bridge restoring from (and writing to) `snapshots`
    pub async fn with_snapshots(config: BridgeConfig, snapshots: MemorySnapshotStore) -> Self {
        let transport = Arc::new(MockTransport::new());
        let spawner = Arc::new(MockSpawner::new());
        let snapshots = Arc::new(snapshots);

        let bridge = Bridge::new(
            config,
            BridgeDependencies {
                transport: transport.clone(),
                spawner: spawner.clone(),
                snapshot_store: Some(snapshots.clone()),
            },
        );
        let events = bridge.subscribe();

        let (inbound, inbound_rx) = mpsc::channel(64);
        bridge
            .start(inbound_rx)
            .await
            .expect("bridge should start");

        Self {
            bridge,
            transport,
            spawner,
            snapshots,
            inbound,
            events,
        }
    }

    /// Deliver one raw JSON frame as if it arrived on `peer`
    pub async fn send(&self, peer: PeerId, client_id: Option<&str>, value: &Value) {
        self.bridge
            .handle_transport_event(TransportEvent::Message {
                peer,
                client_id: client_id.map(str::to_string),
                payload: value.to_string().into_bytes(),
            })
            .await;
    }

    pub async fn send_frame(&self, peer: PeerId, client_id: &str, frame: &JsonRpcFrame) {
        self.bridge
            .handle_transport_event(TransportEvent::Message {
                peer,
                client_id: Some(client_id.to_string()),
                payload: frame.encode(),
            })
            .await;
    }

    /// Register `client_id` over `peer`; the client ends up `Connected`
    pub async fn register(&self, peer: PeerId, client_id: &str, client_type: ClientType, reconnect: bool) {
        let message = fixtures::register_json(client_id, client_type, reconnect);
        self.send(peer, None, &message).await;
    }

    /// The connection on `peer` went away
    pub async fn close(&self, peer: PeerId, client_id: Option<&str>) {
        self.bridge
            .handle_transport_event(TransportEvent::Closed {
                peer,
                client_id: client_id.map(str::to_string),
            })
            .await;
    }

    /// All events emitted so far
    pub fn drain_events(&mut self) -> Vec<mcpbridge_core::BridgeEvent> {
        self.events.drain()
    }

    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
    }
}

/// Test harness for the connection manager on its own
pub struct ConnectionTestHarness {
    pub manager: Arc<ConnectionManager>,
    pub registry: Arc<DiscoveryRegistry>,
    pub transport: Arc<MockTransport>,
    pub event_bus: EventBus,
    pub events: EventReceiver,
}

impl ConnectionTestHarness {
    pub fn new(settings: ConnectionSettings) -> Self {
        let event_bus = EventBus::new();
        let events = event_bus.subscribe();
        let registry = Arc::new(DiscoveryRegistry::new(event_bus.sender()));
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(
            registry.clone(),
            transport.clone(),
            event_bus.sender(),
            settings,
        );

        Self {
            manager,
            registry,
            transport,
            event_bus,
            events,
        }
    }

    /// Settings with the given retry cap and short timers
    pub fn with_retries(max_reconnect_attempts: u32) -> Self {
        Self::new(ConnectionSettings {
            reconnect_interval: Duration::from_millis(50),
            max_reconnect_attempts,
            handshake_timeout: Duration::from_millis(200),
        })
    }

    /// Answer the pending `initialize` request sent to `client_id`
    pub async fn complete_handshake(&self, client_id: &str) -> bool {
        let Some(request) = self
            .transport
            .frames_sent_to(client_id)
            .into_iter()
            .rev()
            .find(|frame| frame.method() == Some(mcpbridge_core::protocol::methods::INITIALIZE))
        else {
            return false;
        };
        let Some(id) = request.id else {
            return false;
        };
        let response = handshake::initialize_response(id);
        self.manager.handle_response(client_id, &response).await
    }

    pub fn drain_events(&mut self) -> Vec<mcpbridge_core::BridgeEvent> {
        self.events.drain()
    }
}
