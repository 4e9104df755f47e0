//! ConnectionManager - per-client connection state machine
//!
//! Event-driven:
//! - inbound triggers: registration, heartbeat, disconnect, transport loss,
//!   handshake responses, session requests
//! - outbound effects: `BridgeEvent`s, registry updates, transport sends
//!
//! Race prevention follows a flow-id scheme: every state-changing operation
//! bumps the client's `flow_id`, and timers and async continuations carry the
//! flow id they were created under. A mismatch means the result is stale and
//! is dropped.
//!
//! ```text
//! (none) ──register──────────────────────────────► Connected
//! Discovered ──attempt──► Connecting ──sent──► Handshaking ──result──► Connected
//!                            │                      │
//!                            └──error/timeout───────┴──► Disconnected ──timer──► Connecting
//! Connected ──disconnect / transport loss──► Disconnected
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use mcpbridge_core::protocol::registration::{
    self, DisconnectMessage, HeartbeatMessage, RegisterMessage, ResponseStatus,
};
use mcpbridge_core::protocol::{error_codes, methods, FrameKind, ServerCapabilities};
use mcpbridge_core::{
    BridgeEvent, ConnectionState, EventSender, JsonRpcError, JsonRpcFrame, RegistrationMessage,
    RequestId, TransportKind,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::handshake::{self, HandshakeOutcome};
use super::{ConnectionError, ConnectionSettings};
use crate::registry::DiscoveryRegistry;
use crate::transport::{Transport, TransportError};

const SHUTDOWN_REASON: &str = "bridge shutting down";

/// Per-client runtime state (in-memory only)
#[derive(Default)]
struct ClientConnection {
    /// `None` until the first transition
    state: Option<ConnectionState>,
    /// Monotonic counter for stale-result rejection
    flow_id: u64,
    /// Whether the client ever reached `Connected`
    has_connected_before: bool,
    reconnect_attempts: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    /// Set while the entry is being torn down; a new registration waits it out
    retired: bool,
}

/// An `initialize` request awaiting its response
struct PendingHandshake {
    request_id: RequestId,
    flow_id: u64,
    timeout: JoinHandle<()>,
}

pub struct ConnectionManager {
    registry: Arc<DiscoveryRegistry>,
    transport: Arc<dyn Transport>,
    event_tx: EventSender,
    settings: ConnectionSettings,
    connections: DashMap<String, Arc<Mutex<ClientConnection>>>,
    /// Keyed by client id; at most one handshake in flight per client
    pending: DashMap<String, PendingHandshake>,
    next_request_id: AtomicI64,
    disposed: AtomicBool,
    /// For timers, which must not keep the manager alive
    self_ref: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<DiscoveryRegistry>,
        transport: Arc<dyn Transport>,
        event_tx: EventSender,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            registry,
            transport,
            event_tx,
            settings,
            connections: DashMap::new(),
            pending: DashMap::new(),
            next_request_id: AtomicI64::new(1),
            disposed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    /// What registering clients are told about the bridge
    pub fn server_capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            protocol_version: handshake::protocol_version(),
            supported_methods: vec![
                methods::INITIALIZE.to_string(),
                methods::PING.to_string(),
                "tools/*".to_string(),
            ],
            supported_transports: vec![TransportKind::UnixSocket],
            routing: true,
            reconnect: true,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn state_of(&self, client_id: &str) -> Option<ConnectionState> {
        self.connections
            .get(client_id)
            .and_then(|conn| conn.lock().state)
    }

    pub fn reconnect_attempts(&self, client_id: &str) -> Option<u32> {
        self.connections
            .get(client_id)
            .map(|conn| conn.lock().reconnect_attempts)
    }

    pub fn has_pending_handshake(&self, client_id: &str) -> bool {
        self.pending.contains_key(client_id)
    }

    pub fn pending_handshake_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a retry timer is armed and has not fired yet
    pub fn has_reconnect_timer(&self, client_id: &str) -> bool {
        self.connections.get(client_id).is_some_and(|conn| {
            conn.lock()
                .reconnect_timer
                .as_ref()
                .is_some_and(|timer| !timer.is_finished())
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // =========================================================================
    // State helpers
    // =========================================================================

    fn connection(&self, client_id: &str) -> Arc<Mutex<ClientConnection>> {
        self.connections
            .entry(client_id.to_string())
            .or_default()
            .clone()
    }

    fn existing(&self, client_id: &str) -> Option<Arc<Mutex<ClientConnection>>> {
        self.connections.get(client_id).map(|conn| conn.clone())
    }

    /// Record a transition, mirror it into the registry, and emit it
    fn set_state(&self, client_id: &str, conn: &mut ClientConnection, to: ConnectionState) {
        let from = conn.state.replace(to);
        self.registry.update_client(client_id, |record| record.set_state(to));
        info!(
            client_id = %client_id,
            from = ?from,
            to = %to,
            flow_id = conn.flow_id,
            "[ConnectionManager] State changed"
        );
        self.event_tx.emit(BridgeEvent::ClientStateChanged {
            client_id: client_id.to_string(),
            from,
            to,
        });
    }

    /// `set_state` restricted to the handshake-driven transition table
    fn advance(&self, client_id: &str, conn: &mut ClientConnection, to: ConnectionState) -> bool {
        if let Some(from) = conn.state {
            if !from.can_advance_to(to) {
                warn!(
                    client_id = %client_id,
                    from = %from,
                    to = %to,
                    "[ConnectionManager] Ignoring illegal transition"
                );
                return false;
            }
        }
        self.set_state(client_id, conn, to);
        true
    }

    fn take_pending(&self, client_id: &str) {
        if let Some((_, pending)) = self.pending.remove(client_id) {
            pending.timeout.abort();
        }
    }

    /// Drop all bookkeeping and the registry record for the entry `guard` locks.
    ///
    /// The entry stays in the map, marked retired, until the record is gone,
    /// so a registration racing with this cannot be removed by it.
    fn retire(
        &self,
        client_id: &str,
        conn: &Arc<Mutex<ClientConnection>>,
        mut guard: MutexGuard<'_, ClientConnection>,
    ) {
        guard.retired = true;
        guard.flow_id += 1;
        if let Some(timer) = guard.reconnect_timer.take() {
            timer.abort();
        }
        drop(guard);

        self.take_pending(client_id);
        self.registry.remove_client(client_id);
        self.connections
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, conn));
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    // =========================================================================
    // Registration protocol
    // =========================================================================

    /// Inbound `register`: straight to `Connected`, registry upsert.
    pub fn handle_register(&self, message: &RegisterMessage) -> RegistrationMessage {
        if self.is_disposed() {
            return registration::create_register_error_message(
                message.client_id.clone(),
                SHUTDOWN_REASON,
            );
        }

        let mut record = registration::handle_register_message(message);
        let client_id = record.id.clone();
        if let Some(existing) = self.registry.get_client(&client_id) {
            if record.process_id.is_none() {
                record.process_id = existing.process_id;
            }
        }

        self.take_pending(&client_id);
        loop {
            let conn = self.connection(&client_id);
            let mut guard = conn.lock();
            if guard.retired {
                drop(guard);
                std::thread::yield_now();
                continue;
            }
            if let Some(timer) = guard.reconnect_timer.take() {
                timer.abort();
            }
            guard.flow_id += 1;
            guard.reconnect_attempts = 0;
            guard.has_connected_before = true;
            self.set_state(&client_id, &mut guard, ConnectionState::Connected);
            break;
        }

        let client_type = record.client_type;
        self.registry.register_client(record);
        self.event_tx.emit(BridgeEvent::ClientConnected {
            client_id: client_id.clone(),
            client_type,
        });
        info!(
            client_id = %client_id,
            client_type = %client_type,
            "[ConnectionManager] Client registered"
        );

        registration::create_register_response_message(&client_id, self.server_capabilities())
    }

    /// Inbound `heartbeat`: refresh `last_seen`. Unknown clients get an error reply.
    pub fn handle_heartbeat(&self, message: &HeartbeatMessage) -> RegistrationMessage {
        let Some(record) = self.registry.get_client(&message.client_id) else {
            warn!(
                client_id = %message.client_id,
                "[ConnectionManager] Heartbeat from unknown client"
            );
            return registration::create_heartbeat_response_message(
                &message.client_id,
                ResponseStatus::Error,
                Some("unknown client".to_string()),
            );
        };

        let refreshed = registration::handle_heartbeat_message(message, &record);
        self.registry.update_client(&message.client_id, |r| {
            r.last_seen = refreshed.last_seen;
        });
        trace!(client_id = %message.client_id, "[ConnectionManager] Heartbeat");
        registration::create_heartbeat_response_message(
            &message.client_id,
            ResponseStatus::Success,
            None,
        )
    }

    /// Inbound `disconnect`. Unknown clients are logged and ignored.
    pub async fn handle_disconnect(&self, message: &DisconnectMessage) {
        let Some(record) = self.registry.get_client(&message.client_id) else {
            warn!(
                client_id = %message.client_id,
                "[ConnectionManager] Disconnect from unknown client"
            );
            return;
        };
        let updated = registration::handle_disconnect_message(message, &record);
        debug!(
            client_id = %updated.id,
            reason = ?message.reason,
            "[ConnectionManager] Disconnect requested"
        );

        self.on_connection_lost(&message.client_id, message.reason.clone());
        self.transport.close(&message.client_id).await;
    }

    /// The transport lost the client's connection
    pub fn handle_transport_closed(&self, client_id: &str) {
        self.on_connection_lost(client_id, Some("transport closed".to_string()));
    }

    fn on_connection_lost(&self, client_id: &str, reason: Option<String>) {
        if self.is_disposed() {
            return;
        }
        let Some(conn) = self.existing(client_id) else {
            debug!(client_id = %client_id, "[ConnectionManager] Loss for untracked client");
            return;
        };

        let mut guard = conn.lock();
        let current = guard.state;
        match current {
            None | Some(ConnectionState::Discovered) | Some(ConnectionState::Disconnected) => {
                debug!(
                    client_id = %client_id,
                    state = ?current,
                    "[ConnectionManager] Already disconnected"
                );
                return;
            }
            Some(state) if state.is_in_flight() => {
                let flow_id = guard.flow_id;
                drop(guard);
                self.on_handshake_failed(
                    client_id,
                    flow_id,
                    reason.unwrap_or_else(|| "connection lost during handshake".to_string()),
                );
                return;
            }
            _ => {}
        }

        self.take_pending(client_id);
        guard.flow_id += 1;
        self.set_state(client_id, &mut guard, ConnectionState::Disconnected);
        self.event_tx.emit(BridgeEvent::ClientDisconnected {
            client_id: client_id.to_string(),
            reason: reason.clone(),
        });
        info!(
            client_id = %client_id,
            reason = ?reason,
            "[ConnectionManager] Client disconnected"
        );

        self.reconnect_or_forget(client_id, &conn, guard);
    }

    /// Arm a retry when the client asked for reconnection, otherwise discard it
    fn reconnect_or_forget(
        &self,
        client_id: &str,
        conn: &Arc<Mutex<ClientConnection>>,
        mut guard: MutexGuard<'_, ClientConnection>,
    ) {
        let wants_reconnect = self
            .registry
            .get_client(client_id)
            .is_some_and(|record| record.wants_reconnect());

        if !wants_reconnect {
            debug!(client_id = %client_id, "[ConnectionManager] No reconnect; removing client");
            self.retire(client_id, conn, guard);
        } else if guard.reconnect_attempts >= self.settings.max_reconnect_attempts {
            let attempts = guard.reconnect_attempts;
            self.abandon(client_id, conn, guard, attempts);
        } else {
            self.schedule_reconnect(client_id, &mut guard);
        }
    }

    // =========================================================================
    // Reconnection
    // =========================================================================

    fn schedule_reconnect(&self, client_id: &str, conn: &mut ClientConnection) {
        let flow_id = conn.flow_id;
        let attempt = conn.reconnect_attempts + 1;
        let delay = self.settings.reconnect_interval;
        let manager = self.self_ref.clone();
        let id = client_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.on_reconnect_timer(&id, flow_id).await;
            }
        });
        if let Some(previous) = conn.reconnect_timer.replace(timer) {
            previous.abort();
        }

        info!(
            client_id = %client_id,
            attempt,
            max_attempts = self.settings.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "[ConnectionManager] Reconnect scheduled"
        );
        self.event_tx.emit(BridgeEvent::ReconnectScheduled {
            client_id: client_id.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
    }

    async fn on_reconnect_timer(&self, client_id: &str, flow_id: u64) {
        if self.is_disposed() {
            return;
        }
        let Some(conn) = self.existing(client_id) else {
            return;
        };

        {
            let mut guard = conn.lock();
            if guard.flow_id != flow_id {
                debug!(client_id = %client_id, "[ConnectionManager] Stale reconnect timer");
                return;
            }
            // This task owns the handle; dropping it detaches rather than aborts
            guard.reconnect_timer.take();

            if guard.reconnect_attempts >= self.settings.max_reconnect_attempts {
                let attempts = guard.reconnect_attempts;
                self.abandon(client_id, &conn, guard, attempts);
                return;
            }
            guard.reconnect_attempts += 1;
            info!(
                client_id = %client_id,
                attempt = guard.reconnect_attempts,
                "[ConnectionManager] Reconnect attempt"
            );
        }

        if let Err(e) = self.attempt_connection(client_id).await {
            debug!(client_id = %client_id, error = %e, "[ConnectionManager] Reconnect skipped");
        }
    }

    /// Give up on a client while still holding its lock
    fn abandon(
        &self,
        client_id: &str,
        conn: &Arc<Mutex<ClientConnection>>,
        guard: MutexGuard<'_, ClientConnection>,
        attempts: u32,
    ) {
        warn!(
            client_id = %client_id,
            attempts,
            "[ConnectionManager] Reconnection attempts exhausted; abandoning client"
        );
        self.retire(client_id, conn, guard);
        self.event_tx.emit(BridgeEvent::ClientAbandoned {
            client_id: client_id.to_string(),
            attempts,
        });
    }

    // =========================================================================
    // Outbound handshake
    // =========================================================================

    /// Dial a known client and send `initialize`.
    ///
    /// `Ok(true)` when an attempt was made (its outcome arrives later as
    /// events), `Ok(false)` when the client is unknown, already connected, or
    /// already mid-attempt.
    pub async fn attempt_connection(&self, client_id: &str) -> Result<bool, ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disposed);
        }
        let Some(record) = self.registry.get_client(client_id) else {
            warn!(client_id = %client_id, "[ConnectionManager] Cannot connect unknown client");
            return Ok(false);
        };

        let conn = self.connection(client_id);
        let flow_id = {
            let mut guard = conn.lock();
            if guard.retired {
                debug!(client_id = %client_id, "[ConnectionManager] Client is being removed");
                return Ok(false);
            }
            let current = *guard.state.get_or_insert(record.state);
            if current.is_connected() || current.is_in_flight() {
                debug!(
                    client_id = %client_id,
                    state = %current,
                    "[ConnectionManager] Connection already established or in progress"
                );
                return Ok(false);
            }
            if !self.advance(client_id, &mut guard, ConnectionState::Connecting) {
                return Ok(false);
            }
            guard.flow_id += 1;
            guard.flow_id
        };

        if let Err(e) = self.transport.open(&record).await {
            match e {
                TransportError::NoSocketPath(_) => self.on_unreachable(client_id, flow_id, &e),
                _ => self.on_handshake_failed(client_id, flow_id, format!("dial failed: {}", e)),
            }
            return Ok(true);
        }

        let request_id = self.next_request_id();
        let manager = self.self_ref.clone();
        let id = client_id.to_string();
        let deadline = self.settings.handshake_timeout;
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(manager) = manager.upgrade() {
                manager.on_handshake_timeout(&id, flow_id);
            }
        });
        if let Some(stale) = self.pending.insert(
            client_id.to_string(),
            PendingHandshake {
                request_id: request_id.clone(),
                flow_id,
                timeout,
            },
        ) {
            stale.timeout.abort();
        }

        let frame = handshake::initialize_request(request_id.clone());
        if let Err(e) = self.transport.send(client_id, frame.encode()).await {
            if let Some((_, pending)) = self.pending.remove_if(client_id, |_, p| p.flow_id == flow_id)
            {
                pending.timeout.abort();
            }
            self.on_handshake_failed(client_id, flow_id, format!("initialize send failed: {}", e));
            return Ok(true);
        }
        debug!(
            client_id = %client_id,
            request_id = %request_id,
            "[ConnectionManager] Sent initialize"
        );

        // A fast response may already have moved the client past Connecting
        let mut guard = conn.lock();
        if guard.flow_id == flow_id && guard.state == Some(ConnectionState::Connecting) {
            self.advance(client_id, &mut guard, ConnectionState::Handshaking);
        }
        Ok(true)
    }

    /// Correlate a response frame with a pending handshake.
    ///
    /// Returns `true` when the frame was consumed as a handshake response.
    pub async fn handle_response(&self, client_id: &str, frame: &JsonRpcFrame) -> bool {
        let Some(response_id) = &frame.id else {
            return false;
        };
        let Some((_, pending)) = self
            .pending
            .remove_if(client_id, |_, p| p.request_id == *response_id)
        else {
            return false;
        };
        pending.timeout.abort();
        if self.is_disposed() {
            return true;
        }

        let outcome = handshake::evaluate_response(frame);
        match outcome {
            HandshakeOutcome::Accepted {
                ref protocol_version,
                ref server_name,
            } => {
                if !outcome.version_matches() {
                    warn!(
                        client_id = %client_id,
                        offered = %handshake::protocol_version(),
                        received = %protocol_version,
                        "[ConnectionManager] Protocol version mismatch; continuing"
                    );
                }
                if self.on_handshake_succeeded(client_id, pending.flow_id, server_name.as_deref()) {
                    let notification = handshake::initialized_notification();
                    if let Err(e) = self.transport.send(client_id, notification.encode()).await {
                        debug!(client_id = %client_id, error = %e, "[ConnectionManager] initialized notification not sent");
                    }
                }
            }
            HandshakeOutcome::Rejected(reason) => {
                self.on_handshake_failed(client_id, pending.flow_id, reason);
            }
        }
        true
    }

    fn on_handshake_succeeded(&self, client_id: &str, flow_id: u64, server_name: Option<&str>) -> bool {
        let Some(conn) = self.existing(client_id) else {
            return false;
        };
        {
            let mut guard = conn.lock();
            if guard.flow_id != flow_id {
                debug!(client_id = %client_id, "[ConnectionManager] Stale handshake result");
                return false;
            }
            if !self.advance(client_id, &mut guard, ConnectionState::Connected) {
                return false;
            }
            guard.reconnect_attempts = 0;
            guard.has_connected_before = true;
            if let Some(timer) = guard.reconnect_timer.take() {
                timer.abort();
            }
        }

        let Some(record) = self.registry.update_client(client_id, |record| record.touch()) else {
            return false;
        };
        info!(
            client_id = %client_id,
            server = ?server_name,
            "[ConnectionManager] Handshake complete"
        );
        self.event_tx.emit(BridgeEvent::ClientConnected {
            client_id: client_id.to_string(),
            client_type: record.client_type,
        });
        true
    }

    fn on_handshake_timeout(&self, client_id: &str, flow_id: u64) {
        // Removing the entry drops this task's own handle without aborting it
        if self
            .pending
            .remove_if(client_id, |_, p| p.flow_id == flow_id)
            .is_none()
        {
            return;
        }
        let reason = format!(
            "handshake timed out after {}ms",
            self.settings.handshake_timeout.as_millis()
        );
        self.on_handshake_failed(client_id, flow_id, reason);
    }

    fn on_handshake_failed(&self, client_id: &str, flow_id: u64, reason: String) {
        if self.is_disposed() {
            return;
        }
        let Some(conn) = self.existing(client_id) else {
            return;
        };
        let mut guard = conn.lock();
        if guard.flow_id != flow_id {
            debug!(client_id = %client_id, "[ConnectionManager] Stale handshake failure");
            return;
        }
        if let Some((_, pending)) = self.pending.remove_if(client_id, |_, p| p.flow_id == flow_id) {
            pending.timeout.abort();
        }

        guard.flow_id += 1;
        if !self.advance(client_id, &mut guard, ConnectionState::Disconnected) {
            return;
        }
        warn!(client_id = %client_id, reason = %reason, "[ConnectionManager] Handshake failed");
        if guard.has_connected_before {
            self.event_tx.emit(BridgeEvent::ClientDisconnected {
                client_id: client_id.to_string(),
                reason: Some(reason),
            });
        } else {
            self.event_tx.emit(BridgeEvent::ClientUpdated {
                client_id: client_id.to_string(),
                state: ConnectionState::Disconnected,
                message: Some(reason),
            });
        }

        self.reconnect_or_forget(client_id, &conn, guard);
    }

    /// The client can never be dialed; park it in `Error` for cleanup to collect
    fn on_unreachable(&self, client_id: &str, flow_id: u64, error: &TransportError) {
        let Some(conn) = self.existing(client_id) else {
            return;
        };
        let mut guard = conn.lock();
        if guard.flow_id != flow_id {
            return;
        }
        guard.flow_id += 1;
        if self.advance(client_id, &mut guard, ConnectionState::Error) {
            warn!(client_id = %client_id, error = %error, "[ConnectionManager] Client unreachable");
            self.event_tx.emit(BridgeEvent::ClientUpdated {
                client_id: client_id.to_string(),
                state: ConnectionState::Error,
                message: Some(error.to_string()),
            });
        }
    }

    // =========================================================================
    // Session traffic
    // =========================================================================

    /// Handle `ping`, `initialize`, notifications, and unroutable requests.
    ///
    /// Returns the reply frame to send back, if any.
    pub fn handle_session_message(
        &self,
        client_id: Option<&str>,
        frame: &JsonRpcFrame,
    ) -> Option<JsonRpcFrame> {
        if let Some(id) = client_id {
            self.registry.update_client(id, |record| record.touch());
        }

        match frame.kind() {
            FrameKind::Request { id, method } => match method {
                methods::PING => {
                    trace!(client_id = ?client_id, "[ConnectionManager] Ping");
                    Some(handshake::ping_response(id.clone()))
                }
                methods::INITIALIZE => {
                    debug!(client_id = ?client_id, "[ConnectionManager] Inbound initialize");
                    Some(handshake::initialize_response(id.clone()))
                }
                other => {
                    debug!(
                        client_id = ?client_id,
                        method = %other,
                        "[ConnectionManager] Method not found"
                    );
                    Some(JsonRpcFrame::error(
                        Some(id.clone()),
                        JsonRpcError::method_not_found(other),
                    ))
                }
            },
            FrameKind::Notification { method } => {
                if methods::KNOWN_NOTIFICATIONS.contains(&method) {
                    debug!(client_id = ?client_id, method = %method, "[ConnectionManager] Notification");
                    if let Some(id) = client_id {
                        self.event_tx.emit(BridgeEvent::ClientNotification {
                            client_id: id.to_string(),
                            method: method.to_string(),
                        });
                    }
                } else {
                    debug!(
                        client_id = ?client_id,
                        method = %method,
                        "[ConnectionManager] Unrecognized notification ignored"
                    );
                }
                None
            }
            FrameKind::Response { id } => {
                debug!(client_id = ?client_id, id = %id, "[ConnectionManager] Uncorrelated response dropped");
                None
            }
            FrameKind::Invalid => {
                warn!(client_id = ?client_id, "[ConnectionManager] Invalid JSON-RPC frame");
                frame.id.as_ref().map(|id| {
                    JsonRpcFrame::error(
                        Some(id.clone()),
                        JsonRpcError::new(error_codes::INVALID_REQUEST, "Invalid request"),
                    )
                })
            }
        }
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Disconnect every tracked client once, cancel every timer, clear all maps.
    ///
    /// Idempotent. Handshake responses arriving afterwards are ignored.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        for entry in self.pending.iter() {
            entry.timeout.abort();
        }
        self.pending.clear();

        let mut disconnected = 0usize;
        for entry in self.connections.iter() {
            let client_id = entry.key();
            let mut guard = entry.value().lock();
            if let Some(timer) = guard.reconnect_timer.take() {
                timer.abort();
            }
            guard.flow_id += 1;

            let current = guard.state;
            match current {
                None | Some(ConnectionState::Discovered) | Some(ConnectionState::Disconnected) => {}
                Some(_) => {
                    self.set_state(client_id, &mut guard, ConnectionState::Disconnected);
                    self.event_tx.emit(BridgeEvent::ClientDisconnected {
                        client_id: client_id.clone(),
                        reason: Some(SHUTDOWN_REASON.to_string()),
                    });
                    disconnected += 1;
                }
            }
        }
        self.connections.clear();

        info!(disconnected, "[ConnectionManager] Disposed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.timeout.abort();
        }
        for entry in self.connections.iter() {
            if let Some(timer) = entry.value().lock().reconnect_timer.take() {
                timer.abort();
            }
        }
    }
}
