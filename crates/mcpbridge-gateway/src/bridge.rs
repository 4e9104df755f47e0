//! Bridge - orchestrates registry, connections, routing, and timers
//!
//! ```text
//!  Transport ──TransportEvent──► inbound loop ──► registration ──► ConnectionManager
//!                                    │
//!                                    ├──► responses ──► handshake correlation / task completion
//!                                    ├──► session    ──► ConnectionManager
//!                                    └──► requests   ──► Router ──► delivery worker ──► Transport
//!                                                          └──► error worker ──► origin
//! ```
//!
//! Background work (inbound loop, delivery and error workers, cleanup and scan
//! intervals, process watchers) runs on spawned tasks that stop on the
//! bridge's `CancellationToken`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use mcpbridge_core::branding::{CLIENT_ID_ENV, SOCKET_ENV};
use mcpbridge_core::protocol::registration::{self, ResponseStatus};
use mcpbridge_core::protocol::{error_codes, methods};
use mcpbridge_core::{
    AutoStartClient, BridgeConfig, BridgeEvent, ClientRecord, ConnectionState, EventBus,
    EventReceiver, InboundFrame, JsonRpcError, JsonRpcFrame, RegistrationMessage, RequestId,
    SnapshotStore, Task, TaskStatus, TaskUpdate, TransportKind,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::process::{ProcessEvent, ProcessSpawner, ProcessSpec};
use crate::registry::DiscoveryRegistry;
use crate::router::{OutboundMessage, RoutedMessage, Router, RouterChannels, RoutingError, RoutingFailure};
use crate::tasks::TaskStore;
use crate::transport::{PeerId, Transport, TransportEvent};

/// Snapshot key of the registry
pub const SNAPSHOT_KEY: &str = "clients.json";

const SNAPSHOT_VERSION: u64 = 1;

/// Collaborators injected into the bridge
pub struct BridgeDependencies {
    pub transport: Arc<dyn Transport>,
    pub spawner: Arc<dyn ProcessSpawner>,
    /// Registry snapshots are written only when a store is supplied
    pub snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

pub struct Bridge {
    config: BridgeConfig,
    event_bus: EventBus,
    registry: Arc<DiscoveryRegistry>,
    tasks: Arc<TaskStore>,
    connections: Arc<ConnectionManager>,
    router: Arc<Router>,
    router_channels: Mutex<Option<RouterChannels>>,
    transport: Arc<dyn Transport>,
    spawner: Arc<dyn ProcessSpawner>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    /// Routed requests sent to their target and awaiting a response, by task id
    in_flight: DashMap<String, RoutedMessage>,
    /// Kill switches of bridge-spawned processes, by client id
    children: DashMap<String, CancellationToken>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Bridge {
    pub fn new(config: BridgeConfig, deps: BridgeDependencies) -> Arc<Self> {
        let event_bus = EventBus::with_capacity(config.event_capacity);
        let registry = Arc::new(DiscoveryRegistry::new(event_bus.sender()));
        let tasks = Arc::new(TaskStore::new(config.task_expiration()));
        let connections = ConnectionManager::new(
            registry.clone(),
            deps.transport.clone(),
            event_bus.sender(),
            ConnectionSettings::from(&config),
        );
        let (router, channels) =
            Router::new(registry.clone(), tasks.clone(), event_bus.sender(), &config);

        Arc::new(Self {
            config,
            event_bus,
            registry,
            tasks,
            connections,
            router: Arc::new(router),
            router_channels: Mutex::new(Some(channels)),
            transport: deps.transport,
            spawner: deps.spawner,
            snapshot_store: deps.snapshot_store,
            in_flight: DashMap::new(),
            children: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    pub fn registry(&self) -> &Arc<DiscoveryRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// Number of routed requests awaiting a response
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start background work, restore the snapshot, and spawn autostart clients.
    pub async fn start(self: &Arc<Self>, transport_events: mpsc::Receiver<TransportEvent>) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            bail!("bridge has been shut down");
        }
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("bridge already started");
        }
        let channels = self
            .router_channels
            .lock()
            .take()
            .context("router channels already taken")?;

        info!(
            transport = %self.transport.description(),
            rules = self.config.routing_rules.len(),
            "[Bridge] Starting"
        );

        let workers = vec![
            tokio::spawn(self.clone().run_inbound(transport_events)),
            tokio::spawn(self.clone().run_deliveries(channels.deliveries)),
            tokio::spawn(self.clone().run_routing_errors(channels.errors)),
            tokio::spawn(self.clone().run_cleanup()),
            tokio::spawn(self.clone().run_scan()),
        ];
        self.workers.lock().extend(workers);

        if let Err(e) = self.restore_snapshot().await {
            warn!(error = %e, "[Bridge] Snapshot restore failed; starting empty");
        }

        for client in &self.config.autostart {
            if let Err(e) = self.spawn_client(client).await {
                error!(
                    command = %client.command,
                    error = %e,
                    "[Bridge] Failed to start client"
                );
            }
        }

        self.event_bus.sender().emit(BridgeEvent::BridgeStarted {
            socket_path: self.config.socket_path.display().to_string(),
        });
        Ok(())
    }

    /// Stop everything. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[Bridge] Shutting down");

        self.cancel.cancel();
        self.connections.dispose();

        if let Err(e) = self.write_snapshot().await {
            warn!(error = %e, "[Bridge] Final snapshot failed");
        }

        for child in self.children.iter() {
            child.value().cancel();
        }
        self.children.clear();

        self.transport.shutdown().await;

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.abort();
        }

        self.in_flight.clear();
        self.registry.clear();
        self.event_bus.sender().emit(BridgeEvent::BridgeStopped);
        info!("[Bridge] Stopped");
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    async fn run_inbound(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        debug!("[Bridge] Transport event channel closed");
                        break;
                    }
                },
            }
        }
    }

    /// Dispatch one transport event
    pub async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Message {
                peer,
                client_id,
                payload,
            } => match InboundFrame::parse(&payload) {
                Some(InboundFrame::Registration(message)) => {
                    self.handle_registration(peer, message).await
                }
                Some(InboundFrame::Rpc(frame)) => self.handle_rpc(peer, client_id, frame).await,
                None => {
                    debug!(
                        peer,
                        client_id = ?client_id,
                        bytes = payload.len(),
                        "[Bridge] Discarding malformed frame"
                    );
                }
            },
            TransportEvent::Closed {
                peer,
                client_id: Some(client_id),
            } => {
                debug!(peer, client_id = %client_id, "[Bridge] Connection closed");
                self.on_client_lost(&client_id);
            }
            TransportEvent::Closed {
                peer,
                client_id: None,
            } => {
                trace!(peer, "[Bridge] Anonymous connection closed");
            }
        }
    }

    async fn handle_registration(self: &Arc<Self>, peer: PeerId, message: RegistrationMessage) {
        let response = match &message {
            RegistrationMessage::Register(register) => {
                let response = self.connections.handle_register(register);
                if let RegistrationMessage::RegisterResponse(r) = &response {
                    if let (ResponseStatus::Success, Some(client_id)) = (r.status, &r.client_id) {
                        self.transport.bind(peer, client_id);
                    }
                }
                Some(response)
            }
            RegistrationMessage::Heartbeat(heartbeat) => {
                Some(self.connections.handle_heartbeat(heartbeat))
            }
            RegistrationMessage::Disconnect(disconnect) => {
                self.connections.handle_disconnect(disconnect).await;
                self.retry_in_flight_for(&disconnect.client_id);
                None
            }
            RegistrationMessage::RegisterResponse(_) | RegistrationMessage::HeartbeatResponse(_) => {
                debug!(
                    peer,
                    message_type = message.type_name(),
                    "[Bridge] Ignoring response-type registration message"
                );
                None
            }
        };

        let Some(response) = response else {
            return;
        };
        match registration::serialize_message(&response) {
            Ok(text) => {
                if let Err(e) = self.transport.reply(peer, text.into_bytes()).await {
                    debug!(peer, error = %e, "[Bridge] Registration reply not delivered");
                }
            }
            Err(e) => error!(error = %e, "[Bridge] Failed to serialize registration reply"),
        }
    }

    async fn handle_rpc(&self, peer: PeerId, client_id: Option<String>, frame: JsonRpcFrame) {
        if frame.is_response() {
            let Some(client_id) = client_id else {
                debug!(peer, "[Bridge] Response from unregistered peer dropped");
                return;
            };
            if self.connections.handle_response(&client_id, &frame).await {
                return;
            }
            self.complete_task(&client_id, frame).await;
            return;
        }

        let session = match frame.method() {
            Some(method) => frame.id.is_none() || methods::is_session_method(method),
            None => true,
        };
        if !session {
            if let Some(origin) = client_id.as_deref() {
                if self.router.can_route(&frame) {
                    self.registry.update_client(origin, |record| record.touch());
                    self.router.route(OutboundMessage::new(origin, frame)).await;
                    return;
                }
            } else if let Some(id) = frame.id.clone() {
                let reply = JsonRpcFrame::error(
                    Some(id),
                    JsonRpcError::new(
                        error_codes::INVALID_REQUEST,
                        "register before sending requests",
                    ),
                );
                self.reply(peer, &reply).await;
                return;
            }
        }

        if let Some(reply) = self
            .connections
            .handle_session_message(client_id.as_deref(), &frame)
        {
            self.reply(peer, &reply).await;
        }
    }

    async fn reply(&self, peer: PeerId, frame: &JsonRpcFrame) {
        if let Err(e) = self.transport.reply(peer, frame.encode()).await {
            debug!(peer, error = %e, "[Bridge] Reply not delivered");
        }
    }

    /// Forward a target's response back to the origin under its original id
    async fn complete_task(&self, responder: &str, frame: JsonRpcFrame) {
        let Some(RequestId::String(task_id)) = frame.id.clone() else {
            debug!(client_id = %responder, "[Bridge] Uncorrelated response dropped");
            return;
        };
        let Some(task) = self.tasks.get_task(&task_id) else {
            debug!(task_id = %task_id, "[Bridge] Response for unknown task dropped");
            return;
        };
        if task.target_client_id.as_deref() != Some(responder) || task.is_terminal() {
            debug!(
                task_id = %task_id,
                client_id = %responder,
                status = task.status.as_str(),
                "[Bridge] Response not accepted for task"
            );
            return;
        }

        let mut update = TaskUpdate::status(TaskStatus::Completed);
        if let Some(error) = &frame.error {
            update = update.with_error(error.message.clone());
        }
        self.tasks.update_task(&task_id, update);
        self.in_flight.remove(&task_id);

        let mut forwarded = frame;
        forwarded.id = origin_request_id(&task);
        forwarded.target_client_id = None;
        if let Err(e) = self.transport.send(&task.client_id, forwarded.encode()).await {
            warn!(
                task_id = %task_id,
                origin = %task.client_id,
                error = %e,
                "[Bridge] Origin gone; response dropped"
            );
        }

        info!(task_id = %task_id, origin = %task.client_id, "[Bridge] Task completed");
        self.event_bus.sender().emit(BridgeEvent::TaskCompleted {
            task_id,
            client_id: task.client_id,
        });
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    async fn run_deliveries(self: Arc<Self>, mut deliveries: mpsc::Receiver<RoutedMessage>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = deliveries.recv() => match message {
                    Some(message) => self.deliver(message).await,
                    None => break,
                },
            }
        }
    }

    async fn deliver(self: &Arc<Self>, message: RoutedMessage) {
        let mut frame = message.frame.clone();
        frame.id = Some(RequestId::String(message.task_id.clone()));

        match self.transport.send(&message.target_client_id, frame.encode()).await {
            Ok(()) => {
                debug!(
                    task_id = %message.task_id,
                    target = %message.target_client_id,
                    "[Bridge] Delivered"
                );
                self.tasks.update_task(
                    &message.task_id,
                    TaskUpdate::status(TaskStatus::Processing),
                );
                self.in_flight.insert(message.task_id.clone(), message);
            }
            Err(e) => {
                warn!(
                    task_id = %message.task_id,
                    target = %message.target_client_id,
                    error = %e,
                    "[Bridge] Delivery failed"
                );
                self.retry(message);
            }
        }
    }

    /// Count a failed attempt, then either redeliver or fail the task
    fn retry(self: &Arc<Self>, message: RoutedMessage) {
        let Some(task) = self.tasks.increment_task_attempts(&message.task_id) else {
            return;
        };
        if task.status == TaskStatus::Failed {
            let bridge = self.clone();
            tokio::spawn(async move { bridge.fail_task(&task).await });
            return;
        }

        // The delivery worker feeds the channel redeliver writes to
        let router = self.router.clone();
        tokio::spawn(async move {
            router.redeliver(message).await;
        });
    }

    /// Retry every in-flight request that was sent to `client_id`
    fn retry_in_flight_for(self: &Arc<Self>, client_id: &str) {
        for task in self.tasks.active_tasks_for_target(client_id) {
            if let Some((_, message)) = self.in_flight.remove(&task.id) {
                info!(
                    task_id = %task.id,
                    target = %client_id,
                    "[Bridge] Target lost; retrying request"
                );
                self.retry(message);
            }
        }
    }

    async fn fail_task(&self, task: &Task) {
        let reason = task
            .error
            .clone()
            .unwrap_or_else(|| "delivery failed".to_string());
        warn!(
            task_id = %task.id,
            origin = %task.client_id,
            attempts = task.attempts,
            "[Bridge] Task failed: {}", reason
        );
        let frame = JsonRpcFrame::error(
            origin_request_id(task),
            JsonRpcError::new(error_codes::DELIVERY_FAILED, reason.clone()),
        );
        if let Err(e) = self.transport.send(&task.client_id, frame.encode()).await {
            debug!(origin = %task.client_id, error = %e, "[Bridge] Failure not delivered");
        }
        self.event_bus.sender().emit(BridgeEvent::TaskFailed {
            task_id: task.id.clone(),
            client_id: task.client_id.clone(),
            error: reason,
        });
    }

    async fn run_routing_errors(self: Arc<Self>, mut errors: mpsc::Receiver<RoutingFailure>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                failure = errors.recv() => match failure {
                    Some(failure) => self.report_routing_failure(failure).await,
                    None => break,
                },
            }
        }
    }

    async fn report_routing_failure(&self, failure: RoutingFailure) {
        let code = match failure.error {
            RoutingError::NoTargetType { .. } | RoutingError::NoConnectedClient { .. } => {
                error_codes::ROUTING_FAILED
            }
            RoutingError::NotRoutable => error_codes::INVALID_REQUEST,
            RoutingError::ChannelClosed => error_codes::INTERNAL_ERROR,
        };
        let message = failure.error.to_string();

        if let Some(task_id) = &failure.task_id {
            self.in_flight.remove(task_id);
            self.event_bus.sender().emit(BridgeEvent::TaskFailed {
                task_id: task_id.clone(),
                client_id: failure.origin_client_id.clone(),
                error: message.clone(),
            });
        }

        // Notifications get no error reply
        let Some(request_id) = failure.request_id else {
            return;
        };
        let frame = JsonRpcFrame::error(Some(request_id), JsonRpcError::new(code, message));
        if let Err(e) = self
            .transport
            .send(&failure.origin_client_id, frame.encode())
            .await
        {
            debug!(
                origin = %failure.origin_client_id,
                error = %e,
                "[Bridge] Routing error not delivered"
            );
        }
    }

    // =========================================================================
    // Client loss and spawned processes
    // =========================================================================

    fn on_client_lost(self: &Arc<Self>, client_id: &str) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.connections.handle_transport_closed(client_id);

        // A spawned client that never registered has nothing to reconnect to
        if let Some(record) = self.registry.get_client(client_id) {
            if record.state == ConnectionState::Discovered {
                self.registry.remove_client(client_id);
            }
        }
        self.retry_in_flight_for(client_id);
    }

    /// Start a client process and pre-register it as discovered.
    ///
    /// The child learns its id through `MCPBRIDGE_CLIENT_ID`; process exit is
    /// treated as transport loss for that id.
    pub async fn spawn_client(self: &Arc<Self>, client: &AutoStartClient) -> Result<String> {
        if self.stopped.load(Ordering::Acquire) {
            bail!("bridge has been shut down");
        }
        let client_id = ClientRecord::generate_id(client.client_type);

        let mut spec = ProcessSpec::new(client.command.clone())
            .with_env(CLIENT_ID_ENV, client_id.clone())
            .with_env(SOCKET_ENV, self.config.socket_path.display().to_string());
        spec.args = client.args.clone();
        spec.env.extend(client.env.clone());
        spec.cwd = client.cwd.clone();

        let mut handle = self
            .spawner
            .spawn(spec)
            .await
            .with_context(|| format!("Failed to start {} client '{}'", client.client_type, client.command))?;

        let mut record = ClientRecord::new(&client_id, client.client_type, TransportKind::UnixSocket);
        if let Some(pid) = handle.pid {
            record = record.with_process_id(pid);
        }
        self.registry.register_client(record);
        self.children.insert(client_id.clone(), handle.kill.clone());
        info!(
            client_id = %client_id,
            command = %client.command,
            pid = ?handle.pid,
            "[Bridge] Client process started"
        );

        let bridge = self.clone();
        let id = client_id.clone();
        tokio::spawn(async move {
            while let Some(event) = handle.events.recv().await {
                match event {
                    ProcessEvent::Spawned { pid } => {
                        debug!(client_id = %id, pid, "[Bridge] Process spawned");
                    }
                    ProcessEvent::Exited { code } => {
                        info!(client_id = %id, code = ?code, "[Bridge] Client process exited");
                        break;
                    }
                    ProcessEvent::Error { message } => {
                        warn!(client_id = %id, error = %message, "[Bridge] Client process error");
                        break;
                    }
                }
            }
            bridge.children.remove(&id);
            bridge.on_client_lost(&id);
        });

        Ok(client_id)
    }

    // =========================================================================
    // Timers
    // =========================================================================

    async fn run_cleanup(self: Arc<Self>) {
        let period = self.config.cleanup_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.run_cleanup_once().await,
            }
        }
    }

    /// One cleanup sweep plus a snapshot write
    pub async fn run_cleanup_once(&self) {
        let report = self.tasks.cleanup(&self.registry);
        self.in_flight
            .retain(|task_id, _| self.tasks.get_task(task_id).is_some());
        trace!(
            tasks_removed = report.tasks_removed,
            clients_removed = report.clients_removed,
            "[Bridge] Cleanup sweep"
        );
        if let Err(e) = self.write_snapshot().await {
            warn!(error = %e, "[Bridge] Snapshot write failed");
        }
    }

    async fn run_scan(self: Arc<Self>) {
        let period = self.config.scan_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.registry.scan() {
                        Some(found) => trace!(found = found.len(), "[Bridge] Discovery scan"),
                        None => debug!("[Bridge] Discovery scan already running"),
                    }
                }
            }
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn write_snapshot(&self) -> Result<()> {
        let Some(store) = &self.snapshot_store else {
            return Ok(());
        };
        let clients = self.registry.all_clients();
        let value = json!({
            "version": SNAPSHOT_VERSION,
            "savedAt": Utc::now(),
            "clients": clients,
        });
        store
            .write(SNAPSHOT_KEY, &value)
            .await
            .context("Failed to write registry snapshot")?;
        trace!(clients = clients.len(), "[Bridge] Snapshot written");
        Ok(())
    }

    /// Re-register snapshot records as discovered; dial the reconnect-capable ones
    async fn restore_snapshot(self: &Arc<Self>) -> Result<()> {
        let Some(store) = &self.snapshot_store else {
            return Ok(());
        };
        let Some(value) = store
            .read(SNAPSHOT_KEY)
            .await
            .context("Failed to read registry snapshot")?
        else {
            return Ok(());
        };

        let records: Vec<ClientRecord> = match value.get("clients").cloned() {
            Some(clients) => serde_json::from_value(clients).context("Invalid registry snapshot")?,
            None => Vec::new(),
        };

        let mut restored = 0usize;
        for mut record in records {
            if self.registry.contains(&record.id) {
                continue;
            }
            record.set_state(ConnectionState::Discovered);
            let dial = record.wants_reconnect() && record.socket_path.is_some();
            let client_id = record.id.clone();
            self.registry.register_client(record);
            restored += 1;

            if dial {
                let connections = self.connections.clone();
                tokio::spawn(async move {
                    if let Err(e) = connections.attempt_connection(&client_id).await {
                        debug!(client_id = %client_id, error = %e, "[Bridge] Restore dial skipped");
                    }
                });
            }
        }
        info!(restored, "[Bridge] Registry snapshot restored");
        Ok(())
    }
}

/// The origin's request id stored on the task, if it round-trips
fn origin_request_id(task: &Task) -> Option<RequestId> {
    task.origin_request_id
        .clone()
        .and_then(|value: Value| serde_json::from_value(value).ok())
}
