//! Mock collaborator implementations for testing
//!
//! In-memory transport, process spawner, and snapshot store so the bridge can
//! be driven without sockets, child processes, or files.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mcpbridge_core::{
    ClientRecord, JsonRpcFrame, RegistrationMessage, SnapshotStore, StorageError,
};
use mcpbridge_gateway::{
    PeerId, ProcessEvent, ProcessHandle, ProcessSpawner, ProcessSpec, Transport, TransportError,
};

// ============================================================================
// MockTransport
// ============================================================================

/// Records every outbound frame; sends to "unreachable" clients fail
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    replies: Mutex<Vec<(PeerId, Vec<u8>)>>,
    bindings: Mutex<HashMap<PeerId, String>>,
    opened: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
    unreachable: Mutex<HashSet<String>>,
    refuse_dials: AtomicBool,
    shut_down: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `client_id` fail
    pub fn make_unreachable(&self, client_id: &str) {
        self.unreachable.lock().insert(client_id.to_string());
    }

    pub fn make_reachable(&self, client_id: &str) {
        self.unreachable.lock().remove(client_id);
    }

    /// Make every dial fail with a connection-refused error
    pub fn refuse_dials(&self, refuse: bool) {
        self.refuse_dials.store(refuse, Ordering::SeqCst);
    }

    /// JSON-RPC frames sent to `client_id`, oldest first
    pub fn frames_sent_to(&self, client_id: &str) -> Vec<JsonRpcFrame> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| id == client_id)
            .filter_map(|(_, bytes)| serde_json::from_slice(bytes).ok())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Raw JSON of every reply written to `peer`
    pub fn replies_to(&self, peer: PeerId) -> Vec<Value> {
        self.replies
            .lock()
            .iter()
            .filter(|(p, _)| *p == peer)
            .filter_map(|(_, bytes)| serde_json::from_slice(bytes).ok())
            .collect()
    }

    pub fn registration_replies_to(&self, peer: PeerId) -> Vec<RegistrationMessage> {
        self.replies_to(peer)
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect()
    }

    pub fn rpc_replies_to(&self, peer: PeerId) -> Vec<JsonRpcFrame> {
        self.replies_to(peer)
            .into_iter()
            .filter(|value| value.get("jsonrpc").is_some())
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect()
    }

    pub fn bound_client(&self, peer: PeerId) -> Option<String> {
        self.bindings.lock().get(&peer).cloned()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().clone()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, client_id: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.unreachable.lock().contains(client_id) {
            return Err(TransportError::NotConnected(client_id.to_string()));
        }
        self.sent.lock().push((client_id.to_string(), payload));
        Ok(())
    }

    async fn reply(&self, peer: PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.replies.lock().push((peer, payload));
        Ok(())
    }

    async fn open(&self, record: &ClientRecord) -> Result<(), TransportError> {
        if record.socket_path.is_none() {
            return Err(TransportError::NoSocketPath(record.id.clone()));
        }
        if self.refuse_dials.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.opened.lock().push(record.id.clone());
        Ok(())
    }

    fn bind(&self, peer: PeerId, client_id: &str) {
        self.bindings.lock().insert(peer, client_id.to_string());
    }

    async fn close(&self, client_id: &str) {
        self.bindings.lock().retain(|_, id| id != client_id);
        self.closed.lock().push(client_id.to_string());
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    fn description(&self) -> String {
        "mock".to_string()
    }
}

// ============================================================================
// MockSpawner
// ============================================================================

struct MockChild {
    events: mpsc::Sender<ProcessEvent>,
    kill: CancellationToken,
}

/// Hands out fake processes whose lifecycle the test drives
pub struct MockSpawner {
    specs: Mutex<Vec<ProcessSpec>>,
    children: Mutex<Vec<MockChild>>,
    fail: AtomicBool,
    next_pid: AtomicU32,
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self {
            specs: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            next_pid: AtomicU32::new(4000),
        }
    }
}

impl MockSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().clone()
    }

    /// Report exit of the `index`th spawned process
    pub async fn exit(&self, index: usize, code: Option<i32>) {
        let sender = self.children.lock().get(index).map(|c| c.events.clone());
        if let Some(sender) = sender {
            let _ = sender.send(ProcessEvent::Exited { code }).await;
        }
    }

    pub fn was_killed(&self, index: usize) -> bool {
        self.children
            .lock()
            .get(index)
            .is_some_and(|child| child.kill.is_cancelled())
    }
}

#[async_trait]
impl ProcessSpawner for MockSpawner {
    async fn spawn(&self, spec: ProcessSpec) -> Result<ProcessHandle> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("Command not found: {}", spec.command);
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        let _ = tx.try_send(ProcessEvent::Spawned { pid });
        let kill = CancellationToken::new();

        self.specs.lock().push(spec);
        self.children.lock().push(MockChild {
            events: tx,
            kill: kill.clone(),
        });

        Ok(ProcessHandle {
            pid: Some(pid),
            events: rx,
            kill,
        })
    }
}

// ============================================================================
// MemorySnapshotStore
// ============================================================================

#[derive(Default)]
pub struct MemorySnapshotStore {
    values: RwLock<HashMap<String, Value>>,
    writes: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, path: &str, value: Value) -> Self {
        self.values.write().insert(path.to_string(), value);
        self
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.values.read().get(path).cloned()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn write(&self, path: &str, value: &Value) -> Result<(), StorageError> {
        self.values.write().insert(path.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.read().get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.values.write().remove(path);
        Ok(())
    }
}
