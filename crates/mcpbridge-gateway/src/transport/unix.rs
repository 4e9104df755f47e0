//! Unix-domain socket transport
//!
//! Newline-delimited JSON frames. Every connection gets one reader task and
//! one writer task fed by a bounded queue. The socket file is created `0600`
//! inside a `0700` directory; a stale file from a previous run is removed.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use mcpbridge_core::ClientRecord;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{PeerId, Transport, TransportError, TransportEvent, MAX_FRAME_BYTES};

/// Per-connection outbound queue depth
const WRITE_QUEUE_CAPACITY: usize = 64;

struct PeerConnection {
    writer: mpsc::Sender<Vec<u8>>,
    client_id: Option<String>,
    cancel: CancellationToken,
}

struct Shared {
    events: mpsc::Sender<TransportEvent>,
    peers: DashMap<PeerId, PeerConnection>,
    clients: DashMap<String, PeerId>,
    next_peer: AtomicU64,
    cancel: CancellationToken,
    /// Longest line a peer may send before it is disconnected
    max_frame_bytes: usize,
}

impl Shared {
    fn bound_client(&self, peer: PeerId) -> Option<String> {
        self.peers.get(&peer).and_then(|conn| conn.client_id.clone())
    }

    /// Forget `peer`. Returns the client it was bound to, if it was still tracked.
    fn forget(&self, peer: PeerId) -> Option<Option<String>> {
        let (_, conn) = self.peers.remove(&peer)?;
        if let Some(client_id) = &conn.client_id {
            self.clients.remove_if(client_id, |_, bound| *bound == peer);
        }
        Some(conn.client_id)
    }
}

pub struct UnixSocketTransport {
    shared: Arc<Shared>,
    socket_path: Mutex<Option<PathBuf>>,
}

impl UnixSocketTransport {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self::with_max_frame_bytes(events, MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(events: mpsc::Sender<TransportEvent>, max_frame_bytes: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                events,
                peers: DashMap::new(),
                clients: DashMap::new(),
                next_peer: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                max_frame_bytes,
            }),
            socket_path: Mutex::new(None),
        }
    }

    /// Bind `path` and start accepting connections
    pub fn listen(&self, path: &Path) -> std::io::Result<JoinHandle<()>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            if let Err(e) = fs::set_permissions(parent, fs::Permissions::from_mode(0o700)) {
                debug!(error = %e, "[UnixSocket] Could not restrict socket directory");
            }
        }
        if path.exists() {
            debug!(path = %path.display(), "[UnixSocket] Removing stale socket file");
            fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        *self.socket_path.lock() = Some(path.to_path_buf());

        info!(path = %path.display(), "[UnixSocket] Listening");

        let shared = self.shared.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    accept = listener.accept() => match accept {
                        Ok((stream, _addr)) => {
                            let peer = attach(&shared, stream, None);
                            debug!(peer, "[UnixSocket] Accepted connection");
                        }
                        Err(e) => warn!(error = %e, "[UnixSocket] Accept failed"),
                    }
                }
            }
            debug!("[UnixSocket] Accept loop stopped");
        }))
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket_path.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.peers.len()
    }

    fn writer_for_client(&self, client_id: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        let peer = *self.shared.clients.get(client_id)?;
        self.shared.peers.get(&peer).map(|conn| conn.writer.clone())
    }
}

/// Register a new connection and spawn its reader and writer tasks
fn attach(shared: &Arc<Shared>, stream: UnixStream, client_id: Option<String>) -> PeerId {
    let peer = shared.next_peer.fetch_add(1, Ordering::Relaxed);
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let cancel = shared.cancel.child_token();

    if let Some(id) = &client_id {
        shared.clients.insert(id.clone(), peer);
    }
    shared.peers.insert(
        peer,
        PeerConnection {
            writer: tx,
            client_id,
            cancel: cancel.clone(),
        },
    );

    tokio::spawn(writer_loop(peer, writer, rx, cancel.clone()));
    tokio::spawn(reader_loop(shared.clone(), peer, reader, cancel));
    peer
}

async fn writer_loop(
    peer: PeerId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let result = async {
            writer.write_all(&frame).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!(peer, error = %e, "[UnixSocket] Write failed");
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_loop(
    shared: Arc<Shared>,
    peer: PeerId,
    reader: OwnedReadHalf,
    cancel: CancellationToken,
) {
    let codec = LinesCodec::new_with_max_length(shared.max_frame_bytes);
    let mut frames = FramedRead::new(reader, codec);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                trace!(peer, bytes = line.len(), "[UnixSocket] Frame received");
                let event = TransportEvent::Message {
                    peer,
                    client_id: shared.bound_client(peer),
                    payload: line.as_bytes().to_vec(),
                };
                if shared.events.send(event).await.is_err() {
                    break;
                }
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!(
                    peer,
                    max_bytes = shared.max_frame_bytes,
                    "[UnixSocket] Frame exceeds size limit; closing connection"
                );
                break;
            }
            Some(Err(e)) => {
                debug!(peer, error = %e, "[UnixSocket] Read failed");
                break;
            }
            None => break,
        }
    }

    cancel.cancel();
    // Deliberate closes have already forgotten the peer
    if let Some(client_id) = shared.forget(peer) {
        debug!(peer, client_id = ?client_id, "[UnixSocket] Connection closed");
        let _ = shared
            .events
            .send(TransportEvent::Closed { peer, client_id })
            .await;
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn send(&self, client_id: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let writer = self
            .writer_for_client(client_id)
            .ok_or_else(|| TransportError::NotConnected(client_id.to_string()))?;
        writer
            .send(payload)
            .await
            .map_err(|_| TransportError::NotConnected(client_id.to_string()))
    }

    async fn reply(&self, peer: PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        let writer = self
            .shared
            .peers
            .get(&peer)
            .map(|conn| conn.writer.clone())
            .ok_or(TransportError::UnknownPeer(peer))?;
        writer
            .send(payload)
            .await
            .map_err(|_| TransportError::UnknownPeer(peer))
    }

    async fn open(&self, record: &ClientRecord) -> Result<(), TransportError> {
        if self.shared.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.writer_for_client(&record.id).is_some() {
            return Ok(());
        }
        let path = record
            .socket_path
            .as_deref()
            .ok_or_else(|| TransportError::NoSocketPath(record.id.clone()))?;

        let stream = UnixStream::connect(path).await?;
        let peer = attach(&self.shared, stream, Some(record.id.clone()));
        info!(client_id = %record.id, peer, path, "[UnixSocket] Dialed client");
        Ok(())
    }

    fn bind(&self, peer: PeerId, client_id: &str) {
        let Some(mut conn) = self.shared.peers.get_mut(&peer) else {
            warn!(peer, client_id, "[UnixSocket] Bind for unknown peer");
            return;
        };
        conn.client_id = Some(client_id.to_string());
        drop(conn);

        // A newer connection supersedes the old one for this client
        if let Some(previous) = self.shared.clients.insert(client_id.to_string(), peer) {
            if previous != peer {
                if let Some(mut old) = self.shared.peers.get_mut(&previous) {
                    old.client_id = None;
                }
                debug!(client_id, previous, peer, "[UnixSocket] Rebound client");
            }
        }
    }

    async fn close(&self, client_id: &str) {
        let Some((_, peer)) = self.shared.clients.remove(client_id) else {
            return;
        };
        if let Some((_, conn)) = self.shared.peers.remove(&peer) {
            conn.cancel.cancel();
            debug!(client_id, peer, "[UnixSocket] Closed client connection");
        }
    }

    async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.peers.clear();
        self.shared.clients.clear();
        if let Some(path) = self.socket_path.lock().take() {
            if let Err(e) = fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "[UnixSocket] Socket file not removed");
            }
        }
        info!("[UnixSocket] Transport shut down");
    }

    fn description(&self) -> String {
        match self.socket_path() {
            Some(path) => format!("unix:{}", path.display()),
            None => "unix:<not listening>".to_string(),
        }
    }
}
