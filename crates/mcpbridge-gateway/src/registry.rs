//! Discovery Registry - the authoritative map of known clients
//!
//! One `ClientRecord` per id, connected or not. The registry never times
//! clients out on its own; callers signal loss through `remove_client` or the
//! periodic `purge_disconnected` sweep driven by the bridge cleanup timer.
//!
//! Events:
//! - `ClientFound` the first time an id is inserted
//! - `ClientLost` whenever a record is removed

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcpbridge_core::{BridgeEvent, ClientRecord, ClientType, EventSender};
use parking_lot::RwLock;
use tracing::{debug, info, trace};

/// Registry entry; `seq` preserves first-arrival order for routing tie-breaks
struct Entry {
    record: ClientRecord,
    seq: u64,
}

pub struct DiscoveryRegistry {
    clients: RwLock<HashMap<String, Entry>>,
    next_seq: AtomicU64,
    scanning: AtomicBool,
    event_tx: EventSender,
}

/// Clears the in-flight scan flag on every exit path
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DiscoveryRegistry {
    pub fn new(event_tx: EventSender) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            scanning: AtomicBool::new(false),
            event_tx,
        }
    }

    /// Upsert by id and refresh `last_seen`.
    ///
    /// Returns `true` (and emits `ClientFound`) only on first insertion.
    /// Re-registration keeps the original arrival position.
    pub fn register_client(&self, mut record: ClientRecord) -> bool {
        record.touch();
        record.set_state(record.state);

        let client_id = record.id.clone();
        let client_type = record.client_type;

        let inserted = {
            let mut clients = self.clients.write();
            match clients.get_mut(&client_id) {
                Some(entry) => {
                    entry.record = record;
                    false
                }
                None => {
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    clients.insert(client_id.clone(), Entry { record, seq });
                    true
                }
            }
        };

        if inserted {
            info!(
                client_id = %client_id,
                client_type = %client_type,
                "[DiscoveryRegistry] Client found"
            );
            self.event_tx.emit(BridgeEvent::ClientFound {
                client_id,
                client_type,
            });
        } else {
            trace!(client_id = %client_id, "[DiscoveryRegistry] Client refreshed");
        }
        inserted
    }

    /// Mutate a record in place. Returns the updated copy, or `None` if unknown.
    pub fn update_client<F>(&self, client_id: &str, f: F) -> Option<ClientRecord>
    where
        F: FnOnce(&mut ClientRecord),
    {
        let mut clients = self.clients.write();
        let entry = clients.get_mut(client_id)?;
        f(&mut entry.record);
        Some(entry.record.clone())
    }

    pub fn get_client(&self, client_id: &str) -> Option<ClientRecord> {
        self.clients
            .read()
            .get(client_id)
            .map(|entry| entry.record.clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.read().contains_key(client_id)
    }

    /// All records of `client_type`, connected or not, in arrival order
    pub fn get_clients_by_type(&self, client_type: ClientType) -> Vec<ClientRecord> {
        self.collect_ordered(|record| record.client_type == client_type)
    }

    /// Connected records of `client_type`, in arrival order
    pub fn connected_clients_by_type(&self, client_type: ClientType) -> Vec<ClientRecord> {
        self.collect_ordered(|record| record.client_type == client_type && record.is_connected())
    }

    pub fn all_clients(&self) -> Vec<ClientRecord> {
        self.collect_ordered(|_| true)
    }

    fn collect_ordered<P>(&self, predicate: P) -> Vec<ClientRecord>
    where
        P: Fn(&ClientRecord) -> bool,
    {
        let clients = self.clients.read();
        let mut matched: Vec<&Entry> = clients
            .values()
            .filter(|entry| predicate(&entry.record))
            .collect();
        matched.sort_by_key(|entry| entry.seq);
        matched.into_iter().map(|entry| entry.record.clone()).collect()
    }

    /// Remove a record, emitting `ClientLost`. Returns the removed record.
    pub fn remove_client(&self, client_id: &str) -> Option<ClientRecord> {
        let removed = self.clients.write().remove(client_id)?;
        info!(client_id = %client_id, "[DiscoveryRegistry] Client lost");
        self.event_tx.emit(BridgeEvent::ClientLost {
            client_id: client_id.to_string(),
        });
        Some(removed.record)
    }

    /// Remove records that are not connected, not mid-connection, and whose
    /// `last_seen` is strictly older than `max_age` at `now`.
    pub fn purge_disconnected(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        let stale: Vec<String> = {
            let clients = self.clients.read();
            clients
                .values()
                .filter(|entry| {
                    let record = &entry.record;
                    !record.is_connected()
                        && !record.state.is_in_flight()
                        && older_than(now, record.last_seen, max_age)
                })
                .map(|entry| entry.record.id.clone())
                .collect()
        };

        stale
            .into_iter()
            .filter(|id| self.remove_client(id).is_some())
            .collect()
    }

    /// Report the current registry snapshot.
    ///
    /// Registration-driven discovery does no active probing; this is the hook
    /// for future strategies. Returns `None` when a scan is already in flight.
    pub fn scan(&self) -> Option<Vec<ClientRecord>> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[DiscoveryRegistry] Scan already in progress, skipping");
            return None;
        }
        let _guard = ScanGuard(&self.scanning);

        let snapshot = self.all_clients();
        trace!(clients = snapshot.len(), "[DiscoveryRegistry] Scan complete");
        Some(snapshot)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Drop every record without emitting events (bridge shutdown)
    pub fn clear(&self) {
        self.clients.write().clear();
    }
}

/// `now - then > max_age`; timestamps in the future are never expired
pub(crate) fn older_than(now: DateTime<Utc>, then: DateTime<Utc>, max_age: Duration) -> bool {
    match (now - then).to_std() {
        Ok(age) => age > max_age,
        Err(_) => false,
    }
}
