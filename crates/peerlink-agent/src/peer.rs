//! Known peers and change notification

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Peer identifier property
pub const ATTR_ID: &str = "ID";
/// Human-readable agent name
pub const ATTR_NAME: &str = "Name";
/// Operating system of the peer
pub const ATTR_OS_NAME: &str = "OSName";
/// Transport used to reach the peer
pub const ATTR_TRANSPORT_NAME: &str = "TransportName";
/// Host name or address
pub const ATTR_HOST: &str = "Host";
/// Port number
pub const ATTR_PORT: &str = "Port";
/// Unique id of the agent process
pub const ATTR_AGENT_ID: &str = "AgentID";

/// A reachable agent and the properties it advertises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Unique peer identifier
    pub id: String,
    /// Named string properties
    pub attrs: BTreeMap<String, String>,
    /// Whether the peer is reported to clients
    pub discoverable: bool,
}

impl PeerRecord {
    /// Discoverable peer with no properties
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: BTreeMap::new(),
            discoverable: true,
        }
    }

    /// Add or replace a property
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Set the discoverability flag
    pub fn with_discoverable(mut self, discoverable: bool) -> Self {
        self.discoverable = discoverable;
        self
    }

    /// Property value by name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// `{"ID": id, <name>: <value>, ...}`
impl Serialize for PeerRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = self.attrs.keys().filter(|k| *k != ATTR_ID).count();
        let mut map = serializer.serialize_map(Some(extra + 1))?;
        map.serialize_entry(ATTR_ID, &self.id)?;
        for (name, value) in &self.attrs {
            if name != ATTR_ID {
                map.serialize_entry(name, value)?;
            }
        }
        map.end()
    }
}

/// Registry change kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// First time the peer is seen
    Added,
    /// Properties changed
    Changed,
    /// Peer re-announced itself unchanged
    HeartBeat,
    /// Peer is gone
    Removed,
}

impl PeerEvent {
    /// Event name on the wire
    pub fn name(self) -> &'static str {
        match self {
            PeerEvent::Added => "peerAdded",
            PeerEvent::Changed => "peerChanged",
            PeerEvent::HeartBeat => "peerHeartBeat",
            PeerEvent::Removed => "peerRemoved",
        }
    }
}

/// Receives registry changes
pub trait PeerListener: Send + Sync {
    /// Called after the registry has been updated, outside its lock
    fn peer_changed(&self, event: PeerEvent, peer: &PeerRecord);
}

/// In-memory table of known peers
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<String, PeerRecord>>,
    listeners: Mutex<Vec<Arc<dyn PeerListener>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PeerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer. Returns the event that was emitted.
    pub fn add(&self, record: PeerRecord) -> PeerEvent {
        let event = {
            let mut peers = lock(&self.peers);
            match peers.insert(record.id.clone(), record.clone()) {
                None => PeerEvent::Added,
                Some(prev) if prev == record => PeerEvent::HeartBeat,
                Some(_) => PeerEvent::Changed,
            }
        };
        debug!("Peer {} {:?}", record.id, event);
        self.notify(event, &record);
        event
    }

    /// Report that a known peer is still alive
    pub fn heartbeat(&self, id: &str) -> bool {
        let Some(record) = self.find(id) else {
            return false;
        };
        self.notify(PeerEvent::HeartBeat, &record);
        true
    }

    /// Drop a peer
    pub fn remove(&self, id: &str) -> Option<PeerRecord> {
        let record = lock(&self.peers).remove(id)?;
        debug!("Peer {} removed", id);
        self.notify(PeerEvent::Removed, &record);
        Some(record)
    }

    /// Look up a peer by id
    pub fn find(&self, id: &str) -> Option<PeerRecord> {
        lock(&self.peers).get(id).cloned()
    }

    /// Snapshot of every known peer
    pub fn peers(&self) -> Vec<PeerRecord> {
        lock(&self.peers).values().cloned().collect()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    /// Whether no peers are known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to every future change
    pub fn add_listener(&self, listener: Arc<dyn PeerListener>) {
        lock(&self.listeners).push(listener);
    }

    fn notify(&self, event: PeerEvent, record: &PeerRecord) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.peer_changed(event, record);
        }
    }
}
