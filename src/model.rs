//! # Data Model
//!
//! Immutable wire types: `NodeId`, `TransportAddress`, `Event`, `Peer`,
//! `TransportPeer`, `Digest`, `DigestResponse`, `EventMessage`. `NodeId` and
//! `TransportAddress` are newtype wrappers around `String` so the two
//! identity spaces (stable logical identity vs. possibly-changing transport
//! locator) can never be mixed up at a call site — see spec's "Opaque IDs"
//! redesign note.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GossipError, Result};
use crate::vector_clock::VectorClockSnapshot;

/// Stable logical identity of a node. Survives restarts for a given node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(GossipError::VectorClockError(
                "node id must not be empty".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Builds a `NodeId` without validation. Reserved for constructing
    /// deliberately-invalid values in tests of the validation path itself.
    #[cfg(test)]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque transport-layer locator. May change between sessions even for the
/// same `NodeId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportAddress(String);

impl TransportAddress {
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        if addr.is_empty() {
            return Err(GossipError::InvalidEvent(
                "transport address must not be empty".into(),
            ));
        }
        Ok(Self(addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An immutable application event. Equality and hashing are by `id` alone;
/// `content_hash` (over `id`, `node_id`, `logical_timestamp`,
/// `creation_timestamp`) is available for callers that want to compare
/// event bodies without pulling in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub node_id: NodeId,
    pub logical_timestamp: u64,
    pub creation_timestamp: u64,
    pub payload: HashMap<String, serde_json::Value>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Event {}

impl Event {
    /// Validates a non-empty payload and stamps a fresh globally unique id.
    /// `logical_timestamp` must already have been taken from the
    /// originator's vector clock by the caller (the engine, in `create`).
    pub fn new(
        node_id: NodeId,
        logical_timestamp: u64,
        payload: HashMap<String, serde_json::Value>,
    ) -> Result<Self> {
        if payload.is_empty() {
            return Err(GossipError::InvalidEvent("payload must not be empty".into()));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            node_id,
            logical_timestamp,
            creation_timestamp: now_ms(),
            payload,
        })
    }

    pub fn content_hash(&self) -> [u8; 32] {
        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.node_id.as_str().as_bytes());
        hasher.update(self.logical_timestamp.to_be_bytes());
        hasher.update(self.creation_timestamp.to_be_bytes());
        hasher.finalize().into()
    }

    pub fn summary(&self) -> EventSummary {
        EventSummary {
            id: self.id.clone(),
            node_id: self.node_id.clone(),
            logical_timestamp: self.logical_timestamp,
        }
    }

    /// Best-effort serialized size estimate, used by the message-size cap.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// A compact, loggable stand-in for a full `Event`.
#[derive(Debug, Clone)]
pub struct EventSummary {
    pub id: String,
    pub node_id: NodeId,
    pub logical_timestamp: u64,
}

/// A remote node at the transport level: a live connection the transport
/// knows about, identified by address. Lifetime is owned by the transport —
/// created on connection, dropped on disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPeer {
    pub address: TransportAddress,
    pub display_name: Option<String>,
    pub connected_at: u64,
    pub is_active: bool,
    pub metadata: HashMap<String, String>,
}

impl TransportPeer {
    pub fn new(address: TransportAddress) -> Self {
        Self {
            address,
            display_name: None,
            connected_at: now_ms(),
            is_active: true,
            metadata: HashMap::new(),
        }
    }
}

/// A remote node at the gossip level, identified by `NodeId`. Created only
/// once a digest or response reveals a `NodeId` bound to a known
/// `TransportAddress`; destroyed once that `NodeId` disappears from every
/// active transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub node_id: NodeId,
    pub address: TransportAddress,
    pub last_contact_time: Option<u64>,
    pub is_active: bool,
    pub metadata: HashMap<String, String>,
}

impl Peer {
    pub fn new(node_id: NodeId, address: TransportAddress) -> Self {
        Self {
            node_id,
            address,
            last_contact_time: None,
            is_active: true,
            metadata: HashMap::new(),
        }
    }
}

/// Phase-1 digest: a compact vector-clock summary. Pure snapshot, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub sender_id: NodeId,
    pub vector_clock: VectorClockSnapshot,
    pub created_at: u64,
    pub metadata: HashMap<String, String>,
}

impl Digest {
    pub fn new(sender_id: NodeId, vector_clock: VectorClockSnapshot) -> Self {
        Self {
            sender_id,
            vector_clock,
            created_at: now_ms(),
            metadata: HashMap::new(),
        }
    }
}

/// Phase-2 response: what the responder is sending back, and what it still
/// needs from the requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestResponse {
    pub sender_id: NodeId,
    pub events: Vec<Event>,
    pub event_requests: HashMap<NodeId, u64>,
    pub created_at: u64,
}

impl DigestResponse {
    pub fn new(sender_id: NodeId) -> Self {
        Self {
            sender_id,
            events: Vec::new(),
            event_requests: HashMap::new(),
            created_at: now_ms(),
        }
    }
}

/// Phase-3 payload: events pushed in response to an `event_requests` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub sender_id: NodeId,
    pub events: Vec<Event>,
    pub created_at: u64,
}

impl EventMessage {
    pub fn new(sender_id: NodeId, events: Vec<Event>) -> Self {
        Self {
            sender_id,
            events,
            created_at: now_ms(),
        }
    }
}
