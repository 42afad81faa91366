//! # gossip_sync
//!
//! A transport-agnostic gossip-based event synchronization engine: a fleet
//! of peer nodes converge on a shared, append-only log of application
//! events without a central coordinator. Each node originates events
//! locally and learns about remote events through periodic pairwise digest
//! exchanges; a vector clock tracks causal order.
//!
//! The crate supplies the protocol engine (`engine::GossipEngine`) and its
//! immediate collaborators — vector clock, data model, store and transport
//! contracts, peer selection, reliability accounting — plus reference
//! in-memory and `sled`-backed store implementations and an in-process
//! loopback transport for testing. A concrete network transport and a
//! production store backend are left to the embedding application.

pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod model;
pub mod peer_selection;
pub mod reliability;
pub mod store;
pub mod transport;
pub mod vector_clock;

pub use config::{Config, PeerSelectionStrategy};
pub use engine::{EventReceivedMsg, GossipEngine, GossipExchangeResult};
pub use error::{GossipError, Result};
pub use model::{
    Digest, DigestResponse, Event, EventMessage, NodeId, Peer, TransportAddress, TransportPeer,
};
pub use vector_clock::{ClockOrdering, VectorClock, VectorClockSnapshot};
