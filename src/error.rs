//! # Error Kinds
//!
//! A single tagged error union for every failure mode the engine and its
//! collaborators can produce. Mirrors the exception hierarchy of the source
//! system as a flat `enum` with fields carrying the same context
//! (`peer_id`, `event_id`, `cause`) an exception's attributes would.

use thiserror::Error;

/// All failure modes surfaced by this crate.
///
/// Validation and state-precondition variants (`InvalidConfig`,
/// `InvalidEvent`, `NotInitialized`, `VectorClockError`) are raised directly
/// to the caller. `StoreError` and `TransportError` are also raised to
/// direct callers (e.g. `EventStore::save`), but when they occur inside a
/// gossip cycle the engine catches them and reports a failed
/// `GossipExchangeResult` instead of propagating.
#[derive(Debug, Error)]
pub enum GossipError {
    /// Configuration failed validation at construction time.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An event could not be created: empty payload or malformed field.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The operation requires a lifecycle state the engine is not in.
    #[error("engine not initialized: {0}")]
    NotInitialized(String),

    /// The event store failed to perform a requested operation.
    #[error("event store error: {source}")]
    StoreError {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The transport failed to send, receive, or reach a peer.
    #[error("transport error: {source}")]
    TransportError {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A peer was unknown, unreachable, or inconsistent with known state.
    #[error("peer error{}", .peer_id.as_ref().map(|p| format!(" ({p})")).unwrap_or_default())]
    PeerError { peer_id: Option<String> },

    /// A wire-format value failed to parse.
    #[error("serialization error{}", .data.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
    SerializationError { data: Option<String> },

    /// A vector clock invariant was violated (negative value, empty node id).
    #[error("vector clock error: {0}")]
    VectorClockError(String),

    /// An event with this id already exists. Only raised when the caller
    /// opts into strict duplicate reporting; the default behavior is silent
    /// idempotency (see `EventStore::save`).
    #[error("duplicate event: {event_id}")]
    DuplicateEvent { event_id: String },
}

impl GossipError {
    pub fn store<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        GossipError::StoreError {
            source: Box::new(source),
        }
    }

    pub fn transport<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        GossipError::TransportError {
            source: Box::new(source),
        }
    }

    pub fn peer(peer_id: impl Into<String>) -> Self {
        GossipError::PeerError {
            peer_id: Some(peer_id.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GossipError>;
