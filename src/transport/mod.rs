//! # Transport Contract
//!
//! Everything the engine needs from the network layer, abstracted behind
//! one trait so the engine never depends on a concrete transport. A real
//! deployment would implement `GossipTransport` over TCP, QUIC, or a
//! pub/sub broker; `loopback` provides an in-process reference
//! implementation used by tests and the demo binary.

pub mod loopback;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::model::{Digest, DigestResponse, EventMessage, TransportAddress, TransportPeer};

/// One incoming digest: who sent it, its contents, and a one-shot channel
/// to push the response back through. The transport never fabricates or
/// validates NodeIds; it only reports `TransportAddress`es — all NodeId
/// trust is established by the engine cross-checking `senderId` against
/// the address that delivered the message.
pub struct IncomingDigest {
    pub from: TransportPeer,
    pub digest: Digest,
    pub respond: oneshot::Sender<DigestResponse>,
}

/// One incoming event batch.
pub struct IncomingEventMessage {
    pub from: TransportPeer,
    pub message: EventMessage,
}

/// Capability the engine consumes from the network layer. Implementations
/// must be `Send + Sync` since the engine may hold one behind an `Arc` and
/// drive it from the gossip, anti-entropy, and discovery tasks at once.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;

    /// Request/response digest exchange. Fails with `TransportError` on an
    /// unreachable peer or on timeout.
    async fn send_digest(
        &self,
        peer: &TransportPeer,
        digest: Digest,
        timeout: std::time::Duration,
    ) -> Result<DigestResponse>;

    /// Fire-and-acknowledge event push. Fails with `TransportError`.
    async fn send_events(
        &self,
        peer: &TransportPeer,
        message: EventMessage,
        timeout: std::time::Duration,
    ) -> Result<()>;

    /// Best-effort enumeration of currently reachable transport peers.
    async fn discover_peers(&self) -> Result<Vec<TransportPeer>>;

    async fn is_peer_reachable(&self, peer: &TransportPeer) -> Result<bool>;

    /// Hands back the receiving half of the incoming-digests channel.
    /// Restartable only by resubscribing; the engine calls this once
    /// during `initialize`.
    async fn incoming_digests(&self) -> Result<mpsc::Receiver<IncomingDigest>>;

    /// Hands back the receiving half of the incoming-events channel.
    async fn incoming_events(&self) -> Result<mpsc::Receiver<IncomingEventMessage>>;

    fn local_address(&self) -> TransportAddress;
}
