//! # Loopback Transport
//!
//! An in-process `GossipTransport` over `tokio::sync::mpsc`, keyed by
//! `TransportAddress`. Every `LoopbackTransport` registers itself in a
//! shared `LoopbackNetwork` hub on construction; sending to a peer looks
//! the peer's inbox up in the hub and pushes directly into its channel.
//! Intended for tests and the demo binary — never for cross-process use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{GossipError, Result};
use crate::model::{Digest, DigestResponse, EventMessage, TransportAddress, TransportPeer};

use super::{GossipTransport, IncomingDigest, IncomingEventMessage};

struct Inbox {
    digests: mpsc::Sender<IncomingDigest>,
    events: mpsc::Sender<IncomingEventMessage>,
}

/// Shared rendezvous point for a set of in-process `LoopbackTransport`s.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inboxes: Arc<Mutex<HashMap<TransportAddress, Inbox>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct LoopbackTransport {
    address: TransportAddress,
    network: LoopbackNetwork,
    digest_rx: Mutex<Option<mpsc::Receiver<IncomingDigest>>>,
    event_rx: Mutex<Option<mpsc::Receiver<IncomingEventMessage>>>,
}

impl LoopbackTransport {
    /// Registers a new transport at `address` on `network`. Two transports
    /// sharing the same `network` can reach each other by address.
    pub async fn new(address: TransportAddress, network: LoopbackNetwork) -> Self {
        let (digest_tx, digest_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        network.inboxes.lock().await.insert(
            address.clone(),
            Inbox {
                digests: digest_tx,
                events: event_tx,
            },
        );
        Self {
            address,
            network,
            digest_rx: Mutex::new(Some(digest_rx)),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }
}

#[async_trait]
impl GossipTransport for LoopbackTransport {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.network.inboxes.lock().await.remove(&self.address);
        Ok(())
    }

    async fn send_digest(
        &self,
        peer: &TransportPeer,
        digest: Digest,
        timeout: Duration,
    ) -> Result<DigestResponse> {
        let (respond_tx, respond_rx) = oneshot::channel();
        let sender = {
            let inboxes = self.network.inboxes.lock().await;
            inboxes
                .get(&peer.address)
                .map(|inbox| inbox.digests.clone())
        };
        let sender = sender.ok_or_else(|| {
            GossipError::transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no loopback peer at {}", peer.address),
            ))
        })?;

        let local = LoopbackTransport {
            address: self.address.clone(),
            network: self.network.clone(),
            digest_rx: Mutex::new(None),
            event_rx: Mutex::new(None),
        };
        let from = TransportPeer::new(local.address.clone());

        sender
            .send(IncomingDigest {
                from,
                digest,
                respond: respond_tx,
            })
            .await
            .map_err(|e| GossipError::transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e.to_string(),
            )))?;

        tokio::time::timeout(timeout, respond_rx)
            .await
            .map_err(|_| {
                GossipError::transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "digest exchange timed out",
                ))
            })?
            .map_err(|e| GossipError::transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e.to_string(),
            )))
    }

    async fn send_events(
        &self,
        peer: &TransportPeer,
        message: EventMessage,
        timeout: Duration,
    ) -> Result<()> {
        let sender = {
            let inboxes = self.network.inboxes.lock().await;
            inboxes.get(&peer.address).map(|inbox| inbox.events.clone())
        };
        let sender = sender.ok_or_else(|| {
            GossipError::transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no loopback peer at {}", peer.address),
            ))
        })?;
        let from = TransportPeer::new(self.address.clone());
        tokio::time::timeout(timeout, sender.send(IncomingEventMessage { from, message }))
            .await
            .map_err(|_| {
                GossipError::transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "event send timed out",
                ))
            })?
            .map_err(|e| {
                GossipError::transport(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    e.to_string(),
                ))
            })
    }

    async fn discover_peers(&self) -> Result<Vec<TransportPeer>> {
        let inboxes = self.network.inboxes.lock().await;
        Ok(inboxes
            .keys()
            .filter(|addr| *addr != &self.address)
            .map(|addr| TransportPeer::new(addr.clone()))
            .collect())
    }

    async fn is_peer_reachable(&self, peer: &TransportPeer) -> Result<bool> {
        Ok(self.network.inboxes.lock().await.contains_key(&peer.address))
    }

    async fn incoming_digests(&self) -> Result<mpsc::Receiver<IncomingDigest>> {
        self.digest_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| GossipError::NotInitialized("digest channel already taken".into()))
    }

    async fn incoming_events(&self) -> Result<mpsc::Receiver<IncomingEventMessage>> {
        self.event_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| GossipError::NotInitialized("event channel already taken".into()))
    }

    fn local_address(&self) -> TransportAddress {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;
    use crate::vector_clock::VectorClockSnapshot;

    #[tokio::test]
    async fn send_digest_round_trips_through_responder() {
        let network = LoopbackNetwork::new();
        let a_addr = TransportAddress::new("a").unwrap();
        let b_addr = TransportAddress::new("b").unwrap();
        let a = LoopbackTransport::new(a_addr.clone(), network.clone()).await;
        let b = LoopbackTransport::new(b_addr.clone(), network.clone()).await;

        let mut b_digests = b.incoming_digests().await.unwrap();
        let responder = tokio::spawn(async move {
            let incoming = b_digests.recv().await.unwrap();
            let response = DigestResponse::new(NodeId::new("B").unwrap());
            incoming.respond.send(response).unwrap();
        });

        let digest = Digest::new(NodeId::new("A").unwrap(), VectorClockSnapshot::default());
        let peer = TransportPeer::new(b_addr);
        let response = a
            .send_digest(&peer, digest, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.sender_id, NodeId::new("B").unwrap());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn send_digest_to_unknown_peer_fails() {
        let network = LoopbackNetwork::new();
        let a = LoopbackTransport::new(TransportAddress::new("a").unwrap(), network).await;
        let ghost = TransportPeer::new(TransportAddress::new("ghost").unwrap());
        let digest = Digest::new(NodeId::new("A").unwrap(), VectorClockSnapshot::default());
        let result = a.send_digest(&ghost, digest, Duration::from_millis(100)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn discover_peers_excludes_self() {
        let network = LoopbackNetwork::new();
        let a = LoopbackTransport::new(TransportAddress::new("a").unwrap(), network.clone()).await;
        let _b = LoopbackTransport::new(TransportAddress::new("b").unwrap(), network).await;
        let peers = a.discover_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, TransportAddress::new("b").unwrap());
    }
}
