//! # Gossip Engine
//!
//! The core state machine: owns the node's vector clock, its peer set, and
//! the three-phase digest exchange, and coordinates them across a gossip
//! timer, an anti-entropy timer, a peer-discovery timer, and the
//! transport's two incoming-message streams. Parameterized over the three
//! capability traits (`EventStoreContract`, `VectorClockStoreContract`,
//! `GossipTransport`) so it never depends on a concrete backend.
//!
//! Mutable in-memory state (clock, peer maps, contact times, reliability,
//! round-robin cursor, dedup cache) lives behind one `tokio::sync::Mutex`,
//! held only for the brief critical sections around a clock read/write or a
//! bookkeeping update — never across a transport call, so exchanges within
//! one cycle run concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dedup::DuplicateCache;
use crate::error::{GossipError, Result};
use crate::model::{
    now_ms, Digest, DigestResponse, Event, EventMessage, NodeId, Peer, TransportAddress,
    TransportPeer,
};
use crate::peer_selection::{select_peers, RoundRobinCursor};
use crate::reliability::ReliabilityTracker;
use crate::store::{EventStoreContract, VectorClockStoreContract};
use crate::transport::{GossipTransport, IncomingDigest, IncomingEventMessage};
use crate::vector_clock::{VectorClock, VectorClockSnapshot};

const CHANNEL_CAPACITY: usize = 1024;

/// `New -> Initialized -> Gossiping -> Initialized -> Shutdown` (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    New,
    Initialized,
    Gossiping,
    Shutdown,
}

/// An event newly learned from a peer.
#[derive(Debug, Clone)]
pub struct EventReceivedMsg {
    pub event: Event,
    pub from_peer: NodeId,
    pub received_at: u64,
}

/// Outcome of one `gossip_with` exchange, published on the exchange channel
/// regardless of success.
#[derive(Debug, Clone)]
pub struct GossipExchangeResult {
    pub peer: NodeId,
    pub success: bool,
    pub events_exchanged: usize,
    pub duration: Duration,
    pub error: Option<String>,
}

struct Channels {
    event_created: broadcast::Sender<Event>,
    event_received: broadcast::Sender<EventReceivedMsg>,
    peer_added: broadcast::Sender<Peer>,
    peer_removed: broadcast::Sender<NodeId>,
    gossip_exchange: broadcast::Sender<GossipExchangeResult>,
}

struct SharedState {
    clock: VectorClock,
    peers: HashMap<NodeId, Peer>,
    address_to_node: HashMap<TransportAddress, NodeId>,
    last_contact_times: HashMap<NodeId, u64>,
    reliability: ReliabilityTracker,
    round_robin_cursor: RoundRobinCursor,
    dedup: Option<DuplicateCache>,
}

struct Inner {
    config: Config,
    own_node_id: NodeId,
    event_store: Arc<dyn EventStoreContract>,
    clock_store: Option<Arc<dyn VectorClockStoreContract>>,
    transport: Arc<dyn GossipTransport>,
    shared: Mutex<SharedState>,
    state: Mutex<EngineState>,
    gossip_in_progress: AtomicBool,
    cancellation: CancellationToken,
    timer_tasks: StdMutex<Vec<JoinHandle<()>>>,
    incoming_tasks: StdMutex<Vec<JoinHandle<()>>>,
    channels: Channels,
}

/// A cheaply-clonable handle to the engine. Cloning shares the same
/// underlying state (`Arc`); spawned background tasks hold their own clone.
#[derive(Clone)]
pub struct GossipEngine {
    inner: Arc<Inner>,
}

impl GossipEngine {
    pub fn new(
        config: Config,
        event_store: Arc<dyn EventStoreContract>,
        transport: Arc<dyn GossipTransport>,
        clock_store: Option<Arc<dyn VectorClockStoreContract>>,
    ) -> Result<Self> {
        config.validate()?;
        let own_node_id = NodeId::new(config.node_id.clone())?;
        let dedup = if config.enable_duplicate_detection {
            Some(DuplicateCache::new(config.duplicate_cache_size))
        } else {
            None
        };

        let shared = SharedState {
            clock: VectorClock::new(),
            peers: HashMap::new(),
            address_to_node: HashMap::new(),
            last_contact_times: HashMap::new(),
            reliability: ReliabilityTracker::new(),
            round_robin_cursor: RoundRobinCursor::new(),
            dedup,
        };

        let (event_created, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (event_received, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (peer_added, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (peer_removed, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (gossip_exchange, _) = broadcast::channel(CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                own_node_id,
                event_store,
                clock_store,
                transport,
                shared: Mutex::new(shared),
                state: Mutex::new(EngineState::New),
                gossip_in_progress: AtomicBool::new(false),
                cancellation: CancellationToken::new(),
                timer_tasks: StdMutex::new(Vec::new()),
                incoming_tasks: StdMutex::new(Vec::new()),
                channels: Channels {
                    event_created,
                    event_received,
                    peer_added,
                    peer_removed,
                    gossip_exchange,
                },
            }),
        })
    }

    async fn require_active(&self) -> Result<()> {
        match *self.inner.state.lock().await {
            EngineState::Initialized | EngineState::Gossiping => Ok(()),
            EngineState::New => Err(GossipError::NotInitialized("engine not initialized".into())),
            EngineState::Shutdown => Err(GossipError::NotInitialized("engine is shut down".into())),
        }
    }

    // ---- lifecycle ----------------------------------------------------

    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match *state {
            EngineState::Initialized | EngineState::Gossiping => return Ok(()),
            EngineState::Shutdown => {
                return Err(GossipError::NotInitialized("engine is shut down".into()))
            }
            EngineState::New => {}
        }

        self.inner.transport.initialize().await?;

        if let Some(store) = &self.inner.clock_store {
            if let Some(snapshot) = store.load(&self.inner.own_node_id).await? {
                self.inner.shared.lock().await.clock = VectorClock::from_snapshot(snapshot);
            }
        }

        let digest_rx = self.inner.transport.incoming_digests().await?;
        let event_rx = self.inner.transport.incoming_events().await?;
        self.spawn_incoming_loops(digest_rx, event_rx);

        *state = EngineState::Initialized;
        Ok(())
    }

    pub async fn start_gossiping(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match *state {
            EngineState::Gossiping => return Ok(()),
            EngineState::Initialized => {}
            EngineState::New => {
                return Err(GossipError::NotInitialized("call initialize() first".into()))
            }
            EngineState::Shutdown => {
                return Err(GossipError::NotInitialized("engine is shut down".into()))
            }
        }
        self.spawn_timers();
        *state = EngineState::Gossiping;
        Ok(())
    }

    pub async fn stop_gossiping(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match *state {
            EngineState::Gossiping => {}
            EngineState::Initialized => return Ok(()),
            EngineState::New => {
                return Err(GossipError::NotInitialized("engine not initialized".into()))
            }
            EngineState::Shutdown => {
                return Err(GossipError::NotInitialized("engine is shut down".into()))
            }
        }
        for handle in std::mem::take(&mut *self.inner.timer_tasks.lock().unwrap()) {
            handle.abort();
        }
        *state = EngineState::Initialized;
        Ok(())
    }

    /// Optional convenience wrapper over `initialize()` + `start_gossiping()`.
    pub async fn start(&self) -> Result<()> {
        self.initialize().await?;
        self.start_gossiping().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        if matches!(*self.inner.state.lock().await, EngineState::Shutdown) {
            return Ok(());
        }
        self.inner.cancellation.cancel();
        for handle in std::mem::take(&mut *self.inner.timer_tasks.lock().unwrap()) {
            handle.abort();
        }
        for handle in std::mem::take(&mut *self.inner.incoming_tasks.lock().unwrap()) {
            handle.abort();
        }
        if let Err(e) = self.inner.transport.shutdown().await {
            log::warn!("transport shutdown failed: {e}");
        }
        if let Err(e) = self.inner.event_store.close().await {
            log::warn!("event store close failed: {e}");
        }
        if let Some(store) = &self.inner.clock_store {
            if let Err(e) = store.close().await {
                log::warn!("vector clock store close failed: {e}");
            }
        }
        *self.inner.state.lock().await = EngineState::Shutdown;
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(
            *self.inner.state.lock().await,
            EngineState::Initialized | EngineState::Gossiping
        )
    }

    pub async fn is_gossiping(&self) -> bool {
        matches!(*self.inner.state.lock().await, EngineState::Gossiping)
    }

    // ---- event creation -------------------------------------------------

    pub async fn create(
        &self,
        payload: HashMap<String, serde_json::Value>,
    ) -> Result<Event> {
        self.require_active().await?;
        if payload.is_empty() {
            return Err(GossipError::InvalidEvent("payload must not be empty".into()));
        }
        let event = {
            let mut shared = self.inner.shared.lock().await;
            let ts = shared.clock.increment(&self.inner.own_node_id)?;
            Event::new(self.inner.own_node_id.clone(), ts, payload)?
        };
        // Clock increment above is retained even if the save below fails.
        self.inner.event_store.save(event.clone()).await?;
        self.persist_vector_clock().await;
        let _ = self.inner.channels.event_created.send(event.clone());
        Ok(event)
    }

    // ---- peers -----------------------------------------------------------

    pub async fn peers(&self) -> Vec<Peer> {
        self.inner.shared.lock().await.peers.values().cloned().collect()
    }

    pub async fn vector_clock(&self) -> VectorClockSnapshot {
        self.inner.shared.lock().await.clock.summary()
    }

    /// Testing aid: manually binds a peer without a handshake. Rejects self.
    pub async fn add_peer(&self, node_id: NodeId, address: TransportAddress) -> Result<()> {
        if node_id == self.inner.own_node_id {
            return Err(GossipError::peer(node_id.to_string()));
        }
        let peer = Peer::new(node_id.clone(), address.clone());
        {
            let mut shared = self.inner.shared.lock().await;
            shared.address_to_node.insert(address, node_id.clone());
            shared.peers.insert(node_id, peer.clone());
        }
        let _ = self.inner.channels.peer_added.send(peer);
        Ok(())
    }

    pub async fn remove_peer(&self, node_id: &NodeId) {
        let removed = {
            let mut shared = self.inner.shared.lock().await;
            shared.last_contact_times.remove(node_id);
            shared.reliability.remove(node_id);
            shared.address_to_node.retain(|_, bound| bound != node_id);
            shared.peers.remove(node_id)
        };
        if removed.is_some() {
            let _ = self.inner.channels.peer_removed.send(node_id.clone());
        }
    }

    /// Runs `transport.discoverPeers()` once, handshakes with any address
    /// not yet bound to a NodeId, and drops peers whose only known address
    /// no longer appears in the fresh discovery.
    pub async fn discover_peers(&self) -> Result<()> {
        self.require_active().await?;
        let fresh = self.inner.transport.discover_peers().await?;
        let fresh_addrs: HashSet<TransportAddress> =
            fresh.iter().map(|p| p.address.clone()).collect();

        for transport_peer in &fresh {
            let already_bound = {
                let shared = self.inner.shared.lock().await;
                shared.address_to_node.contains_key(&transport_peer.address)
            };
            if !already_bound {
                if let Err(e) = self.handshake_with(transport_peer.clone()).await {
                    log::debug!("handshake with {} failed: {e}", transport_peer.address);
                }
            }
        }

        let stale: Vec<NodeId> = {
            let shared = self.inner.shared.lock().await;
            shared
                .peers
                .values()
                .filter(|peer| {
                    shared
                        .address_to_node
                        .iter()
                        .filter(|(_, node)| *node == &peer.node_id)
                        .all(|(addr, _)| !fresh_addrs.contains(addr))
                })
                .map(|peer| peer.node_id.clone())
                .collect()
        };
        for node_id in stale {
            self.remove_peer(&node_id).await;
        }
        Ok(())
    }

    // ---- digest exchange -------------------------------------------------

    /// Outbound digest exchange with an already-known peer.
    pub async fn gossip_with(&self, peer: &Peer) -> Result<GossipExchangeResult> {
        self.require_active().await?;
        let transport_peer = {
            let shared = self.inner.shared.lock().await;
            if !shared.peers.contains_key(&peer.node_id) {
                return Err(GossipError::peer(peer.node_id.to_string()));
            }
            TransportPeer::new(peer.address.clone())
        };

        let start = Instant::now();
        let digest = {
            let shared = self.inner.shared.lock().await;
            Digest::new(self.inner.own_node_id.clone(), shared.clock.summary())
        };

        let response = match self
            .inner
            .transport
            .send_digest(&transport_peer, digest, self.inner.config.gossip_timeout())
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(self.fail_exchange(&peer.node_id, start, e).await),
        };

        if response.sender_id != peer.node_id {
            return Ok(self
                .fail_exchange(&peer.node_id, start, GossipError::peer(peer.node_id.to_string()))
                .await);
        }

        let events_exchanged = match self
            .apply_digest_response(&transport_peer, &peer.node_id, response)
            .await
        {
            Ok(n) => n,
            Err(e) => return Ok(self.fail_exchange(&peer.node_id, start, e).await),
        };

        {
            let mut shared = self.inner.shared.lock().await;
            shared.last_contact_times.insert(peer.node_id.clone(), now_ms());
            shared.reliability.record_success(&peer.node_id);
        }
        self.persist_vector_clock().await;

        let result = GossipExchangeResult {
            peer: peer.node_id.clone(),
            success: true,
            events_exchanged,
            duration: start.elapsed(),
            error: None,
        };
        let _ = self.inner.channels.gossip_exchange.send(result.clone());
        Ok(result)
    }

    /// Digest exchange with a transport peer whose NodeId is not yet known.
    /// The resulting `senderId` establishes the NodeId<->address binding. A
    /// conflicting existing binding aborts without modifying state.
    async fn handshake_with(&self, transport_peer: TransportPeer) -> Result<()> {
        let digest = {
            let shared = self.inner.shared.lock().await;
            Digest::new(self.inner.own_node_id.clone(), shared.clock.summary())
        };
        let response = self
            .inner
            .transport
            .send_digest(&transport_peer, digest, self.inner.config.gossip_timeout())
            .await?;
        let sender_id = response.sender_id.clone();
        if sender_id == self.inner.own_node_id {
            return Ok(());
        }

        let mut newly_added = None;
        {
            let mut shared = self.inner.shared.lock().await;
            match shared.address_to_node.get(&transport_peer.address) {
                Some(existing) if existing != &sender_id => return Ok(()),
                _ => {
                    shared
                        .address_to_node
                        .insert(transport_peer.address.clone(), sender_id.clone());
                    if !shared.peers.contains_key(&sender_id) {
                        let peer = Peer::new(sender_id.clone(), transport_peer.address.clone());
                        shared.peers.insert(sender_id.clone(), peer.clone());
                        newly_added = Some(peer);
                    }
                }
            }
        }
        if let Some(peer) = newly_added {
            let _ = self.inner.channels.peer_added.send(peer);
        }

        if let Err(e) = self
            .apply_digest_response(&transport_peer, &sender_id, response)
            .await
        {
            let mut shared = self.inner.shared.lock().await;
            shared.reliability.record_failure(&sender_id);
            return Err(e);
        }

        {
            let mut shared = self.inner.shared.lock().await;
            shared.last_contact_times.insert(sender_id.clone(), now_ms());
            shared.reliability.record_success(&sender_id);
        }
        self.persist_vector_clock().await;
        Ok(())
    }

    /// Processes a `DigestResponse`'s events (merge/store/publish) and
    /// services its `event_requests` (fetch, cap, send). Returns the total
    /// number of events exchanged in both directions. A failure to push our
    /// side of the exchange is propagated rather than swallowed, so the
    /// caller can treat the whole exchange as failed per the gossip
    /// contract's "failures at any step are caught and reported" rule.
    async fn apply_digest_response(
        &self,
        transport_peer: &TransportPeer,
        from_node: &NodeId,
        response: DigestResponse,
    ) -> Result<usize> {
        let mut exchanged = 0usize;
        for event in response.events {
            match self.merge_incoming_event(event.clone()).await {
                Ok(true) => {
                    exchanged += 1;
                    let _ = self.inner.channels.event_received.send(EventReceivedMsg {
                        event,
                        from_peer: from_node.clone(),
                        received_at: now_ms(),
                    });
                }
                Ok(false) => {}
                Err(e) => log::warn!("failed to persist event from {from_node}: {e}"),
            }
        }

        if !response.event_requests.is_empty() {
            match self.build_response_events(&response.event_requests).await {
                Ok(events) if !events.is_empty() => {
                    let count = events.len();
                    let message = EventMessage::new(self.inner.own_node_id.clone(), events);
                    self.inner
                        .transport
                        .send_events(transport_peer, message, self.inner.config.gossip_timeout())
                        .await
                        .map_err(|e| {
                            log::warn!("failed to send events to {from_node}: {e}");
                            e
                        })?;
                    exchanged += count;
                }
                Ok(_) => {}
                Err(e) => log::warn!("failed to build response events for {from_node}: {e}"),
            }
        }
        Ok(exchanged)
    }

    async fn fail_exchange(
        &self,
        peer: &NodeId,
        start: Instant,
        error: GossipError,
    ) -> GossipExchangeResult {
        {
            let mut shared = self.inner.shared.lock().await;
            shared.reliability.record_failure(peer);
        }
        let result = GossipExchangeResult {
            peer: peer.clone(),
            success: false,
            events_exchanged: 0,
            duration: start.elapsed(),
            error: Some(error.to_string()),
        };
        let _ = self.inner.channels.gossip_exchange.send(result.clone());
        result
    }

    /// Fetches events satisfying `requests` (node -> after_ts), orders them
    /// by logical timestamp across all requested nodes, and applies the
    /// count/byte caps. Never splits an event.
    async fn build_response_events(
        &self,
        requests: &HashMap<NodeId, u64>,
    ) -> Result<Vec<Event>> {
        let mut combined = Vec::new();
        for (node, after_ts) in requests {
            let events = self
                .inner
                .event_store
                .events_since(node, *after_ts, Some(self.inner.config.max_events_per_message))
                .await?;
            combined.extend(events);
        }
        Ok(cap_events(
            combined,
            self.inner.config.max_events_per_message,
            self.inner.config.max_message_size_bytes,
        ))
    }

    /// Persists `event` if not already known, merging its timestamp into
    /// the clock. Returns whether it was newly stored. Store errors are
    /// propagated to the caller, which treats them as non-fatal (the event
    /// is simply re-requested on a future exchange).
    async fn merge_incoming_event(&self, event: Event) -> Result<bool> {
        let already_cached = {
            let shared = self.inner.shared.lock().await;
            shared.dedup.as_ref().map(|cache| cache.contains(&event.id)).unwrap_or(false)
        };
        if already_cached || self.inner.event_store.has(&event.id).await? {
            return Ok(false);
        }
        self.inner.event_store.save(event.clone()).await?;
        {
            let mut shared = self.inner.shared.lock().await;
            let mut delta = HashMap::new();
            delta.insert(event.node_id.clone(), event.logical_timestamp);
            shared.clock.merge(&VectorClockSnapshot(delta));
            shared.last_contact_times.insert(event.node_id.clone(), now_ms());
            if let Some(cache) = shared.dedup.as_mut() {
                cache.insert(event.id.clone());
            }
        }
        Ok(true)
    }

    async fn persist_vector_clock(&self) {
        let Some(store) = &self.inner.clock_store else {
            return;
        };
        let snapshot = self.inner.shared.lock().await.clock.summary();
        if let Err(e) = store.save(&self.inner.own_node_id, &snapshot).await {
            log::warn!("failed to persist vector clock: {e}");
        }
    }

    // ---- gossip cycle ------------------------------------------------------

    /// Runs one gossip cycle now: selects peers per the configured
    /// strategy and exchanges with all of them concurrently. A reentrancy
    /// guard drops the call (returning an empty result) if a cycle is
    /// already in progress.
    pub async fn gossip(&self) -> Result<Vec<GossipExchangeResult>> {
        self.require_active().await?;
        if self
            .inner
            .gossip_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(Vec::new());
        }
        let result = self.run_gossip_cycle().await;
        self.inner.gossip_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_gossip_cycle(&self) -> Result<Vec<GossipExchangeResult>> {
        let selected = {
            let mut guard = self.inner.shared.lock().await;
            let shared = &mut *guard;
            let active: Vec<Peer> = shared.peers.values().cloned().collect();
            select_peers(
                self.inner.config.peer_selection_strategy,
                &active,
                self.inner.config.fanout,
                &mut shared.round_robin_cursor,
                &shared.last_contact_times,
                &shared.reliability,
            )
        };
        let exchanges = selected.iter().map(|peer| self.gossip_with(peer));
        let results = futures::future::join_all(exchanges).await;
        Ok(results.into_iter().filter_map(std::result::Result::ok).collect())
    }

    /// Removes clock entries for nodes (other than self) whose last contact
    /// is older than `nodeExpirationAge`, or that were never contacted.
    /// Returns the number removed.
    pub async fn garbage_collect_vector_clock(&self) -> Result<usize> {
        self.require_active().await?;
        let own = self.inner.own_node_id.clone();
        let expiration_ms = self.inner.config.node_expiration_age().as_millis() as u64;
        let now = now_ms();

        let mut removed = 0usize;
        let mut changed = false;
        {
            let mut shared = self.inner.shared.lock().await;
            let stale: Vec<NodeId> = shared
                .clock
                .nodes()
                .filter(|node| **node != own)
                .filter(|node| match shared.last_contact_times.get(*node) {
                    Some(&last) => now.saturating_sub(last) > expiration_ms,
                    None => true,
                })
                .cloned()
                .collect();
            for node in stale {
                if shared.clock.remove_node(&node) {
                    removed += 1;
                    changed = true;
                }
            }
        }
        if changed {
            self.persist_vector_clock().await;
        }
        Ok(removed)
    }

    // ---- incoming message handlers -----------------------------------------

    async fn handle_incoming_digest(&self, incoming: IncomingDigest) {
        let IncomingDigest { from, digest, respond } = incoming;
        let sender_id = digest.sender_id.clone();

        let mut newly_added = None;
        if sender_id != self.inner.own_node_id {
            let mut shared = self.inner.shared.lock().await;
            match shared.address_to_node.get(&from.address) {
                Some(existing) if existing != &sender_id => {}
                _ => {
                    shared
                        .address_to_node
                        .insert(from.address.clone(), sender_id.clone());
                    if !shared.peers.contains_key(&sender_id) {
                        let peer = Peer::new(sender_id.clone(), from.address.clone());
                        shared.peers.insert(sender_id.clone(), peer.clone());
                        newly_added = Some(peer);
                    }
                }
            }
        }
        if let Some(peer) = newly_added {
            let _ = self.inner.channels.peer_added.send(peer);
        }

        let to_send_requests: HashMap<NodeId, u64> = {
            let shared = self.inner.shared.lock().await;
            shared
                .clock
                .nodes()
                .filter_map(|node| {
                    let our_ts = shared.clock.get_unchecked(node);
                    let their_ts = digest.vector_clock.get(node);
                    (our_ts > their_ts).then(|| (node.clone(), their_ts))
                })
                .collect()
        };
        let events = match self.build_response_events(&to_send_requests).await {
            Ok(events) => events,
            Err(e) => {
                log::warn!("failed to assemble digest response: {e}");
                Vec::new()
            }
        };

        let event_requests: HashMap<NodeId, u64> = {
            let shared = self.inner.shared.lock().await;
            digest
                .vector_clock
                .iter()
                .filter(|(node, _)| **node != self.inner.own_node_id)
                .filter_map(|(node, &their_ts)| {
                    let our_ts = shared.clock.get_unchecked(node);
                    (their_ts > our_ts).then(|| (node.clone(), our_ts))
                })
                .collect()
        };

        let response = DigestResponse {
            sender_id: self.inner.own_node_id.clone(),
            events,
            event_requests,
            created_at: now_ms(),
        };
        let _ = respond.send(response);

        self.inner
            .shared
            .lock()
            .await
            .last_contact_times
            .insert(sender_id, now_ms());
    }

    async fn handle_incoming_event_message(&self, incoming: IncomingEventMessage) {
        let IncomingEventMessage { from, message } = incoming;
        let bound_node = {
            let shared = self.inner.shared.lock().await;
            shared.address_to_node.get(&from.address).cloned()
        };
        let Some(bound_node) = bound_node else {
            return; // unknown address; silently dropped
        };
        if message.sender_id != bound_node {
            return; // sender/address mismatch; silently dropped
        }

        for event in message.events {
            match self.merge_incoming_event(event.clone()).await {
                Ok(true) => {
                    let _ = self.inner.channels.event_received.send(EventReceivedMsg {
                        event,
                        from_peer: bound_node.clone(),
                        received_at: now_ms(),
                    });
                }
                Ok(false) => {}
                Err(e) => log::warn!("failed to persist event from {bound_node}: {e}"),
            }
        }
        self.persist_vector_clock().await;
    }

    // ---- background tasks ---------------------------------------------------

    fn spawn_incoming_loops(
        &self,
        mut digest_rx: mpsc::Receiver<IncomingDigest>,
        mut event_rx: mpsc::Receiver<IncomingEventMessage>,
    ) {
        let mut handles = Vec::new();

        let engine = self.clone();
        let token = self.inner.cancellation.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    incoming = digest_rx.recv() => match incoming {
                        Some(incoming) => engine.handle_incoming_digest(incoming).await,
                        None => break,
                    },
                }
            }
        }));

        let engine = self.clone();
        let token = self.inner.cancellation.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    incoming = event_rx.recv() => match incoming {
                        Some(incoming) => engine.handle_incoming_event_message(incoming).await,
                        None => break,
                    },
                }
            }
        }));

        self.inner.incoming_tasks.lock().unwrap().extend(handles);
    }

    fn spawn_timers(&self) {
        let mut handles = Vec::new();

        let engine = self.clone();
        let token = self.inner.cancellation.clone();
        let period = self.inner.config.gossip_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.gossip().await {
                            log::warn!("gossip cycle failed: {e}");
                        }
                    }
                }
            }
        }));

        if self.inner.config.enable_anti_entropy {
            let engine = self.clone();
            let token = self.inner.cancellation.clone();
            let period = self.inner.config.anti_entropy_interval();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if engine.inner.config.enable_vector_clock_gc {
                                if let Err(e) = engine.garbage_collect_vector_clock().await {
                                    log::warn!("vector clock gc failed: {e}");
                                }
                            }
                            if let Err(e) = engine.gossip().await {
                                log::warn!("anti-entropy cycle failed: {e}");
                            }
                        }
                    }
                }
            }));
        }

        let engine = self.clone();
        let token = self.inner.cancellation.clone();
        let period = self.inner.config.peer_discovery_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.discover_peers().await {
                            log::debug!("peer discovery failed: {e}");
                        }
                    }
                }
            }
        }));

        self.inner.timer_tasks.lock().unwrap().extend(handles);
    }

    // ---- subscriptions -------------------------------------------------------

    pub fn subscribe_event_created(&self) -> broadcast::Receiver<Event> {
        self.inner.channels.event_created.subscribe()
    }

    pub fn subscribe_event_received(&self) -> broadcast::Receiver<EventReceivedMsg> {
        self.inner.channels.event_received.subscribe()
    }

    pub fn subscribe_peer_added(&self) -> broadcast::Receiver<Peer> {
        self.inner.channels.peer_added.subscribe()
    }

    pub fn subscribe_peer_removed(&self) -> broadcast::Receiver<NodeId> {
        self.inner.channels.peer_removed.subscribe()
    }

    pub fn subscribe_gossip_exchange(&self) -> broadcast::Receiver<GossipExchangeResult> {
        self.inner.channels.gossip_exchange.subscribe()
    }
}

/// Accumulates `events` (sorted by logical timestamp) while under both the
/// count and byte caps; stops at the first violation rather than splitting
/// an event.
fn cap_events(mut events: Vec<Event>, max_count: usize, max_bytes: usize) -> Vec<Event> {
    events.sort_by_key(|e| e.logical_timestamp);
    let mut capped = Vec::with_capacity(events.len().min(max_count));
    let mut bytes = 0usize;
    for event in events {
        if capped.len() >= max_count {
            break;
        }
        let size = event.estimated_size();
        if bytes + size > max_bytes {
            break;
        }
        bytes += size;
        capped.push(event);
    }
    capped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryEventStore, MemoryVectorClockStore};
    use crate::transport::loopback::{LoopbackNetwork, LoopbackTransport};
    use std::collections::HashMap as Map;

    fn payload(n: i64) -> Map<String, serde_json::Value> {
        let mut m = Map::new();
        m.insert("n".to_string(), serde_json::json!(n));
        m
    }

    async fn make_engine(
        node_id: &str,
        address: &str,
        network: &LoopbackNetwork,
    ) -> GossipEngine {
        let mut config = Config::new(node_id);
        config.gossip_interval_ms = 50;
        config.gossip_timeout_ms = 1000;
        config.enable_anti_entropy = false;
        config.peer_discovery_interval_ms = 60_000;
        config.validate().unwrap();

        let transport = Arc::new(
            LoopbackTransport::new(TransportAddress::new(address).unwrap(), network.clone()).await,
        );
        let event_store = Arc::new(MemoryEventStore::new());
        let clock_store = Arc::new(MemoryVectorClockStore::new());
        GossipEngine::new(config, event_store, transport, Some(clock_store)).unwrap()
    }

    #[tokio::test]
    async fn create_rejects_empty_payload() {
        let network = LoopbackNetwork::new();
        let engine = make_engine("A", "addr-a", &network).await;
        engine.initialize().await.unwrap();
        let result = engine.create(Map::new()).await;
        assert!(matches!(result, Err(GossipError::InvalidEvent(_))));
    }

    #[tokio::test]
    async fn create_before_initialize_fails() {
        let network = LoopbackNetwork::new();
        let engine = make_engine("A", "addr-a", &network).await;
        let result = engine.create(payload(1)).await;
        assert!(matches!(result, Err(GossipError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn two_node_convergence() {
        let network = LoopbackNetwork::new();
        let a = make_engine("A", "addr-a", &network).await;
        let b = make_engine("B", "addr-b", &network).await;
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        a.add_peer(NodeId::new("B").unwrap(), TransportAddress::new("addr-b").unwrap())
            .await
            .unwrap();
        b.add_peer(NodeId::new("A").unwrap(), TransportAddress::new("addr-a").unwrap())
            .await
            .unwrap();

        a.create(payload(1)).await.unwrap();
        a.create(payload(2)).await.unwrap();

        let a_peer_on_b_side = b
            .peers()
            .await
            .into_iter()
            .find(|p| p.node_id == NodeId::new("A").unwrap())
            .unwrap();
        let _ = a_peer_on_b_side;

        let peer_b = a
            .peers()
            .await
            .into_iter()
            .find(|p| p.node_id == NodeId::new("B").unwrap())
            .unwrap();
        a.gossip_with(&peer_b).await.unwrap();

        let b_clock = b.vector_clock().await;
        assert_eq!(b_clock.get(&NodeId::new("A").unwrap()), 2);

        b.create(payload(3)).await.unwrap();
        let peer_a = b
            .peers()
            .await
            .into_iter()
            .find(|p| p.node_id == NodeId::new("A").unwrap())
            .unwrap();
        b.gossip_with(&peer_a).await.unwrap();

        let a_clock = a.vector_clock().await;
        assert_eq!(a_clock.get(&NodeId::new("A").unwrap()), 2);
        assert_eq!(a_clock.get(&NodeId::new("B").unwrap()), 1);
    }

    #[tokio::test]
    async fn duplicate_incoming_event_message_is_idempotent() {
        let network = LoopbackNetwork::new();
        let a = make_engine("A", "addr-a", &network).await;
        a.initialize().await.unwrap();
        a.add_peer(NodeId::new("P").unwrap(), TransportAddress::new("addr-p").unwrap())
            .await
            .unwrap();

        let event = Event::new(NodeId::new("P").unwrap(), 1, payload(1)).unwrap();
        let from = TransportPeer::new(TransportAddress::new("addr-p").unwrap());
        let message = EventMessage::new(NodeId::new("P").unwrap(), vec![event.clone()]);

        let mut received = a.subscribe_event_received();
        a.handle_incoming_event_message(IncomingEventMessage {
            from: from.clone(),
            message: message.clone(),
        })
        .await;
        a.handle_incoming_event_message(IncomingEventMessage { from, message })
            .await;

        assert_eq!(a.inner.event_store.count().await.unwrap(), 1);
        let first = received.try_recv();
        assert!(first.is_ok());
        let second = received.try_recv();
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn sender_mismatch_drops_incoming_events() {
        let network = LoopbackNetwork::new();
        let a = make_engine("A", "addr-a", &network).await;
        a.initialize().await.unwrap();
        a.add_peer(NodeId::new("P").unwrap(), TransportAddress::new("addr-p").unwrap())
            .await
            .unwrap();

        let event = Event::new(NodeId::new("Q").unwrap(), 1, payload(1)).unwrap();
        let from = TransportPeer::new(TransportAddress::new("addr-p").unwrap());
        let message = EventMessage::new(NodeId::new("Q").unwrap(), vec![event]);
        a.handle_incoming_event_message(IncomingEventMessage { from, message })
            .await;

        assert_eq!(a.inner.event_store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn message_cap_limits_events_per_exchange() {
        let network = LoopbackNetwork::new();
        let a = make_engine("A", "addr-a", &network).await;
        let b = make_engine("B", "addr-b", &network).await;
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        {
            let mut shared = a.inner.shared.lock().await;
            drop(shared.reliability.score(&NodeId::new("B").unwrap()));
        }

        a.add_peer(NodeId::new("B").unwrap(), TransportAddress::new("addr-b").unwrap())
            .await
            .unwrap();
        b.add_peer(NodeId::new("A").unwrap(), TransportAddress::new("addr-a").unwrap())
            .await
            .unwrap();

        for i in 0..10 {
            a.create(payload(i)).await.unwrap();
        }

        let peer_b = a
            .peers()
            .await
            .into_iter()
            .find(|p| p.node_id == NodeId::new("B").unwrap())
            .unwrap();
        let result = a.gossip_with(&peer_b).await.unwrap();
        assert!(result.success);
        assert!(b.inner.event_store.count().await.unwrap() <= 10);
    }

    #[tokio::test]
    async fn garbage_collection_removes_stale_entries_but_not_self() {
        let network = LoopbackNetwork::new();
        let engine = make_engine("self", "addr-self", &network).await;
        engine.initialize().await.unwrap();

        {
            let mut shared = engine.inner.shared.lock().await;
            shared.clock.set(NodeId::new("self").unwrap(), 5).unwrap();
            shared.clock.set(NodeId::new("gone").unwrap(), 7).unwrap();
            shared.clock.set(NodeId::new("active").unwrap(), 2).unwrap();
            let now = now_ms();
            shared
                .last_contact_times
                .insert(NodeId::new("gone").unwrap(), now.saturating_sub(10_000));
            shared
                .last_contact_times
                .insert(NodeId::new("active").unwrap(), now);
        }
        let mut config = engine.inner.config.clone();
        config.enable_vector_clock_gc = true;
        config.node_expiration_age_ms = 1_000;
        // Swap in a config with GC enabled via a fresh engine sharing no state
        // is unnecessary here; node_expiration_age is read off inner.config
        // directly, so we reach through the same struct via a second engine
        // would diverge state. Instead exercise the pure logic directly.
        let own = NodeId::new("self").unwrap();
        let now = now_ms();
        let expiration_ms = 1_000u64;
        let removed = {
            let mut shared = engine.inner.shared.lock().await;
            let stale: Vec<NodeId> = shared
                .clock
                .nodes()
                .filter(|n| **n != own)
                .filter(|n| match shared.last_contact_times.get(*n) {
                    Some(&last) => now.saturating_sub(last) > expiration_ms,
                    None => true,
                })
                .cloned()
                .collect();
            let mut removed = 0usize;
            for node in stale {
                if shared.clock.remove_node(&node) {
                    removed += 1;
                }
            }
            removed
        };
        assert_eq!(removed, 1);
        let clock = engine.vector_clock().await;
        assert_eq!(clock.get(&NodeId::new("self").unwrap()), 5);
        assert_eq!(clock.get(&NodeId::new("active").unwrap()), 2);
        assert_eq!(clock.get(&NodeId::new("gone").unwrap()), 0);
    }

    #[test]
    fn cap_events_never_exceeds_count_or_bytes() {
        let events: Vec<Event> = (0..5)
            .map(|i| Event::new(NodeId::new("a").unwrap(), i + 1, payload(i as i64)).unwrap())
            .collect();
        let capped = cap_events(events, 3, 1_000_000);
        assert_eq!(capped.len(), 3);
        assert_eq!(capped[0].logical_timestamp, 1);
    }

    #[tokio::test]
    async fn add_peer_rejects_self() {
        let network = LoopbackNetwork::new();
        let engine = make_engine("A", "addr-a", &network).await;
        engine.initialize().await.unwrap();
        let result = engine
            .add_peer(NodeId::new("A").unwrap(), TransportAddress::new("addr-a").unwrap())
            .await;
        assert!(matches!(result, Err(GossipError::PeerError { .. })));
        assert!(engine.peers().await.is_empty());
    }

    #[tokio::test]
    async fn restart_with_persisted_clock_preserves_causality() {
        let network = LoopbackNetwork::new();
        let config = {
            let mut c = Config::new("X");
            c.gossip_interval_ms = 50;
            c.gossip_timeout_ms = 1000;
            c.enable_anti_entropy = false;
            c.peer_discovery_interval_ms = 60_000;
            c
        };
        let clock_store = Arc::new(MemoryVectorClockStore::new());

        let transport = Arc::new(
            LoopbackTransport::new(TransportAddress::new("addr-x").unwrap(), network.clone())
                .await,
        );
        let engine = GossipEngine::new(
            config.clone(),
            Arc::new(MemoryEventStore::new()),
            transport,
            Some(clock_store.clone()),
        )
        .unwrap();
        engine.initialize().await.unwrap();
        engine.create(payload(1)).await.unwrap();
        engine.shutdown().await.unwrap();

        // Simulate a restart with the same clock store but a fresh event
        // store (as if the log were lost): the next created event must not
        // repeat logical timestamp 1.
        let transport2 = Arc::new(
            LoopbackTransport::new(TransportAddress::new("addr-x-2").unwrap(), network.clone())
                .await,
        );
        let restarted = GossipEngine::new(
            config,
            Arc::new(MemoryEventStore::new()),
            transport2,
            Some(clock_store),
        )
        .unwrap();
        restarted.initialize().await.unwrap();
        let event = restarted.create(payload(2)).await.unwrap();
        assert_eq!(event.logical_timestamp, 2);
    }

    #[tokio::test]
    async fn incoming_digest_from_unbound_address_creates_peer() {
        let network = LoopbackNetwork::new();
        let a = make_engine("A", "addr-a", &network).await;
        a.initialize().await.unwrap();

        let mut peer_added = a.subscribe_peer_added();
        let (respond_tx, respond_rx) = tokio::sync::oneshot::channel();
        let from = TransportPeer::new(TransportAddress::new("addr-p").unwrap());
        let digest = Digest::new(NodeId::new("P").unwrap(), VectorClockSnapshot::default());
        a.handle_incoming_digest(IncomingDigest {
            from,
            digest,
            respond: respond_tx,
        })
        .await;

        let added = peer_added.try_recv().unwrap();
        assert_eq!(added.node_id, NodeId::new("P").unwrap());
        let response = respond_rx.await.unwrap();
        assert_eq!(response.sender_id, NodeId::new("A").unwrap());
    }
}
