//! Wires two in-process `GossipEngine`s over the loopback transport and
//! drives a few manual gossip cycles so the convergence behavior can be
//! observed on stdout. Not a product surface — a demonstration binary, the
//! equivalent of this codebase's original standalone server entry point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use gossip_sync::store::{MemoryEventStore, MemoryVectorClockStore};
use gossip_sync::transport::loopback::{LoopbackNetwork, LoopbackTransport};
use gossip_sync::{Config, GossipEngine, NodeId, TransportAddress};

/// Run a small two-node gossip demo in-process.
#[derive(Parser, Debug)]
struct Args {
    /// Number of events node "A" creates before the first exchange.
    #[arg(long, default_value_t = 3)]
    events: u64,

    /// Gossip cycle period, in milliseconds.
    #[arg(long, default_value_t = 200)]
    interval_ms: u64,
}

async fn make_node(
    node_id: &str,
    address: &str,
    interval_ms: u64,
    network: &LoopbackNetwork,
) -> Result<GossipEngine> {
    let mut config = Config::new(node_id);
    config.gossip_interval_ms = interval_ms;
    config.gossip_timeout_ms = interval_ms * 20;
    config.peer_discovery_interval_ms = interval_ms * 5;
    config.validate()?;

    let transport = Arc::new(
        LoopbackTransport::new(TransportAddress::new(address)?, network.clone()).await,
    );
    let event_store = Arc::new(MemoryEventStore::new());
    let clock_store = Arc::new(MemoryVectorClockStore::new());
    let engine = GossipEngine::new(config, event_store, transport, Some(clock_store))?;
    engine.initialize().await?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let network = LoopbackNetwork::new();
    let node_a = make_node("A", "addr-a", args.interval_ms, &network).await?;
    let node_b = make_node("B", "addr-b", args.interval_ms, &network).await?;

    node_a
        .add_peer(NodeId::new("B")?, TransportAddress::new("addr-b")?)
        .await?;
    node_b
        .add_peer(NodeId::new("A")?, TransportAddress::new("addr-a")?)
        .await?;

    let mut received_on_b = node_b.subscribe_event_received();

    for i in 0..args.events {
        let mut payload = HashMap::new();
        payload.insert("n".to_string(), serde_json::json!(i));
        let event = node_a.create(payload).await?;
        log::info!("A created event {} at logical ts {}", event.id, event.logical_timestamp);
    }

    node_a.start_gossiping().await?;
    node_b.start_gossiping().await?;

    tokio::time::sleep(Duration::from_millis(args.interval_ms * 10)).await;

    while let Ok(msg) = received_on_b.try_recv() {
        log::info!(
            "B learned event {} from {} (logical ts {})",
            msg.event.id,
            msg.from_peer,
            msg.event.logical_timestamp
        );
    }

    println!("A's vector clock: {:?}", node_a.vector_clock().await);
    println!("B's vector clock: {:?}", node_b.vector_clock().await);
    println!("B's known peers: {}", node_b.peers().await.len());

    node_a.shutdown().await?;
    node_b.shutdown().await?;
    Ok(())
}
