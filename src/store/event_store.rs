//! # Event Store Contract
//!
//! Persistence interface for the append-only event log. Implementations may
//! be in-memory or backed by a file/database; the engine only relies on the
//! semantics documented on each method, never on a specific backend.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Event, NodeId};

/// Aggregate counters a backend can report cheaply, used for diagnostics
/// and the demo binary's status output.
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub nodes_represented: u64,
}

/// Semantic contract for event persistence. All methods may fail with
/// `GossipError::StoreError`.
///
/// The store exposes events in a total order by `logical_timestamp` per
/// node; across nodes no order is promised beyond what the caller provides.
#[async_trait]
pub trait EventStoreContract: Send + Sync {
    /// Idempotent on `event.id`: saving an id that already exists is a
    /// silent no-op, never an error.
    async fn save(&self, event: Event) -> Result<()>;

    /// Semantically equivalent to saving each event; implementations may
    /// make this atomic.
    async fn save_batch(&self, events: Vec<Event>) -> Result<()>;

    /// Events with `node_id == node` and `logical_timestamp > after_ts`,
    /// ascending by `logical_timestamp`, truncated to `limit` if given.
    /// `after_ts == 0` returns from the beginning.
    async fn events_since(
        &self,
        node: &NodeId,
        after_ts: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>>;

    async fn get(&self, id: &str) -> Result<Option<Event>>;
    async fn has(&self, id: &str) -> Result<bool>;
    async fn count(&self) -> Result<u64>;
    async fn count_for_node(&self, node: &NodeId) -> Result<u64>;

    /// 0 if no event from `node` has been saved.
    async fn latest_timestamp(&self, node: &NodeId) -> Result<u64>;
    async fn latest_timestamps_for_all_nodes(&self) -> Result<std::collections::HashMap<NodeId, u64>>;

    /// Events with `logical_timestamp` in `[start_ts, end_ts]`, optionally
    /// restricted to one node, truncated to `limit`.
    async fn events_in_range(
        &self,
        start_ts: u64,
        end_ts: u64,
        node: Option<&NodeId>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>>;

    async fn remove_older_than(&self, creation_ts: u64) -> Result<u64>;
    async fn remove_for_node(&self, node: &NodeId) -> Result<u64>;
    async fn clear(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn stats(&self) -> Result<EventStats>;
}
