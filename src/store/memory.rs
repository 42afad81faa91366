//! # In-Memory Reference Stores
//!
//! `MemoryEventStore` and `MemoryVectorClockStore` back the event and
//! vector-clock contracts with a `tokio::sync::RwLock<HashMap<..>>` —
//! multiple concurrent readers, one writer at a time, same shape as this
//! codebase's thread-safe in-memory engine, adapted to the engine's async
//! executor instead of OS threads. Not persistent: all data is lost when
//! the process terminates.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::{Event, NodeId};
use crate::vector_clock::VectorClockSnapshot;

use super::clock_store::VectorClockStoreContract;
use super::event_store::{EventStats, EventStoreContract};

#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<HashMap<String, Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventStoreContract for MemoryEventStore {
    async fn save(&self, event: Event) -> Result<()> {
        let mut events = self.events.write().await;
        events.entry(event.id.clone()).or_insert(event);
        Ok(())
    }

    async fn save_batch(&self, batch: Vec<Event>) -> Result<()> {
        let mut events = self.events.write().await;
        for event in batch {
            events.entry(event.id.clone()).or_insert(event);
        }
        Ok(())
    }

    async fn events_since(
        &self,
        node: &NodeId,
        after_ts: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        let mut matching: Vec<Event> = events
            .values()
            .filter(|e| &e.node_id == node && e.logical_timestamp > after_ts)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.logical_timestamp);
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn get(&self, id: &str) -> Result<Option<Event>> {
        Ok(self.events.read().await.get(id).cloned())
    }

    async fn has(&self, id: &str) -> Result<bool> {
        Ok(self.events.read().await.contains_key(id))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.events.read().await.len() as u64)
    }

    async fn count_for_node(&self, node: &NodeId) -> Result<u64> {
        let events = self.events.read().await;
        Ok(events.values().filter(|e| &e.node_id == node).count() as u64)
    }

    async fn latest_timestamp(&self, node: &NodeId) -> Result<u64> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .filter(|e| &e.node_id == node)
            .map(|e| e.logical_timestamp)
            .max()
            .unwrap_or(0))
    }

    async fn latest_timestamps_for_all_nodes(&self) -> Result<HashMap<NodeId, u64>> {
        let events = self.events.read().await;
        let mut out: HashMap<NodeId, u64> = HashMap::new();
        for event in events.values() {
            let entry = out.entry(event.node_id.clone()).or_insert(0);
            if event.logical_timestamp > *entry {
                *entry = event.logical_timestamp;
            }
        }
        Ok(out)
    }

    async fn events_in_range(
        &self,
        start_ts: u64,
        end_ts: u64,
        node: Option<&NodeId>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        let mut matching: Vec<Event> = events
            .values()
            .filter(|e| {
                e.logical_timestamp >= start_ts
                    && e.logical_timestamp <= end_ts
                    && node.map_or(true, |n| &e.node_id == n)
            })
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.logical_timestamp);
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn remove_older_than(&self, creation_ts: u64) -> Result<u64> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|_, e| e.creation_timestamp >= creation_ts);
        Ok((before - events.len()) as u64)
    }

    async fn remove_for_node(&self, node: &NodeId) -> Result<u64> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|_, e| &e.node_id != node);
        Ok((before - events.len()) as u64)
    }

    async fn clear(&self) -> Result<()> {
        self.events.write().await.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<EventStats> {
        let events = self.events.read().await;
        let nodes: std::collections::HashSet<&NodeId> =
            events.values().map(|e| &e.node_id).collect();
        Ok(EventStats {
            total_events: events.len() as u64,
            nodes_represented: nodes.len() as u64,
        })
    }
}

#[derive(Default)]
pub struct MemoryVectorClockStore {
    clocks: RwLock<HashMap<NodeId, VectorClockSnapshot>>,
}

impl MemoryVectorClockStore {
    pub fn new() -> Self {
        Self {
            clocks: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorClockStoreContract for MemoryVectorClockStore {
    async fn save(&self, node: &NodeId, clock: &VectorClockSnapshot) -> Result<()> {
        self.clocks
            .write()
            .await
            .insert(node.clone(), clock.clone());
        Ok(())
    }

    async fn load(&self, node: &NodeId) -> Result<Option<VectorClockSnapshot>> {
        Ok(self.clocks.read().await.get(node).cloned())
    }

    async fn has(&self, node: &NodeId) -> Result<bool> {
        Ok(self.clocks.read().await.contains_key(node))
    }

    async fn delete(&self, node: &NodeId) -> Result<bool> {
        Ok(self.clocks.write().await.remove(node).is_some())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn payload() -> Map<String, serde_json::Value> {
        let mut m = Map::new();
        m.insert("n".to_string(), serde_json::json!(1));
        m
    }

    #[tokio::test]
    async fn save_is_idempotent_on_id() {
        let store = MemoryEventStore::new();
        let event = Event::new(node("a"), 1, payload()).unwrap();
        store.save(event.clone()).await.unwrap();
        store.save(event.clone()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn events_since_orders_ascending_and_respects_limit() {
        let store = MemoryEventStore::new();
        for ts in [3u64, 1, 2] {
            let mut event = Event::new(node("a"), ts, payload()).unwrap();
            event.logical_timestamp = ts;
            store.save(event).await.unwrap();
        }
        let events = store.events_since(&node("a"), 0, Some(2)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].logical_timestamp, 1);
        assert_eq!(events[1].logical_timestamp, 2);
    }

    #[tokio::test]
    async fn latest_timestamp_is_zero_when_absent() {
        let store = MemoryEventStore::new();
        assert_eq!(store.latest_timestamp(&node("a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clock_store_roundtrips() {
        let store = MemoryVectorClockStore::new();
        let node_a = node("a");
        assert!(store.load(&node_a).await.unwrap().is_none());

        let mut snapshot = Map::new();
        snapshot.insert(node_a.clone(), 3u64);
        let snapshot = VectorClockSnapshot(snapshot);
        store.save(&node_a, &snapshot).await.unwrap();

        let loaded = store.load(&node_a).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(store.delete(&node_a).await.unwrap());
        assert!(store.load(&node_a).await.unwrap().is_none());
    }
}
