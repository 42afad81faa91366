//! # Vector Clock
//!
//! Per-node logical timestamps used to stamp locally created events and to
//! summarize a node's knowledge of the whole system during a digest
//! exchange. A missing key reads as 0; the clock never shrinks except
//! through an explicit `remove_node` or garbage collection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{GossipError, Result};
use crate::model::NodeId;

/// The result of comparing two vector clocks under the partial order they
/// induce (happens-before).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

/// A read-only snapshot of a `VectorClock`, suitable for transmission in a
/// `Digest`. Serializes as a plain `{nodeId: integer}` mapping; an absent
/// key is implicitly 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClockSnapshot(pub HashMap<NodeId, u64>);

impl VectorClockSnapshot {
    pub fn get(&self, node: &NodeId) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.0.iter()
    }
}

/// Mapping from `NodeId` to non-negative logical timestamp.
#[derive(Debug, Clone, Default)]
pub struct VectorClock {
    entries: HashMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Build a clock from a deserialized snapshot. Rejects negative values
    /// at the deserialization boundary (the snapshot's `u64` type already
    /// makes negative values unrepresentable; this constructor exists so a
    /// future i64-based wire type can still route through one validation
    /// point).
    pub fn from_snapshot(snapshot: VectorClockSnapshot) -> Self {
        Self {
            entries: snapshot.0,
        }
    }

    /// Returns 0 if `node` is absent. Fails if `node` is empty.
    pub fn get(&self, node: &NodeId) -> Result<u64> {
        if node.as_str().is_empty() {
            return Err(GossipError::VectorClockError(
                "node id must not be empty".into(),
            ));
        }
        Ok(self.entries.get(node).copied().unwrap_or(0))
    }

    /// Infallible read used internally once a `NodeId` is already known to
    /// be valid (it was constructed via `NodeId::new`, which validates).
    pub fn get_unchecked(&self, node: &NodeId) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Sets `node`'s entry. Fails if `node` is empty or `ts` would imply a
    /// negative value — `ts` is already unsigned, so this only guards the
    /// empty-node-id invariant.
    pub fn set(&mut self, node: NodeId, ts: u64) -> Result<()> {
        if node.as_str().is_empty() {
            return Err(GossipError::VectorClockError(
                "node id must not be empty".into(),
            ));
        }
        self.entries.insert(node, ts);
        Ok(())
    }

    /// Atomically sets `node`'s entry to `get(node) + 1` and returns the
    /// new value.
    pub fn increment(&mut self, node: &NodeId) -> Result<u64> {
        let next = self.get(node)? + 1;
        self.entries.insert(node.clone(), next);
        Ok(next)
    }

    /// Per-key max merge. Associative, commutative, idempotent.
    pub fn merge(&mut self, other: &VectorClockSnapshot) {
        for (node, &ts) in other.iter() {
            let current = self.entries.get(node).copied().unwrap_or(0);
            if ts > current {
                self.entries.insert(node.clone(), ts);
            }
        }
    }

    /// Compares this clock against `other`'s summary over the union of
    /// their keys.
    pub fn compare(&self, other: &VectorClockSnapshot) -> ClockOrdering {
        let mut keys: std::collections::HashSet<&NodeId> = self.entries.keys().collect();
        keys.extend(other.0.keys());

        let mut self_lte = true;
        let mut other_lte = true;
        for key in keys {
            let mine = self.entries.get(key).copied().unwrap_or(0);
            let theirs = other.get(key);
            if mine > theirs {
                other_lte = false;
            }
            if theirs > mine {
                self_lte = false;
            }
        }

        match (self_lte, other_lte) {
            (true, true) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Concurrent,
        }
    }

    /// Removes `node`'s entry, returning whether it existed.
    pub fn remove_node(&mut self, node: &NodeId) -> bool {
        self.entries.remove(node).is_some()
    }

    /// A read-only snapshot suitable for transmission.
    pub fn summary(&self) -> VectorClockSnapshot {
        VectorClockSnapshot(self.entries.clone())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.entries.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn missing_key_reads_as_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.get(&node("a")).unwrap(), 0);
    }

    #[test]
    fn increment_is_monotonic() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.increment(&node("a")).unwrap(), 1);
        assert_eq!(clock.increment(&node("a")).unwrap(), 2);
        assert_eq!(clock.get(&node("a")).unwrap(), 2);
    }

    #[test]
    fn merge_is_per_key_max() {
        let mut a = VectorClock::new();
        a.set(node("x"), 5).unwrap();
        a.set(node("y"), 1).unwrap();

        let mut b_snapshot = HashMap::new();
        b_snapshot.insert(node("x"), 2);
        b_snapshot.insert(node("y"), 9);
        b_snapshot.insert(node("z"), 3);
        let b = VectorClockSnapshot(b_snapshot);

        a.merge(&b);
        assert_eq!(a.get(&node("x")).unwrap(), 5);
        assert_eq!(a.get(&node("y")).unwrap(), 9);
        assert_eq!(a.get(&node("z")).unwrap(), 3);
    }

    #[test]
    fn merge_is_associative_commutative_idempotent() {
        let mut a1 = VectorClock::new();
        a1.set(node("x"), 3).unwrap();
        let mut snap_b = HashMap::new();
        snap_b.insert(node("x"), 7);
        snap_b.insert(node("y"), 2);
        let b = VectorClockSnapshot(snap_b);
        let mut snap_c = HashMap::new();
        snap_c.insert(node("y"), 5);
        snap_c.insert(node("z"), 1);
        let c = VectorClockSnapshot(snap_c);

        // (a merge b) merge c
        let mut left = a1.clone();
        left.merge(&b);
        left.merge(&c);

        // a merge (b merge c) -- simulate by merging c into b's clock first
        let mut bc = VectorClock::from_snapshot(b.clone());
        bc.merge(&c);
        let mut right = a1.clone();
        right.merge(&bc.summary());

        assert_eq!(left.summary().0, right.summary().0);

        // idempotent
        let mut idem = a1.clone();
        idem.merge(&b);
        let once = idem.summary();
        idem.merge(&b);
        assert_eq!(idem.summary().0, once.0);
    }

    #[test]
    fn compare_partitions_exactly_one_relation() {
        let mut a = VectorClock::new();
        a.set(node("x"), 1).unwrap();

        let equal = a.summary();
        assert_eq!(a.compare(&equal), ClockOrdering::Equal);

        let mut before_snap = HashMap::new();
        before_snap.insert(node("x"), 2);
        assert_eq!(
            a.compare(&VectorClockSnapshot(before_snap)),
            ClockOrdering::Before
        );

        let mut after_snap = HashMap::new();
        after_snap.insert(node("x"), 0);
        assert_eq!(
            a.compare(&VectorClockSnapshot(after_snap)),
            ClockOrdering::After
        );

        let mut a2 = VectorClock::new();
        a2.set(node("x"), 2).unwrap();
        a2.set(node("y"), 0).unwrap();
        let mut concurrent_snap = HashMap::new();
        concurrent_snap.insert(node("x"), 1);
        concurrent_snap.insert(node("y"), 5);
        assert_eq!(
            a2.compare(&VectorClockSnapshot(concurrent_snap)),
            ClockOrdering::Concurrent
        );
    }

    #[test]
    fn remove_node_reports_prior_existence() {
        let mut clock = VectorClock::new();
        assert!(!clock.remove_node(&node("a")));
        clock.set(node("a"), 4).unwrap();
        assert!(clock.remove_node(&node("a")));
        assert_eq!(clock.get(&node("a")).unwrap(), 0);
    }

    #[test]
    fn empty_node_id_is_rejected() {
        let mut clock = VectorClock::new();
        let empty = NodeId::new_unchecked("");
        assert!(clock.get(&empty).is_err());
        assert!(clock.set(empty.clone(), 1).is_err());
        assert!(clock.increment(&empty).is_err());
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let mut clock = VectorClock::new();
        clock.set(node("a"), 3).unwrap();
        clock.set(node("b"), 0).unwrap();
        let snapshot = clock.summary();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: VectorClockSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot, parsed);
    }
}
