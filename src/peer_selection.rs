//! # Peer Selection Strategies
//!
//! The four fanout strategies the gossip cycle driver uses to pick
//! `min(fanout, activePeers.len())` peers each cycle.

use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::config::PeerSelectionStrategy;
use crate::model::{NodeId, Peer};
use crate::reliability::ReliabilityTracker;

/// Stateful cursor for `RoundRobin`, held by the engine across cycles.
#[derive(Debug, Default)]
pub struct RoundRobinCursor(usize);

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self(0)
    }

    fn advance(&mut self, by: usize, modulo: usize) {
        if modulo > 0 {
            self.0 = (self.0 + by) % modulo;
        } else {
            self.0 = 0;
        }
    }
}

/// Picks up to `fanout` peers from `active` per `strategy`. `active` must
/// already exclude inactive peers and self.
pub fn select_peers(
    strategy: PeerSelectionStrategy,
    active: &[Peer],
    fanout: usize,
    cursor: &mut RoundRobinCursor,
    last_contact_times: &HashMap<NodeId, u64>,
    reliability: &ReliabilityTracker,
) -> Vec<Peer> {
    let count = fanout.min(active.len());
    if count == 0 {
        return Vec::new();
    }

    match strategy {
        PeerSelectionStrategy::Random => {
            let mut rng = rand::thread_rng();
            let mut pool: Vec<Peer> = active.to_vec();
            pool.shuffle(&mut rng);
            pool.truncate(count);
            pool
        }
        PeerSelectionStrategy::RoundRobin => {
            let len = active.len();
            let mut selected = Vec::with_capacity(count);
            for i in 0..count {
                selected.push(active[(cursor.0 + i) % len].clone());
            }
            cursor.advance(count, len);
            selected
        }
        PeerSelectionStrategy::LeastRecentlyContacted => {
            let mut pool: Vec<Peer> = active.to_vec();
            pool.sort_by_key(|p| last_contact_times.get(&p.node_id).copied().unwrap_or(0));
            pool.truncate(count);
            pool
        }
        PeerSelectionStrategy::MostReliable => {
            let mut pool: Vec<Peer> = active.to_vec();
            pool.sort_by(|a, b| {
                reliability
                    .score(&b.node_id)
                    .cmp(&reliability.score(&a.node_id))
            });
            pool.truncate(count);
            pool
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransportAddress;

    fn peer(id: &str) -> Peer {
        Peer::new(
            NodeId::new(id).unwrap(),
            TransportAddress::new(format!("{id}-addr")).unwrap(),
        )
    }

    #[test]
    fn selects_at_most_fanout_peers() {
        let peers = vec![peer("a"), peer("b"), peer("c")];
        let mut cursor = RoundRobinCursor::new();
        let tracker = ReliabilityTracker::new();
        let selected = select_peers(
            PeerSelectionStrategy::Random,
            &peers,
            2,
            &mut cursor,
            &HashMap::new(),
            &tracker,
        );
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn round_robin_advances_cursor_without_repeats_within_cycle() {
        let peers = vec![peer("a"), peer("b"), peer("c"), peer("d")];
        let mut cursor = RoundRobinCursor::new();
        let tracker = ReliabilityTracker::new();

        let first = select_peers(
            PeerSelectionStrategy::RoundRobin,
            &peers,
            2,
            &mut cursor,
            &HashMap::new(),
            &tracker,
        );
        assert_eq!(
            first.iter().map(|p| p.node_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let second = select_peers(
            PeerSelectionStrategy::RoundRobin,
            &peers,
            2,
            &mut cursor,
            &HashMap::new(),
            &tracker,
        );
        assert_eq!(
            second.iter().map(|p| p.node_id.as_str()).collect::<Vec<_>>(),
            vec!["c", "d"]
        );
    }

    #[test]
    fn least_recently_contacted_prefers_epoch_for_unknown() {
        let peers = vec![peer("a"), peer("b")];
        let mut last_contact = HashMap::new();
        last_contact.insert(NodeId::new("a").unwrap(), 1_000u64);
        let mut cursor = RoundRobinCursor::new();
        let tracker = ReliabilityTracker::new();
        let selected = select_peers(
            PeerSelectionStrategy::LeastRecentlyContacted,
            &peers,
            1,
            &mut cursor,
            &last_contact,
            &tracker,
        );
        assert_eq!(selected[0].node_id.as_str(), "b");
    }

    #[test]
    fn most_reliable_orders_by_score_descending() {
        let peers = vec![peer("a"), peer("b")];
        let mut tracker = ReliabilityTracker::new();
        tracker.record_failure(&NodeId::new("a").unwrap());
        let mut cursor = RoundRobinCursor::new();
        let selected = select_peers(
            PeerSelectionStrategy::MostReliable,
            &peers,
            1,
            &mut cursor,
            &HashMap::new(),
            &tracker,
        );
        assert_eq!(selected[0].node_id.as_str(), "b");
    }
}
