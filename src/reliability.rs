//! # Reliability Accounting
//!
//! Per-peer heuristic in `[0, 100]`, seeded at 100 on first contact,
//! nudged up on successful exchanges and down on failures. Feeds the
//! `MostReliable` peer-selection strategy.

use std::collections::HashMap;

use crate::model::NodeId;

const INITIAL_SCORE: i32 = 100;
const SUCCESS_DELTA: i32 = 1;
const FAILURE_DELTA: i32 = -5;
const MIN_SCORE: i32 = 0;
const MAX_SCORE: i32 = 100;

/// Tracks a reliability score per `NodeId`. Entries are created lazily on
/// first `record_success`/`record_failure` and dropped when a peer is
/// removed from the engine.
#[derive(Debug, Clone, Default)]
pub struct ReliabilityTracker {
    scores: HashMap<NodeId, i32>,
}

impl ReliabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, node: &NodeId) -> i32 {
        self.scores.get(node).copied().unwrap_or(INITIAL_SCORE)
    }

    pub fn record_success(&mut self, node: &NodeId) -> i32 {
        let current = self.score(node);
        let next = (current + SUCCESS_DELTA).clamp(MIN_SCORE, MAX_SCORE);
        self.scores.insert(node.clone(), next);
        next
    }

    pub fn record_failure(&mut self, node: &NodeId) -> i32 {
        let current = self.score(node);
        let next = (current + FAILURE_DELTA).clamp(MIN_SCORE, MAX_SCORE);
        self.scores.insert(node.clone(), next);
        next
    }

    pub fn remove(&mut self, node: &NodeId) {
        self.scores.remove(node);
    }
}
