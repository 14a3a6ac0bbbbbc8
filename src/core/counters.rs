// src/core/counters.rs

//! Distributed counters: one slot per node, each node the sole writer of its
//! own slot, merged by sum. Slot exchange rides the normal cluster event
//! path, so counter convergence needs no coordination.

use dashmap::DashMap;
use std::collections::HashSet;

/// Per-node slot state for every named counter, plus update subscribers.
#[derive(Debug, Default)]
pub struct CounterManager {
    slots: DashMap<String, DashMap<String, i64>>,
    subscribers: DashMap<String, HashSet<u64>>,
}

impl CounterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a delta to `node`'s slot and returns the merged value.
    pub fn apply_delta(&self, name: &str, node: &str, delta: i64) -> i64 {
        let counter = self.slots.entry(name.to_string()).or_default();
        *counter.entry(node.to_string()).or_insert(0) += delta;
        counter.iter().map(|e| *e.value()).sum()
    }

    /// Replaces `node`'s slot with its authoritative value (the node is the
    /// sole writer of its own slot). Returns the merged value.
    pub fn merge_slot(&self, name: &str, node: &str, value: i64) -> i64 {
        let counter = self.slots.entry(name.to_string()).or_default();
        counter.insert(node.to_string(), value);
        counter.iter().map(|e| *e.value()).sum()
    }

    /// The merged value across all node slots.
    pub fn value(&self, name: &str) -> i64 {
        self.slots
            .get(name)
            .map(|counter| counter.iter().map(|e| *e.value()).sum())
            .unwrap_or(0)
    }

    /// This node's own slot value, for gossiping to peers.
    pub fn local_slot(&self, name: &str, node: &str) -> i64 {
        self.slots
            .get(name)
            .and_then(|counter| counter.get(node).map(|v| *v.value()))
            .unwrap_or(0)
    }

    pub fn subscribe(&self, name: &str, session_id: u64) {
        self.subscribers
            .entry(name.to_string())
            .or_default()
            .insert(session_id);
    }

    pub fn subscribers(&self, name: &str) -> Vec<u64> {
        self.subscribers
            .get(name)
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Session-close cleanup.
    pub fn unsubscribe_all(&self, session_id: u64) {
        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().remove(&session_id);
        }
        self.subscribers.retain(|_, sessions| !sessions.is_empty());
    }
}

