// src/core/topics.rs

//! Topic pub/sub: pure fan-out to local subscribers. Peer publishes arrive
//! over the cluster bus and are delivered locally only, never re-forwarded,
//! which is what prevents loops.

use dashmap::DashMap;
use std::collections::HashSet;

/// Tracks which local sessions subscribe to which topics.
#[derive(Debug, Default)]
pub struct TopicManager {
    subscribers: DashMap<String, HashSet<u64>>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, session_id: u64) {
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .insert(session_id);
    }

    pub fn unsubscribe(&self, topic: &str, session_id: u64) {
        if let Some(mut sessions) = self.subscribers.get_mut(topic) {
            sessions.remove(&session_id);
        }
    }

    /// Session-close cleanup.
    pub fn unsubscribe_all(&self, session_id: u64) {
        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().remove(&session_id);
        }
        self.subscribers.retain(|_, sessions| !sessions.is_empty());
    }

    pub fn local_subscribers(&self, topic: &str) -> Vec<u64> {
        self.subscribers
            .get(topic)
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default()
    }
}

