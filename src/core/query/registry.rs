// src/core/query/registry.rs

//! Live query subscriptions and incremental delivery.
//!
//! Every successful apply-to-map calls [`QueryRegistry::process_change`],
//! which re-evaluates affected subscriptions on the changed key only and
//! emits ADDED/UPDATED/REMOVED deltas relative to each subscription's
//! previous-result-key set. No write ever triggers a rescan.

use super::{Query, QueryRow};
use crate::core::crdt::Timestamp;
use crate::core::protocol::{DeltaKind, ServerMessage};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// One live subscription.
#[derive(Debug)]
pub struct Subscription {
    pub query_id: String,
    pub session_id: u64,
    pub map: String,
    pub query: Query,
    /// Keys in the last delivered result set.
    prev_keys: RwLock<HashSet<String>>,
}

/// Registry of live subscriptions, indexed by query id and by map name.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    subscriptions: DashMap<String, Arc<Subscription>>,
    by_map: DashMap<String, HashSet<String>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription, seeded with the snapshot's result keys.
    pub fn register(
        &self,
        query_id: String,
        session_id: u64,
        map: String,
        query: Query,
        seed_keys: impl IntoIterator<Item = String>,
    ) {
        let subscription = Arc::new(Subscription {
            query_id: query_id.clone(),
            session_id,
            map: map.clone(),
            query,
            prev_keys: RwLock::new(seed_keys.into_iter().collect()),
        });
        self.subscriptions.insert(query_id.clone(), subscription);
        self.by_map.entry(map).or_default().insert(query_id);
    }

    pub fn unregister(&self, query_id: &str) -> bool {
        let Some((_, subscription)) = self.subscriptions.remove(query_id) else {
            return false;
        };
        if let Some(mut ids) = self.by_map.get_mut(&subscription.map) {
            ids.remove(query_id);
        }
        true
    }

    /// Drops every subscription owned by `session_id` (session close path).
    pub fn unregister_session(&self, session_id: u64) -> usize {
        let doomed: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| e.key().clone())
            .collect();
        for query_id in &doomed {
            self.unregister(query_id);
        }
        doomed.len()
    }

    /// Session ids with at least one subscription on `map`. Drives the
    /// broadcast router's subscription filter.
    pub fn sessions_subscribed_to(&self, map: &str) -> HashSet<u64> {
        let Some(ids) = self.by_map.get(map) else {
            return HashSet::new();
        };
        ids.iter()
            .filter_map(|query_id| self.subscriptions.get(query_id))
            .map(|s| s.session_id)
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Re-evaluates subscriptions on `map` for the changed `key`.
    ///
    /// `current` is the key's visible value after the apply (`None` when the
    /// key is now absent). Returns the per-session delta frames to route.
    pub fn process_change(
        &self,
        map: &str,
        key: &str,
        current: Option<&Value>,
        timestamp: &Timestamp,
    ) -> Vec<(u64, ServerMessage)> {
        let Some(ids) = self.by_map.get(map).map(|ids| ids.value().clone()) else {
            return Vec::new();
        };
        let mut deltas = Vec::new();
        for query_id in ids {
            let Some(subscription) = self.subscriptions.get(&query_id) else {
                continue;
            };
            let matches_now = current
                .map(|value| subscription.query.matches(key, value))
                .unwrap_or(false);
            let was_in_results = subscription.prev_keys.read().contains(key);
            let delta = match (was_in_results, matches_now) {
                (false, true) => {
                    subscription.prev_keys.write().insert(key.to_string());
                    DeltaKind::Added
                }
                (true, true) => DeltaKind::Updated,
                (true, false) => {
                    subscription.prev_keys.write().remove(key);
                    DeltaKind::Removed
                }
                (false, false) => continue,
            };
            let row = QueryRow {
                key: key.to_string(),
                value: current.cloned().unwrap_or(Value::Null),
                timestamp: timestamp.clone(),
            };
            deltas.push((
                subscription.session_id,
                ServerMessage::QueryDelta {
                    query_id: query_id.clone(),
                    delta,
                    row,
                },
            ));
        }
        deltas
    }
}

