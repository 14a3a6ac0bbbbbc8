// src/core/crdt/lww.rs

//! Last-writer-wins map: one record per key, survivor chosen by greater HLC.
//! A `null` value marks a tombstone.

use super::hlc::Timestamp;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single LWW record: value plus HLC timestamp plus optional TTL in millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwRecord {
    pub value: Value,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl_ms: Option<u64>,
}

impl LwwRecord {
    pub fn new(value: Value, timestamp: Timestamp) -> Self {
        Self {
            value,
            timestamp,
            ttl_ms: None,
        }
    }

    pub fn with_ttl(value: Value, timestamp: Timestamp, ttl_ms: Option<u64>) -> Self {
        Self {
            value,
            timestamp,
            ttl_ms,
        }
    }

    /// A tombstone is a record whose value is `null`.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_null()
    }

    /// Returns true if the record carries a TTL that has elapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl_ms {
            Some(ttl) if !self.is_tombstone() => {
                self.timestamp.millis.saturating_add(ttl as i64) < now_ms
            }
            _ => false,
        }
    }
}

/// The outcome of a merge attempt.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// True if the incoming record became the survivor.
    pub applied: bool,
    /// The record that was in place before the merge, if any.
    pub old: Option<LwwRecord>,
}

/// An in-memory LWW map. `merge` is commutative, associative, and idempotent:
/// the survivor for a key is always the record with the greatest HLC, and the
/// HLC order is total, so replay order never changes the result.
#[derive(Debug, Default)]
pub struct LwwMap {
    entries: DashMap<String, LwwRecord>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges an incoming record for `key`. The merge is performed under the
    /// entry lock, which serializes concurrent applies for the same key.
    pub fn merge(&self, key: &str, incoming: LwwRecord) -> MergeOutcome {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(incoming);
                MergeOutcome {
                    applied: true,
                    old: None,
                }
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let old = occupied.get().clone();
                if incoming.timestamp > old.timestamp {
                    occupied.insert(incoming);
                    MergeOutcome {
                        applied: true,
                        old: Some(old),
                    }
                } else {
                    MergeOutcome {
                        applied: false,
                        old: Some(old),
                    }
                }
            }
        }
    }

    /// Overwrites the record for `key` without LWW arbitration. Used by the
    /// conflict-resolver path, where the survivor has already been chosen.
    pub fn put_resolved(&self, key: &str, record: LwwRecord) -> Option<LwwRecord> {
        self.entries.insert(key.to_string(), record)
    }

    pub fn get(&self, key: &str) -> Option<LwwRecord> {
        self.entries.get(key).map(|r| r.value().clone())
    }

    /// Visits every `(key, record)` pair, tombstones included.
    pub fn for_each(&self, mut f: impl FnMut(&str, &LwwRecord)) {
        for entry in self.entries.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live (non-tombstone) keys.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().is_tombstone()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collects records whose TTL has elapsed at `now_ms`.
    pub fn expired_records(&self, now_ms: i64) -> Vec<(String, LwwRecord)> {
        self.entries
            .iter()
            .filter(|e| e.value().is_expired(now_ms))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Removes tombstones strictly older than `safe`. Returns the pruned
    /// keys so callers can retract them from the Merkle tree.
    pub fn prune_tombstones(&self, safe: &Timestamp) -> Vec<String> {
        let mut pruned = Vec::new();
        self.entries.retain(|key, record| {
            if record.is_tombstone() && record.timestamp < *safe {
                pruned.push(key.clone());
                false
            } else {
                true
            }
        });
        pruned
    }
}

