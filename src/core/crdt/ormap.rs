// src/core/crdt/ormap.rs

//! Observed-remove map: multi-valued per key, each value carrying a unique
//! tag. Removal tombstones the tag; a key is present iff at least one of its
//! tagged entries is not tombstoned.

use super::hlc::Timestamp;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tagged entry in an OR map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedEntry {
    pub value: Value,
    pub timestamp: Timestamp,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl_ms: Option<u64>,
}

impl TaggedEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl_ms {
            Some(ttl) => self.timestamp.millis.saturating_add(ttl as i64) < now_ms,
            None => false,
        }
    }
}

/// An in-memory OR map. Adds and removes commute because removal is keyed by
/// tag: removing a tag that has not yet been observed still tombstones it, so
/// the late-arriving add is suppressed.
#[derive(Debug, Default)]
pub struct OrMap {
    entries: DashMap<String, Vec<TaggedEntry>>,
    /// Tag -> removal timestamp, used for safe pruning.
    tombstones: DashMap<String, Timestamp>,
}

impl OrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a tagged add. Idempotent: a duplicate tag or an already
    /// tombstoned tag is a no-op.
    pub fn apply_add(&self, key: &str, entry: TaggedEntry) -> bool {
        if self.tombstones.contains_key(&entry.tag) {
            return false;
        }
        let mut live = self.entries.entry(key.to_string()).or_default();
        if live.iter().any(|e| e.tag == entry.tag) {
            return false;
        }
        live.push(entry);
        true
    }

    /// Applies a tagged remove: records the tombstone and drops the matching
    /// live entry if it has been observed. Idempotent.
    pub fn apply_remove(&self, key: &str, tag: &str, removed_at: Timestamp) -> Option<TaggedEntry> {
        self.tombstones.entry(tag.to_string()).or_insert(removed_at);
        let mut removed = None;
        if let Some(mut live) = self.entries.get_mut(key)
            && let Some(pos) = live.iter().position(|e| e.tag == tag)
        {
            removed = Some(live.remove(pos));
        }
        removed
    }

    /// Surviving entries for `key`. Empty means the key is absent.
    pub fn get(&self, key: &str) -> Vec<TaggedEntry> {
        self.entries
            .get(key)
            .map(|live| live.value().clone())
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|live| !live.is_empty())
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &[TaggedEntry])) {
        for entry in self.entries.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collects `(key, entry)` pairs whose TTL has elapsed at `now_ms`.
    pub fn expired_entries(&self, now_ms: i64) -> Vec<(String, TaggedEntry)> {
        let mut out = Vec::new();
        for entry in self.entries.iter() {
            for tagged in entry.value().iter().filter(|e| e.is_expired(now_ms)) {
                out.push((entry.key().clone(), tagged.clone()));
            }
        }
        out
    }

    /// The full tombstone tag set, persisted under the `__tombstones__` key.
    pub fn tombstone_tags(&self) -> Vec<(String, Timestamp)> {
        self.tombstones
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Restores a tombstone from storage without touching live entries.
    pub fn restore_tombstone(&self, tag: String, removed_at: Timestamp) {
        self.tombstones.insert(tag, removed_at);
    }

    /// Removes tombstones strictly older than `safe`. Returns the prune count.
    pub fn prune_tombstones(&self, safe: &Timestamp) -> usize {
        let mut pruned = 0;
        self.tombstones.retain(|_, removed_at| {
            if *removed_at < *safe {
                pruned += 1;
                false
            } else {
                true
            }
        });
        pruned
    }
}

