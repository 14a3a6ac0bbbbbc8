// src/core/search.rs

//! Full-text search seam. The production engine is an external collaborator;
//! the in-process index here keeps the `SEARCH` verbs and the HTTP facade
//! working end-to-end with a naive inverted index.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;

/// The index interface the coordinator writes through on every apply.
pub trait SearchIndex: Send + Sync + std::fmt::Debug {
    /// Re-indexes one record (`None` removes it).
    fn index_record(&self, map: &str, key: &str, value: Option<&Value>);

    /// Keys on `map` matching every token of `text`.
    fn search(&self, map: &str, text: &str, limit: usize) -> Vec<String>;
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn tokens_of_value(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => out.extend(tokenize(s)),
        Value::Array(items) => items.iter().for_each(|v| tokens_of_value(v, out)),
        Value::Object(fields) => fields.values().for_each(|v| tokens_of_value(v, out)),
        Value::Number(n) => {
            out.insert(n.to_string());
        }
        Value::Bool(_) | Value::Null => {}
    }
}

/// Naive in-memory inverted index: token -> key set per map, plus the token
/// set per key so re-indexing can retract stale postings.
#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    postings: DashMap<String, DashMap<String, HashSet<String>>>,
    key_tokens: DashMap<(String, String), HashSet<String>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SearchIndex for MemorySearchIndex {
    fn index_record(&self, map: &str, key: &str, value: Option<&Value>) {
        let map_postings = self.postings.entry(map.to_string()).or_default();
        let slot = (map.to_string(), key.to_string());
        if let Some((_, old_tokens)) = self.key_tokens.remove(&slot) {
            for token in old_tokens {
                if let Some(mut keys) = map_postings.get_mut(&token) {
                    keys.remove(key);
                }
            }
        }
        let Some(value) = value else {
            return;
        };
        let mut tokens = HashSet::new();
        tokens_of_value(value, &mut tokens);
        for token in &tokens {
            map_postings
                .entry(token.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.key_tokens.insert(slot, tokens);
    }

    fn search(&self, map: &str, text: &str, limit: usize) -> Vec<String> {
        let Some(map_postings) = self.postings.get(map) else {
            return Vec::new();
        };
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }
        let mut result: Option<HashSet<String>> = None;
        for token in tokens {
            let keys = map_postings
                .get(&token)
                .map(|k| k.value().clone())
                .unwrap_or_default();
            result = Some(match result {
                Some(acc) => acc.intersection(&keys).cloned().collect(),
                None => keys,
            });
            if result.as_ref().is_some_and(HashSet::is_empty) {
                return Vec::new();
            }
        }
        let mut keys: Vec<String> = result.unwrap_or_default().into_iter().collect();
        keys.sort();
        keys.truncate(limit);
        keys
    }
}

/// One live `SEARCH_SUB` registration.
#[derive(Debug, Clone)]
pub struct SearchSubscription {
    pub request_id: String,
    pub session_id: u64,
    pub map: String,
    pub text: String,
}

/// Registry of live search subscriptions.
#[derive(Debug, Default)]
pub struct SearchSubscriptions {
    subs: DashMap<String, SearchSubscription>,
}

impl SearchSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sub: SearchSubscription) {
        self.subs.insert(sub.request_id.clone(), sub);
    }

    pub fn unregister(&self, request_id: &str) -> bool {
        self.subs.remove(request_id).is_some()
    }

    pub fn unregister_session(&self, session_id: u64) {
        self.subs.retain(|_, sub| sub.session_id != session_id);
    }

    /// Subscriptions on `map` whose query matches the new record text.
    pub fn matching(&self, map: &str, value: &Value) -> Vec<SearchSubscription> {
        let mut record_tokens = HashSet::new();
        tokens_of_value(value, &mut record_tokens);
        self.subs
            .iter()
            .filter(|e| {
                let sub = e.value();
                sub.map == map && tokenize(&sub.text).is_subset(&record_tokens)
            })
            .map(|e| e.value().clone())
            .collect()
    }
}

