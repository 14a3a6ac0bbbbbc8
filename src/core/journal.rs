// src/core/journal.rs

//! A bounded in-memory change journal. Every successful apply appends one
//! classified entry; subscribed sessions receive `JOURNAL_EVENT` frames and
//! anyone can page through history with `JOURNAL_READ`.

use crate::core::crdt::Timestamp;
use crate::core::protocol::{EventType, JournalEntry};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_JOURNAL_CAPACITY: usize = 10_000;

/// The journal ring plus its subscriber set.
#[derive(Debug)]
pub struct JournalManager {
    entries: Mutex<VecDeque<JournalEntry>>,
    capacity: usize,
    next_seq: AtomicU64,
    subscribers: Mutex<HashSet<u64>>,
    enabled: bool,
}

impl JournalManager {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            next_seq: AtomicU64::new(1),
            subscribers: Mutex::new(HashSet::new()),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Appends one entry, evicting the oldest when full. Returns the entry
    /// for delivery to subscribers, or `None` when the journal is disabled.
    pub fn append(
        &self,
        map: &str,
        key: &str,
        event_type: EventType,
        timestamp: Timestamp,
    ) -> Option<JournalEntry> {
        if !self.enabled {
            return None;
        }
        let entry = JournalEntry {
            seq: self.next_seq.fetch_add(1, Ordering::AcqRel),
            map: map.to_string(),
            key: key.to_string(),
            event_type,
            timestamp,
        };
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        Some(entry)
    }

    /// Entries with `seq >= from_seq`, up to `limit`, plus a has-more flag.
    pub fn read(&self, from_seq: u64, limit: usize) -> (Vec<JournalEntry>, bool) {
        let entries = self.entries.lock();
        let mut selected: Vec<JournalEntry> = entries
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect();
        let has_more = selected.len() > limit;
        selected.truncate(limit);
        (selected, has_more)
    }

    pub fn subscribe(&self, session_id: u64) {
        self.subscribers.lock().insert(session_id);
    }

    pub fn unsubscribe(&self, session_id: u64) {
        self.subscribers.lock().remove(&session_id);
    }

    pub fn subscribers(&self) -> Vec<u64> {
        self.subscribers.lock().iter().copied().collect()
    }
}

