// src/core/storage/driver.rs

//! The seam to the persistent storage driver.
//!
//! The production driver is an external collaborator; the coordinator only
//! depends on this trait. The in-memory implementation backs tests and
//! ephemeral standalone nodes.

use crate::core::crdt::{LwwRecord, TaggedEntry, Timestamp};
use crate::core::errors::OlivineError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// The key under which an OR map's tombstone tag set is persisted.
pub const TOMBSTONES_KEY: &str = "__tombstones__";

/// One persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoredRecord {
    Lww(LwwRecord),
    OrEntries(Vec<TaggedEntry>),
    /// Stored under [`TOMBSTONES_KEY`] only.
    OrTombstones(Vec<(String, Timestamp)>),
}

/// Durable per-map key/value storage.
#[async_trait]
pub trait StorageDriver: Send + Sync + std::fmt::Debug {
    /// Loads every record of a map, the tombstone row included.
    async fn load_map(&self, map: &str) -> Result<Vec<(String, StoredRecord)>, OlivineError>;

    async fn store_record(
        &self,
        map: &str,
        key: &str,
        record: &StoredRecord,
    ) -> Result<(), OlivineError>;

    async fn delete_record(&self, map: &str, key: &str) -> Result<(), OlivineError>;
}

/// Keeps everything in process memory. Durability ends with the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    maps: DashMap<String, DashMap<String, StoredRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageDriver for MemoryStorage {
    async fn load_map(&self, map: &str) -> Result<Vec<(String, StoredRecord)>, OlivineError> {
        Ok(self
            .maps
            .get(map)
            .map(|records| {
                records
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn store_record(
        &self,
        map: &str,
        key: &str,
        record: &StoredRecord,
    ) -> Result<(), OlivineError> {
        self.maps
            .entry(map.to_string())
            .or_default()
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn delete_record(&self, map: &str, key: &str) -> Result<(), OlivineError> {
        if let Some(records) = self.maps.get(map) {
            records.remove(key);
        }
        Ok(())
    }
}
