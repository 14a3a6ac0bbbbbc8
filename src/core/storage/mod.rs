// src/core/storage/mod.rs

//! The in-process map registry: lazy creation with a type hint, async
//! hydration from the storage driver, and the persist path used by the
//! operation pipeline.

pub mod driver;

use crate::core::crdt::{CrdtMap, MapType, MerkleTree};
use crate::core::errors::OlivineError;
use crate::core::metrics;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

pub use driver::{MemoryStorage, StorageDriver, StoredRecord, TOMBSTONES_KEY};

/// A named CRDT container plus its Merkle tree and readiness signal.
#[derive(Debug)]
pub struct ManagedMap {
    pub name: String,
    pub map: CrdtMap,
    pub merkle: MerkleTree,
    ready: watch::Receiver<bool>,
}

impl ManagedMap {
    /// Waits until hydration from storage has completed. Returns immediately
    /// for maps that are already live.
    pub async fn await_ready(&self) {
        let mut ready = self.ready.clone();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Owns every map on this node. Maps are created lazily on first reference
/// and hydrated from the storage driver before their first external read.
#[derive(Debug)]
pub struct StorageManager {
    driver: Arc<dyn StorageDriver>,
    maps: DashMap<String, Arc<ManagedMap>>,
}

impl StorageManager {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            driver,
            maps: DashMap::new(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// Returns the map if it exists; never creates.
    pub fn get(&self, name: &str) -> Option<Arc<ManagedMap>> {
        self.maps.get(name).map(|e| e.value().clone())
    }

    /// Resolves a map by name and type hint, creating and hydrating it on
    /// first reference. A stored map whose type contradicts the hint is a
    /// protocol error.
    pub fn get_or_create(
        &self,
        name: &str,
        hint: MapType,
    ) -> Result<Arc<ManagedMap>, OlivineError> {
        if let Some(existing) = self.maps.get(name) {
            let existing = existing.value().clone();
            if existing.map.map_type() != hint {
                return Err(OlivineError::MapTypeMismatch {
                    map: name.to_string(),
                    stored: existing.map.map_type().to_string(),
                    requested: hint.to_string(),
                });
            }
            return Ok(existing);
        }

        let (ready_tx, ready_rx) = watch::channel(false);
        let managed = Arc::new(ManagedMap {
            name: name.to_string(),
            map: CrdtMap::new(hint),
            merkle: MerkleTree::new(),
            ready: ready_rx,
        });

        let entry = self
            .maps
            .entry(name.to_string())
            .or_insert_with(|| managed.clone());
        let current = entry.value().clone();
        drop(entry);

        if !Arc::ptr_eq(&current, &managed) {
            // Lost the creation race; re-check the hint against the winner.
            if current.map.map_type() != hint {
                return Err(OlivineError::MapTypeMismatch {
                    map: name.to_string(),
                    stored: current.map.map_type().to_string(),
                    requested: hint.to_string(),
                });
            }
            return Ok(current);
        }

        let driver = self.driver.clone();
        let map = managed.clone();
        tokio::spawn(async move {
            hydrate(driver, &map).await;
            let _ = ready_tx.send(true);
        });
        Ok(managed)
    }

    /// Names of every live map.
    pub fn map_names(&self) -> Vec<String> {
        self.maps.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of every managed map, for GC and repair sweeps.
    pub fn all_maps(&self) -> Vec<Arc<ManagedMap>> {
        self.maps.iter().map(|e| e.value().clone()).collect()
    }

    /// Persists the current state of one key. Errors are surfaced to the
    /// caller; the pipeline decides whether they are fatal (`PERSISTED`
    /// concern) or merely logged.
    pub async fn persist_key(&self, managed: &ManagedMap, key: &str) -> Result<(), OlivineError> {
        match &managed.map {
            CrdtMap::Lww(lww) => match lww.get(key) {
                Some(record) => {
                    self.driver
                        .store_record(&managed.name, key, &StoredRecord::Lww(record))
                        .await
                }
                None => self.driver.delete_record(&managed.name, key).await,
            },
            CrdtMap::Or(or) => {
                let entries = or.get(key);
                if entries.is_empty() {
                    self.driver.delete_record(&managed.name, key).await?;
                } else {
                    self.driver
                        .store_record(&managed.name, key, &StoredRecord::OrEntries(entries))
                        .await?;
                }
                self.driver
                    .store_record(
                        &managed.name,
                        TOMBSTONES_KEY,
                        &StoredRecord::OrTombstones(or.tombstone_tags()),
                    )
                    .await
            }
        }
    }

    /// Refreshes the map-size gauge after an apply.
    pub fn update_size_metric(&self, managed: &ManagedMap) {
        metrics::MAP_SIZE
            .with_label_values(&[managed.name.as_str()])
            .set(managed.map.len() as f64);
    }
}

async fn hydrate(driver: Arc<dyn StorageDriver>, managed: &ManagedMap) {
    let records = match driver.load_map(&managed.name).await {
        Ok(records) => records,
        Err(e) => {
            error!("Failed to hydrate map '{}': {}", managed.name, e);
            return;
        }
    };
    let mut loaded = 0usize;
    for (key, stored) in records {
        match (&managed.map, stored) {
            (CrdtMap::Lww(lww), StoredRecord::Lww(record)) => {
                let serialized = serde_json::to_vec(&record).unwrap_or_default();
                lww.merge(&key, record);
                managed.merkle.update(&key, &serialized);
                loaded += 1;
            }
            (CrdtMap::Or(or), StoredRecord::OrEntries(entries)) => {
                let serialized = serde_json::to_vec(&entries).unwrap_or_default();
                for entry in entries {
                    or.apply_add(&key, entry);
                }
                managed.merkle.update(&key, &serialized);
                loaded += 1;
            }
            (CrdtMap::Or(or), StoredRecord::OrTombstones(tags)) => {
                for (tag, removed_at) in tags {
                    or.restore_tombstone(tag, removed_at);
                }
            }
            (_, other) => {
                error!(
                    "Skipping record '{}' with mismatched storage shape in map '{}': {:?}",
                    key, managed.name, other
                );
            }
        }
    }
    debug!("Hydrated map '{}' with {} records", managed.name, loaded);
}

