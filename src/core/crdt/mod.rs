// src/core/crdt/mod.rs

//! Conflict-free replicated data types: the HLC clock, the LWW and OR maps,
//! and the bucketed Merkle tree used for anti-entropy.

pub mod hlc;
pub mod lww;
pub mod merkle;
pub mod ormap;

use serde::{Deserialize, Serialize};

pub use hlc::{HlcClock, Timestamp, wall_clock_ms};
pub use lww::{LwwMap, LwwRecord, MergeOutcome};
pub use merkle::{MERKLE_BUCKETS, MerkleTree, bucket_for_key};
pub use ormap::{OrMap, TaggedEntry};

/// The CRDT strategy of a map, carried as a type hint on every operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MapType {
    Lww,
    Or,
}

/// A named CRDT container, either LWW or OR.
#[derive(Debug)]
pub enum CrdtMap {
    Lww(LwwMap),
    Or(OrMap),
}

impl CrdtMap {
    pub fn new(map_type: MapType) -> Self {
        match map_type {
            MapType::Lww => CrdtMap::Lww(LwwMap::new()),
            MapType::Or => CrdtMap::Or(OrMap::new()),
        }
    }

    pub fn map_type(&self) -> MapType {
        match self {
            CrdtMap::Lww(_) => MapType::Lww,
            CrdtMap::Or(_) => MapType::Or,
        }
    }

    pub fn as_lww(&self) -> Option<&LwwMap> {
        match self {
            CrdtMap::Lww(map) => Some(map),
            CrdtMap::Or(_) => None,
        }
    }

    pub fn as_or(&self) -> Option<&OrMap> {
        match self {
            CrdtMap::Or(map) => Some(map),
            CrdtMap::Lww(_) => None,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        match self {
            CrdtMap::Lww(map) => map.len(),
            CrdtMap::Or(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes tombstones strictly older than `safe`.
    pub fn prune_tombstones(&self, safe: &Timestamp) -> usize {
        match self {
            CrdtMap::Lww(map) => map.prune_tombstones(safe).len(),
            CrdtMap::Or(map) => map.prune_tombstones(safe),
        }
    }
}
