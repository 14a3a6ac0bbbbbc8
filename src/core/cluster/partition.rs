// src/core/cluster/partition.rs

//! Key -> partition -> owner/backup routing.
//!
//! The authoritative partition assignment lives in the external cluster
//! layer; this module is the seam the coordinator consumes, plus the default
//! CRC-based implementation used when that layer runs in-process.

use super::{ClusterView, NodeId, PartitionInfo};
use crate::core::query::Query;
use crc::{CRC_32_ISO_HDLC, Crc};
use std::sync::Arc;

const KEY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Maps keys to partitions and partitions to owner/backup nodes.
pub trait PartitionService: Send + Sync + std::fmt::Debug {
    fn partition_count(&self) -> u32;

    fn partition_for_key(&self, key: &str) -> u32;

    fn owner(&self, partition: u32) -> NodeId;

    fn backups(&self, partition: u32) -> Vec<NodeId>;

    fn is_local_owner(&self, key: &str) -> bool;

    /// True if the local node is the owner or a backup for `key`'s partition.
    fn is_local_replica(&self, key: &str) -> bool;

    /// Peer nodes that may hold results for `query`. A query pinned to a
    /// single key prunes to that key's replica set; anything else needs every
    /// peer.
    fn relevant_peers(&self, query: &Query) -> Vec<NodeId>;

    /// The full assignment table, versioned for `PARTITION_MAP_REQUEST`.
    fn partition_map(&self) -> (u64, Vec<PartitionInfo>);
}

/// Rendezvous-free modulo placement over the sorted member list. Owner for
/// partition `p` is `members[p % len]`; backups are the next `backup_count`
/// members in ring order.
#[derive(Debug)]
pub struct HashPartitionService {
    cluster: Arc<ClusterView>,
    partition_count: u32,
    backup_count: usize,
}

impl HashPartitionService {
    pub fn new(cluster: Arc<ClusterView>, partition_count: u32, backup_count: usize) -> Self {
        Self {
            cluster,
            partition_count,
            backup_count,
        }
    }

    fn assignment(&self, partition: u32) -> (NodeId, Vec<NodeId>) {
        let members = self.cluster.members();
        let owner_index = partition as usize % members.len();
        let owner = members[owner_index].clone();
        let backups = (1..=self.backup_count)
            .filter_map(|offset| {
                let index = (owner_index + offset) % members.len();
                (index != owner_index).then(|| members[index].clone())
            })
            .collect();
        (owner, backups)
    }
}

impl PartitionService for HashPartitionService {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn partition_for_key(&self, key: &str) -> u32 {
        KEY_CRC.checksum(key.as_bytes()) % self.partition_count
    }

    fn owner(&self, partition: u32) -> NodeId {
        self.assignment(partition).0
    }

    fn backups(&self, partition: u32) -> Vec<NodeId> {
        self.assignment(partition).1
    }

    fn is_local_owner(&self, key: &str) -> bool {
        self.owner(self.partition_for_key(key)) == *self.cluster.local_node()
    }

    fn is_local_replica(&self, key: &str) -> bool {
        let partition = self.partition_for_key(key);
        let (owner, backups) = self.assignment(partition);
        let local = self.cluster.local_node();
        owner == *local || backups.contains(local)
    }

    fn relevant_peers(&self, query: &Query) -> Vec<NodeId> {
        let local = self.cluster.local_node();
        if let Some(key) = query.single_key() {
            let (owner, backups) = self.assignment(self.partition_for_key(&key));
            let mut peers: Vec<NodeId> = std::iter::once(owner)
                .chain(backups)
                .filter(|node| node != local)
                .collect();
            peers.dedup();
            return peers;
        }
        self.cluster.peers()
    }

    fn partition_map(&self) -> (u64, Vec<PartitionInfo>) {
        let version = self.cluster.version();
        let partitions = (0..self.partition_count)
            .map(|partition_id| {
                let (owner, backups) = self.assignment(partition_id);
                PartitionInfo {
                    partition_id,
                    owner,
                    backups,
                }
            })
            .collect();
        (version, partitions)
    }
}

