// src/core/cluster/mod.rs

//! Cluster-facing types: the peer protocol, the membership view, and the
//! partition map exposed to clients.

pub mod events;
pub mod gc;
pub mod partition;
pub mod transport;

use crate::core::crdt::Timestamp;
use crate::core::protocol::{EventPayload, MapOp};
use crate::core::query::{Query, QueryRow};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use partition::{HashPartitionService, PartitionService};
pub use transport::{ClusterTransport, LoopbackTransport};

pub type NodeId = String;

/// Peer-to-peer cluster messages. Encoded as MessagePack on the cluster bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    /// A routed client op. With `replication`/`migration` set the frame is
    /// consumed by those listeners instead of the operation pipeline.
    OpForward {
        op: MapOp,
        origin_node: NodeId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        origin_session: Option<u64>,
        #[serde(default)]
        replication: bool,
        #[serde(default)]
        migration: bool,
    },
    /// A change applied on the owner, pushed to backups and interested peers.
    ClusterEvent { payload: EventPayload },
    ClusterQueryExec {
        request_id: String,
        origin_node: NodeId,
        map: String,
        query: Query,
    },
    ClusterQueryResp {
        request_id: String,
        node_id: NodeId,
        results: Vec<QueryRow>,
    },
    ClusterGcReport {
        node_id: NodeId,
        min_hlc: Timestamp,
    },
    ClusterGcCommit {
        safe: Timestamp,
    },
    ClusterLockReq {
        origin_node: NodeId,
        session_id: u64,
        request_id: String,
        name: String,
        ttl_ms: u64,
    },
    ClusterLockRelease {
        origin_node: NodeId,
        session_id: u64,
        request_id: String,
        name: String,
    },
    ClusterLockGranted {
        /// Composite id `"{node_id}:{session_id}"` of the original requester.
        holder: String,
        request_id: String,
        name: String,
        fencing_token: u64,
    },
    ClusterLockReleased {
        holder: String,
        request_id: String,
        name: String,
    },
    ClusterClientDisconnected {
        node_id: NodeId,
        session_id: u64,
    },
    ClusterTopicPub {
        topic: String,
        payload: Value,
        original_sender: String,
    },
    ClusterMerkleRootReq {
        request_id: String,
        map: String,
    },
    ClusterMerkleRootResp {
        request_id: String,
        map: String,
        root: String,
    },
    ClusterRepairDataReq {
        request_id: String,
        map: String,
        bucket: u32,
    },
    ClusterRepairDataResp {
        request_id: String,
        map: String,
        bucket: u32,
        records: Vec<QueryRow>,
    },
}

impl PeerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::OpForward { .. } => "OP_FORWARD",
            PeerMessage::ClusterEvent { .. } => "CLUSTER_EVENT",
            PeerMessage::ClusterQueryExec { .. } => "CLUSTER_QUERY_EXEC",
            PeerMessage::ClusterQueryResp { .. } => "CLUSTER_QUERY_RESP",
            PeerMessage::ClusterGcReport { .. } => "CLUSTER_GC_REPORT",
            PeerMessage::ClusterGcCommit { .. } => "CLUSTER_GC_COMMIT",
            PeerMessage::ClusterLockReq { .. } => "CLUSTER_LOCK_REQ",
            PeerMessage::ClusterLockRelease { .. } => "CLUSTER_LOCK_RELEASE",
            PeerMessage::ClusterLockGranted { .. } => "CLUSTER_LOCK_GRANTED",
            PeerMessage::ClusterLockReleased { .. } => "CLUSTER_LOCK_RELEASED",
            PeerMessage::ClusterClientDisconnected { .. } => "CLUSTER_CLIENT_DISCONNECTED",
            PeerMessage::ClusterTopicPub { .. } => "CLUSTER_TOPIC_PUB",
            PeerMessage::ClusterMerkleRootReq { .. } => "CLUSTER_MERKLE_ROOT_REQ",
            PeerMessage::ClusterMerkleRootResp { .. } => "CLUSTER_MERKLE_ROOT_RESP",
            PeerMessage::ClusterRepairDataReq { .. } => "CLUSTER_REPAIR_DATA_REQ",
            PeerMessage::ClusterRepairDataResp { .. } => "CLUSTER_REPAIR_DATA_RESP",
        }
    }
}

/// One partition's assignment, as sent to clients in `PARTITION_MAP`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfo {
    pub partition_id: u32,
    pub owner: NodeId,
    pub backups: Vec<NodeId>,
}

/// The membership view of sibling nodes. The external cluster transport keeps
/// it current; the coordinator only reads it.
#[derive(Debug)]
pub struct ClusterView {
    local_node: NodeId,
    members: RwLock<Vec<NodeId>>,
    version: RwLock<u64>,
}

impl ClusterView {
    pub fn new(local_node: impl Into<NodeId>) -> Self {
        let local_node = local_node.into();
        Self {
            members: RwLock::new(vec![local_node.clone()]),
            local_node,
            version: RwLock::new(1),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// All current member ids, the local node included.
    pub fn members(&self) -> Vec<NodeId> {
        self.members.read().clone()
    }

    /// All member ids except the local node.
    pub fn peers(&self) -> Vec<NodeId> {
        self.members
            .read()
            .iter()
            .filter(|m| **m != self.local_node)
            .cloned()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.members.read().len()
    }

    pub fn version(&self) -> u64 {
        *self.version.read()
    }

    /// The GC leader: the lexicographically smallest member id.
    pub fn leader(&self) -> NodeId {
        self.members
            .read()
            .iter()
            .min()
            .cloned()
            .unwrap_or_else(|| self.local_node.clone())
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == self.local_node
    }

    /// Replaces the member list after a topology change; bumps the version.
    pub fn update_members(&self, mut members: Vec<NodeId>) -> u64 {
        if !members.contains(&self.local_node) {
            members.push(self.local_node.clone());
        }
        members.sort();
        members.dedup();
        *self.members.write() = members;
        let mut version = self.version.write();
        *version += 1;
        *version
    }
}

