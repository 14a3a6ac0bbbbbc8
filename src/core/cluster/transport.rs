// src/core/cluster/transport.rs

//! The seam to the external cluster transport. The coordinator only needs
//! `send` and `broadcast`; discovery, connection management, and retransmit
//! policy live outside this crate.

use super::{NodeId, PeerMessage};
use crate::core::errors::OlivineError;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

/// Moves peer messages between nodes. Implementations must preserve
/// per-sender ordering; delivery is best-effort.
#[async_trait]
pub trait ClusterTransport: Send + Sync + std::fmt::Debug {
    async fn send(&self, target: &NodeId, message: PeerMessage) -> Result<(), OlivineError>;

    /// Sends to every peer (not the local node). Per-peer failures are
    /// logged by the implementation, never surfaced.
    async fn broadcast(&self, message: PeerMessage);
}

/// In-process transport wiring nodes together through channels. Used by tests
/// and by single-process multi-node setups.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    local_node: NodeId,
    inboxes: DashMap<NodeId, mpsc::UnboundedSender<(NodeId, PeerMessage)>>,
}

impl LoopbackTransport {
    pub fn new(local_node: impl Into<NodeId>) -> Self {
        Self {
            local_node: local_node.into(),
            inboxes: DashMap::new(),
        }
    }

    /// Registers a node and returns its inbox receiver.
    pub fn register(&self, node: impl Into<NodeId>) -> mpsc::UnboundedReceiver<(NodeId, PeerMessage)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(node.into(), tx);
        rx
    }
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    async fn send(&self, target: &NodeId, message: PeerMessage) -> Result<(), OlivineError> {
        let Some(inbox) = self.inboxes.get(target) else {
            return Err(OlivineError::Cluster(format!("unknown peer '{target}'")));
        };
        inbox
            .send((self.local_node.clone(), message))
            .map_err(|_| OlivineError::Cluster(format!("peer '{target}' is gone")))
    }

    async fn broadcast(&self, message: PeerMessage) {
        for entry in self.inboxes.iter() {
            if *entry.key() == self.local_node {
                continue;
            }
            if entry
                .value()
                .send((self.local_node.clone(), message.clone()))
                .is_err()
            {
                warn!("Dropping {} for dead peer {}", message.type_name(), entry.key());
            }
        }
    }
}
