// src/core/cluster/events.rs

//! Dispatches peer messages arriving over the cluster bus.

use super::{NodeId, PeerMessage};
use crate::core::handler::{adapters, pipeline, query};
use crate::core::interceptor::OpContext;
use crate::core::locks::composite_holder;
use crate::core::protocol::{EventPayload, EventType, MapOp, OpKind, ServerMessage};
use crate::core::state::ServerState;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry point for the external membership layer: installs the new member
/// list and pushes the resulting partition map to every authenticated
/// session.
pub fn apply_topology_change(state: &Arc<ServerState>, members: Vec<NodeId>) {
    let version = state.cluster.update_members(members);
    let (map_version, partitions) = state.partitions.partition_map();
    debug!(
        "Topology changed (view {}); broadcasting partition map v{}",
        version, map_version
    );
    crate::core::handler::broadcast::broadcast(
        state,
        &ServerMessage::PartitionMap {
            version: map_version,
            partitions,
        },
        None,
    );
}

/// Routes one peer message by type.
pub async fn handle_peer_message(state: &Arc<ServerState>, sender: NodeId, message: PeerMessage) {
    match message {
        PeerMessage::OpForward {
            op,
            origin_node,
            origin_session,
            replication,
            migration,
        } => {
            if replication || migration {
                // Consumed by the replication/migration listeners of the
                // external cluster layer, not by the op pipeline.
                debug!(
                    "Leaving flagged OP_FORWARD '{}' to its listener (replication={}, migration={})",
                    op.id, replication, migration
                );
                return;
            }
            let ctx = OpContext {
                session_id: None,
                principal: None,
                authenticated: true,
                from_cluster: true,
                origin_sender: Some(
                    origin_session
                        .map(|s| composite_holder(&origin_node, s))
                        .unwrap_or_else(|| origin_node.clone()),
                ),
            };
            if let Err(e) = pipeline::process_local(state, op, &ctx, false, None, true).await {
                warn!("Forwarded op from '{}' failed: {}", sender, e);
            }
        }

        PeerMessage::ClusterEvent { payload } => {
            handle_cluster_event(state, payload).await;
        }

        PeerMessage::ClusterQueryExec {
            request_id,
            origin_node,
            map,
            query: peer_query,
        } => {
            let results = query::execute_local_query(state, &map, &peer_query).await;
            let resp = PeerMessage::ClusterQueryResp {
                request_id,
                node_id: state.node_id.clone(),
                results,
            };
            if let Err(e) = state.transport.send(&origin_node, resp).await {
                warn!("Query response to '{}' failed: {}", origin_node, e);
            }
        }

        PeerMessage::ClusterQueryResp {
            request_id,
            node_id,
            results,
        } => {
            query::handle_query_resp(state, &request_id, node_id, results);
        }

        PeerMessage::ClusterGcReport { node_id, min_hlc } => {
            super::gc::handle_report(state, node_id, min_hlc).await;
        }

        PeerMessage::ClusterGcCommit { safe } => {
            super::gc::run_local_gc(state, &safe).await;
        }

        PeerMessage::ClusterLockReq {
            origin_node,
            session_id,
            request_id,
            name,
            ttl_ms,
        } => {
            let holder = composite_holder(&origin_node, session_id);
            if let Some(grant) = state.locks.acquire(
                &name,
                &holder,
                &request_id,
                std::time::Duration::from_millis(ttl_ms),
            ) {
                adapters::route_lock_grant(state, grant).await;
            }
        }

        PeerMessage::ClusterLockRelease {
            origin_node,
            session_id,
            request_id,
            name,
        } => {
            let holder = composite_holder(&origin_node, session_id);
            let next = state.locks.release(&name, &holder);
            let released = PeerMessage::ClusterLockReleased {
                holder,
                request_id,
                name,
            };
            if let Err(e) = state.transport.send(&origin_node, released).await {
                debug!("Lock release confirmation to '{}' failed: {}", origin_node, e);
            }
            if let Some(grant) = next {
                adapters::route_lock_grant(state, grant).await;
            }
        }

        PeerMessage::ClusterLockGranted {
            holder,
            request_id,
            name,
            fencing_token,
        } => {
            deliver_to_holder(
                state,
                &holder,
                ServerMessage::LockGranted {
                    request_id,
                    name,
                    fencing_token,
                },
            );
        }

        PeerMessage::ClusterLockReleased {
            holder,
            request_id,
            name,
        } => {
            deliver_to_holder(state, &holder, ServerMessage::LockReleased { request_id, name });
        }

        PeerMessage::ClusterClientDisconnected { node_id, session_id } => {
            let holder = composite_holder(&node_id, session_id);
            for grant in state.locks.release_all_for(&holder) {
                adapters::route_lock_grant(state, grant).await;
            }
        }

        PeerMessage::ClusterTopicPub { topic, payload, .. } => {
            // Local delivery only; never re-forwarded.
            adapters::deliver_topic_locally(state, &topic, &payload, None);
        }

        PeerMessage::ClusterMerkleRootReq { request_id, map } => {
            let root = match state.storage.get(&map) {
                Some(managed) => {
                    managed.await_ready().await;
                    managed.merkle.root()
                }
                None => String::new(),
            };
            let resp = PeerMessage::ClusterMerkleRootResp {
                request_id,
                map,
                root,
            };
            if let Err(e) = state.transport.send(&sender, resp).await {
                warn!("Merkle root response to '{}' failed: {}", sender, e);
            }
        }

        PeerMessage::ClusterRepairDataReq {
            request_id,
            map,
            bucket,
        } => {
            let records = match state.storage.get(&map) {
                Some(managed) => {
                    managed.await_ready().await;
                    let keys = managed.merkle.keys_in_bucket(bucket);
                    let mut records = Vec::with_capacity(keys.len());
                    if let Some(lww) = managed.map.as_lww() {
                        for key in keys {
                            if let Some(record) = lww.get(&key) {
                                records.push(crate::core::query::QueryRow {
                                    key,
                                    value: record.value,
                                    timestamp: record.timestamp,
                                });
                            }
                        }
                    }
                    records
                }
                None => Vec::new(),
            };
            let resp = PeerMessage::ClusterRepairDataResp {
                request_id,
                map,
                bucket,
                records,
            };
            if let Err(e) = state.transport.send(&sender, resp).await {
                warn!("Repair data response to '{}' failed: {}", sender, e);
            }
        }

        // Consumed by the external anti-entropy repair scheduler.
        PeerMessage::ClusterMerkleRootResp { map, .. } => {
            debug!("Merkle root response for '{}' left to the repair scheduler", map);
        }
        PeerMessage::ClusterRepairDataResp { map, .. } => {
            debug!("Repair data response for '{}' left to the repair scheduler", map);
        }
    }
}

/// `CLUSTER_EVENT`: store iff this node is owner or backup for the key, feed
/// the subscription registry, and broadcast to local clients.
async fn handle_cluster_event(state: &Arc<ServerState>, payload: EventPayload) {
    if !state.partitions.is_local_replica(&payload.key) {
        debug!(
            "Ignoring cluster event for '{}/{}': not a replica",
            payload.map, payload.key
        );
        return;
    }
    let Some(op) = op_from_event(&payload) else {
        warn!(
            "Dropping cluster event for '{}/{}' with no record",
            payload.map, payload.key
        );
        return;
    };
    let ctx = OpContext {
        session_id: None,
        principal: None,
        authenticated: true,
        from_cluster: true,
        origin_sender: Some(payload.origin_node.clone()),
    };
    // Replication is suppressed: this change already came from a replica.
    if let Err(e) = pipeline::process_local(state, op, &ctx, false, None, false).await {
        warn!(
            "Cluster event apply failed for '{}/{}': {}",
            payload.map, payload.key, e
        );
    }
}

/// Reconstructs the equivalent op from an event payload.
fn op_from_event(payload: &EventPayload) -> Option<MapOp> {
    let (kind, timestamp) = if let Some(record) = &payload.record {
        (
            OpKind::Put {
                value: record.value.clone(),
                ttl_ms: record.ttl_ms,
            },
            record.timestamp.clone(),
        )
    } else if let Some(or_record) = &payload.or_record {
        let kind = match payload.event_type {
            EventType::Delete => OpKind::OrRemove {
                tag: or_record.tag.clone(),
            },
            _ => OpKind::OrAdd {
                value: or_record.value.clone(),
                tag: or_record.tag.clone(),
                ttl_ms: or_record.ttl_ms,
            },
        };
        (kind, or_record.timestamp.clone())
    } else {
        return None;
    };
    Some(MapOp {
        id: uuid::Uuid::new_v4().to_string(),
        map: payload.map.clone(),
        map_type: payload.map_type,
        key: payload.key.clone(),
        timestamp,
        kind,
        write_concern: None,
        timeout_ms: None,
    })
}

fn deliver_to_holder(state: &Arc<ServerState>, holder: &str, message: ServerMessage) {
    let Some((node, session_part)) = holder.rsplit_once(':') else {
        return;
    };
    if node != state.node_id {
        return;
    }
    let Ok(session_id) = session_part.parse::<u64>() else {
        return;
    };
    if let Some(session) = state.connections.get(session_id) {
        session.writer.write(&message, false);
    }
}
