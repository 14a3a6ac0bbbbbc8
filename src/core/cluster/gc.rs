// src/core/cluster/gc.rs

//! Distributed garbage-collection consensus for CRDT tombstone reclamation.
//!
//! Each round: every node computes its local minimum HLC (the earliest
//! last-active HLC across its sessions, or `now()` with none connected) and
//! reports it to the leader, the lexicographically smallest member id. With
//! reports from all members, the leader subtracts the configured tombstone
//! age from the global minimum, broadcasts `CLUSTER_GC_COMMIT{safe}`, and
//! every node prunes locally. Nothing with an HLC above `safe` is ever
//! touched.

use super::PeerMessage;
use crate::core::crdt::{CrdtMap, Timestamp, wall_clock_ms};
use crate::core::handler::{broadcast, pipeline};
use crate::core::interceptor::OpContext;
use crate::core::metrics;
use crate::core::protocol::{MapOp, OpKind, ServerMessage};
use crate::core::state::ServerState;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs one consensus round from this node's perspective.
pub async fn run_round(state: &Arc<ServerState>) {
    let min_hlc = state.min_session_hlc();

    if !state.config.cluster.enabled || state.cluster.size() <= 1 {
        let safe = safe_point(&min_hlc, state.config.gc.age.as_millis() as i64);
        run_local_gc(state, &safe).await;
        return;
    }

    let leader = state.cluster.leader();
    if leader == state.node_id {
        handle_report(state, state.node_id.clone(), min_hlc).await;
    } else {
        let report = PeerMessage::ClusterGcReport {
            node_id: state.node_id.clone(),
            min_hlc,
        };
        if let Err(e) = state.transport.send(&leader, report).await {
            warn!("GC report to leader '{}' failed: {}", leader, e);
        }
    }
}

/// Leader-side report intake. Fires the commit once every current member has
/// reported.
pub async fn handle_report(state: &Arc<ServerState>, node_id: String, min_hlc: Timestamp) {
    if !state.cluster.is_leader() {
        debug!("Ignoring GC report from '{}': not the leader", node_id);
        return;
    }
    state.gc_reports.insert(node_id, min_hlc);

    let members = state.cluster.members();
    let all_reported = members
        .iter()
        .all(|member| state.gc_reports.contains_key(member));
    if !all_reported {
        return;
    }

    let global = state
        .gc_reports
        .iter()
        .map(|e| e.value().clone())
        .min()
        .expect("at least the leader reported");
    let safe = safe_point(&global, state.config.gc.age.as_millis() as i64);
    info!(
        "GC consensus complete: global minimum {}, safe point {}",
        global, safe
    );

    state
        .transport
        .broadcast(PeerMessage::ClusterGcCommit { safe: safe.clone() })
        .await;
    run_local_gc(state, &safe).await;

    // Reports are per-round.
    state.gc_reports.clear();
}

/// `safe = {millis: global.millis - gc_age_ms, counter: 0, node_id: global.node_id}`.
fn safe_point(global: &Timestamp, gc_age_ms: i64) -> Timestamp {
    Timestamp {
        millis: global.millis.saturating_sub(gc_age_ms),
        counter: 0,
        node_id: global.node_id.clone(),
    }
}

/// Local GC: expire TTLs, then prune tombstones older than `safe`.
pub async fn run_local_gc(state: &Arc<ServerState>, safe: &Timestamp) {
    let now = wall_clock_ms();
    let ctx = OpContext {
        session_id: None,
        principal: None,
        authenticated: true,
        from_cluster: false,
        origin_sender: None,
    };

    for managed in state.storage.all_maps() {
        managed.await_ready().await;

        // TTL expiry first: a fresh tombstone written at the expiration
        // instant survives the prune below and wins against any replica
        // still carrying the expired value, which is what prevents
        // resurrection.
        match &managed.map {
            CrdtMap::Lww(lww) => {
                for (key, record) in lww.expired_records(now) {
                    let ttl = record.ttl_ms.unwrap_or(0) as i64;
                    let expired_at = Timestamp {
                        millis: record.timestamp.millis.saturating_add(ttl),
                        counter: record.timestamp.counter.saturating_add(1),
                        node_id: record.timestamp.node_id.clone(),
                    };
                    let op = MapOp {
                        id: uuid::Uuid::new_v4().to_string(),
                        map: managed.name.clone(),
                        map_type: managed.map.map_type(),
                        key,
                        timestamp: expired_at,
                        kind: OpKind::Put {
                            value: Value::Null,
                            ttl_ms: None,
                        },
                        write_concern: None,
                        timeout_ms: None,
                    };
                    metrics::GC_EXPIRED_TOTAL.inc();
                    if let Err(e) = pipeline::process_local(state, op, &ctx, false, None, true).await
                    {
                        warn!("TTL expiry failed in '{}': {}", managed.name, e);
                    }
                }
            }
            CrdtMap::Or(or) => {
                for (key, entry) in or.expired_entries(now) {
                    let ttl = entry.ttl_ms.unwrap_or(0) as i64;
                    let expired_at = Timestamp {
                        millis: entry.timestamp.millis.saturating_add(ttl),
                        counter: entry.timestamp.counter.saturating_add(1),
                        node_id: entry.timestamp.node_id.clone(),
                    };
                    let op = MapOp {
                        id: uuid::Uuid::new_v4().to_string(),
                        map: managed.name.clone(),
                        map_type: managed.map.map_type(),
                        key,
                        timestamp: expired_at,
                        kind: OpKind::OrRemove { tag: entry.tag },
                        write_concern: None,
                        timeout_ms: None,
                    };
                    metrics::GC_EXPIRED_TOTAL.inc();
                    if let Err(e) = pipeline::process_local(state, op, &ctx, false, None, true).await
                    {
                        warn!("OR TTL expiry failed in '{}': {}", managed.name, e);
                    }
                }
            }
        }

        // Tombstone prune.
        let pruned = match &managed.map {
            CrdtMap::Lww(lww) => {
                let keys = lww.prune_tombstones(safe);
                for key in &keys {
                    managed.merkle.remove(key);
                }
                keys.len()
            }
            CrdtMap::Or(or) => or.prune_tombstones(safe),
        };
        if pruned > 0 {
            metrics::GC_PRUNED_TOTAL.inc_by(pruned as f64);
            info!("Pruned {} tombstones from '{}'", pruned, managed.name);
            broadcast::broadcast(
                state,
                &ServerMessage::GcPrune {
                    map: managed.name.clone(),
                    pruned,
                    safe: safe.clone(),
                },
                None,
            );
        }
    }
}
