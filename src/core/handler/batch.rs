// src/core/handler/batch.rs

//! Fans a client batch into the operation pipeline with admission-control
//! backpressure, partition-aware forwarding, batched broadcast, and
//! Write-Concern acknowledgement.

use super::pipeline::{self, PipelineResult};
use crate::connection::Session;
use crate::core::cluster::PeerMessage;
use crate::core::interceptor::OpContext;
use crate::core::metrics;
use crate::core::protocol::{
    EventPayload, MapOp, OpKind, OpResult, ServerMessage, WriteConcern,
};
use crate::core::permissions::Permission;
use crate::core::state::ServerState;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// The permission an op needs: removals need `REMOVE`, everything else `PUT`.
fn required_permission(op: &MapOp) -> Permission {
    match &op.kind {
        OpKind::Put { value, .. } if value.is_null() => Permission::REMOVE,
        OpKind::OrRemove { .. } => Permission::REMOVE,
        _ => Permission::PUT,
    }
}

/// Entry point for `OP_BATCH` (and single `CLIENT_OP`, which is a batch of
/// one). Validates and admits synchronously, acks the early bucket, then
/// schedules the processing task.
pub async fn handle_op_batch(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    ops: Vec<MapOp>,
    batch_concern: Option<WriteConcern>,
    batch_timeout_ms: Option<u64>,
) {
    let principal = session.principal();

    // 1. Fast validation pass: permission and shape. Denied ops are counted
    //    and dropped; the batch continues with the survivors.
    let mut accepted = Vec::with_capacity(ops.len());
    let mut denied = 0usize;
    for op in ops {
        if let Err(reason) = op.validate() {
            denied += 1;
            debug!("Dropping malformed op '{}': {}", op.id, reason);
            continue;
        }
        let action = required_permission(&op);
        if state
            .policy
            .check(principal.as_deref(), &op.map, action)
            .is_err()
        {
            denied += 1;
            metrics::OPS_REJECTED_TOTAL.inc();
            continue;
        }
        accepted.push(op);
    }
    if denied > 0 {
        session.writer.write(
            &ServerMessage::error(403, format!("Partial batch failure: {denied} ops denied")),
            true,
        );
    }
    if accepted.is_empty() {
        return;
    }

    // 2. Classify by effective concern.
    let default_timeout = state.config.pipeline.write_concern_timeout;
    let mut early_last_id = None;
    let mut deferred: Vec<(String, WriteConcern, oneshot::Receiver<OpResult>)> = Vec::new();
    for op in &accepted {
        let concern = op
            .write_concern
            .or(batch_concern)
            .unwrap_or(WriteConcern::Memory);
        if concern.is_early_ack() {
            if concern != WriteConcern::FireAndForget {
                early_last_id = Some(op.id.clone());
            }
        } else {
            let timeout = op
                .timeout_ms
                .or(batch_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(default_timeout);
            let rx = state.write_concern.register(&op.id, concern, timeout);
            deferred.push((op.id.clone(), concern, rx));
        }
    }

    // 3. One MEMORY-level ack for the early bucket, before any processing.
    if let Some(last_id) = early_last_id {
        session.writer.write(
            &ServerMessage::OpAck {
                last_id,
                achieved_level: WriteConcern::Memory,
                results: None,
            },
            false,
        );
    }

    // 4. Aggregate ack for the deferred bucket once every pending write
    //    resolves (success, failure, or timeout).
    if !deferred.is_empty() {
        let ack_session = session.clone();
        let (ids, receivers): (Vec<_>, Vec<_>) = deferred
            .into_iter()
            .map(|(id, _, rx)| (id, rx))
            .unzip();
        tokio::spawn(async move {
            let results: Vec<OpResult> = join_all(receivers)
                .await
                .into_iter()
                .zip(ids.iter())
                .map(|(result, id)| {
                    result.unwrap_or(OpResult {
                        id: id.clone(),
                        success: false,
                        error: Some("Write concern tracking aborted".into()),
                        achieved_level: WriteConcern::Memory,
                    })
                })
                .collect();
            let achieved = results
                .iter()
                .map(|r| r.achieved_level)
                .min()
                .unwrap_or(WriteConcern::Memory);
            let last_id = ids.last().cloned().unwrap_or_default();
            ack_session.writer.write(
                &ServerMessage::OpAck {
                    last_id,
                    achieved_level: achieved,
                    results: Some(results),
                },
                false,
            );
        });
    }

    // 5. Processing: deferred to a task, unless backpressure asks for a
    //    synchronous drain.
    let concern_of = move |op: &MapOp| {
        op.write_concern
            .or(batch_concern)
            .unwrap_or(WriteConcern::Memory)
    };
    if state.regulator.should_force_sync() {
        metrics::BATCH_SYNC_FORCED_TOTAL.inc();
        process_batch(state, session, accepted, concern_of).await;
    } else {
        let state = state.clone();
        let session = session.clone();
        tokio::spawn(async move {
            process_batch(&state, &session, accepted, concern_of).await;
        });
    }
}

/// The async half: admission wait, per-op pipeline or forward, batched
/// broadcast, `REPLICATED`/`PERSISTED` notifications.
async fn process_batch(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    ops: Vec<MapOp>,
    concern_of: impl Fn(&MapOp) -> WriteConcern,
) {
    if !state.regulator.register_pending() {
        metrics::BATCH_WAITS_TOTAL.inc();
        if !state
            .regulator
            .wait_for_capacity(state.config.pipeline.capacity_wait)
            .await
        {
            metrics::BATCH_TIMEOUTS_TOTAL.inc();
            warn!("Batch of {} ops rejected: pipeline saturated", ops.len());
            for op in &ops {
                state.write_concern.fail(&op.id, "Server overloaded");
            }
            session
                .writer
                .write(&ServerMessage::error(503, "Server overloaded"), true);
            return;
        }
    }

    let ctx = OpContext {
        session_id: Some(session.id),
        principal: session.principal(),
        authenticated: session.is_authenticated(),
        from_cluster: false,
        origin_sender: Some(session.id.to_string()),
    };

    let mut batch_events: Vec<EventPayload> = Vec::new();
    let mut local_applied: Vec<(String, WriteConcern)> = Vec::new();
    let cluster_routing = state.config.cluster.enabled && state.cluster.size() > 1;

    for op in ops {
        let concern = concern_of(&op);
        if cluster_routing && !state.partitions.is_local_owner(&op.key) {
            forward_to_owner(state, session, op, concern).await;
            continue;
        }

        let sync_persist = concern >= WriteConcern::Persisted;
        let op_id = op.id.clone();
        let op_map = op.map.clone();
        let op_key = op.key.clone();
        match pipeline::process_local(state, op, &ctx, sync_persist, Some(&mut batch_events), true)
            .await
        {
            Ok(PipelineResult::Applied(_)) | Ok(PipelineResult::Stale) => {
                state.write_concern.notify(&op_id, WriteConcern::Applied);
                local_applied.push((op_id, concern));
            }
            Ok(PipelineResult::Dropped) => {
                // Silent interceptor drop still resolves the pending write.
                state.write_concern.notify(&op_id, WriteConcern::Applied);
                local_applied.push((op_id, concern));
            }
            Ok(PipelineResult::Rejected(reason)) => {
                state.write_concern.fail(&op_id, &reason);
                if reason == crate::core::errors::OlivineError::ResolverRejected.to_string() {
                    session.writer.write(
                        &ServerMessage::MergeRejected {
                            id: op_id,
                            map: op_map,
                            key: op_key,
                        },
                        false,
                    );
                } else {
                    session.writer.write(
                        &ServerMessage::OpRejected {
                            id: op_id,
                            reason,
                        },
                        false,
                    );
                }
            }
            Err(e) => {
                state.write_concern.fail(&op_id, &e.to_string());
                warn!("Op '{}' failed in pipeline: {}", op_id, e);
            }
        }
    }

    // Deliver the collected events as one SERVER_BATCH_EVENT, then mark the
    // locals REPLICATED (and PERSISTED where the synchronous storage write
    // already succeeded).
    if !batch_events.is_empty() {
        super::broadcast::broadcast_batch(state, &batch_events, Some(session.id));
    }
    for (op_id, concern) in local_applied {
        state.write_concern.notify(&op_id, WriteConcern::Replicated);
        if concern >= WriteConcern::Persisted {
            state.write_concern.notify(&op_id, WriteConcern::Persisted);
        }
    }

    state.regulator.complete();
}

/// Routes an op to its partition owner. Forwarding marks `REPLICATED`; there
/// is no peer acknowledgement, so this is a weaker guarantee than a local
/// apply.
async fn forward_to_owner(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    op: MapOp,
    _concern: WriteConcern,
) {
    let partition = state.partitions.partition_for_key(&op.key);
    let owner = state.partitions.owner(partition);
    let op_id = op.id.clone();
    let message = PeerMessage::OpForward {
        op,
        origin_node: state.node_id.clone(),
        origin_session: Some(session.id),
        replication: false,
        migration: false,
    };
    match state.transport.send(&owner, message).await {
        Ok(()) => {
            metrics::OPS_FORWARDED_TOTAL.inc();
            state.write_concern.notify(&op_id, WriteConcern::Applied);
            state.write_concern.notify(&op_id, WriteConcern::Replicated);
        }
        Err(e) => {
            warn!("Forwarding op '{}' to '{}' failed: {}", op_id, owner, e);
            state.write_concern.fail(&op_id, &e.to_string());
        }
    }
}
