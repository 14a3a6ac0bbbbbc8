// src/core/handler/pipeline.rs

//! The single-op write pipeline: context, before-interceptors, CRDT merge,
//! persistence, replication, broadcast, after-interceptors.

use super::broadcast;
use crate::core::crdt::{CrdtMap, LwwRecord, TaggedEntry};
use crate::core::errors::OlivineError;
use crate::core::interceptor::OpContext;
use crate::core::metrics;
use crate::core::cluster::PeerMessage;
use crate::core::protocol::{EventPayload, EventType, MapOp, OpKind, ServerMessage};
use crate::core::resolver::Resolution;
use crate::core::state::ServerState;
use crate::core::storage::ManagedMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// The outcome of one pipeline run.
#[derive(Debug)]
pub enum PipelineResult {
    /// The merge changed state; the event was (or will be) broadcast.
    Applied(EventPayload),
    /// The merge was a no-op (stale or duplicate); nothing to broadcast.
    Stale,
    /// A before-interceptor dropped the op silently.
    Dropped,
    /// The op was rejected; the reason is user-visible.
    Rejected(String),
}

/// Runs one op through the full pipeline.
///
/// With `batch_events` set, the resulting event is collected there instead of
/// being broadcast immediately; the batch processor delivers the whole buffer
/// as one `SERVER_BATCH_EVENT` afterwards. `sync_persist` awaits the storage
/// write and surfaces its error, which is what a `PERSISTED` concern needs.
/// `replicate_to_backups` is off for changes that arrived as `CLUSTER_EVENT`,
/// which would otherwise bounce between replicas.
pub async fn process_local(
    state: &Arc<ServerState>,
    op: MapOp,
    ctx: &OpContext,
    sync_persist: bool,
    batch_events: Option<&mut Vec<EventPayload>>,
    replicate_to_backups: bool,
) -> Result<PipelineResult, OlivineError> {
    // Before-interceptors may transform or silently drop the op; an error is
    // a rejection of this op only.
    let mut op = op;
    for interceptor in state.interceptors() {
        match interceptor.on_before_op(op, ctx).await {
            Ok(Some(transformed)) => op = transformed,
            Ok(None) => return Ok(PipelineResult::Dropped),
            Err(e) => return Ok(PipelineResult::Rejected(e.to_string())),
        }
    }

    let applied = match apply_to_map(state, &op, sync_persist).await {
        Ok(Some(applied)) => applied,
        Ok(None) => return Ok(PipelineResult::Stale),
        Err(OlivineError::ResolverRejected) => {
            metrics::OPS_REJECTED_TOTAL.inc();
            return Ok(PipelineResult::Rejected(
                OlivineError::ResolverRejected.to_string(),
            ));
        }
        Err(e @ OlivineError::MapTypeMismatch { .. }) => {
            metrics::OPS_REJECTED_TOTAL.inc();
            return Ok(PipelineResult::Rejected(e.to_string()));
        }
        Err(e) => return Err(e),
    };

    // Replication to backups is fire-and-forget; a slow or dead backup never
    // fails the write.
    if replicate_to_backups {
        replicate(state, &applied.payload);
    }

    let exclude = if ctx.from_cluster { None } else { ctx.session_id };
    match batch_events {
        Some(buffer) => buffer.push(applied.payload.clone()),
        None => broadcast::broadcast(
            state,
            &ServerMessage::ServerEvent {
                payload: applied.payload.clone(),
            },
            exclude,
        ),
    }

    // After-interceptors are fire-and-forget.
    let interceptors = state.interceptors();
    if !interceptors.is_empty() {
        let op = op.clone();
        let payload = applied.payload.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for interceptor in interceptors {
                interceptor.on_after_op(&op, &payload, &ctx).await;
            }
        });
    }

    Ok(PipelineResult::Applied(applied.payload))
}

struct AppliedOp {
    payload: EventPayload,
}

/// The CRDT merge plus its side effects: query-registry notification, size
/// metric, persistence, journal, Merkle, and search-index updates.
///
/// Returns `Ok(None)` when the merge was a no-op.
async fn apply_to_map(
    state: &Arc<ServerState>,
    op: &MapOp,
    sync_persist: bool,
) -> Result<Option<AppliedOp>, OlivineError> {
    let managed = state.storage.get_or_create(&op.map, op.map_type)?;
    managed.await_ready().await;

    let (applied, event_type, record, or_record) = match (&managed.map, &op.kind) {
        (CrdtMap::Lww(lww), OpKind::Put { value, ttl_ms }) => {
            let incoming = LwwRecord::with_ttl(value.clone(), op.timestamp.clone(), *ttl_ms);
            let existing = lww.get(&op.key);
            let (applied, old) = match existing {
                Some(existing_record) => match state.resolvers.resolve(
                    &op.map,
                    &existing_record,
                    &incoming,
                ) {
                    Some(Resolution::Rejected) => return Err(OlivineError::ResolverRejected),
                    Some(Resolution::KeepExisting) => (false, Some(existing_record)),
                    Some(Resolution::UseIncoming) => {
                        lww.put_resolved(&op.key, incoming.clone());
                        (true, Some(existing_record))
                    }
                    None => {
                        let outcome = lww.merge(&op.key, incoming.clone());
                        (outcome.applied, outcome.old)
                    }
                },
                None => {
                    let outcome = lww.merge(&op.key, incoming.clone());
                    (outcome.applied, outcome.old)
                }
            };
            let event_type = if incoming.is_tombstone() {
                EventType::Delete
            } else if old.as_ref().is_none_or(|o| o.is_tombstone()) {
                EventType::Put
            } else {
                EventType::Update
            };
            (applied, event_type, Some(incoming), None)
        }
        (CrdtMap::Or(or), OpKind::OrAdd { value, tag, ttl_ms }) => {
            let entry = TaggedEntry {
                value: value.clone(),
                timestamp: op.timestamp.clone(),
                tag: tag.clone(),
                ttl_ms: *ttl_ms,
            };
            let applied = or.apply_add(&op.key, entry.clone());
            (applied, EventType::Put, None, Some(entry))
        }
        (CrdtMap::Or(or), OpKind::OrRemove { tag }) => {
            let applied = or.apply_remove(&op.key, tag, op.timestamp.clone()).is_some();
            let tombstone_entry = TaggedEntry {
                value: Value::Null,
                timestamp: op.timestamp.clone(),
                tag: tag.clone(),
                ttl_ms: None,
            };
            (applied, EventType::Delete, None, Some(tombstone_entry))
        }
        // Shape mismatches that survive op validation are protocol errors.
        _ => {
            return Err(OlivineError::MapTypeMismatch {
                map: op.map.clone(),
                stored: managed.map.map_type().to_string(),
                requested: op.map_type.to_string(),
            });
        }
    };

    if !applied {
        debug!(
            "Stale {} for '{}/{}' ignored by merge",
            op.kind_name(),
            op.map,
            op.key
        );
        return Ok(None);
    }

    metrics::OPS_APPLIED_TOTAL.inc();

    let current_value = visible_value(&managed, &op.key);

    // (a) Incremental query delivery on the changed key only.
    route_registry_deltas(state, &managed.name, &op.key, current_value.as_ref(), op);

    // (b) Map size metric.
    state.storage.update_size_metric(&managed);

    // (c) Persistence: synchronous when the caller's Write Concern demands
    // it, fire-and-forget otherwise.
    if sync_persist {
        state.storage.persist_key(&managed, &op.key).await?;
    } else {
        let storage_state = state.clone();
        let managed_bg = managed.clone();
        let key = op.key.clone();
        tokio::spawn(async move {
            if let Err(e) = storage_state.storage.persist_key(&managed_bg, &key).await {
                error!("Background persist of '{}/{}' failed: {}", managed_bg.name, key, e);
            }
        });
    }

    // (d) Journal entry.
    if let Some(entry) = state
        .journal
        .append(&op.map, &op.key, event_type, op.timestamp.clone())
    {
        let frame = ServerMessage::JournalEvent { entry };
        for session_id in state.journal.subscribers() {
            if let Some(session) = state.connections.get(session_id) {
                session.writer.write(&frame, false);
            }
        }
    }

    // (e) Merkle tree update.
    let merkle_bytes = serde_json::to_vec(&current_value).unwrap_or_default();
    managed.merkle.update(&op.key, &merkle_bytes);

    // (f) Search index.
    if state.search_enabled_for(&op.map) {
        state
            .search
            .index_record(&op.map, &op.key, current_value.as_ref());
        if let Some(value) = current_value.as_ref() {
            notify_search_subscribers(state, &op.map, &op.key, value, &op.timestamp);
        }
    }

    let payload = EventPayload {
        map: op.map.clone(),
        map_type: op.map_type,
        key: op.key.clone(),
        event_type,
        record,
        or_record,
        origin_node: state.node_id.clone(),
    };
    Ok(Some(AppliedOp { payload }))
}

/// The key's visible value after an apply: LWW non-tombstone value, or the
/// OR key's aggregated surviving values.
pub fn visible_value(managed: &ManagedMap, key: &str) -> Option<Value> {
    match &managed.map {
        CrdtMap::Lww(lww) => lww
            .get(key)
            .filter(|record| !record.is_tombstone())
            .map(|record| record.value),
        CrdtMap::Or(or) => {
            let entries = or.get(key);
            match entries.len() {
                0 => None,
                1 => Some(entries.into_iter().next().expect("len checked").value),
                _ => Some(Value::Array(entries.into_iter().map(|e| e.value).collect())),
            }
        }
    }
}

/// Feeds the change into every live subscription and writes the resulting
/// deltas to their owning sessions.
fn route_registry_deltas(
    state: &Arc<ServerState>,
    map: &str,
    key: &str,
    current: Option<&Value>,
    op: &MapOp,
) {
    for (session_id, delta) in state
        .query_registry
        .process_change(map, key, current, &op.timestamp)
    {
        if let Some(session) = state.connections.get(session_id) {
            session.writer.write(&delta, false);
        }
    }
}

fn notify_search_subscribers(
    state: &Arc<ServerState>,
    map: &str,
    key: &str,
    value: &Value,
    timestamp: &crate::core::crdt::Timestamp,
) {
    for sub in state.search_subs.matching(map, value) {
        if let Some(session) = state.connections.get(sub.session_id) {
            session.writer.write(
                &ServerMessage::SearchResp {
                    request_id: sub.request_id.clone(),
                    results: vec![crate::core::query::QueryRow {
                        key: key.to_string(),
                        value: value.clone(),
                        timestamp: timestamp.clone(),
                    }],
                },
                false,
            );
        }
    }
}

/// Pushes the applied event to the key's backup nodes, fire-and-forget.
fn replicate(state: &Arc<ServerState>, payload: &EventPayload) {
    if !state.config.cluster.enabled || state.cluster.size() <= 1 {
        return;
    }
    let partition = state.partitions.partition_for_key(&payload.key);
    let backups = state.partitions.backups(partition);
    if backups.is_empty() {
        return;
    }
    let message = PeerMessage::ClusterEvent {
        payload: payload.clone(),
    };
    let transport = state.transport.clone();
    let local = state.node_id.clone();
    tokio::spawn(async move {
        for backup in backups {
            if backup == local {
                continue;
            }
            if let Err(e) = transport.send(&backup, message.clone()).await {
                warn!("Replication to backup '{}' failed: {}", backup, e);
            }
        }
    });
}

impl MapOp {
    /// Short name of the op kind for logs.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            OpKind::Put { .. } => "PUT",
            OpKind::OrAdd { .. } => "OR_ADD",
            OpKind::OrRemove { .. } => "OR_REMOVE",
        }
    }
}
