// src/core/handler/adapters.rs

//! Thin protocol verbs over the domain managers: locks, topics, counters,
//! resolvers, journal, entry processors, partition map, search, and the
//! Merkle sync handshake. Each verb is gated by a permission check.

use super::pipeline::{self, PipelineResult, visible_value};
use crate::connection::Session;
use crate::core::cluster::PeerMessage;
use crate::core::crdt::{CrdtMap, MapType};
use crate::core::errors::OlivineError;
use crate::core::interceptor::OpContext;
use crate::core::locks::{DEFAULT_LOCK_TTL, LockGrant};
use crate::core::metrics;
use crate::core::protocol::{MapOp, OpKind, OrDiffEntry, ServerMessage, WriteConcern};
use crate::core::permissions::Permission;
use crate::core::query::QueryRow;
use crate::core::search::SearchSubscription;
use crate::core::state::ServerState;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_SEARCH_LIMIT: usize = 50;

fn deny(session: &Arc<Session>, e: &OlivineError) {
    session
        .writer
        .write(&ServerMessage::error(403, e.to_string()), false);
}

// --- Locks -----------------------------------------------------------------

/// Lock ownership is partitioned by lock name; requests for remotely owned
/// names are forwarded to the owner over the cluster bus.
pub async fn handle_lock_request(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    request_id: String,
    name: String,
    ttl_ms: Option<u64>,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), &name, Permission::PUT)
    {
        deny(session, &e);
        return;
    }
    let ttl = ttl_ms.map(Duration::from_millis).unwrap_or(DEFAULT_LOCK_TTL);

    if state.config.cluster.enabled
        && state.cluster.size() > 1
        && !state.partitions.is_local_owner(&name)
    {
        let owner = state
            .partitions
            .owner(state.partitions.partition_for_key(&name));
        let message = PeerMessage::ClusterLockReq {
            origin_node: state.node_id.clone(),
            session_id: session.id,
            request_id,
            name,
            ttl_ms: ttl.as_millis() as u64,
        };
        if let Err(e) = state.transport.send(&owner, message).await {
            warn!("Lock request forwarding to '{}' failed: {}", owner, e);
        }
        return;
    }

    let holder = state.local_holder(session.id);
    if let Some(grant) = state.locks.acquire(&name, &holder, &request_id, ttl) {
        route_lock_grant(state, grant).await;
    }
}

pub async fn handle_lock_release(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    request_id: String,
    name: String,
) {
    if state.config.cluster.enabled
        && state.cluster.size() > 1
        && !state.partitions.is_local_owner(&name)
    {
        let owner = state
            .partitions
            .owner(state.partitions.partition_for_key(&name));
        let message = PeerMessage::ClusterLockRelease {
            origin_node: state.node_id.clone(),
            session_id: session.id,
            request_id,
            name,
        };
        if let Err(e) = state.transport.send(&owner, message).await {
            warn!("Lock release forwarding to '{}' failed: {}", owner, e);
        }
        return;
    }

    let holder = state.local_holder(session.id);
    let next = state.locks.release(&name, &holder);
    session.writer.write(
        &ServerMessage::LockReleased { request_id, name },
        false,
    );
    if let Some(grant) = next {
        route_lock_grant(state, grant).await;
    }
}

/// Routes a grant to its holder: a local session gets `LOCK_GRANTED`
/// directly; a remote holder's node gets `CLUSTER_LOCK_GRANTED`.
pub async fn route_lock_grant(state: &Arc<ServerState>, grant: LockGrant) {
    let Some((node, session_part)) = grant.holder.rsplit_once(':') else {
        warn!("Dropping lock grant with malformed holder '{}'", grant.holder);
        return;
    };
    if node == state.node_id {
        let Ok(session_id) = session_part.parse::<u64>() else {
            return;
        };
        if let Some(session) = state.connections.get(session_id) {
            session.writer.write(
                &ServerMessage::LockGranted {
                    request_id: grant.request_id,
                    name: grant.name,
                    fencing_token: grant.fencing_token,
                },
                false,
            );
        } else {
            // Holder vanished between grant and delivery; release the lock so
            // the next waiter is not starved.
            if let Some(next) = state.locks.release(&grant.name, &grant.holder) {
                Box::pin(route_lock_grant(state, next)).await;
            }
        }
        return;
    }
    let message = PeerMessage::ClusterLockGranted {
        holder: grant.holder.clone(),
        request_id: grant.request_id,
        name: grant.name,
        fencing_token: grant.fencing_token,
    };
    if let Err(e) = state.transport.send(&node.to_string(), message).await {
        warn!("Lock grant delivery to '{}' failed: {}", node, e);
    }
}

// --- Topics ----------------------------------------------------------------

pub fn handle_topic_sub(state: &Arc<ServerState>, session: &Arc<Session>, topic: &str) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), topic, Permission::READ)
    {
        deny(session, &e);
        return;
    }
    state.topics.subscribe(topic, session.id);
}

pub fn handle_topic_unsub(state: &Arc<ServerState>, session: &Arc<Session>, topic: &str) {
    state.topics.unsubscribe(topic, session.id);
}

/// Publishes to local subscribers and fans out to peers. Peer deliveries are
/// local-only on the receiving side, which prevents forwarding loops.
pub async fn handle_topic_pub(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    topic: String,
    payload: Value,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), &topic, Permission::PUT)
    {
        deny(session, &e);
        return;
    }
    deliver_topic_locally(state, &topic, &payload, Some(session.id));
    if state.config.cluster.enabled && state.cluster.size() > 1 {
        state
            .transport
            .broadcast(PeerMessage::ClusterTopicPub {
                topic,
                payload,
                original_sender: state.local_holder(session.id),
            })
            .await;
    }
}

pub fn deliver_topic_locally(
    state: &Arc<ServerState>,
    topic: &str,
    payload: &Value,
    exclude: Option<u64>,
) {
    let message = ServerMessage::TopicMessage {
        topic: topic.to_string(),
        payload: payload.clone(),
    };
    for session_id in state.topics.local_subscribers(topic) {
        if Some(session_id) == exclude {
            continue;
        }
        if let Some(subscriber) = state.connections.get(session_id) {
            subscriber.writer.write(&message, false);
        }
    }
}

// --- Counters --------------------------------------------------------------

pub fn handle_counter_request(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    name: &str,
    delta: i64,
) {
    let action = if delta == 0 {
        Permission::READ
    } else {
        Permission::PUT
    };
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), name, action)
    {
        deny(session, &e);
        return;
    }
    let value = if delta == 0 {
        state.counters.value(name)
    } else {
        state.counters.apply_delta(name, &state.node_id, delta)
    };
    state.counters.subscribe(name, session.id);
    let update = ServerMessage::CounterUpdate {
        name: name.to_string(),
        value,
    };
    for subscriber_id in state.counters.subscribers(name) {
        if let Some(subscriber) = state.connections.get(subscriber_id) {
            subscriber.writer.write(&update, false);
        }
    }
}

pub fn handle_counter_sync(state: &Arc<ServerState>, session: &Arc<Session>, name: &str) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), name, Permission::READ)
    {
        deny(session, &e);
        return;
    }
    session.writer.write(
        &ServerMessage::CounterUpdate {
            name: name.to_string(),
            value: state.counters.value(name),
        },
        false,
    );
}

// --- Resolvers -------------------------------------------------------------

pub fn handle_register_resolver(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    map: &str,
    strategy: crate::core::protocol::ResolverStrategy,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), map, Permission::PUT)
    {
        deny(session, &e);
        return;
    }
    state.resolvers.register(map, strategy);
    reply_resolver_list(state, session);
}

pub fn handle_unregister_resolver(state: &Arc<ServerState>, session: &Arc<Session>, map: &str) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), map, Permission::PUT)
    {
        deny(session, &e);
        return;
    }
    state.resolvers.unregister(map);
    reply_resolver_list(state, session);
}

pub fn reply_resolver_list(state: &Arc<ServerState>, session: &Arc<Session>) {
    let mut resolvers = state.resolvers.list();
    resolvers.sort_by(|a, b| a.0.cmp(&b.0));
    session
        .writer
        .write(&ServerMessage::ResolverList { resolvers }, false);
}

// --- Journal ---------------------------------------------------------------

pub fn handle_journal_subscribe(state: &Arc<ServerState>, session: &Arc<Session>) {
    state.journal.subscribe(session.id);
}

pub fn handle_journal_unsubscribe(state: &Arc<ServerState>, session: &Arc<Session>) {
    state.journal.unsubscribe(session.id);
}

pub fn handle_journal_read(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    from_seq: u64,
    limit: usize,
) {
    let (entries, has_more) = state.journal.read(from_seq, limit);
    session
        .writer
        .write(&ServerMessage::JournalReadResponse { entries, has_more }, false);
}

// --- Entry processors ------------------------------------------------------

/// Applies a named server-side transformation to a record and runs the
/// result through the normal pipeline, so every side effect applies.
pub async fn handle_entry_process(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    map: String,
    map_type: MapType,
    key: String,
    processor: &str,
    args: Value,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), &map, Permission::PUT)
    {
        deny(session, &e);
        return;
    }

    let current = state
        .storage
        .get(&map)
        .and_then(|managed| visible_value(&managed, &key));
    let next = match apply_processor(processor, current, &args) {
        Ok(next) => next,
        Err(e) => {
            session
                .writer
                .write(&ServerMessage::error(400, e.to_string()), false);
            return;
        }
    };

    let op = MapOp {
        id: uuid::Uuid::new_v4().to_string(),
        map,
        map_type,
        key,
        timestamp: state.clock.tick(),
        kind: OpKind::Put {
            value: next,
            ttl_ms: None,
        },
        write_concern: None,
        timeout_ms: None,
    };
    let ctx = OpContext {
        session_id: Some(session.id),
        principal: session.principal(),
        authenticated: true,
        from_cluster: false,
        origin_sender: Some(session.id.to_string()),
    };
    let op_id = op.id.clone();
    match pipeline::process_local(state, op, &ctx, false, None, true).await {
        Ok(PipelineResult::Applied(_)) | Ok(PipelineResult::Stale) | Ok(PipelineResult::Dropped) => {
            session.writer.write(
                &ServerMessage::OpAck {
                    last_id: op_id,
                    achieved_level: WriteConcern::Applied,
                    results: None,
                },
                false,
            );
        }
        Ok(PipelineResult::Rejected(reason)) => {
            session
                .writer
                .write(&ServerMessage::OpRejected { id: op_id, reason }, false);
        }
        Err(e) => {
            warn!("Entry processor failed for '{}': {}", op_id, e);
            session.writer.write(
                &ServerMessage::OpRejected {
                    id: op_id,
                    reason: e.to_string(),
                },
                false,
            );
        }
    }
}

pub async fn handle_entry_process_batch(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    map: String,
    map_type: MapType,
    keys: Vec<String>,
    processor: &str,
    args: Value,
) {
    for key in keys {
        handle_entry_process(
            state,
            session,
            map.clone(),
            map_type,
            key,
            processor,
            args.clone(),
        )
        .await;
    }
}

fn apply_processor(
    processor: &str,
    current: Option<Value>,
    args: &Value,
) -> Result<Value, OlivineError> {
    match processor {
        "increment" => {
            let step = args.as_i64().unwrap_or(1);
            let base = current.as_ref().and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::from(base + step))
        }
        "merge" => {
            let mut base = match current {
                Some(Value::Object(fields)) => fields,
                _ => serde_json::Map::new(),
            };
            if let Value::Object(overlay) = args {
                for (name, value) in overlay {
                    base.insert(name.clone(), value.clone());
                }
            }
            Ok(Value::Object(base))
        }
        "delete_fields" => {
            let doomed: Vec<&str> = args
                .as_array()
                .map(|names| names.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let mut base = match current {
                Some(Value::Object(fields)) => fields,
                Some(other) => return Ok(other),
                None => return Ok(Value::Null),
            };
            base.retain(|name, _| !doomed.contains(&name.as_str()));
            Ok(Value::Object(base))
        }
        other => Err(OlivineError::UnknownProcessor(other.to_string())),
    }
}

// --- Partition map ---------------------------------------------------------

/// Replies with the partition map only when the server's version exceeds the
/// client's.
pub fn handle_partition_map_request(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    current_version: u64,
) {
    let (version, partitions) = state.partitions.partition_map();
    if version > current_version {
        session
            .writer
            .write(&ServerMessage::PartitionMap { version, partitions }, false);
    } else {
        debug!(
            "Session {} already has partition map version {}",
            session.id, current_version
        );
    }
}

// --- Search ----------------------------------------------------------------

pub async fn handle_search(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    request_id: String,
    map: String,
    text: &str,
    limit: Option<usize>,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), &map, Permission::READ)
    {
        deny(session, &e);
        return;
    }
    if !state.search_enabled_for(&map) {
        session.writer.write(
            &ServerMessage::error(400, format!("Search is not enabled for map '{map}'")),
            false,
        );
        return;
    }
    let results = search_rows(state, &map, text, limit.unwrap_or(DEFAULT_SEARCH_LIMIT)).await;
    session
        .writer
        .write(&ServerMessage::SearchResp { request_id, results }, false);
}

pub async fn handle_search_sub(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    request_id: String,
    map: String,
    text: String,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), &map, Permission::READ)
    {
        deny(session, &e);
        return;
    }
    if !state.search_enabled_for(&map) {
        session.writer.write(
            &ServerMessage::error(400, format!("Search is not enabled for map '{map}'")),
            false,
        );
        return;
    }
    let results = search_rows(state, &map, &text, DEFAULT_SEARCH_LIMIT).await;
    state.search_subs.register(SearchSubscription {
        request_id: request_id.clone(),
        session_id: session.id,
        map,
        text,
    });
    session
        .writer
        .write(&ServerMessage::SearchResp { request_id, results }, false);
}

pub fn handle_search_unsub(state: &Arc<ServerState>, request_id: &str) {
    state.search_subs.unregister(request_id);
}

pub async fn search_rows(
    state: &Arc<ServerState>,
    map: &str,
    text: &str,
    limit: usize,
) -> Vec<QueryRow> {
    let keys = state.search.search(map, text, limit);
    let Some(managed) = state.storage.get(map) else {
        return Vec::new();
    };
    managed.await_ready().await;
    keys.into_iter()
        .filter_map(|key| {
            visible_value(&managed, &key).map(|value| QueryRow {
                key,
                value,
                timestamp: state.clock.current(),
            })
        })
        .collect()
}

// --- Merkle sync -----------------------------------------------------------

pub async fn handle_sync_init(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    map: &str,
    want_type: MapType,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), map, Permission::READ)
    {
        deny(session, &e);
        return;
    }
    let Some(managed) = state.storage.get(map) else {
        session.writer.write(
            &ServerMessage::SyncResetRequired {
                map: map.to_string(),
            },
            false,
        );
        return;
    };
    if managed.map.map_type() != want_type {
        session.writer.write(
            &ServerMessage::SyncResetRequired {
                map: map.to_string(),
            },
            false,
        );
        return;
    }
    managed.await_ready().await;
    session.writer.write(
        &ServerMessage::SyncRespRoot {
            map: map.to_string(),
            root: managed.merkle.root(),
        },
        false,
    );
    session.writer.write(
        &ServerMessage::SyncRespBuckets {
            map: map.to_string(),
            buckets: managed.merkle.buckets(),
        },
        false,
    );
}

pub async fn handle_merkle_req_bucket(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    map: &str,
    bucket: u32,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), map, Permission::READ)
    {
        deny(session, &e);
        return;
    }
    let Some(managed) = state.storage.get(map) else {
        session.writer.write(
            &ServerMessage::SyncResetRequired {
                map: map.to_string(),
            },
            false,
        );
        return;
    };
    managed.await_ready().await;
    let records = bucket_records(&managed, bucket);
    session.writer.write(
        &ServerMessage::SyncRespLeaf {
            map: map.to_string(),
            bucket,
            records,
        },
        false,
    );
}

/// Full records (tombstones included) for one Merkle bucket. Anti-entropy
/// needs tombstones, so this intentionally bypasses `visible_value`.
fn bucket_records(managed: &crate::core::storage::ManagedMap, bucket: u32) -> Vec<QueryRow> {
    let keys = managed.merkle.keys_in_bucket(bucket);
    let mut records = Vec::with_capacity(keys.len());
    match &managed.map {
        CrdtMap::Lww(lww) => {
            for key in keys {
                if let Some(record) = lww.get(&key) {
                    records.push(QueryRow {
                        key,
                        value: record.value,
                        timestamp: record.timestamp,
                    });
                }
            }
        }
        CrdtMap::Or(or) => {
            for key in keys {
                let entries = or.get(&key);
                if let Some(newest) = entries.iter().map(|e| e.timestamp.clone()).max() {
                    records.push(QueryRow {
                        key,
                        value: Value::Array(entries.into_iter().map(|e| e.value).collect()),
                        timestamp: newest,
                    });
                }
            }
        }
    }
    records
}

pub async fn handle_ormap_diff_request(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    map: &str,
    keys: Vec<String>,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), map, Permission::READ)
    {
        deny(session, &e);
        return;
    }
    let Some(managed) = state.storage.get(map) else {
        session.writer.write(
            &ServerMessage::SyncResetRequired {
                map: map.to_string(),
            },
            false,
        );
        return;
    };
    managed.await_ready().await;
    let Some(or) = managed.map.as_or() else {
        session.writer.write(
            &ServerMessage::SyncResetRequired {
                map: map.to_string(),
            },
            false,
        );
        return;
    };
    let tombstones: Vec<String> = or.tombstone_tags().into_iter().map(|(tag, _)| tag).collect();
    let entries = keys
        .into_iter()
        .map(|key| OrDiffEntry {
            entries: or.get(&key),
            tombstones: tombstones.clone(),
            key,
        })
        .collect();
    session.writer.write(
        &ServerMessage::OrmapDiff {
            map: map.to_string(),
            entries,
        },
        false,
    );
}

/// Applies a pushed OR diff through the map's own CRDT merge methods, then
/// confirms with the fresh Merkle root.
pub async fn handle_ormap_push_diff(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    map: &str,
    entries: Vec<OrDiffEntry>,
) {
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), map, Permission::PUT)
    {
        deny(session, &e);
        return;
    }
    let managed = match state.storage.get_or_create(map, MapType::Or) {
        Ok(managed) => managed,
        Err(e) => {
            session
                .writer
                .write(&ServerMessage::error(400, e.to_string()), false);
            return;
        }
    };
    managed.await_ready().await;
    let Some(or) = managed.map.as_or() else {
        return;
    };
    for diff in entries {
        for tag in diff.tombstones {
            or.restore_tombstone(tag, state.clock.tick());
        }
        for entry in diff.entries {
            or.apply_add(&diff.key, entry);
        }
        let serialized = serde_json::to_vec(&or.get(&diff.key)).unwrap_or_default();
        managed.merkle.update(&diff.key, &serialized);
    }
    metrics::OPS_APPLIED_TOTAL.inc();
    session.writer.write(
        &ServerMessage::SyncRespRoot {
            map: map.to_string(),
            root: managed.merkle.root(),
        },
        false,
    );
}
