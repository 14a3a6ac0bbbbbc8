// src/core/handler/query.rs

//! `QUERY_SUB` handling: local execution plus scatter/gather across partition
//! owners, global sort, cursor pagination, subscription registration, and
//! per-requester field filtering.

use crate::connection::Session;
use crate::core::cluster::{NodeId, PeerMessage};
use crate::core::metrics;
use crate::core::protocol::ServerMessage;
use crate::core::query::{Cursor, CursorStatus, Query, QueryRow, cursor::paginate, sort_rows};
use crate::core::permissions::Permission;
use crate::core::state::ServerState;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// State for one in-flight fan-out read. Created on `QUERY_SUB` in cluster
/// mode; destroyed when all peers respond or the timeout fires.
#[derive(Debug)]
pub struct PendingClusterQuery {
    pub request_id: String,
    pub session_id: u64,
    pub query_id: String,
    pub map: String,
    pub query: Query,
    pub cursor: Option<Cursor>,
    pub results: Mutex<Vec<QueryRow>>,
    pub expected: HashSet<NodeId>,
    pub responded: Mutex<HashSet<NodeId>>,
    finalized: AtomicBool,
}

/// Handles one `QUERY_SUB` frame.
pub async fn handle_query_sub(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    query_id: String,
    map: String,
    query: Query,
    cursor_token: Option<String>,
) {
    if !state.policy.subscriptions_enabled() {
        session.writer.write(
            &ServerMessage::error(403, "Subscriptions are disabled on this node"),
            false,
        );
        return;
    }
    if let Err(e) = state
        .policy
        .check(session.principal().as_deref(), &map, Permission::READ)
    {
        session
            .writer
            .write(&ServerMessage::error(403, e.to_string()), false);
        return;
    }

    // Cursor validation happens before any execution; a bad token is
    // answered inline, never with results.
    let cursor = match cursor_token {
        None => None,
        Some(token) => match Cursor::decode(&token) {
            None => {
                reply_cursor_problem(session, &query_id, CursorStatus::Invalid);
                return;
            }
            Some(cursor) => {
                let max_age = state.config.query.cursor_max_age.as_millis() as i64;
                match cursor.status_for(&query, max_age) {
                    CursorStatus::Valid => Some(cursor),
                    status => {
                        reply_cursor_problem(session, &query_id, status);
                        return;
                    }
                }
            }
        },
    };

    // Partition pruning, with the single-key replica-read narrowing: a query
    // pinned to a locally replicated key never leaves this node.
    let mut peers = if state.config.cluster.enabled && state.cluster.size() > 1 {
        state.partitions.relevant_peers(&query)
    } else {
        Vec::new()
    };
    if let Some(key) = query.single_key()
        && state.partitions.is_local_replica(&key)
    {
        peers.clear();
    }

    let local_rows = execute_local_query(state, &map, &query).await;

    if peers.is_empty() {
        let pending = PendingClusterQuery {
            request_id: String::new(),
            session_id: session.id,
            query_id,
            map,
            query,
            cursor,
            results: Mutex::new(local_rows),
            expected: HashSet::new(),
            responded: Mutex::new(HashSet::new()),
            finalized: AtomicBool::new(false),
        };
        finalize(state, &pending);
        return;
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let pending = Arc::new(PendingClusterQuery {
        request_id: request_id.clone(),
        session_id: session.id,
        query_id,
        map: map.clone(),
        query: query.clone(),
        cursor,
        results: Mutex::new(local_rows),
        expected: peers.iter().cloned().collect(),
        responded: Mutex::new(HashSet::new()),
        finalized: AtomicBool::new(false),
    });
    state
        .pending_queries
        .insert(request_id.clone(), pending.clone());

    // Scatter.
    for peer in peers {
        let exec = PeerMessage::ClusterQueryExec {
            request_id: request_id.clone(),
            origin_node: state.node_id.clone(),
            map: map.clone(),
            query: query.clone(),
        };
        if let Err(e) = state.transport.send(&peer, exec).await {
            warn!("Query scatter to '{}' failed: {}", peer, e);
            pending.responded.lock().insert(peer);
        }
    }
    maybe_finalize(state, &pending);

    // Arm the gather timeout.
    let timeout = state.config.query.cluster_timeout;
    let timeout_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some((_, pending)) = timeout_state.pending_queries.remove(&request_id) {
            let responded_snapshot = pending.responded.lock().clone();
            let missing: Vec<&NodeId> = pending
                .expected
                .difference(&responded_snapshot)
                .collect();
            if !missing.is_empty() {
                metrics::QUERY_TIMEOUTS_TOTAL.inc();
                warn!(
                    "Cluster query '{}' timed out; finalizing with partial results ({} peers silent)",
                    pending.request_id,
                    missing.len()
                );
            }
            finalize(&timeout_state, &pending);
        }
    });
}

/// Handles a peer's `CLUSTER_QUERY_RESP`.
pub fn handle_query_resp(
    state: &Arc<ServerState>,
    request_id: &str,
    node_id: NodeId,
    results: Vec<QueryRow>,
) {
    let Some(pending) = state.pending_queries.get(request_id).map(|e| e.value().clone()) else {
        debug!("Late query response for '{}' dropped", request_id);
        return;
    };
    if !pending.expected.contains(&node_id) {
        return;
    }
    pending.results.lock().extend(results);
    pending.responded.lock().insert(node_id);
    maybe_finalize(state, &pending);
}

/// Handles `QUERY_UNSUB`.
pub fn handle_query_unsub(state: &Arc<ServerState>, session: &Arc<Session>, query_id: &str) {
    if state.query_registry.unregister(query_id) {
        session.subscriptions.write().remove(query_id);
        metrics::QUERY_SUBSCRIPTIONS.set(state.query_registry.subscription_count() as f64);
    }
}

/// Executes a query against the local map, awaiting hydration first.
pub async fn execute_local_query(
    state: &Arc<ServerState>,
    map: &str,
    query: &Query,
) -> Vec<QueryRow> {
    let Some(managed) = state.storage.get(map) else {
        return Vec::new();
    };
    managed.await_ready().await;
    crate::core::query::execute_local(&managed.map, query)
}

fn maybe_finalize(state: &Arc<ServerState>, pending: &Arc<PendingClusterQuery>) {
    let done = {
        let responded = pending.responded.lock();
        pending.expected.iter().all(|peer| responded.contains(peer))
    };
    if done {
        state.pending_queries.remove(&pending.request_id);
        finalize(state, pending);
    }
}

/// Dedup, global sort, cursor pagination, subscription registration, field
/// filter, reply.
fn finalize(state: &Arc<ServerState>, pending: &PendingClusterQuery) {
    if pending.finalized.swap(true, Ordering::AcqRel) {
        return;
    }
    let Some(session) = state.connections.get(pending.session_id) else {
        return;
    };

    let rows = std::mem::take(&mut *pending.results.lock());

    // Peer-applied limits and cursors must not leak into the global result:
    // dedup by key keeping the newest record, then sort globally.
    let mut newest: HashMap<String, QueryRow> = HashMap::new();
    for row in rows {
        match newest.get(&row.key) {
            Some(existing) if existing.timestamp >= row.timestamp => {}
            _ => {
                newest.insert(row.key.clone(), row);
            }
        }
    }
    let mut rows: Vec<QueryRow> = newest.into_values().collect();
    sort_rows(&mut rows, &pending.query.sort);

    let (rows, next_cursor, has_more) = paginate(rows, &pending.query, pending.cursor.as_ref());
    let cursor_status = if pending.cursor.is_some() || next_cursor.is_some() {
        CursorStatus::Valid
    } else {
        CursorStatus::None
    };

    // Register for incremental updates, seeded with the snapshot keys.
    state.query_registry.register(
        pending.query_id.clone(),
        pending.session_id,
        pending.map.clone(),
        pending.query.clone(),
        rows.iter().map(|r| r.key.clone()),
    );
    session
        .subscriptions
        .write()
        .insert(pending.query_id.clone());
    metrics::QUERY_SUBSCRIPTIONS.set(state.query_registry.subscription_count() as f64);

    // Field-level filtering for the requester.
    let principal = session.principal();
    let rows: Vec<QueryRow> = rows
        .into_iter()
        .map(|mut row| {
            row.value = state
                .policy
                .filter_value(principal.as_deref(), &pending.map, &row.value);
            row
        })
        .collect();

    session.writer.write(
        &ServerMessage::QueryResp {
            query_id: pending.query_id.clone(),
            results: rows,
            next_cursor,
            has_more,
            cursor_status,
        },
        false,
    );
}

fn reply_cursor_problem(session: &Arc<Session>, query_id: &str, status: CursorStatus) {
    session.writer.write(
        &ServerMessage::QueryResp {
            query_id: query_id.to_string(),
            results: Vec::new(),
            next_cursor: None,
            has_more: false,
            cursor_status: status,
        },
        false,
    );
}
