// src/core/handler/mod.rs

//! The coordinator's handler layer: inbound routing, authentication, the
//! write pipeline, batching, broadcast, queries, and the adapter verbs.

pub mod adapters;
pub mod auth;
pub mod batch;
pub mod broadcast;
pub mod pipeline;
pub mod query;
pub mod regulator;
pub mod router;
pub mod write_concern;

use crate::core::cluster::PeerMessage;
use crate::core::metrics;
use crate::core::state::ServerState;
use std::sync::Arc;
use tracing::debug;

/// The idempotent session close sequence, shared by the connection loop, the
/// heartbeat reaper, and administrative closes:
/// interceptor `on_disconnect`, writer close (flushes), subscription
/// unregister, local lock release, topic/counter/search/journal
/// unsubscribe, `CLUSTER_CLIENT_DISCONNECTED` fan-out, then removal from the
/// connection manager.
pub async fn close_session(state: &Arc<ServerState>, session_id: u64) {
    let Some(session) = state.connections.get(session_id) else {
        return;
    };
    if !session.begin_close() {
        return;
    }
    debug!("Closing session {}", session_id);

    for interceptor in state.interceptors() {
        interceptor.on_disconnect(session_id).await;
    }

    session.writer.close();

    state.query_registry.unregister_session(session_id);
    metrics::QUERY_SUBSCRIPTIONS.set(state.query_registry.subscription_count() as f64);

    let holder = state.local_holder(session_id);
    for grant in state.locks.release_all_for(&holder) {
        adapters::route_lock_grant(state, grant).await;
    }

    state.topics.unsubscribe_all(session_id);
    state.counters.unsubscribe_all(session_id);
    state.search_subs.unregister_session(session_id);
    state.journal.unsubscribe(session_id);

    if state.config.cluster.enabled && state.cluster.size() > 1 {
        state
            .transport
            .broadcast(PeerMessage::ClusterClientDisconnected {
                node_id: state.node_id.clone(),
                session_id,
            })
            .await;
    }

    state.connections.remove(session_id);
}
