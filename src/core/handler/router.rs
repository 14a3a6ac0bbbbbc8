// src/core/handler/router.rs

//! The inbound message router: one entry point per frame. Validates, answers
//! `PING` urgently, advances the clocks, enforces the pre-auth gate, and
//! dispatches by type.

use super::{adapters, auth, batch, query};
use crate::connection::Session;
use crate::core::errors::OlivineError;
use crate::core::protocol::codec::decode_client_message;
use crate::core::protocol::{ClientMessage, ServerMessage, close_code};
use crate::core::state::ServerState;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handles one inbound frame from a session.
pub async fn handle_frame(state: &Arc<ServerState>, session: &Arc<Session>, payload: Bytes) {
    // 1. Schema validation. An unknown type is logged and dropped; any other
    //    malformation is answered with an urgent ERROR{400}.
    let (message, format) = match decode_client_message(&payload) {
        Ok(decoded) => decoded,
        Err(OlivineError::UnknownMessageType(name)) => {
            warn!("Session {}: dropping unknown frame type '{}'", session.id, name);
            return;
        }
        Err(e) => {
            debug!("Session {}: invalid frame: {}", session.id, e);
            session
                .writer
                .write(&ServerMessage::error(400, e.to_string()), true);
            return;
        }
    };
    session.writer.set_format(format);

    // 2. PING bypasses coalescing in both directions to preserve RTT.
    if let ClientMessage::Ping { timestamp } = &message {
        session.record_ping();
        session
            .writer
            .write(&ServerMessage::Pong { timestamp: *timestamp }, true);
        return;
    }

    // 3. Advance the session HLC and tick the node clock from any timestamps
    //    the frame carries.
    for timestamp in message.carried_timestamps() {
        session.observe_hlc(timestamp);
        state.clock.update(timestamp);
    }

    // 4. Pre-authentication, only AUTH (and PING above) are acceptable.
    if !session.is_authenticated() {
        match message {
            ClientMessage::Auth { token } => auth::handle_auth(state, session, &token),
            other => {
                warn!(
                    "Session {}: '{}' before AUTH; closing",
                    session.id,
                    other.type_name()
                );
                session.close(close_code::UNAUTHORIZED, "authentication required");
            }
        }
        return;
    }

    // 5. The type -> handler table.
    match message {
        ClientMessage::Auth { .. } => {
            debug!("Ignoring duplicate AUTH on session {}", session.id);
        }
        ClientMessage::Ping { .. } => unreachable!("PING handled above"),
        ClientMessage::ClientOp { op } => {
            batch::handle_op_batch(state, session, vec![op], None, None).await;
        }
        ClientMessage::OpBatch {
            ops,
            write_concern,
            timeout_ms,
        } => {
            batch::handle_op_batch(state, session, ops, write_concern, timeout_ms).await;
        }
        ClientMessage::QuerySub {
            query_id,
            map,
            query,
            cursor,
        } => {
            query::handle_query_sub(state, session, query_id, map, query, cursor).await;
        }
        ClientMessage::QueryUnsub { query_id } => {
            query::handle_query_unsub(state, session, &query_id);
        }
        ClientMessage::SyncInit { map } => {
            adapters::handle_sync_init(state, session, &map, crate::core::crdt::MapType::Lww).await;
        }
        ClientMessage::MerkleReqBucket { map, bucket } => {
            adapters::handle_merkle_req_bucket(state, session, &map, bucket).await;
        }
        ClientMessage::OrmapSyncInit { map } => {
            adapters::handle_sync_init(state, session, &map, crate::core::crdt::MapType::Or).await;
        }
        ClientMessage::OrmapMerkleReqBucket { map, bucket } => {
            adapters::handle_merkle_req_bucket(state, session, &map, bucket).await;
        }
        ClientMessage::OrmapDiffRequest { map, keys } => {
            adapters::handle_ormap_diff_request(state, session, &map, keys).await;
        }
        ClientMessage::OrmapPushDiff { map, entries } => {
            adapters::handle_ormap_push_diff(state, session, &map, entries).await;
        }
        ClientMessage::LockRequest {
            request_id,
            name,
            ttl_ms,
        } => {
            adapters::handle_lock_request(state, session, request_id, name, ttl_ms).await;
        }
        ClientMessage::LockRelease { request_id, name } => {
            adapters::handle_lock_release(state, session, request_id, name).await;
        }
        ClientMessage::TopicSub { topic } => adapters::handle_topic_sub(state, session, &topic),
        ClientMessage::TopicUnsub { topic } => adapters::handle_topic_unsub(state, session, &topic),
        ClientMessage::TopicPub { topic, payload } => {
            adapters::handle_topic_pub(state, session, topic, payload).await;
        }
        ClientMessage::CounterRequest { name, delta } => {
            adapters::handle_counter_request(state, session, &name, delta);
        }
        ClientMessage::CounterSync { name } => {
            adapters::handle_counter_sync(state, session, &name);
        }
        ClientMessage::EntryProcess {
            map,
            map_type,
            key,
            processor,
            args,
        } => {
            adapters::handle_entry_process(state, session, map, map_type, key, &processor, args)
                .await;
        }
        ClientMessage::EntryProcessBatch {
            map,
            map_type,
            keys,
            processor,
            args,
        } => {
            adapters::handle_entry_process_batch(
                state, session, map, map_type, keys, &processor, args,
            )
            .await;
        }
        ClientMessage::RegisterResolver { map, strategy } => {
            adapters::handle_register_resolver(state, session, &map, strategy);
        }
        ClientMessage::UnregisterResolver { map } => {
            adapters::handle_unregister_resolver(state, session, &map);
        }
        ClientMessage::ListResolvers => adapters::reply_resolver_list(state, session),
        ClientMessage::PartitionMapRequest { current_version } => {
            adapters::handle_partition_map_request(state, session, current_version);
        }
        ClientMessage::Search {
            request_id,
            map,
            text,
            limit,
        } => {
            adapters::handle_search(state, session, request_id, map, &text, limit).await;
        }
        ClientMessage::SearchSub {
            request_id,
            map,
            text,
        } => {
            adapters::handle_search_sub(state, session, request_id, map, text).await;
        }
        ClientMessage::SearchUnsub { request_id } => {
            adapters::handle_search_unsub(state, &request_id);
        }
        ClientMessage::JournalSubscribe => adapters::handle_journal_subscribe(state, session),
        ClientMessage::JournalUnsubscribe => adapters::handle_journal_unsubscribe(state, session),
        ClientMessage::JournalRead { from_seq, limit } => {
            adapters::handle_journal_read(state, session, from_seq, limit);
        }
    }
}
