// src/core/handler/broadcast.rs

//! Subscription-routed broadcast with role-keyed serialization caching.
//!
//! Map events only reach sessions subscribed to the affected maps. Surviving
//! sessions are bucketed by role signature (and wire format); each bucket is
//! field-filtered through one representative and serialized exactly once.

use crate::connection::Session;
use crate::core::metrics;
use crate::core::protocol::codec::{WireFormat, encode_server_message};
use crate::core::protocol::{EventPayload, ServerMessage};
use crate::core::state::ServerState;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Broadcasts one message. `SERVER_EVENT`/`SERVER_BATCH_EVENT` take the
/// subscription-filtered path; every other type goes raw to all open
/// authenticated sessions.
pub fn broadcast(state: &Arc<ServerState>, message: &ServerMessage, exclude: Option<u64>) {
    match message {
        ServerMessage::ServerEvent { payload } => {
            broadcast_batch(state, std::slice::from_ref(payload), exclude);
        }
        ServerMessage::ServerBatchEvent { events } => {
            broadcast_batch(state, events, exclude);
        }
        other => broadcast_raw_to_all(state, other, exclude),
    }
}

/// Broadcast that awaits per-session queue drain before returning.
pub fn broadcast_sync(state: &Arc<ServerState>, message: &ServerMessage, exclude: Option<u64>) {
    broadcast(state, message, exclude);
    flush_all(state, exclude);
}

/// Routes a batch of map events through subscription and field filtering.
pub fn broadcast_batch(state: &Arc<ServerState>, events: &[EventPayload], exclude: Option<u64>) {
    if events.is_empty() {
        return;
    }

    // 1. Subscription filter: union of sessions subscribed to any affected map.
    let affected_maps: HashSet<&str> = events.iter().map(|e| e.map.as_str()).collect();
    let mut subscribed: HashSet<u64> = HashSet::new();
    for map in &affected_maps {
        subscribed.extend(state.query_registry.sessions_subscribed_to(map));
    }
    if subscribed.is_empty() {
        metrics::EVENTS_FILTERED_BY_SUBSCRIPTION.inc_by(events.len() as f64);
        return;
    }

    let recipients: Vec<Arc<Session>> = state
        .connections
        .authenticated_sessions()
        .into_iter()
        .filter(|s| Some(s.id) != exclude && subscribed.contains(&s.id))
        .collect();
    if recipients.is_empty() {
        metrics::EVENTS_FILTERED_BY_SUBSCRIPTION.inc_by(events.len() as f64);
        return;
    }

    // 2. Role grouping: sessions sharing a role signature share permissions,
    //    so one serialization per bucket is sound. The wire format is part of
    //    the key because the bytes differ per encoding.
    let mut buckets: HashMap<(String, WireFormat), Vec<Arc<Session>>> = HashMap::new();
    for session in recipients {
        let key = (session.role_signature(), session.writer.format());
        buckets.entry(key).or_default().push(session);
    }

    metrics::EVENTS_ROUTED_TOTAL.inc_by(events.len() as f64);

    for ((_signature, format), sessions) in buckets {
        // 3. Field-level filter once per bucket, via one representative.
        let representative = sessions[0].principal();
        let filtered = filter_events(state, events, representative.as_deref());

        // 4. Serialize once per bucket; raw-write to every member.
        let message = if filtered.len() == 1 {
            ServerMessage::ServerEvent {
                payload: filtered.into_iter().next().expect("len checked"),
            }
        } else {
            ServerMessage::ServerBatchEvent { events: filtered }
        };
        let payload = match encode_server_message(&message, format) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping broadcast for unserializable event batch: {}", e);
                continue;
            }
        };
        metrics::SUBSCRIBERS_PER_EVENT.observe(sessions.len() as f64);
        for session in sessions {
            session.writer.write_raw(payload.clone(), false);
        }
    }
}

/// Event broadcast that drains writer queues before returning.
pub fn broadcast_batch_sync(
    state: &Arc<ServerState>,
    events: &[EventPayload],
    exclude: Option<u64>,
) {
    broadcast_batch(state, events, exclude);
    flush_all(state, exclude);
}

fn filter_events(
    state: &Arc<ServerState>,
    events: &[EventPayload],
    principal: Option<&crate::core::permissions::Principal>,
) -> Vec<EventPayload> {
    events
        .iter()
        .map(|event| {
            if !state.policy.has_field_rules(principal, &event.map) {
                return event.clone();
            }
            let mut filtered = event.clone();
            if let Some(record) = filtered.record.as_mut() {
                record.value = state.policy.filter_value(principal, &event.map, &record.value);
            }
            if let Some(or_record) = filtered.or_record.as_mut() {
                or_record.value =
                    state
                        .policy
                        .filter_value(principal, &event.map, &or_record.value);
            }
            filtered
        })
        .collect()
}

fn broadcast_raw_to_all(state: &Arc<ServerState>, message: &ServerMessage, exclude: Option<u64>) {
    let mut encoded: HashMap<WireFormat, bytes::Bytes> = HashMap::new();
    for session in state.connections.authenticated_sessions() {
        if Some(session.id) == exclude {
            continue;
        }
        let format = session.writer.format();
        let payload = match encoded.entry(format) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.get().clone(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                match encode_server_message(message, format) {
                    Ok(payload) => entry.insert(payload).clone(),
                    Err(e) => {
                        warn!("Dropping broadcast frame: {}", e);
                        return;
                    }
                }
            }
        };
        session.writer.write_raw(payload, false);
    }
}

fn flush_all(state: &Arc<ServerState>, exclude: Option<u64>) {
    for session in state.connections.authenticated_sessions() {
        if Some(session.id) == exclude {
            continue;
        }
        session.writer.flush();
    }
}
