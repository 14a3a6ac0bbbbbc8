// tests/integration_test.rs

//! End-to-end scenarios driven through the message router against a fully
//! initialized coordinator state, with the transport replaced by channels.

use bytes::Bytes;
use olivinedb::config::Config;
use olivinedb::connection::{CoalescingWriter, Session};
use olivinedb::core::cluster::LoopbackTransport;
use olivinedb::core::cluster::gc::run_local_gc;
use olivinedb::core::crdt::{LwwRecord, MapType, Timestamp};
use olivinedb::core::handler::router::handle_frame;
use olivinedb::core::protocol::codec::{
    WireFormat, decode_batch_envelope, decode_server_message, encode_client_message,
};
use olivinedb::core::protocol::{
    ClientMessage, MapOp, OpKind, ServerMessage, WriteConcern,
};
use olivinedb::core::query::Query;
use olivinedb::core::state::ServerState;
use olivinedb::core::storage::MemoryStorage;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct TestClient {
    state: Arc<ServerState>,
    session: Arc<Session>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    buffered: VecDeque<ServerMessage>,
}

impl TestClient {
    async fn connect(state: &Arc<ServerState>, token: &str) -> Self {
        let (sink_tx, outbound) = mpsc::unbounded_channel();
        let writer = CoalescingWriter::new(sink_tx, state.writer_config);
        let (close_tx, _close_rx) = mpsc::unbounded_channel();
        let session = state.connections.register(None, writer, close_tx);
        session.observe_hlc(&state.clock.current());

        let mut client = Self {
            state: state.clone(),
            session,
            outbound,
            buffered: VecDeque::new(),
        };
        client
            .send(ClientMessage::Auth {
                token: token.to_string(),
            })
            .await;
        let ack = client.expect(|m| matches!(m, ServerMessage::AuthAck { .. })).await;
        assert!(matches!(ack, ServerMessage::AuthAck { protocol_version: 1 }));
        client
    }

    async fn send(&mut self, message: ClientMessage) {
        let payload = encode_client_message(&message, WireFormat::Json).unwrap();
        handle_frame(&self.state, &self.session, payload).await;
    }

    /// Next decoded frame, unwrapping coalesced envelopes.
    async fn next_message(&mut self) -> ServerMessage {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return message;
            }
            let payload = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("no frame within 2s")
                .expect("writer closed");
            match decode_server_message(&payload).unwrap() {
                ServerMessage::Batch { data, .. } => {
                    for inner in decode_batch_envelope(&data).unwrap() {
                        self.buffered.push_back(decode_server_message(&inner).unwrap());
                    }
                }
                message => return message,
            }
        }
    }

    /// Scans forward until a frame matches.
    async fn expect(&mut self, matches: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        for _ in 0..32 {
            let message = self.next_message().await;
            if matches(&message) {
                return message;
            }
        }
        panic!("expected frame never arrived");
    }

    fn put_op(&self, map: &str, key: &str, value: Value) -> MapOp {
        MapOp {
            id: uuid::Uuid::new_v4().to_string(),
            map: map.to_string(),
            map_type: MapType::Lww,
            key: key.to_string(),
            timestamp: self.state.clock.tick(),
            kind: OpKind::Put {
                value,
                ttl_ms: None,
            },
            write_concern: None,
            timeout_ms: None,
        }
    }
}

fn make_state(mutate: impl FnOnce(&mut Config)) -> Arc<ServerState> {
    let mut config = Config::default();
    config.node_id = Some("test-node".to_string());
    mutate(&mut config);
    ServerState::initialize(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(LoopbackTransport::new("test-node")),
    )
}

fn query_all() -> Query {
    Query::default()
}

#[tokio::test]
async fn test_mutate_then_query_round_trip() {
    let state = make_state(|_| {});
    let mut client = TestClient::connect(&state, "alice").await;

    let op = client.put_op("tasks", "t1", json!({"title": "Test"}));
    client.send(ClientMessage::ClientOp { op }).await;
    let ack = client.expect(|m| matches!(m, ServerMessage::OpAck { .. })).await;
    assert!(matches!(
        ack,
        ServerMessage::OpAck {
            achieved_level: WriteConcern::Memory,
            ..
        }
    ));

    // Batch processing is asynchronous; give it a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    client
        .send(ClientMessage::QuerySub {
            query_id: "q1".into(),
            map: "tasks".into(),
            query: query_all(),
            cursor: None,
        })
        .await;
    let resp = client
        .expect(|m| matches!(m, ServerMessage::QueryResp { .. }))
        .await;
    let ServerMessage::QueryResp { results, .. } = resp else {
        unreachable!()
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key, "t1");
    assert_eq!(results[0].value, json!({"title": "Test"}));
}

#[tokio::test]
async fn test_remove_semantics() {
    let state = make_state(|_| {});
    let mut client = TestClient::connect(&state, "alice").await;

    let op = client.put_op("temp", "temp1", json!({"v": 1}));
    client.send(ClientMessage::ClientOp { op }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    client
        .send(ClientMessage::QuerySub {
            query_id: "q1".into(),
            map: "temp".into(),
            query: query_all(),
            cursor: None,
        })
        .await;
    let ServerMessage::QueryResp { results, .. } = client
        .expect(|m| matches!(m, ServerMessage::QueryResp { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(results.len(), 1);

    let op = client.put_op("temp", "temp1", Value::Null);
    client.send(ClientMessage::ClientOp { op }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    client
        .send(ClientMessage::QuerySub {
            query_id: "q2".into(),
            map: "temp".into(),
            query: query_all(),
            cursor: None,
        })
        .await;
    let ServerMessage::QueryResp { results, .. } = client
        .expect(|m| matches!(m, ServerMessage::QueryResp { .. }))
        .await
    else {
        unreachable!()
    };
    assert!(results.is_empty(), "removed key must not be reported");
}

#[tokio::test]
async fn test_allowlist_enforcement() {
    let state = make_state(|config| {
        config.allowed_maps = Some(vec!["tasks".to_string()]);
    });
    let mut client = TestClient::connect(&state, "alice").await;

    client
        .send(ClientMessage::QuerySub {
            query_id: "q1".into(),
            map: "users".into(),
            query: query_all(),
            cursor: None,
        })
        .await;
    let ServerMessage::Error { code, message } = client
        .expect(|m| matches!(m, ServerMessage::Error { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(code, 403);
    assert!(message.contains("not allowed"), "got: {message}");
}

#[tokio::test]
async fn test_mutations_disabled() {
    let state = make_state(|config| {
        config.enable_mutations = false;
    });
    let mut client = TestClient::connect(&state, "alice").await;

    let op = client.put_op("tasks", "t1", json!({"title": "Test"}));
    client.send(ClientMessage::ClientOp { op }).await;
    let ServerMessage::Error { code, message } = client
        .expect(|m| matches!(m, ServerMessage::Error { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(code, 403);
    assert!(message.contains("denied"), "got: {message}");
}

#[tokio::test]
async fn test_subscribed_session_receives_peer_writes() {
    let state = make_state(|_| {});
    let mut watcher = TestClient::connect(&state, "alice").await;
    let mut writer = TestClient::connect(&state, "bob").await;

    watcher
        .send(ClientMessage::QuerySub {
            query_id: "q1".into(),
            map: "tasks".into(),
            query: query_all(),
            cursor: None,
        })
        .await;
    watcher
        .expect(|m| matches!(m, ServerMessage::QueryResp { .. }))
        .await;

    let op = writer.put_op("tasks", "t9", json!({"title": "observed"}));
    writer.send(ClientMessage::ClientOp { op }).await;

    let event = watcher
        .expect(|m| {
            matches!(m, ServerMessage::ServerBatchEvent { .. })
                || matches!(m, ServerMessage::ServerEvent { .. })
                || matches!(m, ServerMessage::QueryDelta { .. })
        })
        .await;
    match event {
        ServerMessage::ServerBatchEvent { events } => {
            assert!(events.iter().any(|e| e.key == "t9"));
        }
        ServerMessage::ServerEvent { payload } => assert_eq!(payload.key, "t9"),
        ServerMessage::QueryDelta { row, .. } => assert_eq!(row.key, "t9"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_ping_is_answered_before_auth() {
    let state = make_state(|_| {});
    let (sink_tx, mut outbound) = mpsc::unbounded_channel();
    let writer = CoalescingWriter::new(sink_tx, state.writer_config);
    let (close_tx, _close_rx) = mpsc::unbounded_channel();
    let session = state.connections.register(None, writer, close_tx);

    let payload =
        encode_client_message(&ClientMessage::Ping { timestamp: 7 }, WireFormat::Json).unwrap();
    handle_frame(&state, &session, payload).await;
    let frame = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        decode_server_message(&frame).unwrap(),
        ServerMessage::Pong { timestamp: 7 }
    );
}

#[tokio::test]
async fn test_unauthenticated_op_requests_close() {
    let state = make_state(|_| {});
    let (sink_tx, _outbound) = mpsc::unbounded_channel();
    let writer = CoalescingWriter::new(sink_tx, state.writer_config);
    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    let session = state.connections.register(None, writer, close_tx);

    let op = MapOp {
        id: "x".into(),
        map: "tasks".into(),
        map_type: MapType::Lww,
        key: "k".into(),
        timestamp: state.clock.tick(),
        kind: OpKind::Put {
            value: json!(1),
            ttl_ms: None,
        },
        write_concern: None,
        timeout_ms: None,
    };
    let payload =
        encode_client_message(&ClientMessage::ClientOp { op }, WireFormat::Json).unwrap();
    handle_frame(&state, &session, payload).await;

    let (code, _) = close_rx.recv().await.expect("close requested");
    assert_eq!(code, 4001);
}

#[tokio::test]
async fn test_gc_never_prunes_above_the_safe_point() {
    let state = make_state(|_| {});
    let managed = state.storage.get_or_create("tasks", MapType::Lww).unwrap();
    managed.await_ready().await;
    let lww = managed.map.as_lww().unwrap();
    lww.merge("old", LwwRecord::new(Value::Null, Timestamp::new(100, 0, "n1")));
    lww.merge("new", LwwRecord::new(Value::Null, Timestamp::new(5_000, 0, "n1")));
    lww.merge(
        "live",
        LwwRecord::new(json!(1), Timestamp::new(50, 0, "n1")),
    );

    run_local_gc(&state, &Timestamp::new(1_000, 0, "n1")).await;

    assert!(lww.get("old").is_none(), "old tombstone pruned");
    assert!(lww.get("new").is_some(), "tombstone above safe survives");
    assert!(lww.get("live").is_some(), "live records are never pruned");
}
