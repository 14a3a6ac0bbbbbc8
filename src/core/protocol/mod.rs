// src/core/protocol/mod.rs

//! The client-facing wire protocol: framed messages carrying a required
//! `type` discriminant. Frames are either the canonical binary encoding
//! (preferred) or a JSON fallback; see [`codec`].

pub mod codec;

use crate::core::crdt::{LwwRecord, MapType, TaggedEntry, Timestamp};
use crate::core::query::{CursorStatus, Query, QueryRow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use codec::{FrameCodec, WireFormat, decode_batch_envelope, encode_batch_envelope};

/// Transport close codes.
pub mod close_code {
    /// Protocol error (schema violation, undecodable frame).
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Admission control rejected the connection (Try Again Later).
    pub const OVERLOADED: u16 = 1013;
    /// A connection interceptor rejected the session.
    pub const REJECTED: u16 = 4000;
    /// Unauthenticated frame or failed authentication.
    pub const UNAUTHORIZED: u16 = 4001;
    /// Heartbeat timeout.
    pub const HEARTBEAT_TIMEOUT: u16 = 4002;
}

pub const PROTOCOL_VERSION: u32 = 1;

/// The durability level requested by a writer.
/// The ladder is MEMORY -> APPLIED -> REPLICATED -> PERSISTED;
/// FIRE_AND_FORGET never receives an acknowledgement at all.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteConcern {
    FireAndForget,
    Memory,
    Applied,
    Replicated,
    Persisted,
}

impl WriteConcern {
    /// True for levels acknowledged immediately on admission.
    pub fn is_early_ack(self) -> bool {
        matches!(self, WriteConcern::FireAndForget | WriteConcern::Memory)
    }
}

/// The CRDT mutation carried by an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    /// LWW write. A `null` value is a tombstone (remove).
    Put {
        value: Value,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        ttl_ms: Option<u64>,
    },
    /// OR map tagged add.
    OrAdd {
        value: Value,
        tag: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        ttl_ms: Option<u64>,
    },
    /// OR map tombstone for the provided tag.
    OrRemove { tag: String },
}

/// One conflict-free replicated write against a named map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapOp {
    pub id: String,
    pub map: String,
    pub map_type: MapType,
    pub key: String,
    pub timestamp: Timestamp,
    pub kind: OpKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub write_concern: Option<WriteConcern>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout_ms: Option<u64>,
}

impl MapOp {
    /// Basic shape validation; deeper checks live in the pipeline.
    pub fn validate(&self) -> Result<(), String> {
        if self.map.is_empty() {
            return Err("op is missing a map name".into());
        }
        if self.key.is_empty() {
            return Err("op is missing a key".into());
        }
        match (&self.kind, self.map_type) {
            (OpKind::Put { .. }, MapType::Lww) => Ok(()),
            (OpKind::OrAdd { tag, .. }, MapType::Or) | (OpKind::OrRemove { tag }, MapType::Or) => {
                if tag.is_empty() {
                    Err("OR op is missing a tag".into())
                } else {
                    Ok(())
                }
            }
            (kind, map_type) => Err(format!("op kind {kind:?} contradicts map type {map_type}")),
        }
    }
}

/// How a map change is classified for the journal and for client events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Put,
    Update,
    Delete,
}

/// The payload of a `SERVER_EVENT`: one observed map change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub map: String,
    pub map_type: MapType,
    pub key: String,
    pub event_type: EventType,
    /// Present for LWW changes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub record: Option<LwwRecord>,
    /// Present for OR changes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub or_record: Option<TaggedEntry>,
    pub origin_node: String,
}

/// The per-op outcome reported inside an `OP_ACK`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpResult {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub achieved_level: WriteConcern,
}

/// Incremental query delta kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaKind {
    Added,
    Updated,
    Removed,
}

/// A conflict resolver strategy clients may register per map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolverStrategy {
    /// Plain last-writer-wins (the default behavior, registering it is a no-op).
    LastWriterWins,
    /// The numerically smaller value survives.
    MinValue,
    /// The numerically greater value survives.
    MaxValue,
    /// Incoming writes older than the stored record are rejected outright.
    RejectOlder,
}

/// A single journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub seq: u64,
    pub map: String,
    pub key: String,
    pub event_type: EventType,
    pub timestamp: Timestamp,
}

/// One OR-map diff entry pushed during anti-entropy repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrDiffEntry {
    pub key: String,
    pub entries: Vec<TaggedEntry>,
    pub tombstones: Vec<String>,
}

/// Client -> server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    Ping {
        timestamp: i64,
    },
    ClientOp {
        op: MapOp,
    },
    OpBatch {
        ops: Vec<MapOp>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        write_concern: Option<WriteConcern>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        timeout_ms: Option<u64>,
    },
    QuerySub {
        query_id: String,
        map: String,
        query: Query,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        cursor: Option<String>,
    },
    QueryUnsub {
        query_id: String,
    },
    SyncInit {
        map: String,
    },
    MerkleReqBucket {
        map: String,
        bucket: u32,
    },
    OrmapSyncInit {
        map: String,
    },
    OrmapMerkleReqBucket {
        map: String,
        bucket: u32,
    },
    OrmapDiffRequest {
        map: String,
        keys: Vec<String>,
    },
    OrmapPushDiff {
        map: String,
        entries: Vec<OrDiffEntry>,
    },
    LockRequest {
        request_id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        ttl_ms: Option<u64>,
    },
    LockRelease {
        request_id: String,
        name: String,
    },
    TopicSub {
        topic: String,
    },
    TopicUnsub {
        topic: String,
    },
    TopicPub {
        topic: String,
        payload: Value,
    },
    CounterRequest {
        name: String,
        #[serde(default)]
        delta: i64,
    },
    CounterSync {
        name: String,
    },
    EntryProcess {
        map: String,
        map_type: MapType,
        key: String,
        processor: String,
        #[serde(default)]
        args: Value,
    },
    EntryProcessBatch {
        map: String,
        map_type: MapType,
        keys: Vec<String>,
        processor: String,
        #[serde(default)]
        args: Value,
    },
    RegisterResolver {
        map: String,
        strategy: ResolverStrategy,
    },
    UnregisterResolver {
        map: String,
    },
    ListResolvers,
    PartitionMapRequest {
        current_version: u64,
    },
    Search {
        request_id: String,
        map: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        limit: Option<usize>,
    },
    SearchSub {
        request_id: String,
        map: String,
        text: String,
    },
    SearchUnsub {
        request_id: String,
    },
    JournalSubscribe,
    JournalUnsubscribe,
    JournalRead {
        from_seq: u64,
        #[serde(default = "default_journal_read_limit")]
        limit: usize,
    },
}

fn default_journal_read_limit() -> usize {
    100
}

impl ClientMessage {
    /// The wire name of the frame, for logs and the handler table.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "AUTH",
            ClientMessage::Ping { .. } => "PING",
            ClientMessage::ClientOp { .. } => "CLIENT_OP",
            ClientMessage::OpBatch { .. } => "OP_BATCH",
            ClientMessage::QuerySub { .. } => "QUERY_SUB",
            ClientMessage::QueryUnsub { .. } => "QUERY_UNSUB",
            ClientMessage::SyncInit { .. } => "SYNC_INIT",
            ClientMessage::MerkleReqBucket { .. } => "MERKLE_REQ_BUCKET",
            ClientMessage::OrmapSyncInit { .. } => "ORMAP_SYNC_INIT",
            ClientMessage::OrmapMerkleReqBucket { .. } => "ORMAP_MERKLE_REQ_BUCKET",
            ClientMessage::OrmapDiffRequest { .. } => "ORMAP_DIFF_REQUEST",
            ClientMessage::OrmapPushDiff { .. } => "ORMAP_PUSH_DIFF",
            ClientMessage::LockRequest { .. } => "LOCK_REQUEST",
            ClientMessage::LockRelease { .. } => "LOCK_RELEASE",
            ClientMessage::TopicSub { .. } => "TOPIC_SUB",
            ClientMessage::TopicUnsub { .. } => "TOPIC_UNSUB",
            ClientMessage::TopicPub { .. } => "TOPIC_PUB",
            ClientMessage::CounterRequest { .. } => "COUNTER_REQUEST",
            ClientMessage::CounterSync { .. } => "COUNTER_SYNC",
            ClientMessage::EntryProcess { .. } => "ENTRY_PROCESS",
            ClientMessage::EntryProcessBatch { .. } => "ENTRY_PROCESS_BATCH",
            ClientMessage::RegisterResolver { .. } => "REGISTER_RESOLVER",
            ClientMessage::UnregisterResolver { .. } => "UNREGISTER_RESOLVER",
            ClientMessage::ListResolvers => "LIST_RESOLVERS",
            ClientMessage::PartitionMapRequest { .. } => "PARTITION_MAP_REQUEST",
            ClientMessage::Search { .. } => "SEARCH",
            ClientMessage::SearchSub { .. } => "SEARCH_SUB",
            ClientMessage::SearchUnsub { .. } => "SEARCH_UNSUB",
            ClientMessage::JournalSubscribe => "JOURNAL_SUBSCRIBE",
            ClientMessage::JournalUnsubscribe => "JOURNAL_UNSUBSCRIBE",
            ClientMessage::JournalRead { .. } => "JOURNAL_READ",
        }
    }

    /// Timestamps carried by the frame, used to advance the session HLC and
    /// tick the node clock on receipt.
    pub fn carried_timestamps(&self) -> Vec<&Timestamp> {
        match self {
            ClientMessage::ClientOp { op } => vec![&op.timestamp],
            ClientMessage::OpBatch { ops, .. } => ops.iter().map(|op| &op.timestamp).collect(),
            _ => Vec::new(),
        }
    }
}

/// Server -> client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    AuthRequired,
    AuthAck {
        protocol_version: u32,
    },
    AuthFail {
        error: String,
    },
    Pong {
        timestamp: i64,
    },
    OpAck {
        last_id: String,
        achieved_level: WriteConcern,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        results: Option<Vec<OpResult>>,
    },
    OpRejected {
        id: String,
        reason: String,
    },
    ServerEvent {
        payload: EventPayload,
    },
    ServerBatchEvent {
        events: Vec<EventPayload>,
    },
    Error {
        code: u16,
        message: String,
    },
    QueryResp {
        query_id: String,
        results: Vec<QueryRow>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        next_cursor: Option<String>,
        has_more: bool,
        cursor_status: CursorStatus,
    },
    QueryDelta {
        query_id: String,
        delta: DeltaKind,
        row: QueryRow,
    },
    SyncRespRoot {
        map: String,
        root: String,
    },
    SyncRespBuckets {
        map: String,
        buckets: Vec<(u32, u64)>,
    },
    SyncRespLeaf {
        map: String,
        bucket: u32,
        records: Vec<QueryRow>,
    },
    SyncResetRequired {
        map: String,
    },
    OrmapDiff {
        map: String,
        entries: Vec<OrDiffEntry>,
    },
    LockGranted {
        request_id: String,
        name: String,
        fencing_token: u64,
    },
    LockReleased {
        request_id: String,
        name: String,
    },
    TopicMessage {
        topic: String,
        payload: Value,
    },
    CounterUpdate {
        name: String,
        value: i64,
    },
    ResolverList {
        resolvers: Vec<(String, ResolverStrategy)>,
    },
    PartitionMap {
        version: u64,
        partitions: Vec<crate::core::cluster::PartitionInfo>,
    },
    MergeRejected {
        id: String,
        map: String,
        key: String,
    },
    SearchResp {
        request_id: String,
        results: Vec<QueryRow>,
    },
    JournalEvent {
        entry: JournalEntry,
    },
    JournalReadResponse {
        entries: Vec<JournalEntry>,
        has_more: bool,
    },
    GcPrune {
        map: String,
        pruned: usize,
        safe: Timestamp,
    },
    /// Coalesced envelope produced by the per-session writer; `data` is
    /// `<4-byte LE count><per message: 4-byte LE length, bytes>...`.
    Batch {
        count: u32,
        data: Vec<u8>,
    },
}

impl ServerMessage {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}
