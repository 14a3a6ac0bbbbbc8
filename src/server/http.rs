// src/server/http.rs

//! The optional HTTP facade: health, the assistant tools endpoint, CORS
//! preflights, and the stateless one-shot `/sync` pipeline for serverless
//! clients.

use crate::core::crdt::{MapType, Timestamp};
use crate::core::errors::OlivineError;
use crate::core::handler::pipeline::{self, PipelineResult};
use crate::core::handler::{auth, query as query_handler};
use crate::core::interceptor::OpContext;
use crate::core::permissions::{ADMIN_ROLE, Permission, Principal};
use crate::core::protocol::{EventType, MapOp, OpKind};
use crate::core::query::{Query, QueryRow};
use crate::core::state::ServerState;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

const SERVER_NAME: &str = "olivinedb";

pub async fn run(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let addr = format!("{}:{}", state.config.host, state.config.http.port);
    let app = Router::new()
        .route("/health", get(health))
        .route("/mcp", get(tools_info).post(tools_call))
        .route("/sync", post(sync))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state.clone());

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("HTTP facade failed to bind {}: {}", addr, e);
            return;
        }
    };
    info!("HTTP facade listening on {}", addr);
    let shutdown = async move {
        let _ = shutdown_rx.recv().await;
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        warn!("HTTP facade terminated: {}", e);
    }
}

/// CORS middleware: answers every `OPTIONS` preflight with 204 and decorates
/// all other responses.
async fn cors(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = state
        .config
        .http
        .cors_allowed_origin
        .clone()
        .unwrap_or_else(|| "*".to_string());
    if request.method() == Method::OPTIONS {
        return cors_headers(&origin, StatusCode::NO_CONTENT.into_response());
    }
    cors_headers(&origin, next.run(request).await)
}

fn cors_headers(origin: &str, mut response: Response) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

// --- /health ---------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

// --- /mcp ------------------------------------------------------------------

async fn tools_info(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "nodeId": state.node_id,
        "tools": [
            {
                "name": "olivine_mutate",
                "description": "Create, update, or remove a record in a map",
            },
            {
                "name": "olivine_query",
                "description": "Query records from a map",
            },
        ],
    }))
}

#[derive(Debug, Deserialize)]
struct ToolsCallRequest {
    method: String,
    #[serde(default)]
    params: ToolsCallParams,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsCallParams {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn tool_text(text: impl Into<String>, is_error: bool) -> Json<Value> {
    Json(json!({
        "result": {
            "content": [{ "type": "text", "text": text.into() }],
            "isError": is_error,
        }
    }))
}

async fn tools_call(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ToolsCallRequest>,
) -> Response {
    if request.method != "tools/call" {
        return (
            StatusCode::OK,
            Json(json!({ "error": { "message": format!("Unknown method '{}'", request.method) } })),
        )
            .into_response();
    }
    match request.params.name.as_str() {
        "olivine_mutate" => tool_mutate(&state, &request.params.arguments)
            .await
            .into_response(),
        "olivine_query" => tool_query(&state, &request.params.arguments)
            .await
            .into_response(),
        other => (
            StatusCode::OK,
            Json(json!({ "error": { "message": format!("Unknown tool '{other}'") } })),
        )
            .into_response(),
    }
}

fn facade_principal() -> Arc<Principal> {
    Arc::new(Principal::normalized(
        "facade".into(),
        None,
        vec![ADMIN_ROLE.to_string()],
        serde_json::Map::new(),
    ))
}

async fn tool_mutate(state: &Arc<ServerState>, arguments: &Value) -> Json<Value> {
    let map = arguments.get("map").and_then(Value::as_str).unwrap_or("");
    let key = arguments.get("key").and_then(Value::as_str).unwrap_or("");
    let op_name = arguments.get("op").and_then(Value::as_str).unwrap_or("set");
    if map.is_empty() || key.is_empty() {
        return tool_text("A map and a key are required", true);
    }
    let value = match op_name {
        "set" => arguments.get("data").cloned().unwrap_or(Value::Null),
        "remove" => Value::Null,
        other => return tool_text(format!("Unknown op '{other}'"), true),
    };

    let principal = facade_principal();
    let action = if value.is_null() {
        Permission::REMOVE
    } else {
        Permission::PUT
    };
    if let Err(e) = state.policy.check(Some(&principal), map, action) {
        return tool_text(e.to_string(), true);
    }

    let op = MapOp {
        id: uuid::Uuid::new_v4().to_string(),
        map: map.to_string(),
        map_type: MapType::Lww,
        key: key.to_string(),
        timestamp: state.clock.tick(),
        kind: OpKind::Put {
            value,
            ttl_ms: None,
        },
        write_concern: None,
        timeout_ms: None,
    };
    let ctx = OpContext {
        session_id: None,
        principal: Some(principal),
        authenticated: true,
        from_cluster: false,
        origin_sender: None,
    };
    match pipeline::process_local(state, op, &ctx, false, None, true).await {
        Ok(PipelineResult::Applied(payload)) => match payload.event_type {
            EventType::Delete => {
                tool_text(format!("Successfully removed record '{key}' from map '{map}'"), false)
            }
            EventType::Update => {
                tool_text(format!("Successfully updated record '{key}' in map '{map}'"), false)
            }
            EventType::Put => {
                tool_text(format!("Successfully created record '{key}' in map '{map}'"), false)
            }
        },
        Ok(PipelineResult::Stale) | Ok(PipelineResult::Dropped) => {
            tool_text(format!("Record '{key}' unchanged in map '{map}'"), false)
        }
        Ok(PipelineResult::Rejected(reason)) => tool_text(reason, true),
        Err(e) => tool_text(e.to_string(), true),
    }
}

async fn tool_query(state: &Arc<ServerState>, arguments: &Value) -> Json<Value> {
    let map = arguments.get("map").and_then(Value::as_str).unwrap_or("");
    if map.is_empty() {
        return tool_text("A map is required", true);
    }
    let principal = facade_principal();
    if let Err(e) = state.policy.check(Some(&principal), map, Permission::READ) {
        return tool_text(e.to_string(), true);
    }
    let query: Query = arguments
        .get("query")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .unwrap_or_default()
        .unwrap_or_default();
    let rows = query_handler::execute_local_query(state, map, &query).await;
    if rows.is_empty() {
        return tool_text("No results found", false);
    }
    let rendered: Vec<Value> = rows
        .iter()
        .map(|row| json!({ "key": row.key, "value": row.value }))
        .collect();
    tool_text(
        serde_json::to_string_pretty(&rendered).unwrap_or_default(),
        false,
    )
}

// --- /sync -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    #[serde(default)]
    client_hlc: Option<Timestamp>,
    #[serde(default)]
    ops: Vec<MapOp>,
    #[serde(default)]
    sync_maps: Vec<SyncMapRequest>,
    #[serde(default)]
    queries: Vec<SyncQueryRequest>,
    #[serde(default)]
    searches: Vec<SyncSearchRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncMapRequest {
    map: String,
    #[serde(default)]
    last_sync: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncQueryRequest {
    map: String,
    #[serde(default)]
    query: Query,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncSearchRequest {
    map: String,
    text: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncOpOutcome {
    id: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncMapRecord {
    key: String,
    value: Value,
    timestamp: Timestamp,
    event_type: EventType,
}

async fn sync(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<SyncRequest>,
) -> Response {
    // Credential first; everything else is per-operation.
    let principal = match bearer_principal(&state, &headers) {
        Ok(principal) => Arc::new(principal),
        Err(e) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    if let Some(client_hlc) = &request.client_hlc {
        state.clock.update(client_hlc);
    }

    // Ops run through the normal pipeline; per-op failures are collected and
    // never abort the request.
    let ctx = OpContext {
        session_id: None,
        principal: Some(principal.clone()),
        authenticated: true,
        from_cluster: false,
        origin_sender: None,
    };
    let mut op_results = Vec::with_capacity(request.ops.len());
    for op in request.ops {
        let id = op.id.clone();
        let action = match &op.kind {
            OpKind::Put { value, .. } if value.is_null() => Permission::REMOVE,
            OpKind::OrRemove { .. } => Permission::REMOVE,
            _ => Permission::PUT,
        };
        if let Err(e) = op.validate().map_err(OlivineError::InvalidRequest) {
            op_results.push(SyncOpOutcome {
                id,
                success: false,
                error: Some(e.to_string()),
            });
            continue;
        }
        if let Err(e) = state.policy.check(Some(&principal), &op.map, action) {
            op_results.push(SyncOpOutcome {
                id,
                success: false,
                error: Some(e.to_string()),
            });
            continue;
        }
        let outcome = match pipeline::process_local(&state, op, &ctx, false, None, true).await {
            Ok(PipelineResult::Rejected(reason)) => SyncOpOutcome {
                id,
                success: false,
                error: Some(reason),
            },
            Ok(_) => SyncOpOutcome {
                id,
                success: true,
                error: None,
            },
            Err(e) => SyncOpOutcome {
                id,
                success: false,
                error: Some(e.to_string()),
            },
        };
        op_results.push(outcome);
    }

    // Sync-maps: every record with an HLC strictly above the client's
    // last-sync point.
    let mut sync_results = serde_json::Map::new();
    for sync_map in request.sync_maps {
        if state
            .policy
            .check(Some(&principal), &sync_map.map, Permission::READ)
            .is_err()
        {
            continue;
        }
        let since = sync_map.last_sync.unwrap_or_else(Timestamp::zero);
        let records = records_since(&state, &sync_map.map, &since).await;
        sync_results.insert(
            sync_map.map,
            serde_json::to_value(records).unwrap_or(Value::Null),
        );
    }

    // One-shot queries.
    let mut query_results = serde_json::Map::new();
    for query_request in request.queries {
        if state
            .policy
            .check(Some(&principal), &query_request.map, Permission::READ)
            .is_err()
        {
            continue;
        }
        let mut rows =
            query_handler::execute_local_query(&state, &query_request.map, &query_request.query)
                .await;
        crate::core::query::sort_rows(&mut rows, &query_request.query.sort);
        if let Some(limit) = query_request.query.limit {
            rows.truncate(limit);
        }
        let rows: Vec<QueryRow> = rows
            .into_iter()
            .map(|mut row| {
                row.value = state
                    .policy
                    .filter_value(Some(&principal), &query_request.map, &row.value);
                row
            })
            .collect();
        query_results.insert(
            query_request.map,
            serde_json::to_value(rows).unwrap_or(Value::Null),
        );
    }

    // One-shot searches.
    let mut search_results = serde_json::Map::new();
    for search_request in request.searches {
        if state
            .policy
            .check(Some(&principal), &search_request.map, Permission::READ)
            .is_err()
            || !state.search_enabled_for(&search_request.map)
        {
            continue;
        }
        let rows = crate::core::handler::adapters::search_rows(
            &state,
            &search_request.map,
            &search_request.text,
            search_request.limit.unwrap_or(50),
        )
        .await;
        search_results.insert(
            search_request.map,
            serde_json::to_value(rows).unwrap_or(Value::Null),
        );
    }

    // The server HLC is the client's low-water mark for its next round.
    let server_hlc = state.clock.tick();
    Json(json!({
        "serverHlc": server_hlc,
        "opResults": op_results,
        "syncResults": sync_results,
        "queryResults": query_results,
        "searchResults": search_results,
    }))
    .into_response()
}

fn bearer_principal(
    state: &Arc<ServerState>,
    headers: &HeaderMap,
) -> Result<Principal, OlivineError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| OlivineError::AuthFailed("missing bearer token".into()))?;
    match state.config.auth_secret.as_deref() {
        Some(secret) => auth::verify_token(secret, token),
        None => Ok(Principal::normalized(
            token.to_string(),
            None,
            Vec::new(),
            serde_json::Map::new(),
        )),
    }
}

async fn records_since(
    state: &Arc<ServerState>,
    map: &str,
    since: &Timestamp,
) -> Vec<SyncMapRecord> {
    let Some(managed) = state.storage.get(map) else {
        return Vec::new();
    };
    managed.await_ready().await;
    let mut records = Vec::new();
    match &managed.map {
        crate::core::crdt::CrdtMap::Lww(lww) => {
            lww.for_each(|key, record| {
                if record.timestamp > *since {
                    records.push(SyncMapRecord {
                        key: key.to_string(),
                        value: record.value.clone(),
                        timestamp: record.timestamp.clone(),
                        event_type: if record.is_tombstone() {
                            EventType::Delete
                        } else {
                            EventType::Put
                        },
                    });
                }
            });
        }
        crate::core::crdt::CrdtMap::Or(or) => {
            or.for_each(|key, entries| {
                for entry in entries {
                    if entry.timestamp > *since {
                        records.push(SyncMapRecord {
                            key: key.to_string(),
                            value: entry.value.clone(),
                            timestamp: entry.timestamp.clone(),
                            event_type: EventType::Put,
                        });
                    }
                }
            });
        }
    }
    records
}

