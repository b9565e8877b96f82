//! HTTP/REST transport: binds `axum` routes to [`Node`] operations and
//! back. Everything in this module is thin glue — parse the request,
//! call the core, serialise the result — except the one piece of genuine
//! policy left to the caller: retrying a client operation across a
//! `WrongSchemeVersion` result (see [`with_scheme_retry`]).
//!
//! Client routes forward to another shard verbatim (method, query, body)
//! whenever [`Node::forward_target`] says this node does not own the key;
//! the remote response is mirrored back unchanged.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, put};
use axum::{Json, Router};
use rand::seq::IteratorRandom;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::core::shard_scheme::ShardScheme;
use crate::core::vector_clock::VectorClock;
use crate::error::AppError;
use crate::infrastructure::view::INTER_SERVER_PREFIX;
use crate::infrastructure::wire::{decode_reshard_move, encode_data_version_with_scheme};
use crate::infrastructure::PutOutcome;

/// Bound on a single forwarded/local body, generous enough for this
/// store's in-memory values without letting a malicious client exhaust
/// the process.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// How many times a client op retries after a `WrongSchemeVersion`
/// result before giving up and surfacing a 409 to the caller. Unbounded
/// retry is safe on a single-threaded blocking server but would let a
/// misbehaving peer starve this codebase's pooled async runtime, so this
/// bound is an ambient addition (see `DESIGN.md`).
const WRONG_SCHEME_MAX_ATTEMPTS: usize = 5;
const WRONG_SCHEME_WAIT: Duration = Duration::from_millis(200);

pub fn router(app_state: AppState) -> Router {
    let inter_server = Router::new()
        .route("/dataStore/{key}", patch(direct_get_handler))
        .route("/dataSync/push", patch(data_sync_push_handler))
        .route("/shards/prepare", patch(shards_prepare_handler))
        .route("/shards/switch", patch(shards_switch_handler))
        .route("/shards/move", patch(shards_move_handler));

    Router::new()
        .route(
            "/keyValue-store/{key}",
            get(get_key_handler).put(put_key_handler).delete(delete_key_handler),
        )
        .route("/keyValue-store/search/{key}", get(has_key_handler))
        .route("/view", get(list_view_handler).put(add_node_handler).delete(del_node_handler))
        .route("/shard/my_id", get(my_shard_id_handler))
        .route("/shard/all_ids", get(all_shard_ids_handler))
        .route("/shard/members/{shard_id}", get(shard_members_handler))
        .route("/shard/count/{shard_id}", get(shard_count_handler))
        .route("/shard/changeShardNumber", put(change_shard_number_handler))
        .nest(INTER_SERVER_PREFIX, inter_server)
        .with_state(app_state)
}

fn parse_clock(params: &HashMap<String, String>) -> VectorClock {
    VectorClock::from_string_encoding(params.get("payload").map(String::as_str).unwrap_or(""))
}

/// Retries `op` across `WrongSchemeVersion` results, waiting for local
/// scheme convergence between attempts instead of spinning. Exhausting
/// the retry budget surfaces a [`AppError::SchemeConflict`] carrying the
/// last version a peer reported.
async fn with_scheme_retry<T, F, Fut>(app: &AppState, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, crate::infrastructure::NodeError>>,
{
    use crate::infrastructure::NodeError;

    let mut last_version = None;
    for _ in 0..WRONG_SCHEME_MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(NodeError::WrongSchemeVersion(version)) => {
                last_version = Some(version);
                app.node.wait_for_scheme_version(version, WRONG_SCHEME_WAIT).await;
            }
            Err(other) => return Err(other.into()),
        }
    }
    Err(AppError::SchemeConflict(last_version.unwrap_or(-1)))
}

/// Forwards the original request verbatim (method, path, query, body) to
/// `target` and mirrors its response back unchanged.
async fn proxy(app: &AppState, target: &str, req: Request) -> Response {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return AppError::BadRequest("request body too large to forward".to_string()).into_response(),
    };

    let client = app.node.http_client().await;
    let url = format!("http://{target}{path_and_query}");
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);

    match client.request(reqwest_method, &url).body(body).send().await {
        Ok(resp) => mirror_response(resp).await,
        Err(_) => AppError::BadRequest(format!("failed to forward to {target}")).into_response(),
    }
}

async fn mirror_response(resp: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = resp.bytes().await.unwrap_or_default();
    (status, body).into_response()
}

// ---- client-facing routes --------------------------------------------

async fn get_key_handler(
    State(app): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    if let Some(target) = app.node.forward_target(&key).await {
        return proxy(&app, &target, req).await;
    }

    let clock = parse_clock(&params);
    match with_scheme_retry(&app, || app.node.get(key.clone(), clock.clone())).await {
        Ok((Some(value), node_clock)) => (
            StatusCode::OK,
            Json(json!({"value": value, "payload": node_clock.to_string_encoding()})),
        )
            .into_response(),
        Ok((None, node_clock)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"value": Option::<String>::None, "payload": node_clock.to_string_encoding()})),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn has_key_handler(
    State(app): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    if let Some(target) = app.node.forward_target(&key).await {
        return proxy(&app, &target, req).await;
    }

    let clock = parse_clock(&params);
    let (exists, node_clock) = app.node.has(key, clock).await;
    (
        StatusCode::OK,
        Json(json!({"isExists": exists, "payload": node_clock.to_string_encoding()})),
    )
        .into_response()
}

async fn put_key_handler(
    State(app): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    if let Some(target) = app.node.forward_target(&key).await {
        return proxy(&app, &target, req).await;
    }

    let clock = parse_clock(&params);
    let value = match params.get("val") {
        Some(v) => v.clone(),
        None => {
            let body = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
                .await
                .unwrap_or_default();
            String::from_utf8_lossy(&body).into_owned()
        }
    };

    match with_scheme_retry(&app, || app.node.put(key.clone(), value.clone(), clock.clone())).await {
        Ok((PutOutcome::CreatedNewValue, node_clock)) => (
            StatusCode::OK,
            Json(json!({"status": "CreatedNewValue", "payload": node_clock.to_string_encoding()})),
        )
            .into_response(),
        Ok((PutOutcome::UpdatedExistingValue, node_clock)) => (
            StatusCode::CREATED,
            Json(json!({"status": "UpdatedExistingValue", "payload": node_clock.to_string_encoding()})),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn delete_key_handler(
    State(app): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    if let Some(target) = app.node.forward_target(&key).await {
        return proxy(&app, &target, req).await;
    }

    let clock = parse_clock(&params);
    let (deleted, node_clock) = app.node.delete(key, clock).await;
    let status = if deleted { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (status, Json(json!({"payload": node_clock.to_string_encoding()}))).into_response()
}

async fn list_view_handler(State(app): State<AppState>) -> impl IntoResponse {
    let addresses = app.node.all_addresses().await;
    Json(json!({"addresses": addresses}))
}

#[derive(Deserialize)]
struct IpPortQuery {
    ip_port: Option<String>,
}

async fn add_node_handler(State(app): State<AppState>, Query(q): Query<IpPortQuery>) -> Response {
    let Some(addr) = q.ip_port.filter(|s| !s.is_empty()) else {
        return AppError::BadRequest("ip_port is required".to_string()).into_response();
    };
    let new_scheme = app.node.propose_add_node(addr).await;
    let version = new_scheme.version();
    app.node.coordinate_reshard(new_scheme).await;
    (StatusCode::OK, Json(json!({"version": version}))).into_response()
}

async fn del_node_handler(State(app): State<AppState>, Query(q): Query<IpPortQuery>) -> Response {
    let Some(addr) = q.ip_port.filter(|s| !s.is_empty()) else {
        return AppError::BadRequest("ip_port is required".to_string()).into_response();
    };
    let new_scheme = app.node.propose_del_node(addr).await;
    let version = new_scheme.version();
    app.node.coordinate_reshard(new_scheme).await;
    (StatusCode::OK, Json(json!({"version": version}))).into_response()
}

async fn my_shard_id_handler(State(app): State<AppState>) -> impl IntoResponse {
    let id = app.node.my_shard_id().await.map(|id| id as i64).unwrap_or(-1);
    Json(json!({"shardId": id}))
}

async fn all_shard_ids_handler(State(app): State<AppState>) -> impl IntoResponse {
    let num_shards = app.node.num_shards().await;
    Json(json!({"shardIds": (0..num_shards).collect::<Vec<_>>()}))
}

async fn shard_members_handler(State(app): State<AppState>, Path(shard_id): Path<usize>) -> Response {
    match app.node.shard_members(shard_id).await {
        Some(members) => (StatusCode::OK, Json(json!({"members": members}))).into_response(),
        None => AppError::BadRequest(format!("no such shard {shard_id}")).into_response(),
    }
}

/// Proxies to a random member of `shard_id` when that isn't this node's
/// own shard, since only a shard's own members can count their local
/// live keys.
async fn shard_count_handler(State(app): State<AppState>, Path(shard_id): Path<usize>) -> Response {
    if app.node.my_shard_id().await == Some(shard_id) {
        let count = app.node.count().await;
        return (StatusCode::OK, Json(json!({"count": count}))).into_response();
    }

    let Some(members) = app.node.shard_members(shard_id).await else {
        return AppError::BadRequest(format!("no such shard {shard_id}")).into_response();
    };
    let Some(target) = members.iter().choose(&mut rand::rng()).cloned() else {
        return AppError::BadRequest(format!("shard {shard_id} has no members")).into_response();
    };

    let client = app.node.http_client().await;
    let url = format!("http://{target}/shard/count/{shard_id}");
    match client.get(&url).send().await {
        Ok(resp) => mirror_response(resp).await,
        Err(_) => AppError::BadRequest(format!("failed to reach {target}")).into_response(),
    }
}

#[derive(Deserialize)]
struct NumShardsQuery {
    num: usize,
}

async fn change_shard_number_handler(State(app): State<AppState>, Query(q): Query<NumShardsQuery>) -> Response {
    match app.node.propose_reshard(q.num).await {
        Ok(new_scheme) => {
            let version = new_scheme.version();
            app.node.coordinate_reshard(new_scheme).await;
            (StatusCode::OK, Json(json!({"version": version}))).into_response()
        }
        Err(err) => AppError::from(err).into_response(),
    }
}

// ---- inter-server routes, nested under `/inter_server` --------------

async fn direct_get_handler(State(app): State<AppState>, Path(key): Path<String>) -> Response {
    let (data, scheme_version) = app.node.direct_get(&key).await;
    match data {
        Some(dv) => (StatusCode::OK, encode_data_version_with_scheme(scheme_version, &dv)).into_response(),
        None => (StatusCode::OK, String::new()).into_response(),
    }
}

async fn data_sync_push_handler(State(app): State<AppState>, body: String) -> Response {
    match app.node.sync_data(&body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn shards_prepare_handler(State(app): State<AppState>, body: String) -> Response {
    let new_scheme = ShardScheme::deserialize(&body, "");
    match app.node.reshard_prepare(new_scheme).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn shards_switch_handler(State(app): State<AppState>, body: String) -> Response {
    let version: i32 = match body.trim().parse() {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    match app.node.reshard_switch(version).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn shards_move_handler(State(app): State<AppState>, body: String) -> Response {
    let Some((version, key, data)) = decode_reshard_move(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match app.node.reshard_move(version, key, data).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::PAYMENT_REQUIRED.into_response(),
    }
}
