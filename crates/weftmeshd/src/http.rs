//! HTTP serving surface (§6): the host-acting-as-server API over the
//! content store, cache, and player registry.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use weftmesh_core::types::ConfigKind;

use crate::state::AppState;

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Build the full router, including password-gate middleware and the
/// tracing/compression layers the teacher's own service composition uses.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/stats", get(stats))
        .route("/api/players/register", post(register_player))
        .route("/api/players/nearby", post(nearby))
        .route("/api/register-mods", post(register_mods))
        .route("/api/mods/:player_id", get(get_mods))
        .route("/api/mods/:player_id/chunked", get(get_mods_chunked))
        .route("/api/filter-connected", post(filter_connected))
        .route("/api/batch-check", post(batch_check))
        .layer(middleware::from_fn_with_state(state.clone(), password_gate))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .with_state(state)
}

/// Optional password gate: `x-fyteclub-password` header or `password` query
/// parameter must match the configured password. `/health` and
/// `/api/status` are exempt (§6).
async fn password_gate(
    State(state): State<AppState>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.config.password else {
        return next.run(req).await;
    };

    let path = req.uri().path();
    if path == "/health" || path == "/api/status" {
        return next.run(req).await;
    }

    let header_ok = req
        .headers()
        .get("x-fyteclub-password")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    let query_ok = req
        .uri()
        .query()
        .map(|q| url_query_pairs(q).any(|(k, v)| k == "password" && v == *expected))
        .unwrap_or(false);

    if header_ok || query_ok {
        next.run(req).await
    } else {
        (StatusCode::UNAUTHORIZED, Json(ErrorBody { error: "invalid password".into() })).into_response()
    }
}

fn url_query_pairs(query: &str) -> impl Iterator<Item = (String, String)> + '_ {
    query.split('&').filter_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next()?;
        let v = parts.next().unwrap_or("");
        Some((k.to_string(), v.to_string()))
    })
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
    timestamp: u64,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { service: "weftmeshd", status: "healthy", timestamp: now() })
}

#[derive(Serialize)]
struct StatusResponse {
    name: &'static str,
    version: &'static str,
    uptime: u64,
    users: usize,
    timestamp: u64,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        name: "weftmeshd",
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.uptime_secs(),
        users: state.players.len(),
        timestamp: now(),
    })
}

#[derive(Serialize)]
struct StatsResponse {
    storage: weftmesh_store::StorageStats,
    registered_players: usize,
    timestamp: u64,
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.store.stats() {
        Ok(storage) => {
            Json(StatsResponse { storage, registered_players: state.players.len(), timestamp: now() })
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "stats: failed to read storage counters");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

#[derive(Deserialize)]
struct RegisterPlayerRequest {
    #[serde(rename = "playerId")]
    player_id: String,
    #[serde(rename = "playerName")]
    player_name: String,
    #[serde(rename = "publicKey")]
    public_key: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn register_player(State(state): State<AppState>, Json(req): Json<RegisterPlayerRequest>) -> Response {
    if req.player_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(ErrorBody { error: "playerId must not be empty".into() }))
            .into_response();
    }
    state.players.register(&req.player_id, &req.player_name, &req.public_key);
    Json(SuccessResponse { success: true }).into_response()
}

#[derive(Deserialize)]
struct NearbyRequest {
    #[serde(rename = "playerId")]
    player_id: String,
    #[serde(rename = "nearbyPlayers")]
    nearby_players: Vec<String>,
    #[allow(dead_code)]
    zone: Option<String>,
}

#[derive(Serialize)]
struct NearbyResponse {
    mods: BTreeMap<String, weftmesh_core::types::Package>,
}

async fn nearby(State(state): State<AppState>, Json(req): Json<NearbyRequest>) -> Response {
    state.players.touch(&req.player_id);
    let mut mods = BTreeMap::new();
    for peer_id in req.nearby_players {
        if !state.players.is_connected(&peer_id) {
            continue;
        }
        if let Some(cached) = state.cache.get(&cache_key(&peer_id)) {
            if let Ok(pkg) = serde_json::from_value(cached) {
                mods.insert(peer_id, pkg);
                continue;
            }
        }
        if let Ok(pkg) = state.store.package(&peer_id) {
            if let Ok(value) = serde_json::to_value(&pkg) {
                state.cache.set(&cache_key(&peer_id), value, None);
            }
            mods.insert(peer_id, pkg);
        }
    }
    Json(NearbyResponse { mods }).into_response()
}

fn cache_key(player_id: &str) -> String {
    format!("package:{player_id}")
}

#[derive(Deserialize)]
struct ModAssetDto {
    path: String,
    /// Base64-encoded asset bytes.
    data: String,
}

#[derive(Deserialize)]
struct RegisterModsRequest {
    #[serde(rename = "playerId")]
    player_id: String,
    #[allow(dead_code)]
    #[serde(rename = "playerName")]
    player_name: String,
    mods: Vec<ModAssetDto>,
    #[serde(default)]
    configs: BTreeMap<ConfigKind, serde_json::Value>,
}

async fn register_mods(State(state): State<AppState>, Json(req): Json<RegisterModsRequest>) -> Response {
    let mut assets = Vec::with_capacity(req.mods.len());
    for m in req.mods {
        let bytes = match BASE64_STANDARD.decode(&m.data) {
            Ok(b) => b,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(ErrorBody { error: format!("bad asset data: {e}") }))
                    .into_response();
            }
        };
        assets.push((m.path, bytes));
    }

    match state.store.process_player(&req.player_id, &assets, &req.configs) {
        Ok(_) => {
            state.cache.del(&cache_key(&req.player_id));
            Json(SuccessResponse { success: true }).into_response()
        }
        Err(e) => {
            warn!(error = %e, player_id = %req.player_id, "register-mods: ingest failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

fn etag_for(player_id: &str, updated_at: u64) -> String {
    format!("\"{player_id}-{updated_at}\"")
}

async fn get_mods(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(updated_at) = state.store.last_modified(&player_id) else {
        return (StatusCode::NOT_FOUND, Json(ErrorBody { error: "no package for player".into() })).into_response();
    };
    let etag = etag_for(&player_id, updated_at);

    if let Some(if_none_match) = headers.get("if-none-match").and_then(|v| v.to_str().ok()) {
        if if_none_match == etag {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }
    if let Some(since) = headers.get("if-modified-since").and_then(|v| v.to_str().ok()) {
        if let Ok(since_ts) = since.parse::<u64>() {
            if since_ts >= updated_at {
                return StatusCode::NOT_MODIFIED.into_response();
            }
        }
    }

    match state.store.package(&player_id) {
        Ok(pkg) => {
            let mut response = Json(pkg).into_response();
            let h = response.headers_mut();
            h.insert("ETag", etag.parse().unwrap());
            h.insert("Last-Modified", updated_at.to_string().parse().unwrap());
            h.insert("Cache-Control", "private, max-age=3600".parse().unwrap());
            response
        }
        Err(e) => {
            warn!(error = %e, player_id = %player_id, "get_mods: package assembly failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

#[derive(Deserialize)]
struct ChunkedQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Serialize)]
struct Pagination {
    offset: usize,
    limit: usize,
    total: usize,
    #[serde(rename = "hasMore")]
    has_more: bool,
    #[serde(rename = "nextOffset")]
    next_offset: Option<usize>,
}

#[derive(Serialize)]
struct ChunkedResponse {
    mods: Vec<weftmesh_core::types::PackageAsset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    configs: Option<BTreeMap<ConfigKind, serde_json::Value>>,
    pagination: Pagination,
}

async fn get_mods_chunked(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
    Query(q): Query<ChunkedQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(updated_at) = state.store.last_modified(&player_id) else {
        return (StatusCode::NOT_FOUND, Json(ErrorBody { error: "no package for player".into() })).into_response();
    };
    let etag = etag_for(&player_id, updated_at);
    if headers.get("if-none-match").and_then(|v| v.to_str().ok()) == Some(etag.as_str()) {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let pkg = match state.store.package(&player_id) {
        Ok(pkg) => pkg,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: e.to_string() })).into_response();
        }
    };

    let limit = q.limit.unwrap_or(state.config.default_chunk_limit).max(1);
    let offset = q.offset.unwrap_or(0);
    let total = pkg.assets.len();
    let page: Vec<_> = pkg.assets.into_iter().skip(offset).take(limit).collect();
    let has_more = offset + page.len() < total;

    let mut response = Json(ChunkedResponse {
        mods: page,
        configs: if offset == 0 { Some(pkg.configs) } else { None },
        pagination: Pagination {
            offset,
            limit,
            total,
            has_more,
            next_offset: has_more.then_some(offset + limit),
        },
    })
    .into_response();
    response.headers_mut().insert("ETag", etag.parse().unwrap());
    response
}

#[derive(Deserialize)]
struct FilterConnectedRequest {
    #[serde(rename = "playerIds")]
    player_ids: Vec<String>,
    #[allow(dead_code)]
    zone: Option<String>,
}

#[derive(Serialize)]
struct FilterConnectedResponse {
    #[serde(rename = "connectedPlayers")]
    connected_players: Vec<String>,
}

async fn filter_connected(State(state): State<AppState>, Json(req): Json<FilterConnectedRequest>) -> Response {
    Json(FilterConnectedResponse { connected_players: state.players.connected_of(&req.player_ids) }).into_response()
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BatchOperation {
    FilterPlayers {
        #[serde(rename = "playerIds")]
        player_ids: Vec<String>,
    },
    GetMods {
        #[serde(rename = "playerIds")]
        player_ids: Vec<String>,
    },
}

#[derive(Deserialize)]
struct BatchCheckRequest {
    operations: Vec<BatchOperation>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum BatchResult {
    Connected { #[serde(rename = "connectedPlayers")] connected_players: Vec<String> },
    Mods { mods: BTreeMap<String, weftmesh_core::types::Package> },
}

#[derive(Serialize)]
struct BatchCheckResponse {
    results: Vec<BatchResult>,
}

async fn batch_check(State(state): State<AppState>, Json(req): Json<BatchCheckRequest>) -> Response {
    let results = req
        .operations
        .into_iter()
        .map(|op| match op {
            BatchOperation::FilterPlayers { player_ids } => {
                BatchResult::Connected { connected_players: state.players.connected_of(&player_ids) }
            }
            BatchOperation::GetMods { player_ids } => {
                let mut mods = BTreeMap::new();
                for id in player_ids {
                    if let Ok(pkg) = state.store.package(&id) {
                        mods.insert(id, pkg);
                    }
                }
                BatchResult::Mods { mods }
            }
        })
        .collect();
    Json(BatchCheckResponse { results }).into_response()
}
