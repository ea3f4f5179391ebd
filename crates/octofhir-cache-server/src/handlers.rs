//! Cache admin API.

use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use octofhir_cache::{CacheService, HealthReport, StatsSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::metrics;

#[derive(Clone)]
pub struct AppState {
    pub cache: CacheService,
}

pub async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.cache.health_check().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    if let Some(memory) = state.cache.memory() {
        metrics::set_cache_entries("memory", memory.len());
    }
    match metrics::render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => ApiError::unavailable("metrics recorder not installed").into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub hit_rate_display: String,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.cache.stats().await;
    Json(StatsResponse {
        hit_rate_display: stats.hit_rate_display(),
        stats,
    })
}

pub async fn reset_stats(State(state): State<AppState>) -> StatusCode {
    state.cache.reset_stats().await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct PatternQuery {
    pub pattern: Option<String>,
}

pub async fn list_keys(
    State(state): State<AppState>,
    Query(q): Query<PatternQuery>,
) -> Json<serde_json::Value> {
    let pattern = q.pattern.unwrap_or_else(|| "*".to_string());
    let keys = state.cache.keys(&pattern).await;
    Json(json!({
        "pattern": pattern,
        "count": keys.len(),
        "keys": keys,
    }))
}

pub async fn clear(
    State(state): State<AppState>,
    Query(q): Query<PatternQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    // An explicit pattern is required; `*` clears the whole namespace
    let pattern = q
        .pattern
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::bad_request("query parameter 'pattern' is required"))?;
    if !state.cache.clear(&pattern).await {
        return Err(ApiError::unavailable(format!("clear '{pattern}' failed")));
    }
    Ok(Json(json!({ "pattern": pattern, "cleared": true })))
}

pub async fn get_entry(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<Response> {
    match state.cache.get(&key).await {
        Some(value) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            value.as_ref().clone(),
        )
            .into_response()),
        None => Err(ApiError::not_found(format!("key '{key}'"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct TtlQuery {
    /// Seconds; absent or 0 uses the configured default
    pub ttl: Option<u64>,
}

pub async fn put_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<TtlQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let ttl = q.ttl.filter(|s| *s > 0).map(Duration::from_secs);
    if state.cache.set(&key, body.to_vec(), ttl).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::unavailable(format!("key '{key}' was not stored")))
    }
}

pub async fn delete_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    if state.cache.del(&key).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::unavailable(format!("key '{key}' was not deleted")))
    }
}

#[derive(Debug, Deserialize)]
pub struct MgetRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MgetResponse {
    /// Base64 encoded values, `null` for misses, in request order
    pub values: Vec<Option<String>>,
}

pub async fn mget(
    State(state): State<AppState>,
    Json(req): Json<MgetRequest>,
) -> ApiResult<Json<MgetResponse>> {
    if req.keys.is_empty() {
        return Err(ApiError::bad_request("'keys' must not be empty"));
    }
    let values = state
        .cache
        .mget(&req.keys)
        .await
        .into_iter()
        .map(|v| v.map(|bytes| STANDARD.encode(bytes.as_slice())))
        .collect();
    Ok(Json(MgetResponse { values }))
}
