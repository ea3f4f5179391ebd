use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode,
        header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, SET_COOKIE},
    },
    middleware::Next,
    response::Response,
};
use octofhir_cache::CacheService;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::form_urlencoded;
use uuid::Uuid;

use crate::config::ResponseCacheConfig;
use crate::metrics;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    // If the incoming request already has a request-id, preserve it; otherwise generate one
    let req_id_value = match req.headers().get(&X_REQUEST_ID) {
        Some(value) => value.clone(),
        None => match HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            Ok(value) => value,
            Err(_) => return next.run(req).await,
        },
    };

    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(X_REQUEST_ID, req_id_value);
    res
}

pub async fn http_metrics(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let res = next.run(req).await;

    metrics::record_http_request(&method, &path, res.status().as_u16(), start.elapsed());
    res
}

/// Runtime options of the response cache, resolved from [`ResponseCacheConfig`].
#[derive(Debug, Clone)]
pub struct ResponseCacheOptions {
    pub ttl: Option<Duration>,
    pub skip_authenticated: bool,
    pub identity_header: Option<HeaderName>,
    pub max_body_bytes: usize,
}

impl Default for ResponseCacheOptions {
    fn default() -> Self {
        Self::from_config(&ResponseCacheConfig::default())
    }
}

impl ResponseCacheOptions {
    pub fn from_config(config: &ResponseCacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            skip_authenticated: config.skip_authenticated,
            identity_header: config
                .identity_header
                .as_deref()
                .and_then(|name| HeaderName::try_from(name).ok()),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

#[derive(Clone)]
pub struct ResponseCacheState {
    pub cache: CacheService,
    pub options: Arc<ResponseCacheOptions>,
}

impl ResponseCacheState {
    pub fn new(cache: CacheService, options: ResponseCacheOptions) -> Self {
        Self {
            cache,
            options: Arc::new(options),
        }
    }
}

/// Stored form of a cached response (MessagePack encoded).
#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl CachedResponse {
    fn into_response(self) -> Response {
        let mut res = Response::new(Body::from(self.body));
        *res.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        if let Some(ct) = self
            .content_type
            .and_then(|ct| HeaderValue::from_str(&ct).ok())
        {
            res.headers_mut().insert(CONTENT_TYPE, ct);
        }
        res
    }
}

/// Cache key of a request before namespacing:
/// `http:{METHOD}:{path}[?{sorted query}][:id:{caller hash}]`.
pub fn response_cache_key(req: &Request<Body>, options: &ResponseCacheOptions) -> String {
    let uri = req.uri();
    let mut key = format!("http:{}:{}", req.method(), uri.path());

    if let Some(query) = uri.query() {
        let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        if !pairs.is_empty() {
            pairs.sort();
            let canonical = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            key.push('?');
            key.push_str(&canonical);
        }
    }

    if let Some(identity) = caller_identity(req.headers(), options) {
        key.push_str(":id:");
        key.push_str(&identity);
    }
    key
}

/// Hash of the first identifying header present: the configured identity
/// header, then `Authorization`, then every `Cookie` value.
fn caller_identity(headers: &HeaderMap, options: &ResponseCacheOptions) -> Option<String> {
    let name = match &options.identity_header {
        Some(name) if headers.contains_key(name) => name.clone(),
        _ if headers.contains_key(AUTHORIZATION) => AUTHORIZATION,
        _ if headers.contains_key(COOKIE) => COOKIE,
        _ => return None,
    };

    let mut hasher = Sha256::new();
    for value in headers.get_all(&name) {
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    Some(hex::encode(&hasher.finalize()[..8]))
}

fn is_authenticated(headers: &HeaderMap) -> bool {
    headers.contains_key(AUTHORIZATION) || headers.contains_key(COOKIE)
}

fn is_storable(headers: &HeaderMap) -> bool {
    if headers.contains_key(SET_COOKIE) {
        return false;
    }
    let directives = headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    !directives.contains("no-store") && !directives.contains("private")
}

/// Body length known up front, from `Content-Length` or an exact size hint.
fn known_length(headers: &HeaderMap, body: &Body) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or_else(|| body.size_hint().exact())
}

fn annotate(res: &mut Response, outcome: &'static str, key: Option<&HeaderValue>) {
    metrics::record_response_cache(outcome);
    let value = match outcome {
        "hit" => "HIT",
        "miss" => "MISS",
        _ => "BYPASS",
    };
    res.headers_mut().insert(X_CACHE, HeaderValue::from_static(value));
    if let Some(key) = key {
        res.headers_mut().insert(X_CACHE_KEY, key.clone());
    }
}

/// Serve GET/HEAD responses from the cache and store successful ones.
///
/// Stores happen in a detached task so the response is never delayed by the
/// cache. Only bodies of known length within `max_body_bytes` are buffered;
/// streaming and oversized bodies pass through unstored. Other methods pass
/// through untouched.
pub async fn response_cache(
    State(state): State<ResponseCacheState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return next.run(req).await;
    }

    if state.options.skip_authenticated && is_authenticated(req.headers()) {
        let mut res = next.run(req).await;
        annotate(&mut res, "bypass", None);
        return res;
    }

    let key = state
        .cache
        .codec()
        .normalize(&response_cache_key(&req, &state.options));
    let key_header = HeaderValue::from_str(&key).ok();

    if let Some(bytes) = state.cache.get(&key).await {
        match rmp_serde::from_slice::<CachedResponse>(&bytes) {
            Ok(cached) => {
                tracing::debug!(key = %key, "Response served from cache");
                let mut res = cached.into_response();
                annotate(&mut res, "hit", key_header.as_ref());
                return res;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Dropping undecodable cached response");
                state.cache.del(&key).await;
            }
        }
    }

    let res = next.run(req).await;
    let (mut parts, body) = res.into_parts();

    let limit = state.options.max_body_bytes;
    let bufferable = known_length(&parts.headers, &body)
        .is_some_and(|len| usize::try_from(len).is_ok_and(|len| len <= limit));
    if !parts.status.is_success() || !is_storable(&parts.headers) || !bufferable {
        let mut res = Response::from_parts(parts, body);
        annotate(&mut res, "miss", key_header.as_ref());
        return res;
    }

    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            // The body is gone; keep the handler's status and headers.
            tracing::warn!(key = %key, error = %e, "Failed to buffer response body");
            parts.headers.remove(CONTENT_LENGTH);
            let mut res = Response::from_parts(parts, Body::empty());
            annotate(&mut res, "miss", key_header.as_ref());
            return res;
        }
    };

    let entry = CachedResponse {
        status: parts.status.as_u16(),
        content_type: parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: bytes.to_vec(),
    };
    let cache = state.cache.clone();
    let ttl = state.options.ttl;
    let store_key = key.clone();
    tokio::spawn(async move {
        match rmp_serde::to_vec(&entry) {
            Ok(encoded) => {
                if !cache.set(&store_key, encoded, ttl).await {
                    tracing::debug!(key = %store_key, "Response was not cached");
                }
            }
            Err(e) => {
                tracing::warn!(key = %store_key, error = %e, "Failed to encode response for cache");
            }
        }
    });

    let mut res = Response::from_parts(parts, Body::from(bytes));
    annotate(&mut res, "miss", key_header.as_ref());
    res
}
