use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::Path,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    routing::get,
};
use futures_util::StreamExt;
use octofhir_cache::CacheService;
use octofhir_cache_server::{AppConfig, build_app};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

struct TestServer {
    base: String,
    cache: CacheService,
    calls: Arc<AtomicUsize>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
        self.cache.shutdown().await;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Stores are fire-and-forget; wait until one lands.
    async fn wait_cached(&self, key: &str) {
        for _ in 0..100 {
            if self.cache.has(key).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{key} was never cached");
    }
}

fn routes(calls: Arc<AtomicUsize>) -> Router {
    let reports = calls.clone();
    let failing = calls.clone();
    let me = calls.clone();
    let big = calls.clone();
    let private = calls.clone();
    let session = calls;

    Router::new()
        .route(
            "/reports/{id}",
            get(move |Path(id): Path<String>| {
                let calls = reports.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({ "id": id, "generation": n }))
                }
            })
            .post(|| async { StatusCode::CREATED }),
        )
        .route(
            "/failing",
            get(move || {
                let calls = failing.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        )
        .route(
            "/me",
            get(move |headers: HeaderMap| {
                let calls = me.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let user = headers
                        .get("x-user-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("anonymous")
                        .to_string();
                    Json(json!({ "user": user }))
                }
            }),
        )
        .route(
            "/big",
            get(move || {
                let calls = big.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "x".repeat(4096)
                }
            }),
        )
        .route(
            "/private",
            get(move || {
                let calls = private.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([("cache-control", "private")], "secret")
                }
            }),
        )
        .route(
            "/session",
            get(move |headers: HeaderMap| {
                let calls = session.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    headers
                        .get("cookie")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                }
            }),
        )
        .route(
            "/events",
            get(|| async {
                // One event, then the stream stays open
                let events = futures_util::stream::once(async {
                    Ok::<_, std::io::Error>(Bytes::from_static(b"data: hello\n\n"))
                })
                .chain(futures_util::stream::pending());
                ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(events))
            }),
        )
}

async fn start_server(cfg: AppConfig) -> TestServer {
    let cache = CacheService::new(cfg.cache.clone());
    cache.start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let app = build_app(&cfg, cache.clone(), routes(calls.clone()));

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        cache,
        calls,
        shutdown_tx,
        handle,
    }
}

fn header<'a>(resp: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn second_get_is_served_from_cache() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();
    let url = format!("{}/reports/1", server.base);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header(&resp, "x-cache"), Some("MISS"));
    assert_eq!(header(&resp, "x-cache-key"), Some("cache:http:GET:/reports/1"));
    let first: Value = resp.json().await.unwrap();

    server.wait_cached("http:GET:/reports/1").await;

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header(&resp, "x-cache"), Some("HIT"));
    assert_eq!(header(&resp, "content-type"), Some("application/json"));
    let second: Value = resp.json().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(server.calls(), 1);

    // Invalidating through the cache forces a fresh render
    assert!(server.cache.clear("http:GET:/reports/*").await);
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(header(&resp, "x-cache"), Some("MISS"));
    let third: Value = resp.json().await.unwrap();
    assert_eq!(third["generation"], 2);

    server.stop().await;
}

#[tokio::test]
async fn query_order_does_not_split_entries() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/reports/2?b=2&a=1", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(header(&resp, "x-cache"), Some("MISS"));
    server.wait_cached("http:GET:/reports/2?a=1&b=2").await;

    let resp = client
        .get(format!("{}/reports/2?a=1&b=2", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(header(&resp, "x-cache"), Some("HIT"));
    assert_eq!(server.calls(), 1);

    server.stop().await;
}

#[tokio::test]
async fn non_get_and_failed_responses_are_not_cached() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/reports/3", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    assert!(header(&resp, "x-cache").is_none());

    for _ in 0..2 {
        let resp = client
            .get(format!("{}/failing", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        assert_eq!(header(&resp, "x-cache"), Some("MISS"));
    }
    assert_eq!(server.calls(), 2);
    assert!(!server.cache.has("http:GET:/failing").await);

    for _ in 0..2 {
        let resp = client
            .get(format!("{}/private", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.text().await.unwrap(), "secret");
    }
    assert_eq!(server.calls(), 4);

    server.stop().await;
}

#[tokio::test]
async fn oversized_bodies_pass_through() {
    let mut cfg = AppConfig::default();
    cfg.response_cache.max_body_bytes = 1024;
    let server = start_server(cfg).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .get(format!("{}/big", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(header(&resp, "x-cache"), Some("MISS"));
        assert_eq!(resp.text().await.unwrap().len(), 4096);
    }
    assert_eq!(server.calls(), 2);

    server.stop().await;
}

#[tokio::test]
async fn authenticated_requests_bypass_by_default() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .get(format!("{}/reports/4", server.base))
            .header("authorization", "Bearer token")
            .send()
            .await
            .unwrap();
        assert_eq!(header(&resp, "x-cache"), Some("BYPASS"));
        assert!(header(&resp, "x-cache-key").is_none());
    }
    assert_eq!(server.calls(), 2);
    assert!(server.cache.keys("http:*").await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn identity_header_scopes_entries_per_caller() {
    let mut cfg = AppConfig::default();
    cfg.response_cache.skip_authenticated = false;
    cfg.response_cache.identity_header = Some("x-user-id".to_string());
    let server = start_server(cfg).await;
    let client = reqwest::Client::new();
    let url = format!("{}/me", server.base);

    let alice = client.get(&url).header("x-user-id", "alice").send().await.unwrap();
    let alice_key = header(&alice, "x-cache-key").unwrap().to_string();
    assert!(alice_key.starts_with("cache:http:GET:/me:id:"));
    server.wait_cached(&alice_key).await;

    let bob = client.get(&url).header("x-user-id", "bob").send().await.unwrap();
    assert_eq!(header(&bob, "x-cache"), Some("MISS"));
    assert_ne!(header(&bob, "x-cache-key").unwrap(), alice_key);
    let body: Value = bob.json().await.unwrap();
    assert_eq!(body["user"], "bob");

    let again = client.get(&url).header("x-user-id", "alice").send().await.unwrap();
    assert_eq!(header(&again, "x-cache"), Some("HIT"));
    let body: Value = again.json().await.unwrap();
    assert_eq!(body["user"], "alice");

    assert_eq!(server.calls(), 2);
    server.stop().await;
}

#[tokio::test]
async fn disabled_response_cache_leaves_routes_alone() {
    let mut cfg = AppConfig::default();
    cfg.response_cache.enabled = false;
    let server = start_server(cfg).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .get(format!("{}/reports/5", server.base))
            .send()
            .await
            .unwrap();
        assert!(header(&resp, "x-cache").is_none());
    }
    assert_eq!(server.calls(), 2);

    server.stop().await;
}

#[tokio::test]
async fn cookie_sessions_never_share_entries() {
    let mut cfg = AppConfig::default();
    cfg.response_cache.skip_authenticated = false;
    let server = start_server(cfg).await;
    let client = reqwest::Client::new();
    let url = format!("{}/session", server.base);

    let alice = client.get(&url).header("cookie", "sid=alice").send().await.unwrap();
    assert_eq!(header(&alice, "x-cache"), Some("MISS"));
    let alice_key = header(&alice, "x-cache-key").unwrap().to_string();
    assert!(alice_key.starts_with("cache:http:GET:/session:id:"));
    server.wait_cached(&alice_key).await;

    let bob = client.get(&url).header("cookie", "sid=bob").send().await.unwrap();
    assert_eq!(header(&bob, "x-cache"), Some("MISS"));
    assert_ne!(header(&bob, "x-cache-key").unwrap(), alice_key);
    assert_eq!(bob.text().await.unwrap(), "sid=bob");

    let again = client.get(&url).header("cookie", "sid=alice").send().await.unwrap();
    assert_eq!(header(&again, "x-cache"), Some("HIT"));
    assert_eq!(again.text().await.unwrap(), "sid=alice");

    assert_eq!(server.calls(), 2);
    server.stop().await;
}

#[tokio::test]
async fn streaming_responses_are_not_buffered() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();

    let mut resp = tokio::time::timeout(
        Duration::from_secs(2),
        client.get(format!("{}/events", server.base)).send(),
    )
    .await
    .expect("headers arrive while the stream is still open")
    .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header(&resp, "x-cache"), Some("MISS"));
    assert_eq!(header(&resp, "content-type"), Some("text/event-stream"));

    let chunk = tokio::time::timeout(Duration::from_secs(2), resp.chunk())
        .await
        .expect("first event arrives")
        .unwrap()
        .unwrap();
    assert_eq!(chunk.as_ref(), b"data: hello\n\n");

    drop(resp);
    drop(client);
    assert!(server.cache.keys("http:*").await.is_empty());

    // The stream never ends, so do not wait for a graceful drain
    let _ = server.shutdown_tx.send(());
    server.handle.abort();
    server.cache.shutdown().await;
}
