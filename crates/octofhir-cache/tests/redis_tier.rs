//! Integration tests against a real Redis.
//!
//! Tests use testcontainers to spin up a Redis instance, so they need Docker:
//! `cargo test -p octofhir-cache -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use octofhir_cache::{CacheConfig, CacheMode, CacheService, ConnectionState, RemoteConfig};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

/// A started service with its own namespace so tests do not see each other's keys.
async fn cache(mode: CacheMode, namespace: &str) -> CacheService {
    let config = CacheConfig {
        mode,
        namespace: namespace.to_string(),
        remote: RemoteConfig {
            url: Some(get_redis_url().await),
            pool_size: 4,
            command_timeout_ms: 5000,
            ..Default::default()
        },
        ..Default::default()
    };
    let cache = CacheService::new(config);
    cache.start().await;
    cache
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_remote_connects_and_round_trips() {
    let cache = cache(CacheMode::Remote, "it-roundtrip:").await;
    assert_eq!(cache.mode(), CacheMode::Remote);
    assert_eq!(cache.remote().unwrap().state(), ConnectionState::Ready);

    assert!(cache.set("k", b"value".to_vec(), Some(Duration::from_secs(60))).await);
    assert_eq!(cache.get("k").await, Some(Arc::new(b"value".to_vec())));
    assert!(cache.has("k").await);

    assert!(cache.del("k").await);
    assert_eq!(cache.get("k").await, None);

    let health = cache.health_check().await;
    assert!(health.healthy);
    assert!(health.remote.unwrap().latency_ms.is_some());

    cache.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_remote_ttl_expires() {
    let cache = cache(CacheMode::Remote, "it-ttl:").await;

    cache
        .set("short", b"v".to_vec(), Some(Duration::from_millis(200)))
        .await;
    assert!(cache.get("short").await.is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(cache.get("short").await.is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_pipelined_batches() {
    let cache = cache(CacheMode::Remote, "it-batch:").await;

    let entries: Vec<(String, Arc<Vec<u8>>)> = (0..50)
        .map(|i| (format!("item:{i}"), Arc::new(i.to_string().into_bytes())))
        .collect();
    assert!(cache.mset(&entries, None).await);

    let values = cache.mget(&["item:3", "item:missing", "item:42"]).await;
    assert_eq!(
        values,
        vec![
            Some(Arc::new(b"3".to_vec())),
            None,
            Some(Arc::new(b"42".to_vec()))
        ]
    );

    assert!(cache.mdel(&["item:3", "item:42"]).await);
    assert_eq!(cache.mget(&["item:3", "item:42"]).await, vec![None, None]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_scan_based_keys_and_clear() {
    let cache = cache(CacheMode::Remote, "it-scan:").await;

    for key in ["ns:a", "ns:b", "ns.c", "other:a", "q?x"] {
        cache.set(key, b"v".to_vec(), None).await;
    }

    assert_eq!(cache.keys("ns:*").await, vec!["it-scan:ns:a", "it-scan:ns:b"]);
    // `?` is literal, not a single-character wildcard
    assert_eq!(cache.keys("q?x").await, vec!["it-scan:q?x"]);

    assert!(cache.clear("ns:*").await);
    assert_eq!(
        cache.keys("*").await,
        vec!["it-scan:ns.c", "it-scan:other:a", "it-scan:q?x"]
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_hybrid_instances_share_remote_tier() {
    let writer = cache(CacheMode::Hybrid, "it-hybrid:").await;
    let reader = cache(CacheMode::Hybrid, "it-hybrid:").await;

    assert!(writer.set("shared", b"payload".to_vec(), None).await);

    // First read comes from Redis and is promoted into the reader's memory tier
    assert_eq!(reader.get("shared").await, Some(Arc::new(b"payload".to_vec())));
    assert_eq!(reader.get("shared").await, Some(Arc::new(b"payload".to_vec())));

    let stats = reader.stats().await;
    assert_eq!(stats.remote.unwrap().hits, 1);
    assert_eq!(stats.memory.unwrap().hits, 1);
}

#[tokio::test]
async fn test_unreachable_redis_degrades_hybrid() {
    let config = CacheConfig {
        mode: CacheMode::Hybrid,
        remote: RemoteConfig {
            // Reserved port, nothing listens there
            url: Some("redis://127.0.0.1:1".to_string()),
            command_timeout_ms: 200,
            max_reconnect_attempts: 1,
            reprobe_interval_secs: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let cache = CacheService::new(config);
    cache.start().await;

    assert_ne!(cache.remote().unwrap().state(), ConnectionState::Ready);
    assert!(cache.set("k", b"v".to_vec(), None).await);
    assert_eq!(cache.get("k").await, Some(Arc::new(b"v".to_vec())));

    let health = cache.health_check().await;
    assert!(health.healthy);
    assert!(health.degraded);

    cache.shutdown().await;
}
