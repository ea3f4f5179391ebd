//! Multi-tier cache coordinator.
//!
//! `CacheService` is the single entry point used by the rest of the
//! application. It normalizes keys, dispatches to the memory tier, the remote
//! tier or both depending on [`CacheMode`], and records every outcome in the
//! shared [`StatsRecorder`].
//!
//! Public operations never return errors. Tier failures are logged, counted
//! and turned into a miss, `false` or an empty list, so callers always fall
//! back to their own source of truth.
//!
//! # Hybrid mode
//!
//! - reads check memory first, then the remote tier when it is `Ready`; a
//!   remote hit repopulates memory for `min(hybrid_memory_ttl, remaining
//!   remote TTL)`
//! - writes always land in memory (TTL capped by `hybrid_memory_ttl`) and, when
//!   the remote tier is `Ready`, in the remote tier with the requested TTL or
//!   `hybrid_remote_ttl`
//! - deletes and clears hit both tiers independently; a remote failure is
//!   counted as a partial failure

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::CacheValue;
use crate::config::{CacheConfig, CacheMode};
use crate::error::CacheError;
use crate::health::{HealthReport, MemoryHealth, RemoteHealth};
use crate::key::KeyCodec;
use crate::memory::MemoryTier;
use crate::remote::redis::RedisConnector;
use crate::remote::{RemoteConnector, RemoteEntry, RemoteOptions, RemoteTier};
use crate::stats::{StatsRecorder, StatsSnapshot};

enum Tiers {
    Memory(Arc<MemoryTier>),
    Remote(Arc<RemoteTier>),
    Hybrid {
        memory: Arc<MemoryTier>,
        remote: Arc<RemoteTier>,
    },
}

impl Tiers {
    fn mode(&self) -> CacheMode {
        match self {
            Tiers::Memory(_) => CacheMode::Memory,
            Tiers::Remote(_) => CacheMode::Remote,
            Tiers::Hybrid { .. } => CacheMode::Hybrid,
        }
    }
}

struct CacheInner {
    config: CacheConfig,
    codec: KeyCodec,
    stats: StatsRecorder,
    tiers: Tiers,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Cache coordinator. Cheap to clone; clones share the same tiers.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("mode", &self.mode())
            .field("namespace", &self.inner.codec.namespace())
            .finish()
    }
}

impl CacheService {
    /// Build a service from configuration, using Redis for the remote tier.
    ///
    /// Remote or hybrid mode without a usable `cache.remote.url` falls back to
    /// memory mode with a warning.
    pub fn new(config: CacheConfig) -> Self {
        if !config.mode.uses_remote() {
            return Self::build(config, None::<RedisConnector>);
        }

        match RedisConnector::from_config(&config.remote) {
            Ok(connector) => Self::build(config, Some(connector)),
            Err(e) => {
                tracing::warn!(
                    mode = %config.mode,
                    error = %e,
                    "Remote cache not usable, falling back to memory mode"
                );
                let config = CacheConfig {
                    mode: CacheMode::Memory,
                    ..config
                };
                Self::build(config, None::<RedisConnector>)
            }
        }
    }

    /// Build a service with a custom remote connector.
    pub fn with_connector(config: CacheConfig, connector: impl RemoteConnector + 'static) -> Self {
        Self::build(config, Some(connector))
    }

    fn build<C: RemoteConnector + 'static>(config: CacheConfig, connector: Option<C>) -> Self {
        let stats = StatsRecorder::new();

        let memory = |default_ttl: Option<Duration>| {
            Arc::new(MemoryTier::new(
                default_ttl,
                config.max_memory_keys(),
                Arc::clone(&stats.memory),
            ))
        };
        let remote = |connector: C, default_ttl: Option<Duration>| {
            RemoteTier::new(
                connector,
                RemoteOptions::from_config(&config.remote, default_ttl),
                Arc::clone(&stats.remote),
            )
        };

        let tiers = match (config.mode, connector) {
            (CacheMode::Remote, Some(connector)) => {
                Tiers::Remote(remote(connector, config.default_ttl()))
            }
            (CacheMode::Hybrid, Some(connector)) => Tiers::Hybrid {
                memory: memory(Some(config.hybrid_memory_ttl())),
                remote: remote(connector, config.hybrid_remote_ttl()),
            },
            (CacheMode::Memory, _) => Tiers::Memory(memory(config.default_ttl())),
            (mode, None) => {
                tracing::warn!(%mode, "No remote connector, falling back to memory mode");
                Tiers::Memory(memory(config.default_ttl()))
            }
        };

        let codec = KeyCodec::new(config.namespace.clone());
        Self {
            inner: Arc::new(CacheInner {
                config,
                codec,
                stats,
                tiers,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// The mode actually in effect (after any configuration fallback).
    pub fn mode(&self) -> CacheMode {
        self.inner.tiers.mode()
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.inner.codec
    }

    pub fn memory(&self) -> Option<&Arc<MemoryTier>> {
        match &self.inner.tiers {
            Tiers::Memory(memory) | Tiers::Hybrid { memory, .. } => Some(memory),
            Tiers::Remote(_) => None,
        }
    }

    pub fn remote(&self) -> Option<&Arc<RemoteTier>> {
        match &self.inner.tiers {
            Tiers::Remote(remote) | Tiers::Hybrid { remote, .. } => Some(remote),
            Tiers::Memory(_) => None,
        }
    }

    /// Spawn the memory sweeper and connect the remote tier. Only the first call does anything.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(memory) = self.memory() {
            let handle = Arc::clone(memory).spawn_sweeper(
                self.inner.config.sweep_interval(),
                self.inner.shutdown.child_token(),
            );
            *self.inner.sweeper.lock() = Some(handle);
        }

        if let Some(remote) = self.remote() {
            if let Err(e) = remote.connect().await {
                tracing::warn!(
                    endpoint = %remote.endpoint(),
                    error = %e,
                    "Remote cache unavailable at startup, retrying in background"
                );
                remote.schedule_reconnect();
            }
        }

        tracing::info!(mode = %self.mode(), namespace = %self.inner.codec.namespace(), "Cache service started");
    }

    /// Stop background tasks, close the remote tier and drop local entries.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.shutdown.cancel();
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Memory cache sweeper ended abnormally");
            }
        }

        if let Some(remote) = self.remote() {
            remote.close();
        }
        if let Some(memory) = self.memory() {
            memory.clear_all();
        }
        tracing::info!("Cache service shut down");
    }

    fn hybrid_memory_ttl(&self, remote_ttl: Option<Duration>) -> Duration {
        let cap = self.inner.config.hybrid_memory_ttl();
        remote_ttl.map_or(cap, |ttl| ttl.min(cap))
    }

    fn hybrid_remote_ttl(&self, requested: Option<Duration>) -> Option<Duration> {
        requested
            .filter(|ttl| !ttl.is_zero())
            .or_else(|| self.inner.config.hybrid_remote_ttl())
    }

    /// Copy a remote hit into memory, bounded by what is left of its remote TTL.
    fn repopulate(&self, memory: &MemoryTier, key: &str, entry: &RemoteEntry) {
        let ttl = self.hybrid_memory_ttl(entry.ttl);
        if ttl.is_zero() {
            return;
        }
        if memory.set(key, Arc::clone(&entry.value), Some(ttl)) {
            tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Repopulated memory cache from remote");
        }
    }

    fn remote_failed(&self, op: &'static str, err: &CacheError) {
        self.inner.stats.global.record_error(err);
        self.log_remote_error(op, err);
    }

    fn remote_partial_failure(&self, op: &'static str, err: &CacheError) {
        self.inner.stats.record_partial_failure(err);
        self.log_remote_error(op, err);
    }

    fn log_remote_error(&self, op: &'static str, err: &CacheError) {
        match err {
            CacheError::Connection(_) | CacheError::Closed => {
                tracing::debug!(op, error = %err, "Remote cache unavailable")
            }
            _ => tracing::warn!(op, error = %err, "Remote cache operation failed"),
        }
    }

    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        self.inner.stats.record_call("get");
        let key = self.inner.codec.normalize(key);

        let value = match &self.inner.tiers {
            Tiers::Memory(memory) => memory.get(&key),
            Tiers::Remote(remote) => match remote.get(&key).await {
                Ok(entry) => entry.map(|entry| entry.value),
                Err(e) => {
                    self.remote_failed("get", &e);
                    None
                }
            },
            Tiers::Hybrid { memory, remote } => {
                if let Some(value) = memory.get(&key) {
                    Some(value)
                } else if !remote.is_ready() {
                    None
                } else {
                    match remote.get(&key).await {
                        Ok(Some(entry)) => {
                            self.repopulate(memory, &key, &entry);
                            Some(entry.value)
                        }
                        Ok(None) => None,
                        Err(e) => {
                            self.remote_failed("get", &e);
                            None
                        }
                    }
                }
            }
        };

        self.inner.stats.global.record_lookup(value.is_some());
        value
    }

    /// Store a value. `ttl` of `None` or zero uses the mode's default.
    pub async fn set(&self, key: &str, value: impl Into<CacheValue>, ttl: Option<Duration>) -> bool {
        self.inner.stats.record_call("set");
        self.inner.stats.global.record_set();
        let key = self.inner.codec.normalize(key);
        let value = value.into();

        match &self.inner.tiers {
            Tiers::Memory(memory) => memory.set(&key, value, ttl),
            Tiers::Remote(remote) => match remote.set(&key, &value, ttl).await {
                Ok(()) => true,
                Err(e) => {
                    self.remote_failed("set", &e);
                    false
                }
            },
            Tiers::Hybrid { memory, remote } => {
                let remote_ttl = self.hybrid_remote_ttl(ttl);
                let memory_ttl = self.hybrid_memory_ttl(remote_ttl);
                let stored = memory.set(&key, Arc::clone(&value), Some(memory_ttl));

                let written = if remote.is_ready() {
                    match remote.set(&key, &value, remote_ttl).await {
                        Ok(()) => true,
                        Err(e) => {
                            self.remote_failed("set", &e);
                            false
                        }
                    }
                } else {
                    tracing::debug!(key = %key, state = %remote.state(), "Remote cache not ready, memory-only write");
                    false
                };
                stored || written
            }
        }
    }

    /// Returns `true` once the delete has been applied; in hybrid mode the
    /// memory delete alone is enough.
    pub async fn del(&self, key: &str) -> bool {
        self.inner.stats.record_call("del");
        self.inner.stats.global.record_delete();
        let key = self.inner.codec.normalize(key);

        match &self.inner.tiers {
            Tiers::Memory(memory) => {
                memory.del(&key);
                true
            }
            Tiers::Remote(remote) => match remote.del(&key).await {
                Ok(_) => true,
                Err(e) => {
                    self.remote_failed("del", &e);
                    false
                }
            },
            Tiers::Hybrid { memory, remote } => {
                memory.del(&key);
                if let Err(e) = remote.del(&key).await {
                    self.remote_partial_failure("del", &e);
                }
                true
            }
        }
    }

    pub async fn has(&self, key: &str) -> bool {
        self.inner.stats.record_call("has");
        self.inner.stats.global.record_operation();
        let key = self.inner.codec.normalize(key);

        match &self.inner.tiers {
            Tiers::Memory(memory) => memory.has(&key),
            Tiers::Remote(remote) => self.remote_has(remote, &key).await,
            Tiers::Hybrid { memory, remote } => {
                memory.has(&key) || (remote.is_ready() && self.remote_has(remote, &key).await)
            }
        }
    }

    async fn remote_has(&self, remote: &Arc<RemoteTier>, key: &str) -> bool {
        match remote.has(key).await {
            Ok(found) => found,
            Err(e) => {
                self.remote_failed("has", &e);
                false
            }
        }
    }

    /// Values in the order of `keys`; `None` for misses.
    pub async fn mget<K: AsRef<str>>(&self, keys: &[K]) -> Vec<Option<CacheValue>> {
        self.inner.stats.record_call("mget");
        let keys = self.inner.codec.normalize_all(keys);

        let values = match &self.inner.tiers {
            Tiers::Memory(memory) => memory.mget(&keys),
            Tiers::Remote(remote) => match remote.mget(&keys).await {
                Ok(entries) => entries
                    .into_iter()
                    .map(|entry| entry.map(|entry| entry.value))
                    .collect(),
                Err(e) => {
                    self.remote_failed("mget", &e);
                    vec![None; keys.len()]
                }
            },
            Tiers::Hybrid { memory, remote } => {
                let mut values = memory.mget(&keys);
                let missing: Vec<usize> = values
                    .iter()
                    .enumerate()
                    .filter_map(|(i, value)| value.is_none().then_some(i))
                    .collect();

                if !missing.is_empty() && remote.is_ready() {
                    let missing_keys: Vec<String> =
                        missing.iter().map(|&i| keys[i].clone()).collect();
                    match remote.mget(&missing_keys).await {
                        Ok(entries) => {
                            for (i, entry) in missing.into_iter().zip(entries) {
                                if let Some(entry) = entry {
                                    self.repopulate(memory, &keys[i], &entry);
                                    values[i] = Some(entry.value);
                                }
                            }
                        }
                        Err(e) => self.remote_failed("mget", &e),
                    }
                }
                values
            }
        };

        for value in &values {
            self.inner.stats.global.record_lookup(value.is_some());
        }
        values
    }

    /// Store several values with one TTL. Remote writes go out as one pipeline.
    pub async fn mset<K: AsRef<str>>(&self, entries: &[(K, CacheValue)], ttl: Option<Duration>) -> bool {
        self.inner.stats.record_call("mset");
        if entries.is_empty() {
            return true;
        }
        let entries: Vec<(String, CacheValue)> = entries
            .iter()
            .map(|(key, value)| {
                self.inner.stats.global.record_set();
                (self.inner.codec.normalize(key.as_ref()), Arc::clone(value))
            })
            .collect();

        match &self.inner.tiers {
            Tiers::Memory(memory) => memory.mset(&entries, ttl),
            Tiers::Remote(remote) => match remote.mset(&entries, ttl).await {
                Ok(()) => true,
                Err(e) => {
                    self.remote_failed("mset", &e);
                    false
                }
            },
            Tiers::Hybrid { memory, remote } => {
                let remote_ttl = self.hybrid_remote_ttl(ttl);
                let stored = memory.mset(&entries, Some(self.hybrid_memory_ttl(remote_ttl)));

                let written = if remote.is_ready() {
                    match remote.mset(&entries, remote_ttl).await {
                        Ok(()) => true,
                        Err(e) => {
                            self.remote_failed("mset", &e);
                            false
                        }
                    }
                } else {
                    false
                };
                stored || written
            }
        }
    }

    pub async fn mdel<K: AsRef<str>>(&self, keys: &[K]) -> bool {
        self.inner.stats.record_call("mdel");
        let keys = self.inner.codec.normalize_all(keys);
        keys.iter().for_each(|_| self.inner.stats.global.record_delete());

        match &self.inner.tiers {
            Tiers::Memory(memory) => {
                memory.mdel(&keys);
                true
            }
            Tiers::Remote(remote) => match remote.mdel(&keys).await {
                Ok(_) => true,
                Err(e) => {
                    self.remote_failed("mdel", &e);
                    false
                }
            },
            Tiers::Hybrid { memory, remote } => {
                memory.mdel(&keys);
                if let Err(e) = remote.mdel(&keys).await {
                    self.remote_partial_failure("mdel", &e);
                }
                true
            }
        }
    }

    /// Remove every key matching a `*` glob (normalized like a key).
    pub async fn clear(&self, pattern: &str) -> bool {
        self.inner.stats.record_call("clear");
        self.inner.stats.global.record_clear();
        let pattern = self.inner.codec.compile_pattern(pattern);

        let cleared = match &self.inner.tiers {
            Tiers::Memory(memory) => {
                memory.clear(&pattern);
                true
            }
            Tiers::Remote(remote) => match remote.clear(&pattern).await {
                Ok(_) => true,
                Err(e) => {
                    self.remote_failed("clear", &e);
                    false
                }
            },
            Tiers::Hybrid { memory, remote } => {
                memory.clear(&pattern);
                if let Err(e) = remote.clear(&pattern).await {
                    self.remote_partial_failure("clear", &e);
                }
                true
            }
        };

        tracing::info!(pattern = %pattern.as_str(), cleared, "Cache cleared");
        cleared
    }

    /// Canonical keys matching a `*` glob, sorted. Hybrid mode returns the union of both tiers.
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.inner.stats.record_call("keys");
        self.inner.stats.global.record_operation();
        let pattern = self.inner.codec.compile_pattern(pattern);

        match &self.inner.tiers {
            Tiers::Memory(memory) => memory.keys(&pattern),
            Tiers::Remote(remote) => remote.keys(&pattern).await.unwrap_or_else(|e| {
                self.remote_failed("keys", &e);
                Vec::new()
            }),
            Tiers::Hybrid { memory, remote } => {
                let mut keys: BTreeSet<String> = memory.keys(&pattern).into_iter().collect();
                if remote.is_ready() {
                    match remote.keys(&pattern).await {
                        Ok(remote_keys) => keys.extend(remote_keys),
                        Err(e) => self.remote_failed("keys", &e),
                    }
                }
                keys.into_iter().collect()
            }
        }
    }

    /// Look up and decode a JSON value. Undecodable entries are dropped and reported as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                let err = CacheError::from(e);
                self.inner.stats.global.record_error(&err);
                tracing::warn!(key = %key, error = %err, "Failed to decode cached JSON, invalidating");
                self.del(key).await;
                None
            }
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, bytes, ttl).await,
            Err(e) => {
                let err = CacheError::from(e);
                self.inner.stats.global.record_error(&err);
                tracing::warn!(key = %key, error = %err, "Failed to encode value as JSON");
                false
            }
        }
    }

    /// `get` with an overall deadline. On expiry this returns a miss; the
    /// lookup keeps running in the background.
    pub async fn get_within(&self, key: &str, deadline: Duration) -> Option<CacheValue> {
        let cache = self.clone();
        let key = key.to_string();
        let task = tokio::spawn(async move { cache.get(&key).await });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Cache lookup task failed");
                None
            }
            Err(_) => {
                tracing::debug!(deadline_ms = deadline.as_millis() as u64, "Cache lookup deadline elapsed");
                None
            }
        }
    }

    /// `set` with an overall deadline. On expiry this returns `false`; the
    /// write keeps running and may still land.
    pub async fn set_within(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: Option<Duration>,
        deadline: Duration,
    ) -> bool {
        let cache = self.clone();
        let key = key.to_string();
        let value = value.into();
        let task = tokio::spawn(async move { cache.set(&key, value, ttl).await });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(stored)) => stored,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Cache write task failed");
                false
            }
            Err(_) => {
                tracing::debug!(deadline_ms = deadline.as_millis() as u64, "Cache write deadline elapsed");
                false
            }
        }
    }

    pub async fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.mode())
    }

    /// Zero all counters. A ready remote tier keeps its connection timestamp.
    pub async fn reset_stats(&self) {
        self.inner.stats.reset();
        if let Some(remote) = self.remote().filter(|remote| remote.is_ready()) {
            remote.counters().mark_connected(OffsetDateTime::now_utc());
        }
        tracing::info!("Cache statistics reset");
    }

    pub async fn health_check(&self) -> HealthReport {
        let memory = self.memory().map(|memory| {
            let entries = memory.len();
            MemoryHealth {
                healthy: true,
                entries,
                max_entries: memory.max_keys(),
                at_capacity: memory.max_keys().is_some_and(|max| entries >= max),
            }
        });

        let remote = match self.remote() {
            Some(remote) => {
                let ping = remote.ping().await;
                Some(RemoteHealth {
                    healthy: ping.is_ok(),
                    state: remote.state(),
                    latency_ms: ping.as_ref().ok().map(|latency| latency.as_secs_f64() * 1000.0),
                    last_error: remote.counters().last_error(),
                    connected_since: remote.counters().connected_since(),
                })
            }
            None => None,
        };

        HealthReport::assemble(self.mode(), memory, remote)
    }
}
