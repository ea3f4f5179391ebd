//! Networked shared cache tier.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Disconnected --connect--> Connecting --transport up--> Connected --PING ok--> Ready
//!      ^                                                     |                   |
//!      +------------------- I/O error / timeout -------------+-------------------+
//!
//! any state --close()--> Closed (terminal)
//! ```
//!
//! Commands only run while the tier is `Ready`; otherwise they fail
//! immediately with [`CacheError::Connection`]. A transport failure moves the
//! tier back to `Disconnected` and starts a background reconnect task with
//! bounded backoff. No lock is held across a network round trip: the store
//! handle is cloned out of the link state before any I/O.

pub mod redis;

#[cfg(test)]
pub(crate) mod fake;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::CacheValue;
use crate::config::RemoteConfig;
use crate::error::{CacheError, CacheResult};
use crate::key::KeyPattern;
use crate::stats::TierCounters;

/// Keys deleted per pipelined batch by `clear`.
const CLEAR_BATCH_SIZE: usize = 500;

/// Remote connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A value read from the remote tier with its remaining TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub value: CacheValue,
    /// `None` when the key has no expiry.
    pub ttl: Option<Duration>,
}

/// Key/value operations against an established remote connection.
///
/// Multi-key methods must be sent as one pipelined batch.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Handshake / liveness probe.
    async fn ping(&self) -> CacheResult<()>;

    /// Value plus remaining TTL, in one round trip.
    async fn get(&self, key: &str) -> CacheResult<Option<RemoteEntry>>;

    /// `ttl = None` stores without expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> CacheResult<bool>;

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<RemoteEntry>>>;

    async fn mset(&self, entries: &[(String, CacheValue)], ttl: Option<Duration>)
    -> CacheResult<()>;

    /// Per-key "existed" flags.
    async fn mdel(&self, keys: &[String]) -> CacheResult<Vec<bool>>;

    /// Keys matching a Redis-style glob (already escaped).
    async fn scan(&self, glob: &str) -> CacheResult<Vec<String>>;
}

/// Establishes transports to the remote store.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Endpoint description for logs.
    fn endpoint(&self) -> String;

    /// Bring the transport up. The returned store has not been pinged yet.
    async fn connect(&self) -> CacheResult<Arc<dyn RemoteStore>>;
}

/// Reconnect delays: attempt `n` waits `min(n * base, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.cap)
    }
}

/// Runtime settings of the remote tier.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub command_timeout: Duration,
    pub backoff: Backoff,
    /// Pause between exhausted reconnect rounds; `None` gives up after one round.
    pub reprobe_interval: Option<Duration>,
    /// TTL for writes that pass none; `None` stores without expiry.
    pub default_ttl: Option<Duration>,
    pub max_value_bytes: usize,
}

impl RemoteOptions {
    pub fn from_config(config: &RemoteConfig, default_ttl: Option<Duration>) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            backoff: Backoff {
                base: config.backoff_base(),
                cap: config.backoff_cap(),
                max_attempts: config.max_reconnect_attempts,
            },
            reprobe_interval: config.reprobe_interval(),
            default_ttl,
            max_value_bytes: config.max_value_bytes,
        }
    }
}

struct Link {
    state: ConnectionState,
    store: Option<Arc<dyn RemoteStore>>,
    /// Bumped on every new transport so stale failures cannot tear down a fresh one.
    generation: u64,
}

/// Client to the networked shared cache.
pub struct RemoteTier {
    connector: Box<dyn RemoteConnector>,
    options: RemoteOptions,
    link: Mutex<Link>,
    counters: Arc<TierCounters>,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

impl RemoteTier {
    pub fn new(
        connector: impl RemoteConnector + 'static,
        options: RemoteOptions,
        counters: Arc<TierCounters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector: Box::new(connector),
            options,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                store: None,
                generation: 0,
            }),
            counters,
            reconnecting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn options(&self) -> &RemoteOptions {
        &self.options
    }

    pub fn counters(&self) -> &TierCounters {
        &self.counters
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// One connection attempt: transport, then PING. Both bounded by the command timeout.
    pub async fn connect(&self) -> CacheResult<()> {
        {
            let mut link = self.link.lock();
            match link.state {
                ConnectionState::Closed => return Err(CacheError::Closed),
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(CacheError::Connection(
                        "connection attempt already in progress".into(),
                    ));
                }
                ConnectionState::Disconnected => link.state = ConnectionState::Connecting,
            }
        }

        let timeout = self.options.command_timeout;
        let store = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(Ok(store)) => store,
            Ok(Err(e)) => return Err(self.connect_failed(e)),
            Err(_) => return Err(self.connect_failed(CacheError::Timeout(timeout))),
        };

        {
            let mut link = self.link.lock();
            if link.state == ConnectionState::Closed {
                return Err(CacheError::Closed);
            }
            link.state = ConnectionState::Connected;
            link.store = Some(Arc::clone(&store));
            link.generation += 1;
        }

        let handshake = match tokio::time::timeout(timeout, store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };
        if let Err(e) = handshake {
            return Err(self.connect_failed(e));
        }

        {
            let mut link = self.link.lock();
            if link.state != ConnectionState::Connected {
                return Err(CacheError::Connection(format!(
                    "connection changed state to {} during handshake",
                    link.state
                )));
            }
            link.state = ConnectionState::Ready;
        }
        self.counters.mark_connected(OffsetDateTime::now_utc());
        tracing::info!(endpoint = %self.endpoint(), "Remote cache ready");
        Ok(())
    }

    fn connect_failed(&self, err: CacheError) -> CacheError {
        {
            let mut link = self.link.lock();
            if link.state == ConnectionState::Closed {
                return CacheError::Closed;
            }
            link.state = ConnectionState::Disconnected;
            link.store = None;
        }
        self.counters.record_error(&err);
        err
    }

    /// Start a background reconnect task unless one is already running.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let tier = Arc::clone(self);
        tokio::spawn(async move {
            let gave_up = tier.reconnect_loop().await;
            tier.reconnect_loop_finished(gave_up);
        });
    }

    fn reconnect_loop_finished(self: &Arc<Self>, gave_up: bool) {
        self.reconnecting.store(false, Ordering::Release);
        // A failure may have landed between the successful connect and the flag reset.
        if !gave_up && self.state() == ConnectionState::Disconnected {
            self.schedule_reconnect();
        }
    }

    /// Returns `true` when reconnecting was abandoned.
    async fn reconnect_loop(&self) -> bool {
        let backoff = self.options.backoff;
        loop {
            for attempt in 1..=backoff.max_attempts {
                let delay = backoff.delay(attempt);
                tokio::select! {
                    _ = self.shutdown.cancelled() => return true,
                    _ = tokio::time::sleep(delay) => {}
                }

                match self.connect().await {
                    Ok(()) => {
                        tracing::info!(attempt, "Reconnected to remote cache");
                        return false;
                    }
                    Err(CacheError::Closed) => return true,
                    Err(e) => {
                        tracing::warn!(
                            attempt,
                            max_attempts = backoff.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Remote cache reconnect failed"
                        );
                    }
                }
            }

            let Some(reprobe) = self.options.reprobe_interval else {
                tracing::error!(
                    attempts = backoff.max_attempts,
                    "Giving up on remote cache; continuing without it"
                );
                return true;
            };
            tracing::warn!(
                reprobe_secs = reprobe.as_secs(),
                "Remote cache still unreachable, will probe again later"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return true,
                _ = tokio::time::sleep(reprobe) => {}
            }
        }
    }

    /// Terminal: drops the transport and stops reconnecting.
    pub fn close(&self) {
        {
            let mut link = self.link.lock();
            if link.state == ConnectionState::Closed {
                return;
            }
            link.state = ConnectionState::Closed;
            link.store = None;
        }
        self.shutdown.cancel();
        self.counters.mark_disconnected();
        tracing::info!(endpoint = %self.endpoint(), "Remote cache closed");
    }

    fn ready_store(&self) -> CacheResult<(Arc<dyn RemoteStore>, u64)> {
        let link = self.link.lock();
        match (&link.state, &link.store) {
            (ConnectionState::Ready, Some(store)) => Ok((Arc::clone(store), link.generation)),
            (ConnectionState::Closed, _) => Err(CacheError::Closed),
            (state, _) => Err(CacheError::Connection(format!("remote tier is {state}"))),
        }
    }

    /// Run one command against the ready store, bounded by the command timeout.
    async fn run<T, F, Fut>(self: &Arc<Self>, op: &'static str, f: F) -> CacheResult<T>
    where
        F: FnOnce(Arc<dyn RemoteStore>) -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let (store, generation) = self.ready_store()?;
        let timeout = self.options.command_timeout;
        let result = match tokio::time::timeout(timeout, f(store)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };
        if let Err(ref e) = result {
            self.command_failed(op, generation, e);
        }
        result
    }

    fn command_failed(self: &Arc<Self>, op: &'static str, generation: u64, err: &CacheError) {
        self.counters.record_error(err);
        if !err.is_transport() {
            tracing::warn!(op, error = %err, "Remote cache command failed");
            return;
        }

        let disconnected = {
            let mut link = self.link.lock();
            let live = matches!(
                link.state,
                ConnectionState::Ready | ConnectionState::Connected
            );
            if live && link.generation == generation {
                link.state = ConnectionState::Disconnected;
                link.store = None;
                true
            } else {
                false
            }
        };

        if disconnected {
            self.counters.mark_disconnected();
            tracing::warn!(op, error = %err, "Remote cache connection lost, reconnecting");
            self.schedule_reconnect();
        }
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        match ttl {
            Some(ttl) if !ttl.is_zero() => Some(ttl),
            _ => self.options.default_ttl,
        }
    }

    fn check_size(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        if value.len() > self.options.max_value_bytes {
            let err = CacheError::Serialization(format!(
                "value for '{key}' is {} bytes, remote limit is {}",
                value.len(),
                self.options.max_value_bytes
            ));
            self.counters.record_error(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Round-trip latency of a PING.
    pub async fn ping(self: &Arc<Self>) -> CacheResult<Duration> {
        self.counters.record_operation();
        let started = tokio::time::Instant::now();
        self.run("ping", |store| async move { store.ping().await })
            .await?;
        Ok(started.elapsed())
    }

    pub async fn get(self: &Arc<Self>, key: &str) -> CacheResult<Option<RemoteEntry>> {
        let entry = self
            .run("get", |store| async move { store.get(key).await })
            .await
            .inspect_err(|_| self.counters.record_miss())?;
        self.counters.record_lookup(entry.is_some());
        if entry.is_some() {
            tracing::trace!(key = %key, "cache hit (remote)");
        }
        Ok(entry)
    }

    pub async fn set(
        self: &Arc<Self>,
        key: &str,
        value: &CacheValue,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.counters.record_set();
        self.check_size(key, value)?;
        let ttl = self.resolve_ttl(ttl);
        self.run("set", |store| async move { store.set(key, value, ttl).await })
            .await
    }

    pub async fn has(self: &Arc<Self>, key: &str) -> CacheResult<bool> {
        self.counters.record_operation();
        self.run("exists", |store| async move { store.exists(key).await })
            .await
    }

    pub async fn del(self: &Arc<Self>, key: &str) -> CacheResult<bool> {
        self.counters.record_delete();
        self.run("del", |store| async move { store.del(key).await })
            .await
    }

    pub async fn mget(self: &Arc<Self>, keys: &[String]) -> CacheResult<Vec<Option<RemoteEntry>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let result = self
            .run("mget", |store| async move { store.mget(keys).await })
            .await;
        match &result {
            Ok(entries) => entries
                .iter()
                .for_each(|entry| self.counters.record_lookup(entry.is_some())),
            Err(_) => keys.iter().for_each(|_| self.counters.record_miss()),
        }
        result
    }

    pub async fn mset(
        self: &Arc<Self>,
        entries: &[(String, CacheValue)],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        entries.iter().for_each(|_| self.counters.record_set());
        for (key, value) in entries {
            self.check_size(key, value)?;
        }
        let ttl = self.resolve_ttl(ttl);
        self.run("mset", |store| async move { store.mset(entries, ttl).await })
            .await
    }

    pub async fn mdel(self: &Arc<Self>, keys: &[String]) -> CacheResult<Vec<bool>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        keys.iter().for_each(|_| self.counters.record_delete());
        self.run("mdel", |store| async move { store.mdel(keys).await })
            .await
    }

    /// Matching keys, filtered again through the literal matcher, sorted.
    pub async fn keys(self: &Arc<Self>, pattern: &KeyPattern) -> CacheResult<Vec<String>> {
        self.counters.record_operation();
        let glob = pattern.to_remote_glob();
        let mut keys = self
            .run("scan", |store| async move { store.scan(&glob).await })
            .await?;
        keys.retain(|key| pattern.is_match(key));
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Delete every matching key in pipelined batches. Returns the number removed.
    pub async fn clear(self: &Arc<Self>, pattern: &KeyPattern) -> CacheResult<usize> {
        self.counters.record_clear();
        let glob = pattern.to_remote_glob();
        let keys = self
            .run("scan", |store| async move { store.scan(&glob).await })
            .await?;
        let keys: Vec<String> = keys.into_iter().filter(|key| pattern.is_match(key)).collect();

        let mut removed = 0;
        for batch in keys.chunks(CLEAR_BATCH_SIZE) {
            let flags = self
                .run("clear", |store| async move { store.mdel(batch).await })
                .await?;
            removed += flags.into_iter().filter(|existed| *existed).count();
        }
        tracing::debug!(pattern = %pattern.as_str(), removed, "remote cache cleared");
        Ok(removed)
    }
}
