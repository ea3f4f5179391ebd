//! In-process stand-in for the remote store, with fault injection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{RemoteConnector, RemoteEntry, RemoteStore};
use crate::CacheValue;
use crate::error::{CacheError, CacheResult};
use crate::key::KeyPattern;

#[derive(Default)]
pub(crate) struct FakeStore {
    data: Mutex<HashMap<String, (CacheValue, Option<Instant>)>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    key_delays: Mutex<HashMap<String, Duration>>,
    round_trips: AtomicUsize,
}

impl FakeStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every command fails with a connection error while set.
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every command sleeps this long before answering.
    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// `get` of this key sleeps this long on top of any global delay.
    pub(crate) fn set_key_delay(&self, key: &str, delay: Duration) {
        self.key_delays.lock().insert(key.to_string(), delay);
    }

    pub(crate) fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Keys currently stored, expired ones excluded.
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Remaining TTL of a stored key.
    pub(crate) fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.live(key).and_then(|entry| entry.ttl)
    }

    fn live(&self, key: &str) -> Option<RemoteEntry> {
        let now = Instant::now();
        let data = self.data.lock();
        let (value, expires_at) = data.get(key)?;
        match expires_at {
            Some(at) if *at <= now => None,
            Some(at) => Some(RemoteEntry {
                value: Arc::clone(value),
                ttl: Some(*at - now),
            }),
            None => Some(RemoteEntry {
                value: Arc::clone(value),
                ttl: None,
            }),
        }
    }

    fn put(&self, key: &str, value: CacheValue, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.data.lock().insert(key.to_string(), (value, expires_at));
    }

    fn remove(&self, key: &str) -> bool {
        let existed = self.live(key).is_some();
        self.data.lock().remove(key);
        existed
    }

    async fn round_trip(&self) -> CacheResult<()> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Connection("connection reset by peer".into()));
        }
        Ok(())
    }
}

/// Undo the escaping applied by `KeyPattern::to_remote_glob`.
fn unescape_glob(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len());
    let mut chars = glob.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[async_trait]
impl RemoteStore for FakeStore {
    async fn ping(&self) -> CacheResult<()> {
        self.round_trip().await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<RemoteEntry>> {
        self.round_trip().await?;
        let key_delay = self.key_delays.lock().get(key).copied();
        if let Some(delay) = key_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        self.round_trip().await?;
        self.put(key, Arc::new(value.to_vec()), ttl);
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.round_trip().await?;
        Ok(self.live(key).is_some())
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        self.round_trip().await?;
        Ok(self.remove(key))
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<RemoteEntry>>> {
        self.round_trip().await?;
        Ok(keys.iter().map(|key| self.live(key)).collect())
    }

    async fn mset(
        &self,
        entries: &[(String, CacheValue)],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.round_trip().await?;
        for (key, value) in entries {
            self.put(key, Arc::clone(value), ttl);
        }
        Ok(())
    }

    async fn mdel(&self, keys: &[String]) -> CacheResult<Vec<bool>> {
        self.round_trip().await?;
        Ok(keys.iter().map(|key| self.remove(key)).collect())
    }

    async fn scan(&self, glob: &str) -> CacheResult<Vec<String>> {
        self.round_trip().await?;
        let pattern = KeyPattern::new(&unescape_glob(glob));
        let keys: Vec<String> = self.data.lock().keys().cloned().collect();
        Ok(keys
            .into_iter()
            .filter(|key| pattern.is_match(key) && self.live(key).is_some())
            .collect())
    }
}

pub(crate) struct FakeConnector {
    store: Arc<FakeStore>,
    reachable: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub(crate) fn new(store: Arc<FakeStore>) -> Self {
        Self {
            store,
            reachable: Arc::new(AtomicBool::new(true)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Toggle whether new connections succeed.
    pub(crate) fn reachable_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reachable)
    }

    pub(crate) fn connect_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connects)
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    fn endpoint(&self) -> String {
        "fake://remote".to_string()
    }

    async fn connect(&self) -> CacheResult<Arc<dyn RemoteStore>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CacheError::Connection("connection refused".into()));
        }
        Ok(Arc::clone(&self.store) as Arc<dyn RemoteStore>)
    }
}
