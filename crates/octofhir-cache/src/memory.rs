//! In-process cache tier.
//!
//! A `DashMap` keyed by canonical key. Shard locks are held only for the
//! duration of a single map operation, never across an `.await`, so the
//! background sweep and request handlers interleave safely.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::CacheValue;
use crate::key::KeyPattern;
use crate::stats::TierCounters;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: CacheValue,
    /// `None` never expires.
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// TTL-based in-process key/value store.
pub struct MemoryTier {
    entries: DashMap<String, MemoryEntry>,
    default_ttl: Option<Duration>,
    max_keys: Option<usize>,
    counters: Arc<TierCounters>,
}

impl MemoryTier {
    /// Create a memory tier.
    ///
    /// * `default_ttl` - used when a write passes no TTL or a zero TTL; `None` never expires
    /// * `max_keys` - capacity; `None` is unbounded
    pub fn new(
        default_ttl: Option<Duration>,
        max_keys: Option<usize>,
        counters: Arc<TierCounters>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            max_keys,
            counters,
        }
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        match ttl {
            Some(ttl) if !ttl.is_zero() => Some(ttl),
            _ => self.default_ttl,
        }
    }

    /// Look up a live entry. Expired entries that the sweep has not reached
    /// yet are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let value = self.lookup(key);
        self.counters.record_lookup(value.is_some());
        if value.is_some() {
            tracing::trace!(key = %key, "cache hit (memory)");
        }
        value
    }

    fn lookup(&self, key: &str) -> Option<CacheValue> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(Arc::clone(&entry.value));
            }
            // Remove expired entry
            drop(entry);
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }

    pub fn has(&self, key: &str) -> bool {
        self.counters.record_operation();
        self.lookup(key).is_some()
    }

    /// Store a value. Returns `false` when the tier is at capacity.
    pub fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> bool {
        if !self.has_capacity_for(key) {
            self.refuse(key);
            return false;
        }

        let now = Instant::now();
        let expires_at = self
            .resolve_ttl(ttl)
            .and_then(|ttl| now.checked_add(ttl));

        let previous = self
            .entries
            .insert(key.to_string(), MemoryEntry { value, expires_at });

        // Concurrent inserts of new keys can pass the check together; the
        // one that observes the overflow backs out.
        if previous.is_none()
            && self
                .max_keys
                .is_some_and(|max_keys| self.entries.len() > max_keys)
        {
            self.entries.remove(key);
            self.refuse(key);
            return false;
        }

        self.counters.record_set();
        true
    }

    fn refuse(&self, key: &str) {
        self.counters.record_operation();
        self.counters.record_error(&"memory tier at capacity");
        tracing::warn!(
            key = %key,
            max_keys = ?self.max_keys,
            "Memory cache at capacity, skipping insertion"
        );
    }

    /// Overwrites are always accepted; new keys only while below capacity,
    /// after expired entries have been purged.
    fn has_capacity_for(&self, key: &str) -> bool {
        let Some(max_keys) = self.max_keys else {
            return true;
        };
        if self.entries.len() < max_keys || self.entries.contains_key(key) {
            return true;
        }
        self.purge_expired();
        self.entries.len() < max_keys
    }

    /// Returns whether a live entry was removed.
    pub fn del(&self, key: &str) -> bool {
        self.counters.record_delete();
        let now = Instant::now();
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now))
    }

    pub fn mget(&self, keys: &[String]) -> Vec<Option<CacheValue>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Returns `true` only if every entry was stored.
    pub fn mset(&self, entries: &[(String, CacheValue)], ttl: Option<Duration>) -> bool {
        entries
            .iter()
            .fold(true, |all, (key, value)| self.set(key, Arc::clone(value), ttl) && all)
    }

    /// Returns the number of live entries removed.
    pub fn mdel(&self, keys: &[String]) -> usize {
        keys.iter().filter(|key| self.del(key)).count()
    }

    /// Live keys matching the pattern, sorted.
    pub fn keys(&self, pattern: &KeyPattern) -> Vec<String> {
        self.counters.record_operation();
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now) && pattern.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove every entry matching the pattern. Returns the number removed.
    pub fn clear(&self, pattern: &KeyPattern) -> usize {
        self.counters.record_clear();
        let matched: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| pattern.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = matched
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count();
        tracing::debug!(pattern = %pattern.as_str(), removed, "memory cache cleared");
        removed
    }

    /// Drop everything (used at shutdown).
    pub fn clear_all(&self) {
        self.entries.clear();
    }

    /// Remove expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_keys(&self) -> Option<usize> {
        self.max_keys
    }

    pub fn counters(&self) -> &TierCounters {
        &self.counters
    }

    /// Start the background expiry sweep.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("memory cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.purge_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired memory cache entries");
                        }
                    }
                }
            }
        })
    }
}
