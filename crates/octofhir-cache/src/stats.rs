//! Usage statistics shared by every tier.
//!
//! Counters are plain atomics; recording can never fail and never gates a
//! cache operation. Per-tier hits and misses are also forwarded to the
//! `metrics` facade so a Prometheus exporter picks them up.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

use crate::config::CacheMode;

/// Metric names emitted by the cache tiers.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const CACHE_OPERATIONS_TOTAL: &str = "cache_operations_total";
}

/// Hit rate as a percentage rounded to two decimals; 0 when nothing was looked up.
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        let rate = (hits as f64 / total as f64) * 100.0;
        (rate * 100.0).round() / 100.0
    }
}

/// Counters for one tier (or for the coordinator as a whole).
#[derive(Debug)]
pub struct TierCounters {
    /// Metric label; `None` for the aggregate counters.
    metric_tier: Option<&'static str>,
    operations: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    clears: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    connected_since: Mutex<Option<OffsetDateTime>>,
}

impl TierCounters {
    pub fn new(metric_tier: Option<&'static str>) -> Self {
        Self {
            metric_tier,
            operations: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            clears: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
            connected_since: Mutex::new(None),
        }
    }

    pub fn record_hit(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(tier) = self.metric_tier {
            counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
        }
    }

    pub fn record_miss(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(tier) = self.metric_tier {
            counter!(names::CACHE_MISSES_TOTAL, "tier" => tier).increment(1);
        }
    }

    /// Record a lookup outcome.
    pub fn record_lookup(&self, hit: bool) {
        if hit {
            self.record_hit();
        } else {
            self.record_miss();
        }
    }

    pub fn record_set(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an operation that is neither a lookup nor a mutation (has, keys, ping).
    pub fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure. Does not count as an operation on its own.
    pub fn record_error(&self, err: &dyn std::fmt::Display) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(err.to_string());
        if let Some(tier) = self.metric_tier {
            counter!(names::CACHE_ERRORS_TOTAL, "tier" => tier).increment(1);
        }
    }

    pub fn mark_connected(&self, at: OffsetDateTime) {
        *self.connected_since.lock() = Some(at);
    }

    pub fn mark_disconnected(&self) {
        *self.connected_since.lock() = None;
    }

    pub fn connected_since(&self) -> Option<OffsetDateTime> {
        *self.connected_since.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Zero every counter. Connection timestamps are cleared too; the owner
    /// re-stamps them for connections that are still up.
    pub fn reset(&self) {
        self.operations.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.clears.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        *self.last_error.lock() = None;
        *self.connected_since.lock() = None;
    }

    pub fn snapshot(&self) -> TierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TierStats {
            operations: self.operations.load(Ordering::Relaxed),
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
            last_error: self.last_error(),
            connected_since: self.connected_since(),
        }
    }
}

/// Point-in-time view of one tier's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierStats {
    pub operations: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub clears: u64,
    pub errors: u64,
    /// Percentage, two decimals.
    pub hit_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub connected_since: Option<OffsetDateTime>,
}

/// Aggregate and per-tier counters for a [`CacheService`](crate::CacheService).
#[derive(Debug)]
pub struct StatsRecorder {
    pub global: TierCounters,
    pub memory: Arc<TierCounters>,
    pub remote: Arc<TierCounters>,
    partial_failures: AtomicU64,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            global: TierCounters::new(None),
            memory: Arc::new(TierCounters::new(Some("memory"))),
            remote: Arc::new(TierCounters::new(Some("remote"))),
            partial_failures: AtomicU64::new(0),
        }
    }

    /// A hybrid mutation whose memory half succeeded but remote half failed.
    pub fn record_partial_failure(&self, err: &dyn std::fmt::Display) {
        self.partial_failures.fetch_add(1, Ordering::Relaxed);
        self.global.record_error(err);
    }

    /// Count one public coordinator call in the `metrics` facade.
    pub fn record_call(&self, op: &'static str) {
        counter!(names::CACHE_OPERATIONS_TOTAL, "op" => op).increment(1);
    }

    pub fn reset(&self) {
        self.global.reset();
        self.memory.reset();
        self.remote.reset();
        self.partial_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, mode: CacheMode) -> StatsSnapshot {
        let global = self.global.snapshot();
        StatsSnapshot {
            mode,
            total_operations: global.operations,
            hits: global.hits,
            misses: global.misses,
            sets: global.sets,
            deletes: global.deletes,
            clears: global.clears,
            errors: global.errors,
            hit_rate: global.hit_rate,
            partial_failures: self.partial_failures.load(Ordering::Relaxed),
            memory: mode.uses_memory().then(|| self.memory.snapshot()),
            remote: mode.uses_remote().then(|| self.remote.snapshot()),
        }
    }
}

/// Immutable view returned by `CacheService::stats()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub mode: CacheMode,
    pub total_operations: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub clears: u64,
    pub errors: u64,
    /// Percentage, two decimals.
    pub hit_rate: f64,
    pub partial_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<TierStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<TierStats>,
}

impl StatsSnapshot {
    /// Hit rate formatted for display, e.g. `66.67%`.
    pub fn hit_rate_display(&self) -> String {
        format!("{:.2}%", self.hit_rate)
    }
}
