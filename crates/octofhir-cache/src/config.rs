use std::time::Duration;

use redis::IntoConnectionInfo;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::key::DEFAULT_NAMESPACE;

/// Which tiers the coordinator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// In-process tier only
    #[default]
    Memory,
    /// Networked shared tier only
    Remote,
    /// Memory in front of remote, with read-through repopulation
    Hybrid,
}

impl CacheMode {
    pub fn uses_memory(&self) -> bool {
        matches!(self, CacheMode::Memory | CacheMode::Hybrid)
    }

    pub fn uses_remote(&self) -> bool {
        matches!(self, CacheMode::Remote | CacheMode::Hybrid)
    }
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheMode::Memory => write!(f, "memory"),
            CacheMode::Remote => write!(f, "remote"),
            CacheMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Cache coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// memory | remote | hybrid
    #[serde(default)]
    pub mode: CacheMode,

    /// Prefix of every canonical key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Tier default TTL in seconds (0 = entries never expire)
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Upper bound for memory-tier TTLs in hybrid mode
    #[serde(default = "default_hybrid_memory_ttl_secs")]
    pub hybrid_memory_ttl_secs: u64,

    /// Remote TTL in hybrid mode when the caller does not pass one
    #[serde(default = "default_hybrid_remote_ttl_secs")]
    pub hybrid_remote_ttl_secs: u64,

    /// Memory-tier capacity, -1 for unbounded
    #[serde(default = "default_max_memory_keys")]
    pub max_memory_keys: i64,

    /// Period of the memory-tier expiry sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Remote tier settings
    #[serde(default)]
    pub remote: RemoteConfig,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_hybrid_memory_ttl_secs() -> u64 {
    60
}

fn default_hybrid_remote_ttl_secs() -> u64 {
    3600
}

fn default_max_memory_keys() -> i64 {
    -1
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::default(),
            namespace: default_namespace(),
            default_ttl_secs: default_ttl_secs(),
            hybrid_memory_ttl_secs: default_hybrid_memory_ttl_secs(),
            hybrid_remote_ttl_secs: default_hybrid_remote_ttl_secs(),
            max_memory_keys: default_max_memory_keys(),
            sweep_interval_secs: default_sweep_interval_secs(),
            remote: RemoteConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.contains('*') {
            return Err("cache.namespace must not contain '*'".into());
        }
        if self.hybrid_memory_ttl_secs == 0 {
            return Err("cache.hybrid_memory_ttl_secs must be > 0".into());
        }
        if self.sweep_interval_secs == 0 {
            return Err("cache.sweep_interval_secs must be > 0".into());
        }
        if self.max_memory_keys < -1 || self.max_memory_keys == 0 {
            return Err("cache.max_memory_keys must be -1 (unbounded) or > 0".into());
        }
        self.remote.validate()
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        non_zero_secs(self.default_ttl_secs)
    }

    pub fn hybrid_memory_ttl(&self) -> Duration {
        Duration::from_secs(self.hybrid_memory_ttl_secs.max(1))
    }

    pub fn hybrid_remote_ttl(&self) -> Option<Duration> {
        non_zero_secs(self.hybrid_remote_ttl_secs)
    }

    pub fn max_memory_keys(&self) -> Option<usize> {
        usize::try_from(self.max_memory_keys).ok().filter(|max| *max > 0)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Remote (Redis) tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Connection URL (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Deadline for every remote command, in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Attempts per reconnect round
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Backoff step: attempt n waits min(n * base, cap)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Pause before a new reconnect round once a round is exhausted (0 = give up)
    #[serde(default = "default_reprobe_interval_secs")]
    pub reprobe_interval_secs: u64,

    /// Largest value the remote tier accepts
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,
}

fn default_pool_size() -> usize {
    10
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_cap_ms() -> u64 {
    3000
}

fn default_reprobe_interval_secs() -> u64 {
    30
}

fn default_max_value_bytes() -> usize {
    512 * 1024 * 1024 // Redis string limit
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
            command_timeout_ms: default_command_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            reprobe_interval_secs: default_reprobe_interval_secs(),
            max_value_bytes: default_max_value_bytes(),
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("cache.remote.pool_size must be > 0".into());
        }
        if self.command_timeout_ms == 0 {
            return Err("cache.remote.command_timeout_ms must be > 0".into());
        }
        if self.max_reconnect_attempts == 0 {
            return Err("cache.remote.max_reconnect_attempts must be > 0".into());
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err("cache.remote.backoff_base_ms must be <= backoff_cap_ms".into());
        }
        if self.max_value_bytes == 0 {
            return Err("cache.remote.max_value_bytes must be > 0".into());
        }
        Ok(())
    }

    /// The configured endpoint, if it is present and parses as a Redis URL.
    pub fn endpoint(&self) -> CacheResult<&str> {
        let url = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| CacheError::Configuration("cache.remote.url is not set".into()))?;

        url.into_connection_info().map_err(|e| {
            CacheError::Configuration(format!("invalid cache.remote.url '{url}': {e}"))
        })?;

        Ok(url)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn reprobe_interval(&self) -> Option<Duration> {
        non_zero_secs(self.reprobe_interval_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
