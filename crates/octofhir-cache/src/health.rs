//! Health report returned by `CacheService::health_check`.

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::CacheMode;
use crate::remote::ConnectionState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// The cache can serve requests in its configured mode.
    pub healthy: bool,
    /// Hybrid mode running on the memory tier alone.
    pub degraded: bool,
    pub mode: CacheMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteHealth>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryHealth {
    pub healthy: bool,
    pub entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
    pub at_capacity: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteHealth {
    pub healthy: bool,
    pub state: ConnectionState,
    /// PING round trip, when the PING succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub connected_since: Option<OffsetDateTime>,
}

impl HealthReport {
    /// Combine tier results according to the mode.
    ///
    /// Memory mode is healthy by construction, remote mode follows its PING,
    /// hybrid mode stays healthy on memory alone and reports `degraded`.
    pub fn assemble(
        mode: CacheMode,
        memory: Option<MemoryHealth>,
        remote: Option<RemoteHealth>,
    ) -> Self {
        let memory_ok = memory.as_ref().is_none_or(|m| m.healthy);
        let remote_ok = remote.as_ref().is_none_or(|r| r.healthy);

        let (healthy, degraded) = match mode {
            CacheMode::Memory => (memory_ok, false),
            CacheMode::Remote => (remote_ok, false),
            CacheMode::Hybrid => (memory_ok, memory_ok && !remote_ok),
        };

        Self {
            healthy,
            degraded,
            mode,
            memory,
            remote,
        }
    }
}
