//! Multi-tier cache coordinator.
//!
//! ## Cache Modes
//!
//! - **memory**: in-process `DashMap` tier only
//! - **remote**: Redis tier only
//! - **hybrid**: memory in front of Redis with read-through repopulation;
//!   degrades to memory alone while Redis is unreachable
//!
//! ```no_run
//! use std::time::Duration;
//! use octofhir_cache::{CacheConfig, CacheService};
//!
//! # async fn demo() {
//! let cache = CacheService::new(CacheConfig::default());
//! cache.start().await;
//!
//! cache.set("report:daily", b"...".to_vec(), Some(Duration::from_secs(300))).await;
//! let hit = cache.get("report:daily").await;
//! # let _ = hit;
//! cache.shutdown().await;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod key;
pub mod memory;
pub mod remote;
pub mod service;
pub mod stats;

use std::sync::Arc;

/// Cached payload: opaque bytes, cheap to clone on hits.
pub type CacheValue = Arc<Vec<u8>>;

pub use config::{CacheConfig, CacheMode, RemoteConfig};
pub use error::{CacheError, CacheResult};
pub use health::{HealthReport, MemoryHealth, RemoteHealth};
pub use key::{DEFAULT_NAMESPACE, KeyCodec, KeyPattern};
pub use memory::MemoryTier;
pub use remote::redis::{RedisConnector, RedisStore};
pub use remote::{ConnectionState, RemoteConnector, RemoteEntry, RemoteStore, RemoteTier};
pub use service::CacheService;
pub use stats::{StatsRecorder, StatsSnapshot, TierCounters, TierStats};
