//! Error types for the cache tiers.
//!
//! These errors never cross the public [`CacheService`](crate::CacheService)
//! API: the coordinator turns them into misses, `false` results or empty lists
//! and surfaces the detail through logging, stats and health checks.

use std::time::Duration;

use thiserror::Error;

/// Result type for tier-level cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur inside a cache tier
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Remote or hybrid mode selected without a usable endpoint
    #[error("Cache configuration error: {0}")]
    Configuration(String),

    /// Remote tier unreachable or not ready
    #[error("Remote cache connection error: {0}")]
    Connection(String),

    /// A single remote command exceeded its deadline
    #[error("Remote cache command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Value cannot be encoded for the target tier
    #[error("Cache serialization error: {0}")]
    Serialization(String),

    /// Any other error reported by the remote store
    #[error("Remote cache error: {0}")]
    Backend(String),

    /// The tier was shut down
    #[error("Cache tier is closed")]
    Closed,
}

impl CacheError {
    /// Whether this error means the remote transport is no longer usable.
    pub fn is_transport(&self) -> bool {
        matches!(self, CacheError::Connection(_) | CacheError::Timeout(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            CacheError::Connection(err.to_string())
        } else if err.is_timeout() {
            CacheError::Connection(format!("redis timeout: {err}"))
        } else {
            CacheError::Backend(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        CacheError::Connection(format!("failed to get Redis connection: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_classified() {
        assert!(CacheError::Connection("refused".into()).is_transport());
        assert!(CacheError::Timeout(Duration::from_millis(5)).is_transport());
        assert!(!CacheError::Backend("WRONGTYPE".into()).is_transport());
        assert!(!CacheError::Serialization("too large".into()).is_transport());
        assert!(!CacheError::Closed.is_transport());
    }

    #[test]
    fn timeout_message_reports_millis() {
        let err = CacheError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Remote cache command timed out after 250ms");
    }
}
