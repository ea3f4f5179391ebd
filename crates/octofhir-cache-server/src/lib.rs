//! HTTP front end for `octofhir-cache`.
//!
//! Provides a response cache middleware for GET/HEAD routes and a small admin
//! API (`/cache/...`) for inspecting and invalidating the shared cache.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::{AppConfig, ResponseCacheConfig};
pub use error::{ApiError, ApiResult};
pub use middleware::{ResponseCacheOptions, ResponseCacheState, response_cache, response_cache_key};
pub use server::{CacheServer, ServerBuilder, build_app};
