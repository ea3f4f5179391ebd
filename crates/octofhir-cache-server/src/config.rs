use std::{net::SocketAddr, time::Duration};

use axum::http::HeaderName;
use octofhir_cache::CacheConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Cache coordinator configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// HTTP response cache in front of application routes
    #[serde(default)]
    pub response_cache: ResponseCacheConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        self.cache.validate()?;
        self.response_cache.validate()
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest request body accepted (entry uploads)
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8090
}
fn default_body_limit() -> usize {
    4 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// TTL of cached responses in seconds (0 = cache default)
    #[serde(default = "default_response_ttl_secs")]
    pub ttl_secs: u64,
    /// Bypass requests carrying `Authorization` or a cookie
    #[serde(default = "default_true")]
    pub skip_authenticated: bool,
    /// Header identifying the caller; falls back to `Authorization`
    #[serde(default)]
    pub identity_header: Option<String>,
    /// Larger responses are passed through without caching
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_true() -> bool {
    true
}
fn default_response_ttl_secs() -> u64 {
    300
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_response_ttl_secs(),
            skip_authenticated: true,
            identity_header: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ResponseCacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_body_bytes == 0 {
            return Err("response_cache.max_body_bytes must be > 0".into());
        }
        if let Some(name) = &self.identity_header {
            HeaderName::try_from(name.as_str())
                .map_err(|_| format!("response_cache.identity_header '{name}' is not a valid header name"))?;
        }
        Ok(())
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default configuration file, looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "octofhir-cache.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., OCTOFHIR_CACHE__CACHE__MODE=hybrid
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR_CACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.addr().port(), 8090);
        assert_eq!(cfg.response_cache.ttl(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn invalid_identity_header_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.response_cache.identity_header = Some("bad header".into());
        assert!(cfg.validate().unwrap_err().contains("identity_header"));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().is_err());
    }
}
