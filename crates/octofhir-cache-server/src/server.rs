use std::net::SocketAddr;

use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use octofhir_cache::CacheService;
use tower_http::trace::TraceLayer;

use crate::{
    config::AppConfig,
    handlers::{self, AppState},
    middleware::{self as app_middleware, ResponseCacheOptions, ResponseCacheState},
};

pub struct CacheServer {
    addr: SocketAddr,
    app: Router,
    cache: CacheService,
}

/// Admin routes plus `routes`, with `routes` served through the response cache.
pub fn build_app(cfg: &AppConfig, cache: CacheService, routes: Router) -> Router {
    let body_limit = cfg.server.body_limit_bytes;

    let routes = if cfg.response_cache.enabled {
        let state = ResponseCacheState::new(
            cache.clone(),
            ResponseCacheOptions::from_config(&cfg.response_cache),
        );
        routes.layer(middleware::from_fn_with_state(
            state,
            app_middleware::response_cache,
        ))
    } else {
        routes
    };

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics_handler))
        // Cache admin API
        .route("/cache", axum::routing::delete(handlers::clear))
        .route("/cache/keys", get(handlers::list_keys))
        .route("/cache/stats", get(handlers::stats))
        .route("/cache/stats/reset", post(handlers::reset_stats))
        .route("/cache/mget", post(handlers::mget))
        .route(
            "/cache/entries/{key}",
            put(handlers::put_entry)
                .get(handlers::get_entry)
                .delete(handlers::delete_entry),
        )
        .with_state(AppState { cache })
        .merge(routes)
        // Middleware stack (order: metrics -> request id -> trace -> body limit)
        .layer(middleware::from_fn(app_middleware::http_metrics))
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    cache: Option<CacheService>,
    routes: Router,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            cache: None,
            routes: Router::new(),
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Use an existing cache instead of building one from the config.
    pub fn with_cache(mut self, cache: CacheService) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Application routes served behind the response cache.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    pub fn build(self) -> CacheServer {
        let cache = self
            .cache
            .unwrap_or_else(|| CacheService::new(self.config.cache.clone()));
        let app = build_app(&self.config, cache.clone(), self.routes);

        CacheServer {
            addr: self.addr,
            app,
            cache,
        }
    }
}

impl CacheServer {
    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.cache.start().await;

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!(mode = %self.cache.mode(), "listening on {}", self.addr);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        self.cache.shutdown().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
