//! relay_gate: an API gateway in front of a single origin.
//!
//! Every request runs a fixed middleware pipeline, outermost first:
//! logging → cache → rate limiter → authenticator → router, with the
//! reverse proxy as the fallback route. The cache sits outside the
//! limiter on purpose: a cache HIT short-circuits before the limiter and
//! consumes no tokens. Rate-limit buckets and cache entries live in the
//! shared store, so any number of replicas enforce one shared limit.

pub mod admin;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod proxy;
pub mod rate_limit;

use axum::{
    middleware,
    routing::{delete, get},
    Json, Router,
};
use relay_kv::KvStore;
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::limit::RequestBodyLimitLayer;

/// Max request body size: 1 MiB
pub const MAX_BODY_BYTES: usize = 1_048_576;

/// Paths exempt from auth, rate limiting, and caching, but never from
/// logging.
pub const BYPASS_PATHS: &[&str] = &["/health"];

pub(crate) fn is_bypass(path: &str) -> bool {
    BYPASS_PATHS.contains(&path)
}

/// Wall-clock unix time in fractional seconds, the unit bucket and cache
/// timestamps are stored in.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<config::Settings>,
    pub store: Arc<dyn KvStore>,
    pub limiter: rate_limit::RateLimiter,
    pub cache: cache::ResponseCache,
    pub verifier: Arc<auth::TokenVerifier>,
    pub proxy: proxy::ProxyClient,
}

impl AppState {
    pub fn new(settings: config::Settings, store: Arc<dyn KvStore>) -> anyhow::Result<Self> {
        let verifier = auth::TokenVerifier::new(
            &settings.jwt_secret,
            &settings.jwt_algorithm,
            &settings.jwt_audience,
            &settings.jwt_issuer,
        )?;
        let limiter = rate_limit::RateLimiter::new(
            Arc::clone(&store),
            settings.rate_limit_per_minute,
            settings.rate_limit_window_seconds,
        );
        let cache = cache::ResponseCache::new(Arc::clone(&store), settings.cache_ttl);
        let proxy = proxy::ProxyClient::new(&settings.downstream_url)?;
        Ok(Self {
            settings: Arc::new(settings),
            store,
            limiter,
            cache,
            verifier: Arc::new(verifier),
            proxy,
        })
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

pub fn app_with_state(state: AppState) -> Router {
    // Later layers wrap earlier ones, so this reads inner-to-outer:
    // auth is closest to the handlers, logging sees everything.
    Router::new()
        .route("/health", get(health))
        .route("/admin/cache/stats", get(admin::cache_stats))
        .route("/admin/cache", delete(admin::flush_cache))
        .route("/admin/cache/:pattern", delete(admin::invalidate_pattern))
        .fallback(proxy::forward)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::enforce,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cache::serve_or_store,
        ))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(logging::log_requests))
        .with_state(state)
}

pub mod test {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Spawn the gateway on a random port. Returns the bound address and
    /// a JoinHandle that keeps the server alive until dropped.
    pub async fn spawn(
        settings: config::Settings,
        store: Arc<dyn KvStore>,
    ) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let state = AppState::new(settings, store).expect("gateway state");
        let app = app_with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (addr, handle)
    }
}
