//! Error paths and boundary behavior: auth taxonomy, limiter edges,
//! cache refusals, and fail-open degradation against a dead store.

use async_trait::async_trait;
use axum::{http::StatusCode, routing::get, Json, Router};
use jsonwebtoken::{encode, EncodingKey, Header};
use relay_gate::config::Settings;
use relay_kv::{KvError, KvStore, MemoryStore, RedisConfig, ServerInfo};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SECRET: &str = "hardened-secret";
const AUDIENCE: &str = "gateway-clients";
const ISSUER: &str = "relay-tests";

fn settings(downstream: &str) -> Settings {
    Settings {
        downstream_url: downstream.into(),
        jwt_secret: SECRET.into(),
        jwt_algorithm: "HS256".into(),
        jwt_audience: AUDIENCE.into(),
        jwt_issuer: ISSUER.into(),
        rate_limit_enabled: true,
        rate_limit_per_minute: 1000,
        rate_limit_window_seconds: 60,
        cache_enabled: true,
        cache_ttl: 60,
        redis: RedisConfig::default(),
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn mint(claims: Value) -> String {
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn good_token() -> String {
    mint(json!({
        "sub": "alice",
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": unix_secs() + 600,
    }))
}

/// Stub origin: a counting endpoint plus one that forbids caching.
async fn spawn_origin() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let data_hits = Arc::clone(&hits);
    let volatile_hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/api/data",
            get(move || {
                let hits = Arc::clone(&data_hits);
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({"origin_hits": n}))
                }
            }),
        )
        .route(
            "/volatile",
            get(move || {
                let hits = Arc::clone(&volatile_hits);
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    (
                        [("cache-control", "no-store")],
                        Json(json!({"origin_hits": n})),
                    )
                }
            }),
        )
        .fallback(|| async { (StatusCode::NOT_FOUND, "origin 404") });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

async fn setup() -> (String, Client, Arc<AtomicUsize>) {
    let (origin, hits) = spawn_origin().await;
    let store = Arc::new(MemoryStore::new());
    let (addr, _handle) =
        relay_gate::test::spawn(settings(&format!("http://{origin}")), store).await;
    (format!("http://{addr}"), Client::new(), hits)
}

// ── Auth taxonomy ────────────────────────────────────────────────

#[tokio::test]
async fn health_needs_no_token() {
    let (base, http, _) = setup().await;
    let resp = http.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn missing_header_is_401() {
    let (base, http, _) = setup().await;
    let resp = http.get(format!("{base}/api/data")).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["detail"], "Missing or invalid Authorization header");
}

#[tokio::test]
async fn non_bearer_scheme_is_401() {
    let (base, http, _) = setup().await;
    let resp = http
        .get(format!("{base}/api/data"))
        .header("Authorization", "Basic YWxpY2U6cHc=")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["detail"], "Missing or invalid Authorization header");
}

#[tokio::test]
async fn expired_token_is_401_expired() {
    let (base, http, _) = setup().await;
    let stale = mint(json!({
        "sub": "alice",
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": unix_secs() - 1,
    }));
    let resp = http
        .get(format!("{base}/api/data"))
        .bearer_auth(stale)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["detail"], "Token expired");
}

#[tokio::test]
async fn wrong_audience_is_401_invalid() {
    let (base, http, _) = setup().await;
    let foreign = mint(json!({
        "sub": "alice",
        "iss": ISSUER,
        "aud": "someone-else",
        "exp": unix_secs() + 600,
    }));
    let resp = http
        .get(format!("{base}/api/data"))
        .bearer_auth(foreign)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["detail"], "Token invalid");
}

#[tokio::test]
async fn garbage_token_is_401_invalid() {
    let (base, http, _) = setup().await;
    let resp = http
        .get(format!("{base}/api/data"))
        .bearer_auth("not.a.jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["detail"], "Token invalid");
}

#[tokio::test]
async fn admin_routes_require_auth() {
    let (base, http, _) = setup().await;
    let resp = http
        .delete(format!("{base}/admin/cache"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let resp = http
        .get(format!("{base}/admin/cache/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

// ── Limiter boundaries ───────────────────────────────────────────

#[tokio::test]
async fn exhaustion_sequence_and_refill() {
    let (origin, _hits) = spawn_origin().await;
    let store = Arc::new(MemoryStore::new());
    let mut cfg = settings(&format!("http://{origin}"));
    cfg.rate_limit_per_minute = 3;
    cfg.rate_limit_window_seconds = 1;
    let (addr, _handle) = relay_gate::test::spawn(cfg, store).await;
    let base = format!("http://{addr}");
    let http = Client::new();
    let bearer = good_token();

    let send = || {
        let http = http.clone();
        let bearer = bearer.clone();
        let base = base.clone();
        async move {
            http.get(format!("{base}/api/data"))
                .bearer_auth(&bearer)
                .header("Cache-Control", "no-cache")
                .header("X-Forwarded-For", "198.51.100.4")
                .send()
                .await
                .unwrap()
        }
    };

    for expected_remaining in ["2", "1", "0"] {
        let resp = send().await;
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("x-ratelimit-remaining").unwrap(),
            expected_remaining
        );
        assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "3");
        let reset: u64 = resp
            .headers()
            .get("x-ratelimit-reset")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(reset > unix_secs(), "reset must point at the future");
    }

    let resp = send().await;
    assert_eq!(resp.status(), 429);
    assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"detail": "Too many requests"}));

    // 0.4s at 3 tokens/s buys exactly one more admission
    tokio::time::sleep(Duration::from_millis(400)).await;
    let resp = send().await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let resp = send().await;
    assert_eq!(resp.status(), 429);
}

#[tokio::test]
async fn zero_capacity_denies_everything_but_bypass() {
    let (origin, _hits) = spawn_origin().await;
    let store = Arc::new(MemoryStore::new());
    let mut cfg = settings(&format!("http://{origin}"));
    cfg.rate_limit_per_minute = 0;
    let (addr, _handle) = relay_gate::test::spawn(cfg, store).await;
    let base = format!("http://{addr}");
    let http = Client::new();
    let bearer = good_token();

    for _ in 0..2 {
        let resp = http
            .get(format!("{base}/api/data"))
            .bearer_auth(&bearer)
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 429);
        assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "0");
        // A bucket that never refills must still report a finite,
        // near-now reset, not a saturated 1/0
        let reset: u64 = resp
            .headers()
            .get("x-ratelimit-reset")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(reset >= unix_secs());
        assert!(reset <= unix_secs() + 3, "reset too far out: {reset}");
    }
    let resp = http.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn bypass_path_survives_an_exhausted_bucket() {
    let (origin, _hits) = spawn_origin().await;
    let store = Arc::new(MemoryStore::new());
    let mut cfg = settings(&format!("http://{origin}"));
    cfg.rate_limit_per_minute = 1;
    let (addr, _handle) = relay_gate::test::spawn(cfg, store).await;
    let base = format!("http://{addr}");
    let http = Client::new();
    let bearer = good_token();

    let first = http
        .get(format!("{base}/api/data"))
        .bearer_auth(&bearer)
        .header("Cache-Control", "no-cache")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let second = http
        .get(format!("{base}/api/data"))
        .bearer_auth(&bearer)
        .header("Cache-Control", "no-cache")
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 429);

    let health = http.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
}

// ── Cache refusals ───────────────────────────────────────────────

#[tokio::test]
async fn no_cache_request_skips_lookup_but_still_refreshes() {
    let (base, http, hits) = setup().await;
    let bearer = good_token();
    for expected_hits in [1, 2] {
        let resp = http
            .get(format!("{base}/api/data"))
            .bearer_auth(&bearer)
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("x-cache").unwrap(), "MISS");
        assert_eq!(hits.load(Ordering::SeqCst), expected_hits);
    }

    // Each forced refresh rewrote the shared entry: a plain GET now
    // serves the second refresh from the cache without a third origin hit
    let resp = http
        .get(format!("{base}/api/data"))
        .bearer_auth(&bearer)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("x-cache").unwrap(), "HIT");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["origin_hits"], 2);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn no_store_responses_are_not_cached() {
    let (base, http, _hits) = setup().await;
    let bearer = good_token();
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let resp = http
            .get(format!("{base}/volatile"))
            .bearer_auth(&bearer)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("x-cache").unwrap(), "MISS");
        let body: Value = resp.json().await.unwrap();
        bodies.push(body["origin_hits"].as_u64().unwrap());
    }
    assert_eq!(bodies, vec![1, 2]);
}

// ── Fail-open against a dead store ───────────────────────────────

struct DeadStore;

#[async_trait]
impl KvStore for DeadStore {
    async fn ping(&self) -> Result<(), KvError> {
        Err(KvError::Connect("store down".into()))
    }
    async fn get(&self, _: &str) -> Result<Option<String>, KvError> {
        Err(KvError::Connect("store down".into()))
    }
    async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<(), KvError> {
        Err(KvError::Connect("store down".into()))
    }
    async fn del(&self, _: &[String]) -> Result<u64, KvError> {
        Err(KvError::Connect("store down".into()))
    }
    async fn keys(&self, _: &str) -> Result<Vec<String>, KvError> {
        Err(KvError::Connect("store down".into()))
    }
    async fn hget_all(&self, _: &str) -> Result<HashMap<String, String>, KvError> {
        Err(KvError::Connect("store down".into()))
    }
    async fn hset_cas(
        &self,
        _: &str,
        _: &[(&str, Option<&str>)],
        _: &[(&str, &str)],
        _: Duration,
    ) -> Result<bool, KvError> {
        Err(KvError::Connect("store down".into()))
    }
    async fn server_info(&self) -> Result<ServerInfo, KvError> {
        Err(KvError::Connect("store down".into()))
    }
}

#[tokio::test]
async fn dead_store_degrades_to_a_plain_proxy() {
    let (origin, hits) = spawn_origin().await;
    let mut cfg = settings(&format!("http://{origin}"));
    cfg.rate_limit_per_minute = 5;
    let (addr, _handle) = relay_gate::test::spawn(cfg, Arc::new(DeadStore)).await;
    let base = format!("http://{addr}");
    let http = Client::new();
    let bearer = good_token();

    // Far more requests than the bucket holds: all admitted, all misses
    for n in 1..=8u64 {
        let resp = http
            .get(format!("{base}/api/data"))
            .bearer_auth(&bearer)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("x-cache").unwrap(), "MISS");
        assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "5");
        assert_eq!(hits.load(Ordering::SeqCst) as u64, n);
    }
}

#[tokio::test]
async fn dead_store_stats_report_disconnected() {
    let (origin, _hits) = spawn_origin().await;
    let (addr, _handle) = relay_gate::test::spawn(
        settings(&format!("http://{origin}")),
        Arc::new(DeadStore),
    )
    .await;
    let http = Client::new();

    let resp = http
        .get(format!("http://{addr}/admin/cache/stats"))
        .bearer_auth(&good_token())
        .header("Cache-Control", "no-cache")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let stats: Value = resp.json().await.unwrap();
    assert_eq!(stats["store_connected"], false);
    assert_eq!(stats["total_cache_keys"], 0);
    assert!(stats["error"].as_str().unwrap().contains("store down"));
}

#[tokio::test]
async fn admin_flush_surfaces_store_failure_as_500() {
    let (origin, _hits) = spawn_origin().await;
    let (addr, _handle) = relay_gate::test::spawn(
        settings(&format!("http://{origin}")),
        Arc::new(DeadStore),
    )
    .await;
    let http = Client::new();

    let resp = http
        .delete(format!("http://{addr}/admin/cache"))
        .bearer_auth(&good_token())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Failed to clear cache"));
}
