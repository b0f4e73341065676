//! Shared response cache.
//!
//! Entries live in the store under `cache:{fingerprint}` where the
//! fingerprint is a 128-bit digest of `method|path|query|identity`.
//! Only GETs off the bypass set are served from or written to the cache;
//! gateway instrumentation headers are stripped before storage so a
//! later HIT never replays a stale `X-Cache: MISS`.
//!
//! The middleware buffers every response it passes through, which also
//! drains streaming origin bodies into a plain buffered reply.

use crate::{error::GateError, identity, unix_now, AppState};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use relay_kv::{KvError, KvStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub const KEY_PREFIX: &str = "cache:";

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_CACHE_TTL: HeaderName = HeaderName::from_static("x-cache-ttl");
pub const X_PROCESS_TIME: HeaderName = HeaderName::from_static("x-process-time");

/// Headers the gateway injects; never stored, stripped on read as well.
const INJECTED_HEADERS: &[&str] = &["x-cache", "x-process-time", "x-cache-ttl"];

fn is_injected(name: &str) -> bool {
    INJECTED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// The persisted entry: body text, status, surviving headers, and the
/// write timestamp.
#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    content: String,
    status_code: u16,
    headers: BTreeMap<String, String>,
    cached_at: f64,
}

#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KvStore>, ttl_seconds: u64) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(ttl_seconds),
        }
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Cache key for a request: prefix plus the hex form of a truncated
    /// 128-bit digest over the request tuple.
    pub fn fingerprint(method: &Method, path: &str, query: &str, caller: &str) -> String {
        let key_string = format!("{method}|{path}|{query}|{caller}");
        let digest = blake3::hash(key_string.as_bytes());
        format!("{KEY_PREFIX}{}", hex::encode(&digest.as_bytes()[..16]))
    }

    /// GETs off the bypass set are the only requests with cache entries.
    pub fn cacheable_route(method: &Method, path: &str) -> bool {
        *method == Method::GET && !crate::is_bypass(path)
    }

    /// May this request be answered from the cache? A request-side
    /// `Cache-Control: no-cache` skips the lookup only; the response it
    /// forces out of the origin still refreshes the shared entry.
    pub fn eligible_request(method: &Method, path: &str, headers: &HeaderMap) -> bool {
        if !Self::cacheable_route(method, path) {
            return false;
        }
        let no_cache = headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "no-cache");
        !no_cache
    }

    /// May this response be stored?
    pub fn eligible_response(status: StatusCode, headers: &HeaderMap) -> bool {
        if !status.is_success() {
            return false;
        }
        let cache_control = headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        !cache_control.contains("no-cache") && !cache_control.contains("no-store")
    }

    /// Fetch and decode an entry. Store or codec trouble reads as a miss.
    async fn lookup(&self, key: &str) -> Option<StoredResponse> {
        let raw = match self.store.get(key).await {
            Ok(value) => value?,
            Err(e) => {
                error!("cache read error: {e}");
                return None;
            }
        };
        match serde_json::from_str::<StoredResponse>(&raw) {
            Ok(mut stored) => {
                stored.headers.retain(|name, _| !is_injected(name));
                Some(stored)
            }
            Err(e) => {
                error!("cache entry malformed: {e}");
                None
            }
        }
    }

    /// Store a buffered response. Write failures are logged and dropped;
    /// a second cacheable response for the same key overwrites.
    async fn store_response(
        &self,
        key: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) {
        let content = match std::str::from_utf8(body) {
            Ok(text) => text.to_string(),
            Err(_) => {
                debug!("response body is not UTF-8, skipping cache write");
                return;
            }
        };
        let mut stored_headers = BTreeMap::new();
        for (name, value) in headers {
            if is_injected(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                stored_headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let entry = StoredResponse {
            content,
            status_code: status.as_u16(),
            headers: stored_headers,
            cached_at: unix_now(),
        };
        let payload = match serde_json::to_string(&entry) {
            Ok(payload) => payload,
            Err(e) => {
                error!("cache entry encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self.store.set_ex(key, &payload, self.ttl).await {
            error!("cache write error: {e}");
        }
    }

    /// Delete entries matching `cache:{pattern}` (store glob semantics).
    /// Returns how many were removed.
    pub async fn invalidate(&self, pattern: &str) -> Result<u64, KvError> {
        let keys = self.store.keys(&format!("{KEY_PREFIX}{pattern}")).await?;
        let deleted = self.store.del(&keys).await?;
        if deleted > 0 {
            info!("invalidated {deleted} cache entries matching pattern: {pattern}");
        }
        Ok(deleted)
    }

    /// Delete every cache entry.
    pub async fn flush(&self) -> Result<u64, KvError> {
        self.invalidate("*").await
    }
}

/// Middleware: serve eligible requests from the cache, store eligible
/// responses into it, and stamp `X-Cache` on everything that passes by.
pub async fn serve_or_store(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.settings.cache_enabled {
        let mut response = next.run(req).await;
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("DISABLED"));
        return response;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let serve_from_cache = ResponseCache::eligible_request(&method, &path, req.headers());
    let key = ResponseCache::fingerprint(&method, &path, &query, &identity::cache_identity(&req));

    if serve_from_cache {
        if let Some(stored) = state.cache.lookup(&key).await {
            info!("cache HIT for {method} {path}");
            return hit_response(stored, state.cache.ttl_seconds());
        }
        info!("cache MISS for {method} {path}");
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to buffer response body: {e}");
            return GateError::internal("response buffering failed").into_response();
        }
    };

    // Snapshot before the MISS instrumentation goes on. Writes ignore
    // the request's cache-control: a forced refresh still refreshes.
    if ResponseCache::cacheable_route(&method, &path)
        && ResponseCache::eligible_response(parts.status, &parts.headers)
    {
        state
            .cache
            .store_response(&key, parts.status, &parts.headers, &bytes)
            .await;
    }

    parts.headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
    if let Ok(value) = HeaderValue::from_str(&format!("{elapsed:.4}")) {
        parts.headers.insert(X_PROCESS_TIME, value);
    }
    Response::from_parts(parts, Body::from(bytes))
}

fn hit_response(stored: StoredResponse, ttl_seconds: u64) -> Response {
    let mut response = Response::new(Body::from(stored.content));
    *response.status_mut() =
        StatusCode::from_u16(stored.status_code).unwrap_or(StatusCode::OK);
    for (name, value) in &stored.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("HIT"));
    response
        .headers_mut()
        .insert(X_CACHE_TTL, HeaderValue::from(ttl_seconds));
    response
}
