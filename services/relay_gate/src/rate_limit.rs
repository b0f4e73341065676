//! Distributed token-bucket rate limiting.
//!
//! Bucket state lives in the shared store under `rate_limit:{client_id}`
//! as a hash of `tokens` and `last_refill` (unix seconds, fractional),
//! so every gateway replica draws from the same bucket. Refill is
//! continuous and clamped at capacity. Updates go through the store's
//! optimistic compare-and-swap; concurrent writers retry, and any store
//! trouble fails open: a dead store turns the gateway into a plain
//! proxy, never into a denial of service.

use crate::{error::GateError, identity, unix_now, AppState};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use relay_kv::KvStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const KEY_PREFIX: &str = "rate_limit:";
const MAX_RETRIES: u32 = 3;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub limited: bool,
    pub remaining: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    max_tokens: u32,
    refill_rate: f64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, max_tokens: u32, window_seconds: u64) -> Self {
        let window = Duration::from_secs(window_seconds.max(1));
        Self {
            store,
            max_tokens,
            refill_rate: max_tokens as f64 / window.as_secs_f64(),
            window,
        }
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Decide admission for `client_id`, consuming one token when
    /// admitted. Denial writes back the refilled count untouched but
    /// still advances `last_refill`.
    pub async fn check(&self, client_id: &str) -> Admission {
        let key = format!("{KEY_PREFIX}{client_id}");
        // Idle buckets expire; three windows is plenty to refill fully.
        let ttl = self.window * 3;
        for attempt in 1..=MAX_RETRIES {
            let now = unix_now();
            let snapshot = match self.store.hget_all(&key).await {
                Ok(fields) => fields,
                Err(e) => {
                    error!("rate limit read failed for {client_id}: {e}");
                    return self.fail_open();
                }
            };
            let raw_tokens = snapshot.get("tokens").cloned();
            let raw_refill = snapshot.get("last_refill").cloned();
            let tokens = raw_tokens
                .as_deref()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(self.max_tokens as f64);
            let last_refill = raw_refill
                .as_deref()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(now);

            let refilled = (now - last_refill).max(0.0) * self.refill_rate;
            let mut tokens = (tokens + refilled).min(self.max_tokens as f64);
            let limited = tokens < 1.0;
            if !limited {
                tokens -= 1.0;
            }

            let new_tokens = tokens.to_string();
            let new_refill = now.to_string();
            let watched = [
                ("tokens", raw_tokens.as_deref()),
                ("last_refill", raw_refill.as_deref()),
            ];
            let new = [
                ("tokens", new_tokens.as_str()),
                ("last_refill", new_refill.as_str()),
            ];
            match self.store.hset_cas(&key, &watched, &new, ttl).await {
                Ok(true) => {
                    return Admission {
                        limited,
                        remaining: tokens.max(0.0) as u32,
                    }
                }
                Ok(false) => {
                    debug!("bucket conflict for {client_id} (attempt {attempt})");
                    continue;
                }
                Err(e) => {
                    error!("rate limit write failed for {client_id}: {e}");
                    return self.fail_open();
                }
            }
        }
        warn!("rate limit retries exhausted for {client_id}, failing open");
        self.fail_open()
    }

    fn fail_open(&self) -> Admission {
        Admission {
            limited: false,
            remaining: self.max_tokens,
        }
    }
}

/// Middleware: enforce the per-client bucket, stamping `X-RateLimit-*`
/// headers on admitted and denied responses alike.
pub async fn enforce(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.settings.rate_limit_enabled || crate::is_bypass(req.uri().path()) {
        return next.run(req).await;
    }
    let client_id = identity::limiter_identity(&req);
    let admission = state.limiter.check(&client_id).await;

    // Next whole second at which a token is guaranteed available. A
    // zero-capacity bucket never refills; report the next second instead
    // of letting 1/0 saturate the header.
    let rate = state.limiter.refill_rate();
    let reset = if rate > 0.0 {
        (unix_now() + 1.0 / rate).ceil() as u64
    } else {
        unix_now().ceil() as u64
    };
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(state.limiter.max_tokens()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(admission.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset.saturating_add(1)));

    let mut response = if admission.limited {
        warn!("rate limit exceeded for client {client_id}");
        GateError::too_many_requests().into_response()
    } else {
        next.run(req).await
    };
    response.headers_mut().extend(headers);
    response
}
