//! Environment-driven settings.
//!
//! `DOWNSTREAM_URL` and `JWT_SECRET` are required and fail startup
//! loudly; everything else has the documented default.

use anyhow::Context;
use relay_kv::RedisConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Origin base URL every unmatched request is forwarded to.
    pub downstream_url: String,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub jwt_audience: String,
    pub jwt_issuer: String,
    pub rate_limit_enabled: bool,
    /// Bucket capacity (`max_tokens`).
    pub rate_limit_per_minute: u32,
    /// Refill window; `refill_rate = per_minute / window_seconds`.
    pub rate_limit_window_seconds: u64,
    pub cache_enabled: bool,
    /// Cache entry TTL in seconds.
    pub cache_ttl: u64,
    pub redis: RedisConfig,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            downstream_url: std::env::var("DOWNSTREAM_URL")
                .context("DOWNSTREAM_URL must be set")?,
            jwt_secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_algorithm: env_or("JWT_ALGORITHM", "HS256"),
            jwt_audience: env_or("JWT_AUDIENCE", "your-audience"),
            jwt_issuer: env_or("JWT_ISSUER", "your-issuer"),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", true),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", 60),
            rate_limit_window_seconds: env_parse("RATE_LIMIT_WINDOW_SECONDS", 60),
            cache_enabled: env_bool("CACHE_ENABLED", true),
            cache_ttl: env_parse("CACHE_TTL", 300),
            redis: RedisConfig::from_env(),
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
