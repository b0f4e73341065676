//! Client identity derivation.
//!
//! The limiter partitions buckets by `user:{sub}` when a verified claim
//! set is attached, else by client IP (`ip:{first X-Forwarded-For hop}`,
//! then `ip:{peer}`). The cache fingerprint uses `user:{sub}` or the
//! literal `anonymous`, with no IP component, so anonymous callers share
//! entries.

use crate::auth::Claims;
use axum::extract::{ConnectInfo, Request};
use std::net::SocketAddr;

/// Bucket key for the rate limiter.
pub fn limiter_identity(req: &Request) -> String {
    if let Some(claims) = req.extensions().get::<Claims>() {
        return format!("user:{}", claims.sub);
    }
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return format!("ip:{first}");
            }
        }
    }
    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_string(),
    }
}

/// Caller component of the cache fingerprint.
pub fn cache_identity(req: &Request) -> String {
    match req.extensions().get::<Claims>() {
        Some(claims) => format!("user:{}", claims.sub),
        None => "anonymous".to_string(),
    }
}
