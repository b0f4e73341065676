//! Reverse proxy to the single downstream origin.
//!
//! The fallback handler for everything no explicit route claims:
//! forwards method, path, query, headers, and body verbatim, then
//! returns the origin's status, headers, and body untouched. `Host` is
//! dropped (the client re-derives it for the origin) along with
//! hop-by-hop headers, which must not be replayed around a buffering
//! proxy. Transport-level failures become `502 Bad Gateway`; an origin
//! error status is passed through, not rewritten.

use crate::{error::GateError, AppState};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tracing::error;

/// Per-upstream-call timeout.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[derive(Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
    base: String,
}

impl ProxyClient {
    pub fn new(downstream_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base: downstream_url.trim_end_matches('/').to_string(),
        })
    }

    fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!("{}/{}", self.base, path.trim_start_matches('/'));
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Fallback handler: forward the request to the origin.
pub async fn forward(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, crate::MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to read request body: {e}");
            return GateError::internal("failed to read request body").into_response();
        }
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &parts.headers {
        if *name == header::HOST || is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let url = state
        .proxy
        .target_url(parts.uri.path(), parts.uri.query());
    let upstream = match state
        .proxy
        .http
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            error!("upstream request failed for {url}: {e}");
            return GateError::bad_gateway().into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to read upstream body: {e}");
            return GateError::bad_gateway().into_response();
        }
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}
