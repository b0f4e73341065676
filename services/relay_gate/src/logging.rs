//! Request logging: one line on arrival, one on completion with the
//! final status and elapsed time. Outermost in the pipeline so bypass
//! paths and short-circuited responses are logged too.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::info;

pub async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!("→ {method} {path}");
    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    info!(
        "{method} {path} - {} - {elapsed_ms:.4}ms",
        response.status().as_u16()
    );
    response
}
