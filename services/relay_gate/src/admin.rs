//! Cache administration: stats, flush-all, pattern invalidation.
//!
//! Mounted as explicit routes so they always win over the proxy
//! fallback. They sit behind auth and the rate limiter like any other
//! route; stats is a GET and therefore flows through the cache
//! middleware; poll it with `Cache-Control: no-cache` for live numbers.

use crate::{cache, error::GateError, AppState};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use relay_kv::KvError;
use serde_json::json;

pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let settings = &state.settings;
    let probe = async {
        let keys = state.store.keys(&format!("{}*", cache::KEY_PREFIX)).await?;
        let info = state.store.server_info().await?;
        Ok::<_, KvError>((keys.len(), info))
    }
    .await;
    match probe {
        Ok((total_cache_keys, info)) => Json(json!({
            "cache_enabled": settings.cache_enabled,
            "cache_ttl": settings.cache_ttl,
            "total_cache_keys": total_cache_keys,
            "store_connected": true,
            "store_memory_human": info.memory_human,
            "store_uptime_seconds": info.uptime_seconds,
        })),
        Err(e) => Json(json!({
            "cache_enabled": settings.cache_enabled,
            "cache_ttl": settings.cache_ttl,
            "total_cache_keys": 0,
            "store_connected": false,
            "store_memory_human": "unknown",
            "store_uptime_seconds": 0,
            "error": e.to_string(),
        })),
    }
}

pub async fn flush_cache(State(state): State<AppState>) -> impl IntoResponse {
    match state.cache.flush().await {
        Ok(deleted) => Json(json!({
            "message": "Cache cleared successfully",
            "keys_deleted": deleted,
        }))
        .into_response(),
        Err(e) => GateError::internal(format!("Failed to clear cache: {e}")).into_response(),
    }
}

pub async fn invalidate_pattern(
    State(state): State<AppState>,
    Path(pattern): Path<String>,
) -> impl IntoResponse {
    match state.cache.invalidate(&pattern).await {
        Ok(_) => Json(json!({
            "message": format!("Cache entries matching '{pattern}' cleared"),
        }))
        .into_response(),
        Err(e) => {
            GateError::internal(format!("Failed to clear cache pattern: {e}")).into_response()
        }
    }
}
