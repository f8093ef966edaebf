use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;

use crate::server::AppState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// Ready when storage answers and the shared cache tier is reachable.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let storage_ok = match state.controller.storage().ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "storage not ready");
            false
        }
    };
    let cache_ok = state.resource_cache.shared().is_available().await;

    let status = if storage_ok && cache_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ready" } else { "not_ready" },
            "storage": storage_ok,
            "cache": {
                "mode": state.resource_cache.shared().mode(),
                "available": cache_ok,
            },
        })),
    )
}
