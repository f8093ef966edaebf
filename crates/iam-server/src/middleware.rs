use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use iam_core::{CoreError, TenantId};
use uuid::Uuid;

use crate::config::TenantConfig;
use crate::response::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

// Request ID middleware: propagate x-request-id if present; otherwise generate one.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    let req_id_value = match req.headers().get(&header_name) {
        Some(value) => value.clone(),
        None => HeaderValue::try_from(Uuid::new_v4().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    };

    // Add to request extensions for downstream usage (e.g., logging)
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

/// How the tenant id is read from requests.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub header: HeaderName,
    pub enforce: bool,
}

impl TenantSettings {
    pub fn from_config(cfg: &TenantConfig) -> Result<Self, String> {
        let header = HeaderName::from_bytes(cfg.header.as_bytes())
            .map_err(|e| format!("invalid tenant header `{}`: {e}", cfg.header))?;
        Ok(Self {
            header,
            enforce: cfg.enforce,
        })
    }
}

/// Reads the tenant id once per request and stores it as a [`TenantId`]
/// extension. A missing header is the empty tenant unless enforcement is on.
pub async fn tenant_context(
    State(settings): State<Arc<TenantSettings>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let tenant = req
        .headers()
        .get(&settings.header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    if tenant.is_empty() && settings.enforce {
        tracing::debug!(path = %req.uri().path(), "request without tenant id rejected");
        return ApiError::from(CoreError::MissingTenant).into_response();
    }

    req.extensions_mut().insert(TenantId::new(tenant));
    next.run(req).await
}
