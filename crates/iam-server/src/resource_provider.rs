//! Upstream loader for remote resource attributes.
//!
//! Remote resources are owned by the systems that register them. Each system
//! exposes a callback endpoint answering `fetch_instance_info` requests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::config::ResourceProviderConfig;

/// One remote resource: attribute name to value.
pub type Resource = serde_json::Map<String, Value>;

/// Resources returned for one lookup.
pub type ResourceList = Vec<Resource>;

/// User presented to resource providers in basic auth.
pub const PROVIDER_AUTH_USER: &str = "bk_iam";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no resource provider configured for system `{system}`")]
    UnknownSystem { system: String },

    #[error("request to resource provider `{system}` failed: {message}")]
    Transport { system: String, message: String },

    #[error("resource provider `{system}` responded with HTTP {status}")]
    Status { system: String, status: u16 },

    #[error("resource provider `{system}` returned code {code}: {message}")]
    Provider {
        system: String,
        code: i64,
        message: String,
    },

    #[error("invalid response from resource provider `{system}`: {message}")]
    Decode { system: String, message: String },
}

/// Source of remote resource attributes, consulted on a full cache miss.
#[async_trait]
pub trait RemoteResourceSource: Send + Sync {
    async fn fetch(
        &self,
        tenant: &str,
        system: &str,
        resource_type: &str,
        ids: &[String],
        fields: &[String],
    ) -> Result<ResourceList, UpstreamError>;
}

#[derive(Debug, Serialize)]
struct FetchInstanceRequest<'a> {
    #[serde(rename = "type")]
    resource_type: &'a str,
    method: &'static str,
    filter: FetchInstanceFilter<'a>,
}

#[derive(Debug, Serialize)]
struct FetchInstanceFilter<'a> {
    ids: &'a [String],
    attrs: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<ResourceList>,
}

/// HTTP client for the configured resource providers.
#[derive(Debug, Clone)]
pub struct ResourceProviderClient {
    http: reqwest::Client,
    providers: HashMap<String, ResourceProviderConfig>,
    tenant_header: String,
}

impl ResourceProviderClient {
    pub fn new(
        providers: HashMap<String, ResourceProviderConfig>,
        tenant_header: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            providers,
            tenant_header: tenant_header.into(),
        }
    }
}

#[async_trait]
impl RemoteResourceSource for ResourceProviderClient {
    #[instrument(skip(self, ids, fields), fields(ids = ids.len()))]
    async fn fetch(
        &self,
        tenant: &str,
        system: &str,
        resource_type: &str,
        ids: &[String],
        fields: &[String],
    ) -> Result<ResourceList, UpstreamError> {
        let provider = self
            .providers
            .get(system)
            .ok_or_else(|| UpstreamError::UnknownSystem {
                system: system.to_string(),
            })?;

        let url = format!("{}{}", provider.base_url.trim_end_matches('/'), provider.path);
        let body = FetchInstanceRequest {
            resource_type,
            method: "fetch_instance_info",
            filter: FetchInstanceFilter { ids, attrs: fields },
        };

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_millis(provider.timeout_ms))
            .json(&body);
        if !tenant.is_empty() {
            request = request.header(self.tenant_header.as_str(), tenant);
        }
        if let Some(token) = provider.token.as_deref() {
            request = request.basic_auth(PROVIDER_AUTH_USER, Some(token));
        }

        let response = request.send().await.map_err(|e| UpstreamError::Transport {
            system: system.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                system: system.to_string(),
                status: status.as_u16(),
            });
        }

        let payload: ProviderResponse =
            response.json().await.map_err(|e| UpstreamError::Decode {
                system: system.to_string(),
                message: e.to_string(),
            })?;
        if payload.code != 0 {
            return Err(UpstreamError::Provider {
                system: system.to_string(),
                code: payload.code,
                message: payload.message,
            });
        }

        Ok(payload.data.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let ids = vec!["1".to_string(), "2".to_string()];
        let attrs = vec!["id".to_string(), "name".to_string()];
        let body = FetchInstanceRequest {
            resource_type: "host",
            method: "fetch_instance_info",
            filter: FetchInstanceFilter {
                ids: &ids,
                attrs: &attrs,
            },
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "type": "host",
                "method": "fetch_instance_info",
                "filter": {"ids": ["1", "2"], "attrs": ["id", "name"]}
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_system() {
        let client = ResourceProviderClient::new(HashMap::new(), "x-tenant-id");
        let err = client
            .fetch("", "missing", "host", &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::UnknownSystem { .. }));
    }
}
