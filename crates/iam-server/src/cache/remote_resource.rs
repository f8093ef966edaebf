//! Two-tier cache of remote resource lists.
//!
//! Lookup order: local tier (moka) → shared tier ([`SharedCache`]) → resource
//! provider. Concurrent misses of the same key are coalesced so that the
//! provider is asked once; a failed load is handed to every waiting caller and
//! nothing is cached for it.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::{debug, warn};

use super::backend::SharedCache;
use super::key::RemoteResourceListCacheKey;
use crate::resource_provider::{RemoteResourceSource, ResourceList, UpstreamError};

/// Prefix of shared tier keys.
pub const SHARED_KEY_PREFIX: &str = "iam:remote_resource_list:";

/// Default TTL of both tiers (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default local tier capacity (number of lists).
pub const DEFAULT_LOCAL_CAPACITY: u64 = 10_000;

pub struct RemoteResourceCache {
    local: Cache<String, Arc<ResourceList>>,
    shared: SharedCache,
    source: Arc<dyn RemoteResourceSource>,
    ttl: Duration,
}

impl RemoteResourceCache {
    pub fn new(shared: SharedCache, source: Arc<dyn RemoteResourceSource>) -> Self {
        Self::with_config(shared, source, DEFAULT_TTL, DEFAULT_LOCAL_CAPACITY)
    }

    pub fn with_config(
        shared: SharedCache,
        source: Arc<dyn RemoteResourceSource>,
        ttl: Duration,
        local_capacity: u64,
    ) -> Self {
        Self {
            local: Cache::builder()
                .max_capacity(local_capacity)
                .time_to_live(ttl)
                .build(),
            shared,
            source,
            ttl,
        }
    }

    /// Lists the `fields` of the resources `ids` of `resource_type` owned by
    /// `system`. `ids` are joined with `,` and `fields` with `;` to form the key.
    ///
    /// # Errors
    ///
    /// Returns the provider error of the load this call waited on.
    pub async fn list_remote_resources(
        &self,
        tenant: &str,
        system: &str,
        resource_type: &str,
        ids: &[String],
        fields: &[String],
    ) -> Result<Arc<ResourceList>, Arc<UpstreamError>> {
        let key = RemoteResourceListCacheKey::new(
            tenant,
            system,
            resource_type,
            ids.join(","),
            fields.join(";"),
        );
        let digest = key.key();

        self.local
            .try_get_with(digest.clone(), self.load(&key, &digest, ids, fields))
            .await
    }

    async fn load(
        &self,
        key: &RemoteResourceListCacheKey,
        digest: &str,
        ids: &[String],
        fields: &[String],
    ) -> Result<Arc<ResourceList>, UpstreamError> {
        let shared_key = format!("{SHARED_KEY_PREFIX}{digest}");

        if let Some(bytes) = self.shared.get(&shared_key).await {
            match rmp_serde::from_slice::<ResourceList>(&bytes) {
                Ok(list) => {
                    debug!(key = %shared_key, "remote resource list served from shared tier");
                    return Ok(Arc::new(list));
                }
                Err(e) => {
                    warn!(key = %shared_key, error = %e, "undecodable shared cache entry, reloading");
                    self.shared.invalidate(&shared_key).await;
                }
            }
        }

        let list = self
            .source
            .fetch(&key.tenant, &key.system, &key.resource_type, ids, fields)
            .await
            .inspect_err(|e| {
                warn!(system = %key.system, resource_type = %key.resource_type, error = %e, "remote resource load failed");
            })?;

        match rmp_serde::to_vec(&list) {
            Ok(bytes) => self.shared.set(&shared_key, bytes, self.ttl).await,
            Err(e) => warn!(key = %shared_key, error = %e, "failed to encode remote resource list"),
        }
        Ok(Arc::new(list))
    }

    /// Drops the entry from both tiers.
    pub async fn invalidate(&self, key: &RemoteResourceListCacheKey) {
        let digest = key.key();
        self.local.invalidate(&digest).await;
        self.shared
            .invalidate(&format!("{SHARED_KEY_PREFIX}{digest}"))
            .await;
    }

    pub fn shared(&self) -> &SharedCache {
        &self.shared
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
