//! Shared cache tier: Redis when configured, a process-local map otherwise.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connectivity::RedisHandle;

/// A cached entry with TTL support.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    /// Create a new cached entry.
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Byte-level shared tier.
///
/// ## Modes
///
/// - **Local**: single instance, entries live in a DashMap
/// - **Redis**: entries are shared across instances through the cache handle
///
/// Every failure is logged and reported as a miss or a skipped write; the
/// shared tier never fails a lookup.
#[derive(Clone, Debug)]
pub enum SharedCache {
    /// Single-instance: local DashMap only
    Local(Arc<DashMap<String, CachedEntry>>),

    /// Multi-instance: Redis cache handle
    Redis(RedisHandle),
}

impl SharedCache {
    /// Create a new local-only shared tier.
    pub fn new_local() -> Self {
        SharedCache::Local(Arc::new(DashMap::new()))
    }

    /// Create a new Redis-backed shared tier.
    pub fn new_redis(handle: RedisHandle) -> Self {
        SharedCache::Redis(handle)
    }

    /// Get a value from the shared tier.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        match self {
            SharedCache::Local(map) => {
                if let Some(entry) = map.get(key) {
                    if !entry.is_expired() {
                        return Some(Arc::clone(&entry.data));
                    }
                    drop(entry);
                    map.remove(key);
                }
                None
            }
            SharedCache::Redis(redis) => match redis.get_bytes(key).await {
                Ok(Some(data)) => {
                    tracing::debug!(key = %key, "cache hit (shared)");
                    Some(Arc::new(data))
                }
                Ok(None) => {
                    tracing::debug!(key = %key, "cache miss (shared)");
                    None
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Redis GET error");
                    None
                }
            },
        }
    }

    /// Set a value in the shared tier with TTL.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        match self {
            SharedCache::Local(map) => {
                map.insert(key.to_string(), CachedEntry::new(value, ttl));
            }
            SharedCache::Redis(redis) => {
                if let Err(e) = redis.set_ex(key, &value, ttl).await {
                    tracing::warn!(key = %key, error = %e, "Redis SET error");
                } else {
                    tracing::debug!(key = %key, ttl_secs = %ttl.as_secs(), "cache set (shared)");
                }
            }
        }
    }

    /// Invalidate an entry.
    pub async fn invalidate(&self, key: &str) {
        match self {
            SharedCache::Local(map) => {
                map.remove(key);
            }
            SharedCache::Redis(redis) => {
                if let Err(e) = redis.del(key).await {
                    tracing::warn!(key = %key, error = %e, "Redis DEL error");
                }
            }
        }
        tracing::debug!(key = %key, "cache invalidated (shared)");
    }

    pub fn mode(&self) -> &'static str {
        match self {
            SharedCache::Local(_) => "local",
            SharedCache::Redis(_) => "redis",
        }
    }

    /// Check that the shared tier answers (for readiness checks).
    pub async fn is_available(&self) -> bool {
        match self {
            SharedCache::Local(_) => true,
            SharedCache::Redis(redis) => redis.ping().await.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_get_set_invalidate() {
        let cache = SharedCache::new_local();
        cache
            .set("k", b"value".to_vec(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("k").await, Some(Arc::new(b"value".to_vec())));

        cache.invalidate("k").await;
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.mode(), "local");
        assert!(cache.is_available().await);
    }

    #[tokio::test]
    async fn test_local_entries_expire() {
        let cache = SharedCache::new_local();
        cache
            .set("k", b"value".to_vec(), Duration::from_millis(50))
            .await;
        assert!(cache.get("k").await.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get("k").await.is_none());
        if let SharedCache::Local(map) = &cache {
            assert!(map.is_empty());
        }
    }
}
