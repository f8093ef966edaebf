//! Redis connectivity for the shared cache tier and the message queue.
//!
//! Two independent handles, `cache` and `mq`, are owned by one
//! [`Connectivity`] object that is built at startup and shared by `Arc`.
//! Each handle is initialized at most once; concurrent initializers wait for
//! the first one and later calls are no-ops.
//!
//! A handle whose startup ping fails is fatal unless the process runs in
//! debug mode, where the failure is logged and the handle is kept so that
//! commands degrade to per-call errors.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use deadpool_redis::sentinel::SentinelServerType;
use deadpool_redis::{PoolConfig, Runtime};
use redis::aio::ConnectionLike;
use redis::sentinel::SentinelNodeConnectionInfo;
use redis::{
    AsyncCommands, ClientTlsConfig, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo,
    TlsCertificates, TlsMode,
};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, RedisConfig, RedisMode, RedisTlsConfig};

/// Name of the handle backing the shared cache tier.
pub const NAME_CACHE: &str = "cache";

/// Name of the handle used for membership change events.
pub const NAME_MQ: &str = "mq";

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("invalid {name} redis configuration: {message}")]
    Config { name: &'static str, message: String },

    #[error("{name} redis connection failed: {message}")]
    Connection { name: &'static str, message: String },

    #[error("{name} redis command failed: {message}")]
    Command { name: &'static str, message: String },

    #[error("{name} redis command timed out after {timeout:?}")]
    Timeout {
        name: &'static str,
        timeout: Duration,
    },
}

impl ConnectivityError {
    /// Returns `true` if the error is a configuration problem, which is never
    /// downgraded by debug mode.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

#[derive(Clone)]
enum RedisPool {
    Standalone(deadpool_redis::Pool),
    Sentinel(deadpool_redis::sentinel::Pool),
}

/// A pooled connection from either topology.
pub enum RedisConnection {
    Standalone(deadpool_redis::Connection),
    Sentinel(deadpool_redis::sentinel::Connection),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(
        &'a mut self,
        cmd: &'a redis::Cmd,
    ) -> redis::RedisFuture<'a, redis::Value> {
        match self {
            RedisConnection::Standalone(conn) => conn.req_packed_command(cmd),
            RedisConnection::Sentinel(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a redis::Pipeline,
        offset: usize,
        count: usize,
    ) -> redis::RedisFuture<'a, Vec<redis::Value>> {
        match self {
            RedisConnection::Standalone(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConnection::Sentinel(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Standalone(conn) => conn.get_db(),
            RedisConnection::Sentinel(conn) => conn.get_db(),
        }
    }
}

/// A pooled Redis client with per-command read and write deadlines.
#[derive(Clone)]
pub struct RedisHandle {
    name: &'static str,
    mode: RedisMode,
    pool: RedisPool,
    read_timeout: Duration,
    write_timeout: Duration,
    alive: Arc<()>,
}

impl std::fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHandle")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl RedisHandle {
    /// Builds the pool without connecting.
    ///
    /// In sentinel mode the configured CA and client certificate apply to the
    /// sentinel connections; master connections verify against the system
    /// trust store.
    pub fn build(name: &'static str, cfg: &RedisConfig) -> Result<Self, ConnectivityError> {
        let config_error = |message: String| ConnectivityError::Config { name, message };

        let mut pool_config = PoolConfig::new(cfg.effective_pool_size());
        pool_config.timeouts.wait = Some(cfg.dial_timeout());
        pool_config.timeouts.create = Some(cfg.dial_timeout());
        pool_config.timeouts.recycle = Some(cfg.dial_timeout());

        let certs = load_tls_certificates(name, &cfg.tls)?;

        let pool = match cfg.mode {
            RedisMode::Standalone => {
                let info = connection_info(&standalone_url(cfg), certs.as_ref())
                    .map_err(|e| config_error(e.to_string()))?;
                let manager =
                    deadpool_redis::Manager::new(info).map_err(|e| config_error(e.to_string()))?;
                let pool = deadpool_redis::Pool::builder(manager)
                    .config(pool_config)
                    .runtime(Runtime::Tokio1)
                    .build()
                    .map_err(|e| config_error(e.to_string()))?;
                RedisPool::Standalone(pool)
            }
            RedisMode::Sentinel => {
                let sentinels = sentinel_urls(cfg)
                    .iter()
                    .map(|url| connection_info(url, certs.as_ref()))
                    .collect::<redis::RedisResult<Vec<_>>>()
                    .map_err(|e| config_error(e.to_string()))?;
                let node = SentinelNodeConnectionInfo {
                    tls_mode: cfg.tls.enabled.then_some(if cfg.tls.insecure_skip_verify {
                        TlsMode::Insecure
                    } else {
                        TlsMode::Secure
                    }),
                    redis_connection_info: Some(RedisConnectionInfo {
                        db: cfg.db,
                        password: cfg.password.clone().filter(|p| !p.is_empty()),
                        ..RedisConnectionInfo::default()
                    }),
                };
                let manager = deadpool_redis::sentinel::Manager::new(
                    sentinels,
                    cfg.master_name.clone(),
                    Some(node),
                    SentinelServerType::Master,
                )
                .map_err(|e| config_error(e.to_string()))?;
                let pool = deadpool_redis::sentinel::Pool::builder(manager)
                    .config(pool_config)
                    .runtime(Runtime::Tokio1)
                    .build()
                    .map_err(|e| config_error(e.to_string()))?;
                RedisPool::Sentinel(pool)
            }
        };

        Ok(Self {
            name,
            mode: cfg.mode,
            pool,
            read_timeout: cfg.read_timeout(),
            write_timeout: cfg.write_timeout(),
            alive: Arc::new(()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> RedisMode {
        self.mode
    }

    /// Checks out a pooled connection.
    pub async fn connection(&self) -> Result<RedisConnection, ConnectivityError> {
        let conn = match &self.pool {
            RedisPool::Standalone(pool) => pool
                .get()
                .await
                .map(RedisConnection::Standalone)
                .map_err(|e| e.to_string()),
            RedisPool::Sentinel(pool) => pool
                .get()
                .await
                .map(RedisConnection::Sentinel)
                .map_err(|e| e.to_string()),
        };
        conn.map_err(|message| ConnectivityError::Connection {
            name: self.name,
            message,
        })
    }

    async fn with_deadline<T, Fut>(&self, timeout: Duration, fut: Fut) -> Result<T, ConnectivityError>
    where
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ConnectivityError::Command {
                name: self.name,
                message: e.to_string(),
            }),
            Err(_) => Err(ConnectivityError::Timeout {
                name: self.name,
                timeout,
            }),
        }
    }

    pub async fn ping(&self) -> Result<(), ConnectivityError> {
        let mut conn = self.connection().await?;
        self.with_deadline(self.read_timeout, async {
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            pong
        })
        .await?;
        Ok(())
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, ConnectivityError> {
        let mut conn = self.connection().await?;
        self.with_deadline(self.read_timeout, conn.get::<_, Option<Vec<u8>>>(key))
            .await
    }

    pub async fn set_ex(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), ConnectivityError> {
        let mut conn = self.connection().await?;
        self.with_deadline(
            self.write_timeout,
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)),
        )
        .await
    }

    pub async fn del(&self, key: &str) -> Result<(), ConnectivityError> {
        let mut conn = self.connection().await?;
        self.with_deadline(self.write_timeout, conn.del::<_, ()>(key))
            .await
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<(), ConnectivityError> {
        let mut conn = self.connection().await?;
        self.with_deadline(self.write_timeout, conn.lpush::<_, _, ()>(key, value))
            .await
    }

    /// Opens up to `count` connections so the pool starts warm.
    async fn prewarm(&self, count: usize) {
        let mut warmed = Vec::with_capacity(count);
        for _ in 0..count {
            match self.connection().await {
                Ok(conn) => warmed.push(conn),
                Err(e) => {
                    warn!(redis = self.name, error = %e, "failed to prewarm redis pool");
                    break;
                }
            }
        }
    }

    /// Closes pooled connections unused for `idle`, keeping at least `keep`.
    /// Returns the number of closed connections.
    pub fn close_idle(&self, idle: Duration, keep: usize) -> usize {
        let mut kept = 0;
        let mut fresh_or_reserved = |last_used: Duration| {
            let retain = kept < keep || last_used < idle;
            if retain {
                kept += 1;
            }
            retain
        };
        match &self.pool {
            RedisPool::Standalone(pool) => {
                pool.retain(|_, metrics| fresh_or_reserved(metrics.last_used()))
                    .removed
                    .len()
            }
            RedisPool::Sentinel(pool) => {
                pool.retain(|_, metrics| fresh_or_reserved(metrics.last_used()))
                    .removed
                    .len()
            }
        }
    }

    /// Periodically closes idle connections until every clone of this handle
    /// is dropped.
    fn spawn_idle_reaper(&self, idle: Duration, keep: usize) {
        if idle.is_zero() {
            return;
        }
        let alive: Weak<()> = Arc::downgrade(&self.alive);
        let handle = RedisHandle {
            alive: Arc::new(()),
            ..self.clone()
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if alive.upgrade().is_none() {
                    break;
                }
                let closed = handle.close_idle(idle, keep);
                if closed > 0 {
                    debug!(redis = handle.name, closed, "closed idle redis connections");
                }
            }
        });
    }
}

/// Reads the configured CA and client certificate; `None` when TLS is off or
/// no files are configured.
fn load_tls_certificates(
    name: &'static str,
    tls: &RedisTlsConfig,
) -> Result<Option<TlsCertificates>, ConnectivityError> {
    if !tls.enabled {
        return Ok(None);
    }
    let read = |path: &str| {
        std::fs::read(path).map_err(|e| ConnectivityError::Config {
            name,
            message: format!("cannot read {path}: {e}"),
        })
    };

    let root_cert = tls.cert_ca_file.as_deref().map(read).transpose()?;
    let client_tls = match (tls.cert_file.as_deref(), tls.cert_key_file.as_deref()) {
        (Some(cert), Some(key)) => Some(ClientTlsConfig {
            client_cert: read(cert)?,
            client_key: read(key)?,
        }),
        (None, None) => None,
        _ => {
            return Err(ConnectivityError::Config {
                name,
                message: "tls.cert_file and tls.cert_key_file must be set together".into(),
            });
        }
    };

    if root_cert.is_none() && client_tls.is_none() {
        return Ok(None);
    }
    Ok(Some(TlsCertificates {
        client_tls,
        root_cert,
    }))
}

fn connection_info(
    url: &str,
    certs: Option<&TlsCertificates>,
) -> redis::RedisResult<ConnectionInfo> {
    match certs {
        Some(certs) => redis::Client::build_with_tls(url, certs.clone())
            .map(|client| client.get_connection_info().clone()),
        None => url.into_connection_info(),
    }
}

fn standalone_url(cfg: &RedisConfig) -> String {
    let scheme = if cfg.tls.enabled { "rediss" } else { "redis" };
    let auth = match cfg.password.as_deref() {
        Some(p) if !p.is_empty() => format!(":{}@", urlencoding::encode(p)),
        _ => String::new(),
    };
    let fragment = if cfg.tls.enabled && cfg.tls.insecure_skip_verify {
        "#insecure"
    } else {
        ""
    };
    format!("{scheme}://{auth}{}/{}{fragment}", cfg.addr, cfg.db)
}

fn sentinel_urls(cfg: &RedisConfig) -> Vec<String> {
    let scheme = if cfg.tls.enabled { "rediss" } else { "redis" };
    let auth = match cfg.sentinel_password.as_deref() {
        Some(p) if !p.is_empty() => format!(":{}@", urlencoding::encode(p)),
        _ => String::new(),
    };
    let fragment = if cfg.tls.enabled && cfg.tls.insecure_skip_verify {
        "#insecure"
    } else {
        ""
    };
    cfg.sentinel_addrs()
        .into_iter()
        .map(|addr| format!("{scheme}://{auth}{addr}{fragment}"))
        .collect()
}

fn masked(secret: Option<&str>) -> &'static str {
    match secret {
        Some(s) if !s.is_empty() => "***",
        _ => "",
    }
}

async fn connect(
    name: &'static str,
    cfg: &RedisConfig,
    debug: bool,
) -> Result<Option<RedisHandle>, ConnectivityError> {
    if !cfg.enabled {
        info!(redis = name, "redis handle disabled");
        return Ok(None);
    }

    let handle = RedisHandle::build(name, cfg)?;
    match cfg.mode {
        RedisMode::Standalone => info!(
            redis = name,
            mode = %cfg.mode,
            addr = %cfg.addr,
            password = masked(cfg.password.as_deref()),
            db = cfg.db,
            tls = cfg.tls.enabled,
            dial_timeout = ?cfg.dial_timeout(),
            read_timeout = ?cfg.read_timeout(),
            write_timeout = ?cfg.write_timeout(),
            pool_size = cfg.effective_pool_size(),
            min_idle_conns = cfg.effective_min_idle(),
            idle_timeout = ?cfg.idle_timeout(),
            "connect to redis"
        ),
        RedisMode::Sentinel => info!(
            redis = name,
            mode = %cfg.mode,
            master_name = %cfg.master_name,
            sentinels = ?cfg.sentinel_addrs(),
            password = masked(cfg.password.as_deref()),
            sentinel_password = masked(cfg.sentinel_password.as_deref()),
            db = cfg.db,
            tls = cfg.tls.enabled,
            pool_size = cfg.effective_pool_size(),
            min_idle_conns = cfg.effective_min_idle(),
            idle_timeout = ?cfg.idle_timeout(),
            "connect to redis"
        ),
    }
    if cfg.mode == RedisMode::Sentinel
        && (cfg.tls.cert_ca_file.is_some() || cfg.tls.cert_file.is_some())
    {
        warn!(
            redis = name,
            "tls certificate files apply to sentinels only, masters use the system trust store"
        );
    }

    match handle.ping().await {
        Ok(()) => {
            handle.prewarm(cfg.effective_min_idle()).await;
            info!(redis = name, "connected to redis");
        }
        Err(e) if debug => {
            error!(redis = name, error = %e, "connect to redis fail, continuing in debug mode");
        }
        Err(e) => {
            error!(redis = name, error = %e, "connect to redis fail");
            return Err(e);
        }
    }
    handle.spawn_idle_reaper(cfg.idle_timeout(), cfg.effective_min_idle());
    Ok(Some(handle))
}

/// Process-wide Redis handles, initialized once.
#[derive(Debug)]
pub struct Connectivity {
    debug: bool,
    cache_config: RedisConfig,
    mq_config: RedisConfig,
    cache: OnceCell<Option<RedisHandle>>,
    mq: OnceCell<Option<RedisHandle>>,
}

impl Connectivity {
    pub fn new(debug: bool, cache_config: RedisConfig, mq_config: RedisConfig) -> Self {
        Self {
            debug,
            cache_config,
            mq_config,
            cache: OnceCell::new(),
            mq: OnceCell::new(),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.debug, cfg.redis.clone(), cfg.mq_redis.clone())
    }

    /// Connectivity with both handles disabled.
    pub fn disabled() -> Self {
        Self::new(false, RedisConfig::default(), RedisConfig::default())
    }

    /// Initializes the cache handle; returns `None` when it is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration, or on a failed startup ping
    /// outside debug mode. A failed initialization may be retried.
    pub async fn init_cache(&self) -> Result<Option<&RedisHandle>, ConnectivityError> {
        self.cache
            .get_or_try_init(|| connect(NAME_CACHE, &self.cache_config, self.debug))
            .await
            .map(Option::as_ref)
    }

    /// Initializes the MQ handle; returns `None` when it is disabled.
    ///
    /// # Errors
    ///
    /// Same as [`Connectivity::init_cache`].
    pub async fn init_mq(&self) -> Result<Option<&RedisHandle>, ConnectivityError> {
        self.mq
            .get_or_try_init(|| connect(NAME_MQ, &self.mq_config, self.debug))
            .await
            .map(Option::as_ref)
    }

    /// The cache handle, if initialized and enabled.
    pub fn cache(&self) -> Option<&RedisHandle> {
        self.cache.get().and_then(Option::as_ref)
    }

    /// The MQ handle, if initialized and enabled.
    pub fn mq(&self) -> Option<&RedisHandle> {
        self.mq.get().and_then(Option::as_ref)
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_url() {
        let cfg = RedisConfig {
            addr: "redis.local:6380".into(),
            password: Some("p@ss".into()),
            db: 2,
            ..RedisConfig::default()
        };
        assert_eq!(standalone_url(&cfg), "redis://:p%40ss@redis.local:6380/2");

        let tls = RedisConfig {
            tls: RedisTlsConfig {
                enabled: true,
                insecure_skip_verify: true,
                ..RedisTlsConfig::default()
            },
            ..RedisConfig::default()
        };
        assert_eq!(standalone_url(&tls), "rediss://localhost:6379/0#insecure");
    }

    #[test]
    fn test_sentinel_urls_carry_sentinel_password() {
        let cfg = RedisConfig {
            mode: RedisMode::Sentinel,
            master_name: "mymaster".into(),
            sentinel_addr: "10.0.0.1:26379,10.0.0.2:26379".into(),
            sentinel_password: Some("s3".into()),
            password: Some("master-secret".into()),
            ..RedisConfig::default()
        };
        assert_eq!(
            sentinel_urls(&cfg),
            vec!["redis://:s3@10.0.0.1:26379", "redis://:s3@10.0.0.2:26379"]
        );
    }

    fn sentinel_config() -> RedisConfig {
        RedisConfig {
            enabled: true,
            mode: RedisMode::Sentinel,
            master_name: "mymaster".into(),
            sentinel_addr: "127.0.0.1:26379,127.0.0.1:26380".into(),
            sentinel_password: Some("s3".into()),
            password: Some("master-secret".into()),
            db: 3,
            pool_size: 2,
            ..RedisConfig::default()
        }
    }

    #[tokio::test]
    async fn test_build_sentinel_handle_without_connecting() {
        let handle = RedisHandle::build(NAME_MQ, &sentinel_config()).unwrap();
        assert_eq!(handle.mode(), RedisMode::Sentinel);
        assert_eq!(handle.name(), NAME_MQ);
        assert_eq!(handle.close_idle(Duration::ZERO, 0), 0);

        let tls = RedisConfig {
            tls: RedisTlsConfig {
                enabled: true,
                insecure_skip_verify: true,
                ..RedisTlsConfig::default()
            },
            ..sentinel_config()
        };
        let handle = RedisHandle::build(NAME_MQ, &tls).unwrap();
        assert_eq!(handle.mode(), RedisMode::Sentinel);
    }

    #[tokio::test]
    async fn test_build_standalone_handle_without_connecting() {
        let cfg = RedisConfig {
            enabled: true,
            addr: "127.0.0.1:1".into(),
            ..RedisConfig::default()
        };
        let handle = RedisHandle::build(NAME_CACHE, &cfg).unwrap();
        assert_eq!(handle.mode(), RedisMode::Standalone);
        assert_eq!(handle.close_idle(Duration::from_secs(1), 0), 0);
    }

    #[test]
    fn test_sentinel_without_sentinels_is_config_error() {
        let cfg = RedisConfig {
            sentinel_addr: String::new(),
            ..sentinel_config()
        };
        let err = RedisHandle::build(NAME_MQ, &cfg).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_tls_certificates_loaded_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        let cert = dir.path().join("client.pem");
        let key = dir.path().join("client.key");
        std::fs::write(&ca, b"ca-bytes").unwrap();
        std::fs::write(&cert, b"cert-bytes").unwrap();
        std::fs::write(&key, b"key-bytes").unwrap();

        let tls = RedisTlsConfig {
            enabled: true,
            insecure_skip_verify: false,
            cert_ca_file: Some(ca.display().to_string()),
            cert_file: Some(cert.display().to_string()),
            cert_key_file: Some(key.display().to_string()),
        };
        let certs = load_tls_certificates(NAME_CACHE, &tls).unwrap().unwrap();
        assert_eq!(certs.root_cert.as_deref(), Some(&b"ca-bytes"[..]));
        let client = certs.client_tls.unwrap();
        assert_eq!(client.client_cert, b"cert-bytes");
        assert_eq!(client.client_key, b"key-bytes");

        let disabled = RedisTlsConfig {
            enabled: false,
            ..tls
        };
        assert!(load_tls_certificates(NAME_CACHE, &disabled).unwrap().is_none());
    }

    #[test]
    fn test_missing_tls_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let tls = RedisTlsConfig {
            enabled: true,
            cert_ca_file: Some(dir.path().join("absent.pem").display().to_string()),
            ..RedisTlsConfig::default()
        };
        let err = load_tls_certificates(NAME_CACHE, &tls).err().unwrap();
        assert!(matches!(err, ConnectivityError::Config { name: NAME_CACHE, .. }));

        let cfg = RedisConfig {
            enabled: true,
            tls,
            ..RedisConfig::default()
        };
        assert!(RedisHandle::build(NAME_CACHE, &cfg).unwrap_err().is_config());

        let half_pair = RedisTlsConfig {
            enabled: true,
            cert_file: Some("/etc/iam/client.pem".into()),
            ..RedisTlsConfig::default()
        };
        assert!(load_tls_certificates(NAME_CACHE, &half_pair).err().unwrap().is_config());
    }

    #[tokio::test]
    async fn test_disabled_handles_initialize_to_none() {
        let connectivity = Connectivity::disabled();
        assert!(connectivity.init_cache().await.unwrap().is_none());
        assert!(connectivity.init_mq().await.unwrap().is_none());
        assert!(connectivity.cache().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_fatal_outside_debug() {
        let cfg = RedisConfig {
            enabled: true,
            addr: "127.0.0.1:1".into(),
            pool_size: 1,
            min_idle_conns: 1,
            dial_timeout_secs: 1,
            ..RedisConfig::default()
        };

        let strict = Connectivity::new(false, cfg.clone(), RedisConfig::default());
        assert!(strict.init_cache().await.is_err());
        assert!(strict.cache().is_none());

        let debug = Connectivity::new(true, cfg, RedisConfig::default());
        let handle = debug.init_cache().await.unwrap();
        assert!(handle.is_some());
        assert!(debug.cache().unwrap().get_bytes("k").await.is_err());
    }
}
