use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use iam_db_postgres::PostgresMembershipStorage;
use iam_storage::DynMembershipStorage;
use tower_http::trace::TraceLayer;

use crate::cache::{RemoteResourceCache, SharedCache};
use crate::config::{AppConfig, StorageBackend};
use crate::connectivity::Connectivity;
use crate::membership::{MembershipController, RedisEventPublisher};
use crate::middleware::{self as app_middleware, TenantSettings};
use crate::resource_provider::{RemoteResourceSource, ResourceProviderClient};
use crate::handlers;

/// Shared application state passed to handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<MembershipController>,
    pub resource_cache: Arc<RemoteResourceCache>,
    pub connectivity: Arc<Connectivity>,
}

pub struct IamServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
}

/// Builds the router with all routes and the middleware stack.
pub fn build_router(state: AppState, cfg: &AppConfig) -> anyhow::Result<Router> {
    let tenant = Arc::new(TenantSettings::from_config(&cfg.tenant).map_err(anyhow::Error::msg)?);
    let body_limit = cfg.server.body_limit_bytes;

    let api = Router::new()
        .route(
            "/api/v1/web/subject-template-groups",
            post(handlers::batch_create).delete(handlers::batch_delete),
        )
        .route(
            "/api/v1/web/subject-template-groups/expired-at",
            put(handlers::batch_update_expired_at),
        )
        .route_layer(middleware::from_fn_with_state(
            tenant,
            app_middleware::tenant_context,
        ));

    Ok(Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .merge(api)
        .with_state(state)
        // Later layers wrap earlier ones: body limit -> request id -> trace
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit)))
}

/// Builds the router with components derived from `cfg`.
pub async fn build_app(cfg: &AppConfig) -> anyhow::Result<Router> {
    let server = ServerBuilder::new().with_config(cfg.clone()).build().await?;
    Ok(server.app)
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    storage: Option<DynMembershipStorage>,
    resource_source: Option<Arc<dyn RemoteResourceSource>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            storage: None,
            resource_source: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Uses `storage` instead of the configured backend.
    pub fn with_storage(mut self, storage: DynMembershipStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Uses `source` instead of the configured resource providers.
    pub fn with_resource_source(mut self, source: Arc<dyn RemoteResourceSource>) -> Self {
        self.resource_source = Some(source);
        self
    }

    pub async fn build(self) -> anyhow::Result<IamServer> {
        let cfg = self.config;

        let connectivity = Arc::new(Connectivity::from_config(&cfg));
        connectivity
            .init_cache()
            .await
            .context("cache redis initialization failed")?;
        connectivity
            .init_mq()
            .await
            .context("mq redis initialization failed")?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => create_storage(&cfg).await?,
        };

        let shared = match connectivity.cache() {
            Some(handle) => SharedCache::new_redis(handle.clone()),
            None => SharedCache::new_local(),
        };
        let source = self.resource_source.unwrap_or_else(|| {
            Arc::new(ResourceProviderClient::new(
                cfg.resource_providers.clone(),
                cfg.tenant.header.clone(),
            ))
        });
        let resource_cache = Arc::new(RemoteResourceCache::with_config(
            shared,
            source,
            cfg.cache.ttl(),
            cfg.cache.local_max_capacity,
        ));
        tracing::info!(
            mode = resource_cache.shared().mode(),
            ttl_secs = cfg.cache.remote_resource_ttl_secs,
            "remote resource cache ready"
        );

        let mut controller = MembershipController::new(storage, cfg.membership.retry_policy());
        if cfg.membership.publish_events {
            match connectivity.mq() {
                Some(handle) => {
                    controller =
                        controller.with_events(Arc::new(RedisEventPublisher::new(handle.clone())));
                }
                None => tracing::warn!(
                    "membership.publish_events is set but the mq redis handle is disabled"
                ),
            }
        }

        let state = AppState {
            controller: Arc::new(controller),
            resource_cache,
            connectivity,
        };
        let app = build_router(state.clone(), &cfg)?;

        Ok(IamServer {
            addr: self.addr,
            app,
            state,
        })
    }
}

async fn create_storage(cfg: &AppConfig) -> anyhow::Result<DynMembershipStorage> {
    match cfg.storage.backend {
        StorageBackend::Postgres => {
            let pg = cfg.storage.postgres.to_backend_config();
            let storage = PostgresMembershipStorage::connect(&pg)
                .await
                .context("postgres storage initialization failed")?;
            Ok(Arc::new(storage))
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory membership storage; data is not persisted");
            Ok(iam_db_memory::create_membership_storage())
        }
    }
}

impl IamServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio_test::assert_ok;
    use tower::ServiceExt;

    fn memory_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.storage.backend = StorageBackend::Memory;
        cfg
    }

    #[tokio::test]
    async fn test_builder_with_memory_backend() {
        let server = assert_ok!(ServerBuilder::new().with_config(memory_config()).build().await);
        assert!(server.state().connectivity.cache().is_none());
        assert_eq!(server.state().resource_cache.shared().mode(), "local");

        let resp = server
            .router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unreachable_cache_redis_fails_startup() {
        let mut cfg = memory_config();
        cfg.redis.enabled = true;
        cfg.redis.addr = "127.0.0.1:1".into();
        cfg.redis.dial_timeout_secs = 1;
        let result = ServerBuilder::new().with_config(cfg).build().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_cache_redis_tolerated_in_debug() {
        let mut cfg = memory_config();
        cfg.debug = true;
        cfg.redis.enabled = true;
        cfg.redis.addr = "127.0.0.1:1".into();
        cfg.redis.dial_timeout_secs = 1;
        let server = assert_ok!(ServerBuilder::new().with_config(cfg).build().await);
        assert_eq!(server.state().resource_cache.shared().mode(), "redis");
    }

    /// Collects the `request_id` field of every `http.request` span.
    #[derive(Clone, Default)]
    struct RequestSpans(Arc<std::sync::Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for RequestSpans {
        fn on_new_span(
            &self,
            attrs: &tracing::span::Attributes<'_>,
            _id: &tracing::span::Id,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            struct RequestId(Option<String>);
            impl tracing::field::Visit for RequestId {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    if field.name() == "request_id" {
                        self.0 = Some(format!("{value:?}"));
                    }
                }
            }

            if attrs.metadata().name() != "http.request" {
                return;
            }
            let mut visitor = RequestId(None);
            attrs.record(&mut visitor);
            if let Some(id) = visitor.0 {
                self.0.lock().unwrap().push(id);
            }
        }
    }

    #[tokio::test]
    async fn test_request_span_carries_request_id() {
        use tracing_subscriber::layer::SubscriberExt;

        let spans = RequestSpans::default();
        let subscriber = tracing_subscriber::registry().with(spans.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = assert_ok!(build_app(&memory_config()).await);
        let resp = app
            .clone()
            .oneshot(
                Request::get("/healthz")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-request-id"], "req-42");

        let resp = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let generated = resp.headers()["x-request-id"].to_str().unwrap().to_string();
        assert!(!generated.is_empty());

        let recorded = spans.0.lock().unwrap().clone();
        assert_eq!(recorded, vec!["req-42".to_string(), generated]);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = assert_ok!(build_app(&memory_config()).await);
        let resp = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
