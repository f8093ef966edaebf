pub mod cache;
pub mod config;
pub mod connectivity;
pub mod handlers;
pub mod membership;
pub mod middleware;
pub mod observability;
pub mod resource_provider;
pub mod response;
pub mod server;

pub use cache::{RemoteResourceCache, RemoteResourceListCacheKey, SharedCache};
pub use config::{AppConfig, CacheConfig, RedisConfig, ServerConfig, StorageBackend};
pub use connectivity::{Connectivity, ConnectivityError, RedisHandle};
pub use membership::{MembershipController, MembershipError};
pub use observability::init_tracing;
pub use resource_provider::{RemoteResourceSource, ResourceProviderClient, UpstreamError};
pub use server::{AppState, IamServer, ServerBuilder, build_app, build_router};
