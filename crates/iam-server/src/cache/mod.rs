//! Two-tier caching of remote resource lists.
//!
//! ## Cache Hierarchy
//!
//! ```text
//! lookup → local tier (moka) → shared tier (Redis) → resource provider
//!               ↓                     ↓                     ↓
//!          per instance       shared by instances     single-flight load
//! ```
//!
//! Without a Redis cache handle the shared tier falls back to a local map.

pub mod backend;
pub mod key;
pub mod remote_resource;

pub use backend::SharedCache;
pub use key::RemoteResourceListCacheKey;
pub use remote_resource::RemoteResourceCache;
