//! # iam-storage
//!
//! Storage abstraction layer for subject-template-group memberships.
//!
//! This crate defines the [`MembershipStorage`] trait, the [`StorageError`]
//! taxonomy and the [`DeadlockRetry`] executor. Backends live in separate
//! crates (`iam-db-postgres`, `iam-db-memory`).
//!
//! ## Example
//!
//! ```ignore
//! use iam_storage::{DeadlockRetry, MembershipStorage};
//!
//! let retry = DeadlockRetry::new(3, Duration::from_millis(100));
//! retry
//!     .run("storage.bulk_create", &records, || storage.bulk_create(&tenant, &records))
//!     .await?;
//! ```

pub mod error;
pub mod retry;
pub mod traits;
pub mod types;

pub use error::{ErrorCategory, MutationError, StorageError};
pub use retry::DeadlockRetry;
pub use traits::MembershipStorage;
pub use types::{SubjectSystemGroup, unix_now};

/// Type alias for a shareable storage backend.
pub type DynMembershipStorage = std::sync::Arc<dyn MembershipStorage>;
