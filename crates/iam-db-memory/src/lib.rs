//! In-memory membership storage backend.
//!
//! Implements [`MembershipStorage`] over ordered maps guarded by a single
//! `RwLock`, so every batch is applied atomically. Used for single-process
//! development setups and as the reference backend in tests.
//!
//! # Example
//!
//! ```ignore
//! use iam_db_memory::InMemoryStorage;
//! use iam_storage::MembershipStorage;
//!
//! let storage = InMemoryStorage::new();
//! storage.bulk_create(&tenant, &records).await?;
//! ```

pub mod storage;

pub use iam_storage::{MembershipStorage, StorageError};
pub use storage::InMemoryStorage;

/// Creates a new shareable in-memory storage instance.
pub fn create_membership_storage() -> iam_storage::DynMembershipStorage {
    std::sync::Arc::new(InMemoryStorage::new())
}
