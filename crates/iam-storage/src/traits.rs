//! Storage traits for the membership storage layer.

use async_trait::async_trait;
use iam_core::{MembershipKey, SubjectTemplateGroup, TenantId};

use crate::error::StorageError;
use crate::types::SubjectSystemGroup;

/// Contract every membership storage backend must implement.
///
/// Each bulk mutation is a unit of work: either every row in the batch is
/// applied together with the derived index refresh, or nothing is. Backends
/// must report transient lock conflicts as [`StorageError::Deadlock`] so the
/// caller can retry them. Implementations must be thread-safe (`Send + Sync`).
#[async_trait]
pub trait MembershipStorage: Send + Sync {
    // ==================== Mutations ====================

    /// Inserts every record and refreshes the derived index for the affected
    /// `(subject, group)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if any natural key is taken.
    /// Returns `StorageError::Deadlock` on a lock conflict.
    async fn bulk_create(
        &self,
        tenant: &TenantId,
        records: &[SubjectTemplateGroup],
    ) -> Result<(), StorageError>;

    /// Deletes the rows matching each record's natural key and refreshes the
    /// derived index. Records with no matching row are ignored.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Deadlock` on a lock conflict.
    async fn bulk_delete(
        &self,
        tenant: &TenantId,
        records: &[SubjectTemplateGroup],
    ) -> Result<(), StorageError>;

    /// Sets `expired_at` on the rows matching each record's natural key.
    /// Identity columns are never written. Records with no matching row are ignored.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Deadlock` on a lock conflict.
    async fn update_expired_at(
        &self,
        tenant: &TenantId,
        records: &[SubjectTemplateGroup],
    ) -> Result<(), StorageError>;

    /// Records that `group_id` grants permissions in `system_id`.
    ///
    /// Index rows are only derived for authorized systems; the index of the
    /// group's current members is refreshed. Idempotent.
    async fn authorize_group_system(
        &self,
        tenant: &TenantId,
        group_id: i64,
        system_id: &str,
    ) -> Result<(), StorageError>;

    // ==================== Reads ====================

    /// Reads one membership by natural key.
    async fn get(
        &self,
        tenant: &TenantId,
        key: &MembershipKey,
    ) -> Result<Option<SubjectTemplateGroup>, StorageError>;

    /// Lists the memberships granted through a template, ordered by natural key.
    async fn list_by_template(
        &self,
        tenant: &TenantId,
        template_id: i64,
    ) -> Result<Vec<SubjectTemplateGroup>, StorageError>;

    /// Lists the unexpired index rows of a subject within a system, ordered by group.
    async fn list_subject_system_groups(
        &self,
        tenant: &TenantId,
        system_id: &str,
        subject_type: &str,
        subject_id: &str,
    ) -> Result<Vec<SubjectSystemGroup>, StorageError>;

    // ==================== Health ====================

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<(), StorageError>;
}
