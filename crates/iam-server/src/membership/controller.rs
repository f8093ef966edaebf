//! Batch mutations of subject-template-group memberships.

use std::sync::Arc;

use iam_core::{CoreError, SubjectTemplateGroup, TenantId, sort_for_locking};
use iam_storage::{DeadlockRetry, DynMembershipStorage, MutationError};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::events::{MembershipAction, MembershipChangeEvent, MembershipEventSink};

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error(transparent)]
    Mutation(#[from] MutationError),
}

impl MembershipError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Applies membership batches through storage under one retry policy.
///
/// Every batch is validated, then sorted into lock order before it reaches
/// storage. Create, delete and expiry update all retry deadlocks the same way.
#[derive(Clone)]
pub struct MembershipController {
    storage: DynMembershipStorage,
    retry: DeadlockRetry,
    events: Option<Arc<dyn MembershipEventSink>>,
}

impl MembershipController {
    pub fn new(storage: DynMembershipStorage, retry: DeadlockRetry) -> Self {
        Self {
            storage,
            retry,
            events: None,
        }
    }

    /// Publishes a change event after every applied batch.
    pub fn with_events(mut self, events: Arc<dyn MembershipEventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn retry(&self) -> DeadlockRetry {
        self.retry
    }

    pub fn storage(&self) -> &DynMembershipStorage {
        &self.storage
    }

    /// Inserts every record; all or nothing.
    pub async fn bulk_create(
        &self,
        tenant: &TenantId,
        records: Vec<SubjectTemplateGroup>,
    ) -> Result<(), MembershipError> {
        self.apply(MembershipAction::Create, tenant, records).await
    }

    /// Removes the rows matching every record's natural key.
    pub async fn bulk_delete(
        &self,
        tenant: &TenantId,
        records: Vec<SubjectTemplateGroup>,
    ) -> Result<(), MembershipError> {
        self.apply(MembershipAction::Delete, tenant, records).await
    }

    /// Sets only `expired_at` on existing rows; missing rows are skipped.
    pub async fn update_expired_at(
        &self,
        tenant: &TenantId,
        records: Vec<SubjectTemplateGroup>,
    ) -> Result<(), MembershipError> {
        self.apply(MembershipAction::UpdateExpiredAt, tenant, records)
            .await
    }

    #[instrument(skip(self, tenant, records), fields(tenant = %tenant, count = records.len()))]
    async fn apply(
        &self,
        action: MembershipAction,
        tenant: &TenantId,
        mut records: Vec<SubjectTemplateGroup>,
    ) -> Result<(), MembershipError> {
        SubjectTemplateGroup::validate_batch(&records)?;
        sort_for_locking(&mut records);

        let storage = &self.storage;
        let batch = records.as_slice();
        self.retry
            .run(action.operation(), batch, move || async move {
                match action {
                    MembershipAction::Create => storage.bulk_create(tenant, batch).await,
                    MembershipAction::Delete => storage.bulk_delete(tenant, batch).await,
                    MembershipAction::UpdateExpiredAt => {
                        storage.update_expired_at(tenant, batch).await
                    }
                }
            })
            .await?;

        info!(action = ?action, "membership batch applied");

        if let Some(events) = &self.events {
            let event = MembershipChangeEvent::from_records(tenant, action, batch);
            if let Err(e) = events.publish(&event).await {
                warn!(action = ?action, error = %e, "failed to publish membership change event");
            }
        }
        Ok(())
    }
}
