//! Membership change events pushed to the MQ Redis handle.

use std::collections::BTreeSet;

use async_trait::async_trait;
use iam_core::{SubjectGroupKey, SubjectTemplateGroup, TenantId};
use serde::{Deserialize, Serialize};

use crate::connectivity::{ConnectivityError, RedisHandle};

/// List the events are pushed to.
pub const QUEUE_KEY: &str = "iam:queue:subject_template_group";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    Create,
    Delete,
    UpdateExpiredAt,
}

impl MembershipAction {
    /// Operation name used in logs and wrapped errors.
    pub fn operation(self) -> &'static str {
        match self {
            MembershipAction::Create => "storage.bulk_create",
            MembershipAction::Delete => "storage.bulk_delete",
            MembershipAction::UpdateExpiredAt => "storage.update_expired_at",
        }
    }
}

/// One message per applied batch; each `(subject, group)` pair appears once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChangeEvent {
    pub tenant: TenantId,
    pub action: MembershipAction,
    pub subject_groups: Vec<SubjectGroupKey>,
}

impl MembershipChangeEvent {
    pub fn from_records(
        tenant: &TenantId,
        action: MembershipAction,
        records: &[SubjectTemplateGroup],
    ) -> Self {
        let pairs: BTreeSet<SubjectGroupKey> =
            records.iter().map(SubjectTemplateGroup::subject_group).collect();
        Self {
            tenant: tenant.clone(),
            action,
            subject_groups: pairs.into_iter().collect(),
        }
    }
}

/// Destination of membership change events.
#[async_trait]
pub trait MembershipEventSink: Send + Sync {
    async fn publish(&self, event: &MembershipChangeEvent) -> Result<(), ConnectivityError>;
}

/// LPUSHes JSON encoded events onto [`QUEUE_KEY`].
#[derive(Debug, Clone)]
pub struct RedisEventPublisher {
    handle: RedisHandle,
}

impl RedisEventPublisher {
    pub fn new(handle: RedisHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl MembershipEventSink for RedisEventPublisher {
    async fn publish(&self, event: &MembershipChangeEvent) -> Result<(), ConnectivityError> {
        let payload = serde_json::to_string(event).map_err(|e| ConnectivityError::Command {
            name: self.handle.name(),
            message: e.to_string(),
        })?;
        self.handle.lpush(QUEUE_KEY, &payload).await
    }
}
