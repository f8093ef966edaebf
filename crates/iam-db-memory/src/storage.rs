use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use iam_core::{MembershipKey, SubjectGroupKey, SubjectTemplateGroup, TenantId};
use iam_storage::{MembershipStorage, StorageError, SubjectSystemGroup, unix_now};
use tokio::sync::RwLock;

type MembershipMapKey = (TenantId, MembershipKey);
/// (tenant, system, subject_type, subject_id, group_id)
type IndexMapKey = (TenantId, String, String, String, i64);

#[derive(Debug, Default)]
struct State {
    /// Primary table: natural key -> expired_at
    memberships: BTreeMap<MembershipMapKey, i64>,
    /// (tenant, group) -> systems the group is authorized in
    group_systems: BTreeMap<(TenantId, i64), BTreeSet<String>>,
    /// Derived membership index
    index: BTreeMap<IndexMapKey, SubjectSystemGroup>,
}

impl State {
    /// Recomputes the index rows of one `(subject, group)` pair from the primary table.
    fn refresh_index(&mut self, tenant: &TenantId, pair: &SubjectGroupKey) {
        self.index.retain(|(t, _, subject_type, subject_id, group_id), _| {
            !(t == tenant
                && subject_type == &pair.subject_type
                && subject_id == &pair.subject_id
                && *group_id == pair.group_id)
        });

        let (template_count, expired_at) = self
            .memberships
            .iter()
            .filter(|((t, key), _)| {
                t == tenant
                    && key.subject_type == pair.subject_type
                    && key.subject_id == pair.subject_id
                    && key.group_id == pair.group_id
            })
            .fold((0i64, i64::MIN), |(count, max), (_, expired_at)| {
                (count + 1, max.max(*expired_at))
            });
        if template_count == 0 {
            return;
        }

        let Some(systems) = self.group_systems.get(&(tenant.clone(), pair.group_id)) else {
            return;
        };
        for system_id in systems {
            self.index.insert(
                (
                    tenant.clone(),
                    system_id.clone(),
                    pair.subject_type.clone(),
                    pair.subject_id.clone(),
                    pair.group_id,
                ),
                SubjectSystemGroup {
                    system_id: system_id.clone(),
                    subject_type: pair.subject_type.clone(),
                    subject_id: pair.subject_id.clone(),
                    group_id: pair.group_id,
                    expired_at,
                    template_count,
                },
            );
        }
    }

    fn refresh_pairs(&mut self, tenant: &TenantId, records: &[SubjectTemplateGroup]) {
        let pairs: BTreeSet<SubjectGroupKey> =
            records.iter().map(SubjectTemplateGroup::subject_group).collect();
        for pair in &pairs {
            self.refresh_index(tenant, pair);
        }
    }
}

/// In-memory membership storage.
///
/// A single writer lock makes every batch atomic and serializes writers, so
/// this backend never reports a deadlock.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of primary rows across all tenants.
    pub async fn len(&self) -> usize {
        self.state.read().await.memberships.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the whole derived index for one tenant, in key order.
    pub async fn index_snapshot(&self, tenant: &TenantId) -> Vec<SubjectSystemGroup> {
        self.state
            .read()
            .await
            .index
            .iter()
            .filter(|((t, ..), _)| t == tenant)
            .map(|(_, row)| row.clone())
            .collect()
    }
}

fn render_key(key: &MembershipKey) -> String {
    format!(
        "{}/{}/{}/{}",
        key.subject_type, key.subject_id, key.template_id, key.group_id
    )
}

#[async_trait]
impl MembershipStorage for InMemoryStorage {
    async fn bulk_create(
        &self,
        tenant: &TenantId,
        records: &[SubjectTemplateGroup],
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;

        let mut batch_keys = BTreeSet::new();
        for record in records {
            let key = record.key();
            if state.memberships.contains_key(&(tenant.clone(), key.clone()))
                || !batch_keys.insert(key.clone())
            {
                return Err(StorageError::already_exists(render_key(&key)));
            }
        }

        for record in records {
            state
                .memberships
                .insert((tenant.clone(), record.key()), record.expired_at);
        }
        state.refresh_pairs(tenant, records);

        tracing::debug!(tenant = %tenant, count = records.len(), "memberships created");
        Ok(())
    }

    async fn bulk_delete(
        &self,
        tenant: &TenantId,
        records: &[SubjectTemplateGroup],
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        for record in records {
            state.memberships.remove(&(tenant.clone(), record.key()));
        }
        state.refresh_pairs(tenant, records);

        tracing::debug!(tenant = %tenant, count = records.len(), "memberships deleted");
        Ok(())
    }

    async fn update_expired_at(
        &self,
        tenant: &TenantId,
        records: &[SubjectTemplateGroup],
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        for record in records {
            if let Some(expired_at) = state.memberships.get_mut(&(tenant.clone(), record.key())) {
                *expired_at = record.expired_at;
            }
        }
        state.refresh_pairs(tenant, records);
        Ok(())
    }

    async fn authorize_group_system(
        &self,
        tenant: &TenantId,
        group_id: i64,
        system_id: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let inserted = state
            .group_systems
            .entry((tenant.clone(), group_id))
            .or_default()
            .insert(system_id.to_string());
        if !inserted {
            return Ok(());
        }

        let members: BTreeSet<SubjectGroupKey> = state
            .memberships
            .keys()
            .filter(|(t, key)| t == tenant && key.group_id == group_id)
            .map(|(_, key)| SubjectGroupKey {
                subject_type: key.subject_type.clone(),
                subject_id: key.subject_id.clone(),
                group_id,
            })
            .collect();
        for pair in &members {
            state.refresh_index(tenant, pair);
        }
        Ok(())
    }

    async fn get(
        &self,
        tenant: &TenantId,
        key: &MembershipKey,
    ) -> Result<Option<SubjectTemplateGroup>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .get(&(tenant.clone(), key.clone()))
            .map(|expired_at| SubjectTemplateGroup {
                subject_type: key.subject_type.clone(),
                subject_id: key.subject_id.clone(),
                template_id: key.template_id,
                group_id: key.group_id,
                expired_at: *expired_at,
            }))
    }

    async fn list_by_template(
        &self,
        tenant: &TenantId,
        template_id: i64,
    ) -> Result<Vec<SubjectTemplateGroup>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .iter()
            .filter(|((t, key), _)| t == tenant && key.template_id == template_id)
            .map(|((_, key), expired_at)| SubjectTemplateGroup {
                subject_type: key.subject_type.clone(),
                subject_id: key.subject_id.clone(),
                template_id: key.template_id,
                group_id: key.group_id,
                expired_at: *expired_at,
            })
            .collect())
    }

    async fn list_subject_system_groups(
        &self,
        tenant: &TenantId,
        system_id: &str,
        subject_type: &str,
        subject_id: &str,
    ) -> Result<Vec<SubjectSystemGroup>, StorageError> {
        let now = unix_now();
        let state = self.state.read().await;
        Ok(state
            .index
            .iter()
            .filter(|((t, system, st, sid, _), row)| {
                t == tenant
                    && system == system_id
                    && st == subject_type
                    && sid == subject_id
                    && row.is_active_at(now)
            })
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
