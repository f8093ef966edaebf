//! PostgreSQL implementation of [`MembershipStorage`].
//!
//! Every bulk mutation runs in one transaction with a fixed lock order:
//!
//! 1. shared advisory lock per affected group (ascending group id)
//! 2. exclusive advisory lock per affected `(subject, group)` pair (sorted)
//! 3. primary rows, locked `FOR UPDATE` in sorted order where they already exist
//! 4. derived index rows of the locked pairs, recomputed from the primary table
//!
//! Granting a group to a system takes the group lock exclusively, so index
//! refreshes never race with a change of the group's system set.

use std::collections::BTreeSet;

use async_trait::async_trait;
use iam_core::{MembershipKey, SubjectGroupKey, SubjectTemplateGroup, TenantId};
use iam_storage::{MembershipStorage, StorageError, SubjectSystemGroup};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::{PgConnection, PgPool};
use tracing::{debug, instrument};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, classify};
use crate::{migrations, pool};

type StorageResult<T> = Result<T, StorageError>;

/// Column-wise view of a batch, bound as Postgres arrays.
struct BatchColumns {
    subject_types: Vec<String>,
    subject_ids: Vec<String>,
    template_ids: Vec<i64>,
    group_ids: Vec<i64>,
    expired_ats: Vec<i64>,
}

impl BatchColumns {
    fn from_records(records: &[SubjectTemplateGroup]) -> Self {
        let mut columns = Self {
            subject_types: Vec::with_capacity(records.len()),
            subject_ids: Vec::with_capacity(records.len()),
            template_ids: Vec::with_capacity(records.len()),
            group_ids: Vec::with_capacity(records.len()),
            expired_ats: Vec::with_capacity(records.len()),
        };
        for record in records {
            columns.subject_types.push(record.subject_type.clone());
            columns.subject_ids.push(record.subject_id.clone());
            columns.template_ids.push(record.template_id);
            columns.group_ids.push(record.group_id);
            columns.expired_ats.push(record.expired_at);
        }
        columns
    }
}

fn group_lock_key(tenant: &TenantId, group_id: i64) -> String {
    format!("iam:stg:{tenant}:{group_id}")
}

fn pair_lock_key(tenant: &TenantId, pair: &SubjectGroupKey) -> String {
    format!(
        "iam:stg:{tenant}:{}:{}:{}",
        pair.group_id, pair.subject_type, pair.subject_id
    )
}

/// Affected pairs ordered by `(group_id, subject_type, subject_id)`.
fn sorted_pairs(records: &[SubjectTemplateGroup]) -> Vec<SubjectGroupKey> {
    let pairs: BTreeSet<(i64, String, String)> = records
        .iter()
        .map(|r| (r.group_id, r.subject_type.clone(), r.subject_id.clone()))
        .collect();
    pairs
        .into_iter()
        .map(|(group_id, subject_type, subject_id)| SubjectGroupKey {
            subject_type,
            subject_id,
            group_id,
        })
        .collect()
}

/// PostgreSQL membership storage.
#[derive(Debug, Clone)]
pub struct PostgresMembershipStorage {
    pool: PgPool,
}

impl PostgresMembershipStorage {
    /// Creates storage over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the pool and, if configured, runs migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, PostgresError> {
        let pool = pool::create_pool(config).await?;
        if config.run_migrations {
            migrations::run(&pool).await?;
        }
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_batch(
        conn: &mut PgConnection,
        tenant: &TenantId,
        pairs: &[SubjectGroupKey],
    ) -> StorageResult<()> {
        let groups: BTreeSet<i64> = pairs.iter().map(|p| p.group_id).collect();
        for group_id in groups {
            query("SELECT pg_advisory_xact_lock_shared(hashtextextended($1, 0))")
                .bind(group_lock_key(tenant, group_id))
                .execute(&mut *conn)
                .await
                .map_err(classify)?;
        }
        for pair in pairs {
            query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(pair_lock_key(tenant, pair))
                .execute(&mut *conn)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    /// Locks the existing primary rows of a batch in sorted order.
    async fn lock_rows(
        conn: &mut PgConnection,
        tenant: &TenantId,
        columns: &BatchColumns,
    ) -> StorageResult<()> {
        query(
            r#"
            SELECT s.id
            FROM subject_template_group s
            JOIN UNNEST($2::text[], $3::text[], $4::bigint[], $5::bigint[])
                AS t(subject_type, subject_id, template_id, group_id)
              ON s.subject_type = t.subject_type
             AND s.subject_id = t.subject_id
             AND s.template_id = t.template_id
             AND s.group_id = t.group_id
            WHERE s.tenant_id = $1
            ORDER BY s.group_id, s.subject_type, s.subject_id, s.template_id
            FOR UPDATE OF s
            "#,
        )
        .bind(tenant.as_str())
        .bind(&columns.subject_types)
        .bind(&columns.subject_ids)
        .bind(&columns.template_ids)
        .bind(&columns.group_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify)?;
        Ok(())
    }

    /// Recomputes the derived index rows of `pairs` from the primary table.
    async fn refresh_index(
        conn: &mut PgConnection,
        tenant: &TenantId,
        pairs: &[SubjectGroupKey],
    ) -> StorageResult<()> {
        let subject_types: Vec<String> = pairs.iter().map(|p| p.subject_type.clone()).collect();
        let subject_ids: Vec<String> = pairs.iter().map(|p| p.subject_id.clone()).collect();
        let group_ids: Vec<i64> = pairs.iter().map(|p| p.group_id).collect();

        query(
            r#"
            DELETE FROM subject_system_group i
            USING UNNEST($2::text[], $3::text[], $4::bigint[])
                AS p(subject_type, subject_id, group_id)
            WHERE i.tenant_id = $1
              AND i.subject_type = p.subject_type
              AND i.subject_id = p.subject_id
              AND i.group_id = p.group_id
            "#,
        )
        .bind(tenant.as_str())
        .bind(&subject_types)
        .bind(&subject_ids)
        .bind(&group_ids)
        .execute(&mut *conn)
        .await
        .map_err(classify)?;

        query(
            r#"
            INSERT INTO subject_system_group
                (tenant_id, system_id, subject_type, subject_id, group_id, expired_at, template_count)
            SELECT $1, a.system_id, m.subject_type, m.subject_id, m.group_id, m.expired_at, m.template_count
            FROM (
                SELECT s.subject_type, s.subject_id, s.group_id,
                       MAX(s.expired_at) AS expired_at,
                       COUNT(*) AS template_count
                FROM subject_template_group s
                JOIN UNNEST($2::text[], $3::text[], $4::bigint[])
                    AS p(subject_type, subject_id, group_id)
                  ON s.subject_type = p.subject_type
                 AND s.subject_id = p.subject_id
                 AND s.group_id = p.group_id
                WHERE s.tenant_id = $1
                GROUP BY s.subject_type, s.subject_id, s.group_id
            ) m
            JOIN group_system_auth a ON a.tenant_id = $1 AND a.group_id = m.group_id
            ORDER BY m.group_id, m.subject_type, m.subject_id, a.system_id
            "#,
        )
        .bind(tenant.as_str())
        .bind(&subject_types)
        .bind(&subject_ids)
        .bind(&group_ids)
        .execute(&mut *conn)
        .await
        .map_err(classify)?;

        Ok(())
    }
}

#[async_trait]
impl MembershipStorage for PostgresMembershipStorage {
    #[instrument(skip(self, tenant, records), fields(tenant = %tenant, count = records.len()))]
    async fn bulk_create(
        &self,
        tenant: &TenantId,
        records: &[SubjectTemplateGroup],
    ) -> StorageResult<()> {
        let pairs = sorted_pairs(records);
        let columns = BatchColumns::from_records(records);
        let mut tx = self.pool.begin().await.map_err(classify)?;

        Self::lock_batch(&mut tx, tenant, &pairs).await?;
        query(
            r#"
            INSERT INTO subject_template_group
                (tenant_id, subject_type, subject_id, template_id, group_id, expired_at)
            SELECT $1, t.subject_type, t.subject_id, t.template_id, t.group_id, t.expired_at
            FROM UNNEST($2::text[], $3::text[], $4::bigint[], $5::bigint[], $6::bigint[])
                AS t(subject_type, subject_id, template_id, group_id, expired_at)
            "#,
        )
        .bind(tenant.as_str())
        .bind(&columns.subject_types)
        .bind(&columns.subject_ids)
        .bind(&columns.template_ids)
        .bind(&columns.group_ids)
        .bind(&columns.expired_ats)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        Self::refresh_index(&mut tx, tenant, &pairs).await?;

        tx.commit().await.map_err(classify)?;
        debug!("memberships created");
        Ok(())
    }

    #[instrument(skip(self, tenant, records), fields(tenant = %tenant, count = records.len()))]
    async fn bulk_delete(
        &self,
        tenant: &TenantId,
        records: &[SubjectTemplateGroup],
    ) -> StorageResult<()> {
        let pairs = sorted_pairs(records);
        let columns = BatchColumns::from_records(records);
        let mut tx = self.pool.begin().await.map_err(classify)?;

        Self::lock_batch(&mut tx, tenant, &pairs).await?;
        Self::lock_rows(&mut tx, tenant, &columns).await?;
        query(
            r#"
            DELETE FROM subject_template_group s
            USING UNNEST($2::text[], $3::text[], $4::bigint[], $5::bigint[])
                AS t(subject_type, subject_id, template_id, group_id)
            WHERE s.tenant_id = $1
              AND s.subject_type = t.subject_type
              AND s.subject_id = t.subject_id
              AND s.template_id = t.template_id
              AND s.group_id = t.group_id
            "#,
        )
        .bind(tenant.as_str())
        .bind(&columns.subject_types)
        .bind(&columns.subject_ids)
        .bind(&columns.template_ids)
        .bind(&columns.group_ids)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        Self::refresh_index(&mut tx, tenant, &pairs).await?;

        tx.commit().await.map_err(classify)?;
        debug!("memberships deleted");
        Ok(())
    }

    #[instrument(skip(self, tenant, records), fields(tenant = %tenant, count = records.len()))]
    async fn update_expired_at(
        &self,
        tenant: &TenantId,
        records: &[SubjectTemplateGroup],
    ) -> StorageResult<()> {
        let pairs = sorted_pairs(records);
        let columns = BatchColumns::from_records(records);
        let mut tx = self.pool.begin().await.map_err(classify)?;

        Self::lock_batch(&mut tx, tenant, &pairs).await?;
        Self::lock_rows(&mut tx, tenant, &columns).await?;
        query(
            r#"
            UPDATE subject_template_group s
            SET expired_at = t.expired_at, updated_at = NOW()
            FROM UNNEST($2::text[], $3::text[], $4::bigint[], $5::bigint[], $6::bigint[])
                AS t(subject_type, subject_id, template_id, group_id, expired_at)
            WHERE s.tenant_id = $1
              AND s.subject_type = t.subject_type
              AND s.subject_id = t.subject_id
              AND s.template_id = t.template_id
              AND s.group_id = t.group_id
            "#,
        )
        .bind(tenant.as_str())
        .bind(&columns.subject_types)
        .bind(&columns.subject_ids)
        .bind(&columns.template_ids)
        .bind(&columns.group_ids)
        .bind(&columns.expired_ats)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        Self::refresh_index(&mut tx, tenant, &pairs).await?;

        tx.commit().await.map_err(classify)?;
        debug!("membership expiry updated");
        Ok(())
    }

    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    async fn authorize_group_system(
        &self,
        tenant: &TenantId,
        group_id: i64,
        system_id: &str,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(group_lock_key(tenant, group_id))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        let inserted = query(
            r#"
            INSERT INTO group_system_auth (tenant_id, group_id, system_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, group_id, system_id) DO NOTHING
            "#,
        )
        .bind(tenant.as_str())
        .bind(group_id)
        .bind(system_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?
        .rows_affected();

        if inserted > 0 {
            query(
                r#"
                INSERT INTO subject_system_group
                    (tenant_id, system_id, subject_type, subject_id, group_id, expired_at, template_count)
                SELECT $1, $3, subject_type, subject_id, group_id, MAX(expired_at), COUNT(*)
                FROM subject_template_group
                WHERE tenant_id = $1 AND group_id = $2
                GROUP BY subject_type, subject_id, group_id
                ORDER BY subject_type, subject_id
                "#,
            )
            .bind(tenant.as_str())
            .bind(group_id)
            .bind(system_id)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn get(
        &self,
        tenant: &TenantId,
        key: &MembershipKey,
    ) -> StorageResult<Option<SubjectTemplateGroup>> {
        let row: Option<(String, String, i64, i64, i64)> = query_as(
            r#"
            SELECT subject_type, subject_id, template_id, group_id, expired_at
            FROM subject_template_group
            WHERE tenant_id = $1 AND subject_type = $2 AND subject_id = $3
              AND template_id = $4 AND group_id = $5
            "#,
        )
        .bind(tenant.as_str())
        .bind(&key.subject_type)
        .bind(&key.subject_id)
        .bind(key.template_id)
        .bind(key.group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(into_record))
    }

    async fn list_by_template(
        &self,
        tenant: &TenantId,
        template_id: i64,
    ) -> StorageResult<Vec<SubjectTemplateGroup>> {
        let rows: Vec<(String, String, i64, i64, i64)> = query_as(
            r#"
            SELECT subject_type, subject_id, template_id, group_id, expired_at
            FROM subject_template_group
            WHERE tenant_id = $1 AND template_id = $2
            ORDER BY subject_type, subject_id, template_id, group_id
            "#,
        )
        .bind(tenant.as_str())
        .bind(template_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(into_record).collect())
    }

    async fn list_subject_system_groups(
        &self,
        tenant: &TenantId,
        system_id: &str,
        subject_type: &str,
        subject_id: &str,
    ) -> StorageResult<Vec<SubjectSystemGroup>> {
        let rows: Vec<(String, String, String, i64, i64, i64)> = query_as(
            r#"
            SELECT system_id, subject_type, subject_id, group_id, expired_at, template_count
            FROM subject_system_group
            WHERE tenant_id = $1 AND system_id = $2 AND subject_type = $3 AND subject_id = $4
              AND expired_at > EXTRACT(EPOCH FROM NOW())::bigint
            ORDER BY group_id
            "#,
        )
        .bind(tenant.as_str())
        .bind(system_id)
        .bind(subject_type)
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .into_iter()
            .map(
                |(system_id, subject_type, subject_id, group_id, expired_at, template_count)| {
                    SubjectSystemGroup {
                        system_id,
                        subject_type,
                        subject_id,
                        group_id,
                        expired_at,
                        template_count,
                    }
                },
            )
            .collect())
    }

    async fn ping(&self) -> StorageResult<()> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn into_record(
    (subject_type, subject_id, template_id, group_id, expired_at): (String, String, i64, i64, i64),
) -> SubjectTemplateGroup {
    SubjectTemplateGroup {
        subject_type,
        subject_id,
        template_id,
        group_id,
        expired_at,
    }
}
