//! Embedded schema for the membership store.
//!
//! Each entry is applied once, in version order, and recorded in
//! `_sqlx_migrations`. New schema changes append an entry to [`SCHEMA`].

use std::borrow::Cow;

use sqlx_core::migrate::{Migration, MigrationType, Migrator};
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::error::{PostgresError, Result};

/// `(version, description, sql)` of every schema change.
const SCHEMA: &[(i64, &str, &str)] = &[(
    20260101000001,
    "membership_schema",
    include_str!("../../migrations/20260101000001_membership_schema.sql"),
)];

fn migrator() -> Migrator {
    let migrations = SCHEMA
        .iter()
        .map(|&(version, description, sql)| Migration {
            version,
            description: Cow::Borrowed(description),
            migration_type: MigrationType::Simple,
            sql: Cow::Borrowed(sql),
            checksum: Cow::Borrowed(&[]),
            no_tx: false,
        })
        .collect::<Vec<_>>();

    Migrator {
        migrations: Cow::Owned(migrations),
        ignore_missing: false,
        locking: true,
        no_tx: false,
    }
}

/// Brings the membership schema up to date.
///
/// # Errors
///
/// Returns [`PostgresError::Migration`] when a schema change fails.
#[instrument(skip(pool))]
pub async fn run(pool: &PgPool) -> Result<()> {
    info!(versions = SCHEMA.len(), "applying membership schema");
    migrator()
        .run(pool)
        .await
        .map_err(|e| PostgresError::Migration(e.to_string()))?;
    info!("membership schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_ascend() {
        assert!(SCHEMA.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_schema_defines_membership_tables() {
        let sql = SCHEMA
            .iter()
            .map(|(_, _, sql)| *sql)
            .collect::<Vec<_>>()
            .join("\n");
        for table in ["subject_template_group", "group_system_auth", "subject_system_group"] {
            assert!(sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")), "{table}");
        }
    }
}
