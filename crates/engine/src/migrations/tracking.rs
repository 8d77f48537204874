//! Tracking tables
//!
//! DDL and statements for `schema_migrations` and `schema_seeds`, and the
//! [`TrackedUnit`] trait that lets one pipeline drive both migrations and
//! seeds.

use std::fmt;
use std::hash::Hash;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::definitions::{Migration, Seed};
use crate::backends::{DatabaseRow, DatabaseValue};
use crate::error::{StoreError, StoreResult, UnitId};
use crate::transaction::Transaction;

pub const MIGRATIONS_TABLE: &str = "schema_migrations";
pub const SEEDS_TABLE: &str = "schema_seeds";

pub const CREATE_MIGRATIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TIMESTAMPTZ DEFAULT now()
)";

pub const CREATE_SEEDS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_seeds (
    name TEXT PRIMARY KEY,
    applied_at TIMESTAMPTZ DEFAULT now()
)";

pub const SELECT_APPLIED_MIGRATIONS_SQL: &str = "SELECT version, applied_at FROM schema_migrations";
pub const SELECT_APPLIED_SEEDS_SQL: &str = "SELECT name, applied_at FROM schema_seeds";

pub const RECORD_MIGRATION_SQL: &str =
    "INSERT INTO schema_migrations (version, description) VALUES ($1, $2)";
pub const RECORD_SEED_SQL: &str = "INSERT INTO schema_seeds (name) VALUES ($1)";

/// A unit of work recorded in a tracking table once applied
#[async_trait]
pub(crate) trait TrackedUnit: Send + Sync {
    /// Primary key of the unit's tracking row
    type Key: Eq + Hash + Clone + fmt::Debug + Send + Sync;

    const TABLE: &'static str;
    const CREATE_SQL: &'static str;
    const SELECT_APPLIED_SQL: &'static str;
    const RECORD_SQL: &'static str;

    fn key(&self) -> Self::Key;

    fn id(&self) -> UnitId;

    /// Decode one row of the applied-set query
    fn applied_from_row(row: &dyn DatabaseRow) -> StoreResult<(Self::Key, Option<DateTime<Utc>>)>;

    /// Parameters for the tracking insert
    fn record_params(&self) -> Vec<DatabaseValue>;

    /// Run the unit's effect inside `tx`
    async fn apply(&self, ctx: &CancellationToken, tx: &mut Transaction) -> StoreResult<()>;
}

#[async_trait]
impl TrackedUnit for Migration {
    type Key = u32;

    const TABLE: &'static str = MIGRATIONS_TABLE;
    const CREATE_SQL: &'static str = CREATE_MIGRATIONS_TABLE_SQL;
    const SELECT_APPLIED_SQL: &'static str = SELECT_APPLIED_MIGRATIONS_SQL;
    const RECORD_SQL: &'static str = RECORD_MIGRATION_SQL;

    fn key(&self) -> u32 {
        self.version
    }

    fn id(&self) -> UnitId {
        Migration::id(self)
    }

    fn applied_from_row(row: &dyn DatabaseRow) -> StoreResult<(u32, Option<DateTime<Utc>>)> {
        let raw = row.get_by_name("version")?.as_i64()?;
        let version = u32::try_from(raw)
            .map_err(|_| StoreError::Decode(format!("Invalid migration version {}", raw)))?;
        let applied_at = row.get_by_name("applied_at")?.as_datetime()?;
        Ok((version, applied_at))
    }

    fn record_params(&self) -> Vec<DatabaseValue> {
        // Registration keeps versions within INTEGER range.
        vec![
            DatabaseValue::Int32(self.version as i32),
            DatabaseValue::String(self.description.clone()),
        ]
    }

    async fn apply(&self, ctx: &CancellationToken, tx: &mut Transaction) -> StoreResult<()> {
        tx.execute(ctx, &self.up, &[]).await?;
        Ok(())
    }
}

#[async_trait]
impl TrackedUnit for Seed {
    type Key = String;

    const TABLE: &'static str = SEEDS_TABLE;
    const CREATE_SQL: &'static str = CREATE_SEEDS_TABLE_SQL;
    const SELECT_APPLIED_SQL: &'static str = SELECT_APPLIED_SEEDS_SQL;
    const RECORD_SQL: &'static str = RECORD_SEED_SQL;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn id(&self) -> UnitId {
        Seed::id(self)
    }

    fn applied_from_row(row: &dyn DatabaseRow) -> StoreResult<(String, Option<DateTime<Utc>>)> {
        let name = row.get_by_name("name")?.as_str()?.to_string();
        let applied_at = row.get_by_name("applied_at")?.as_datetime()?;
        Ok((name, applied_at))
    }

    fn record_params(&self) -> Vec<DatabaseValue> {
        vec![DatabaseValue::String(self.name.clone())]
    }

    async fn apply(&self, ctx: &CancellationToken, tx: &mut Transaction) -> StoreResult<()> {
        self.run(ctx, tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_ddl_matches_table_names() {
        assert!(CREATE_MIGRATIONS_TABLE_SQL.contains("version INTEGER PRIMARY KEY"));
        assert!(CREATE_MIGRATIONS_TABLE_SQL.contains("description TEXT NOT NULL"));
        assert!(CREATE_SEEDS_TABLE_SQL.contains("name TEXT PRIMARY KEY"));
        assert!(CREATE_SEEDS_TABLE_SQL.contains("applied_at TIMESTAMPTZ DEFAULT now()"));
        assert!(RECORD_SEED_SQL.contains(SEEDS_TABLE));
    }

    #[test]
    fn test_migration_record_params() {
        let migration = Migration::new(42, "add_index", "CREATE INDEX i ON t (c);");
        assert_eq!(
            migration.record_params(),
            vec![
                DatabaseValue::Int32(42),
                DatabaseValue::String("add_index".to_string())
            ]
        );
    }
}
