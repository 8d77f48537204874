//! Migration Definitions - Core types for migrations and seeds
//!
//! [`Migration`] and [`Seed`] are built once (usually by the file loader) and
//! never change afterwards. [`RunSummary`] and [`UnitStatus`] describe what a
//! run did and what the tracking tables currently record.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{StoreResult, UnitId};
use crate::transaction::Transaction;

/// A versioned schema change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Unique version, also the sort key
    pub version: u32,
    /// Human-readable description, recorded in the tracking table
    pub description: String,
    /// Script applying the change
    pub up: String,
    /// Script reversing the change; never run automatically
    pub down: Option<String>,
}

impl Migration {
    pub fn new(version: u32, description: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            up: up.into(),
            down: None,
        }
    }

    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down = Some(down.into());
        self
    }

    pub fn id(&self) -> UnitId {
        UnitId::Migration {
            version: self.version,
            description: self.description.clone(),
        }
    }
}

/// Effect of a seed, run inside the seed's transaction
///
/// Implementations must not commit or roll back; the engine does that once
/// the tracking row is written.
#[async_trait]
pub trait SeedRunner: Send + Sync {
    async fn run(&self, ctx: &CancellationToken, tx: &mut Transaction) -> StoreResult<()>;
}

/// Seed effect that executes a fixed SQL script
#[derive(Debug, Clone)]
pub struct SqlSeed {
    sql: String,
}

impl SqlSeed {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[async_trait]
impl SeedRunner for SqlSeed {
    async fn run(&self, ctx: &CancellationToken, tx: &mut Transaction) -> StoreResult<()> {
        tx.execute(ctx, &self.sql, &[]).await?;
        Ok(())
    }
}

/// A named data-population unit ordered by priority
#[derive(Clone)]
pub struct Seed {
    /// Unique name, recorded in the tracking table
    pub name: String,
    /// Sort key; lower runs first
    pub priority: i64,
    runner: Arc<dyn SeedRunner>,
}

impl Seed {
    pub fn new(name: impl Into<String>, priority: i64, runner: impl SeedRunner + 'static) -> Self {
        Self {
            name: name.into(),
            priority,
            runner: Arc::new(runner),
        }
    }

    /// Seed that runs a single SQL script
    pub fn sql(name: impl Into<String>, priority: i64, sql: impl Into<String>) -> Self {
        Self::new(name, priority, SqlSeed::new(sql))
    }

    pub fn id(&self) -> UnitId {
        UnitId::Seed {
            name: self.name.clone(),
        }
    }

    pub async fn run(&self, ctx: &CancellationToken, tx: &mut Transaction) -> StoreResult<()> {
        self.runner.run(ctx, tx).await
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Result of running one pipeline
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Units applied by this run, in the order they were applied
    pub applied: Vec<UnitId>,
    /// Number of registered units already recorded as applied
    pub skipped: usize,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl RunSummary {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Tracking status of a registered unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub unit: UnitId,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_builder() {
        let migration = Migration::new(1, "init", "CREATE TABLE users (id INT);")
            .with_down("DROP TABLE users;");

        assert_eq!(migration.version, 1);
        assert_eq!(migration.description, "init");
        assert_eq!(migration.down.as_deref(), Some("DROP TABLE users;"));
        assert_eq!(migration.id().to_string(), "migration 1 (init)");
    }

    #[test]
    fn test_seed_debug_omits_runner() {
        let seed = Seed::sql("admin_user", 10, "INSERT INTO users VALUES (1);");
        let debug = format!("{:?}", seed);

        assert!(debug.contains("admin_user"));
        assert!(debug.contains("10"));
        assert!(!debug.contains("INSERT"));
    }
}
