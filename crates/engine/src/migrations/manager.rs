//! Migration Manager - Registers units and runs them against a store
//!
//! Both pipelines follow the same steps: bootstrap the tracking table, read
//! the applied set, then apply every pending unit in order, each in its own
//! transaction together with its tracking row. The first failure stops the
//! run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::definitions::{Migration, RunSummary, Seed, UnitStatus};
use super::tracking::TrackedUnit;
use crate::backends::DatabasePool;
use crate::error::{ApplyPhase, MigrationError, MigrationResult, StoreError};
use crate::transaction::Transaction;

/// Holds registered migrations and seeds and runs them against one pool
pub struct Manager {
    pool: Arc<dyn DatabasePool>,
    migrations: Vec<Migration>,
    seeds: Vec<Seed>,
}

impl Manager {
    /// Create a manager with nothing registered
    pub fn new(pool: Arc<dyn DatabasePool>) -> Self {
        Self {
            pool,
            migrations: Vec::new(),
            seeds: Vec::new(),
        }
    }

    /// Create a manager owning the given pool
    pub fn with_pool<P: DatabasePool + 'static>(pool: P) -> Self {
        Self::new(Arc::new(pool))
    }

    /// Register a migration
    ///
    /// Rejects a version already registered and versions that do not fit the
    /// `INTEGER` tracking column.
    pub fn add_migration(&mut self, migration: Migration) -> MigrationResult<()> {
        if migration.version > i32::MAX as u32 {
            return Err(MigrationError::Registration {
                reason: format!(
                    "migration version {} exceeds the maximum of {}",
                    migration.version,
                    i32::MAX
                ),
            });
        }

        if let Some(existing) = self
            .migrations
            .iter()
            .find(|m| m.version == migration.version)
        {
            return Err(MigrationError::Registration {
                reason: format!(
                    "migration version {} already registered as '{}'",
                    migration.version, existing.description
                ),
            });
        }

        self.migrations.push(migration);
        Ok(())
    }

    /// Register several migrations, stopping at the first rejected one
    pub fn add_migrations(
        &mut self,
        migrations: impl IntoIterator<Item = Migration>,
    ) -> MigrationResult<()> {
        for migration in migrations {
            self.add_migration(migration)?;
        }
        Ok(())
    }

    /// Register a seed; names must be unique
    pub fn add_seed(&mut self, seed: Seed) -> MigrationResult<()> {
        if self.seeds.iter().any(|s| s.name == seed.name) {
            return Err(MigrationError::Registration {
                reason: format!("seed '{}' already registered", seed.name),
            });
        }

        self.seeds.push(seed);
        Ok(())
    }

    pub fn add_seeds(&mut self, seeds: impl IntoIterator<Item = Seed>) -> MigrationResult<()> {
        for seed in seeds {
            self.add_seed(seed)?;
        }
        Ok(())
    }

    /// Registered migrations in registration order
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Registered seeds in registration order
    pub fn seeds(&self) -> &[Seed] {
        &self.seeds
    }

    /// Apply every registered migration not yet recorded, by ascending version
    pub async fn run_migrations(&self, ctx: &CancellationToken) -> MigrationResult<RunSummary> {
        self.run_pipeline(ctx, &self.ordered_migrations()).await
    }

    /// Apply every registered seed not yet recorded, by ascending priority
    ///
    /// Seeds with equal priority run in registration order.
    pub async fn run_seeds(&self, ctx: &CancellationToken) -> MigrationResult<RunSummary> {
        self.run_pipeline(ctx, &self.ordered_seeds()).await
    }

    /// Applied state of every registered migration, in run order
    pub async fn migration_status(&self, ctx: &CancellationToken) -> MigrationResult<Vec<UnitStatus>> {
        self.status(ctx, &self.ordered_migrations()).await
    }

    /// Applied state of every registered seed, in run order
    pub async fn seed_status(&self, ctx: &CancellationToken) -> MigrationResult<Vec<UnitStatus>> {
        self.status(ctx, &self.ordered_seeds()).await
    }

    fn ordered_migrations(&self) -> Vec<Migration> {
        let mut migrations = self.migrations.clone();
        migrations.sort_by_key(|m| m.version);
        migrations
    }

    fn ordered_seeds(&self) -> Vec<Seed> {
        let mut seeds = self.seeds.clone();
        seeds.sort_by_key(|s| s.priority);
        seeds
    }

    async fn run_pipeline<U: TrackedUnit>(
        &self,
        ctx: &CancellationToken,
        units: &[U],
    ) -> MigrationResult<RunSummary> {
        let start_time = Instant::now();

        self.ensure_table::<U>(ctx).await?;
        let applied = self.applied::<U>(ctx).await?;

        let mut summary = RunSummary::default();
        for unit in units {
            if applied.contains_key(&unit.key()) {
                debug!("Skipping {}: already applied", unit.id());
                summary.skipped += 1;
                continue;
            }

            self.apply_unit(ctx, unit).await?;
            info!("Applied {}", unit.id());
            summary.applied.push(unit.id());
        }

        summary.execution_time_ms = start_time.elapsed().as_millis();
        Ok(summary)
    }

    async fn status<U: TrackedUnit>(
        &self,
        ctx: &CancellationToken,
        units: &[U],
    ) -> MigrationResult<Vec<UnitStatus>> {
        self.ensure_table::<U>(ctx).await?;
        let applied = self.applied::<U>(ctx).await?;

        Ok(units
            .iter()
            .map(|unit| {
                let recorded = applied.get(&unit.key());
                UnitStatus {
                    unit: unit.id(),
                    applied: recorded.is_some(),
                    applied_at: recorded.copied().flatten(),
                }
            })
            .collect())
    }

    /// Create the tracking table if missing
    async fn ensure_table<U: TrackedUnit>(&self, ctx: &CancellationToken) -> MigrationResult<()> {
        let mut tx = Transaction::begin(self.pool.as_ref(), ctx)
            .await
            .map_err(|e| MigrationError::tracking(U::TABLE, e))?;

        let result = async {
            tx.execute(ctx, U::CREATE_SQL, &[]).await?;
            tx.commit().await
        }
        .await;
        tx.release().await;

        result.map_err(|e| MigrationError::tracking(U::TABLE, e))?;
        debug!("Tracking table {} ready", U::TABLE);
        Ok(())
    }

    /// Read the applied set from the tracking table
    async fn applied<U: TrackedUnit>(
        &self,
        ctx: &CancellationToken,
    ) -> MigrationResult<HashMap<U::Key, Option<DateTime<Utc>>>> {
        let rows = self
            .pool
            .fetch_all(ctx, U::SELECT_APPLIED_SQL, &[])
            .await
            .map_err(|e| MigrationError::tracking(U::TABLE, e))?;

        rows.iter()
            .map(|row| U::applied_from_row(row.as_ref()))
            .collect::<Result<HashMap<_, _>, StoreError>>()
            .map_err(|e| MigrationError::tracking(U::TABLE, e))
    }

    /// Apply one unit and record it in the same transaction
    async fn apply_unit<U: TrackedUnit>(
        &self,
        ctx: &CancellationToken,
        unit: &U,
    ) -> MigrationResult<()> {
        let mut tx = Transaction::begin(self.pool.as_ref(), ctx)
            .await
            .map_err(apply_error(unit, ApplyPhase::Begin))?;

        let result = apply_in_transaction(ctx, unit, &mut tx).await;
        tx.release().await;
        result
    }
}

async fn apply_in_transaction<U: TrackedUnit>(
    ctx: &CancellationToken,
    unit: &U,
    tx: &mut Transaction,
) -> MigrationResult<()> {
    unit.apply(ctx, tx)
        .await
        .map_err(apply_error(unit, ApplyPhase::Execute))?;

    tx.execute(ctx, U::RECORD_SQL, &unit.record_params())
        .await
        .map_err(apply_error(unit, ApplyPhase::Record))?;

    tx.commit()
        .await
        .map_err(apply_error(unit, ApplyPhase::Commit))
}

fn apply_error<U: TrackedUnit>(
    unit: &U,
    phase: ApplyPhase,
) -> impl FnOnce(StoreError) -> MigrationError + '_ {
    move |source| MigrationError::Apply {
        unit: unit.id(),
        phase,
        source,
    }
}
