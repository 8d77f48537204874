//! In-Memory Backend
//!
//! A deterministic store that understands the tracking-table statements the
//! engine issues and records every other statement as an opaque script.
//! Writes are buffered per transaction and become visible on commit. Tracking
//! inserts reserve their key immediately, so a second open transaction
//! inserting the same key fails with a unique violation, as a row lock would.
//!
//! Faults can be injected on a script pattern or on the Nth call of an
//! operation, and a barrier can hold a script until several transactions
//! reach it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use super::core::*;
use crate::error::{StoreError, StoreResult};
use crate::migrations::tracking::{MIGRATIONS_TABLE, SEEDS_TABLE};

/// Store operations that can be targeted by fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Begin,
    FetchAll,
    Execute,
    FetchOptional,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Migration(i64),
    Seed(String),
}

#[derive(Debug, Clone)]
enum PendingWrite {
    CreateTable(String),
    InsertMigration { version: i64, description: String },
    InsertSeed { name: String },
    Script(String),
}

/// Recognised statement shapes
#[derive(Debug)]
enum Statement {
    CreateTable(String),
    SelectApplied(String),
    Insert(String),
    Script,
}

enum Fault {
    Script { pattern: String, error: StoreError },
    Call { operation: Operation, nth: usize, error: StoreError },
}

#[derive(Default)]
struct MemoryState {
    tables: HashSet<String>,
    migrations: BTreeMap<i64, (String, DateTime<Utc>)>,
    seeds: BTreeMap<String, DateTime<Utc>>,
    reserved: HashSet<RowKey>,
    committed_scripts: Vec<String>,
    attempted_scripts: Vec<String>,
    calls: HashMap<Operation, usize>,
    faults: Vec<Fault>,
    barriers: Vec<(String, Arc<Barrier>)>,
    open_transactions: usize,
}

impl MemoryState {
    /// Count the call and return an injected failure for it, if any
    fn record_call(&mut self, operation: Operation) -> StoreResult<()> {
        let count = self.calls.entry(operation).or_insert(0);
        *count += 1;
        let count = *count;

        let fault = self.faults.iter().find_map(|fault| match fault {
            Fault::Call { operation: op, nth, error } if *op == operation && *nth == count => {
                Some(error.clone())
            }
            _ => None,
        });

        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn script_fault(&self, sql: &str) -> Option<StoreError> {
        self.faults.iter().find_map(|fault| match fault {
            Fault::Script { pattern, error } if sql.contains(pattern.as_str()) => Some(error.clone()),
            _ => None,
        })
    }

    fn barrier_for(&self, sql: &str) -> Option<Arc<Barrier>> {
        self.barriers
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, barrier)| barrier.clone())
    }

    fn require_table(&self, table: &str) -> StoreResult<()> {
        if self.tables.contains(table) {
            Ok(())
        } else {
            Err(StoreError::Query(format!("relation \"{}\" does not exist", table)))
        }
    }

    fn applied_rows(&self, table: &str) -> StoreResult<Vec<Box<dyn DatabaseRow>>> {
        self.require_table(table)?;

        let rows = if table == MIGRATIONS_TABLE {
            self.migrations
                .iter()
                .map(|(version, (description, applied_at))| {
                    MemoryRow::new(vec![
                        ("version", DatabaseValue::Int32(*version as i32)),
                        ("description", DatabaseValue::String(description.clone())),
                        ("applied_at", DatabaseValue::DateTime(*applied_at)),
                    ])
                })
                .collect()
        } else {
            self.seeds
                .iter()
                .map(|(name, applied_at)| {
                    MemoryRow::new(vec![
                        ("name", DatabaseValue::String(name.clone())),
                        ("applied_at", DatabaseValue::DateTime(*applied_at)),
                    ])
                })
                .collect()
        };

        Ok(rows)
    }
}

/// In-memory implementation of [`DatabasePool`]
///
/// Cloning yields another handle onto the same store.
#[derive(Clone, Default)]
pub struct MemoryPool {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Fail every statement whose text contains `pattern`
    pub fn fail_script(&self, pattern: impl Into<String>, error: StoreError) {
        self.lock().faults.push(Fault::Script {
            pattern: pattern.into(),
            error,
        });
    }

    /// Fail the `nth` (1-based) call of `operation`
    pub fn fail_call(&self, operation: Operation, nth: usize, error: StoreError) {
        self.lock().faults.push(Fault::Call { operation, nth, error });
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Hold statements containing `pattern` until `barrier` releases them
    pub fn hold_script(&self, pattern: impl Into<String>, barrier: Arc<Barrier>) {
        self.lock().barriers.push((pattern.into(), barrier));
    }

    /// Record a migration as applied without running it
    pub fn mark_migration_applied(&self, version: i64, description: impl Into<String>) {
        let mut state = self.lock();
        state.tables.insert(MIGRATIONS_TABLE.to_string());
        state.migrations.insert(version, (description.into(), Utc::now()));
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains(table)
    }

    /// Versions with a committed tracking row, ascending
    pub fn applied_versions(&self) -> Vec<i64> {
        self.lock().migrations.keys().copied().collect()
    }

    /// Seed names with a committed tracking row, sorted
    pub fn applied_seeds(&self) -> Vec<String> {
        self.lock().seeds.keys().cloned().collect()
    }

    /// Scripts whose transaction committed, in commit order
    pub fn committed_scripts(&self) -> Vec<String> {
        self.lock().committed_scripts.clone()
    }

    /// Every script execution attempted, including failed and rolled back ones
    pub fn attempted_scripts(&self) -> Vec<String> {
        self.lock().attempted_scripts.clone()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Transactions begun but neither committed nor rolled back
    pub fn open_transactions(&self) -> usize {
        self.lock().open_transactions
    }
}

#[async_trait]
impl DatabasePool for MemoryPool {
    async fn begin_transaction(
        &self,
        ctx: &CancellationToken,
    ) -> StoreResult<Box<dyn DatabaseTransaction>> {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let mut state = self.lock();
        state.record_call(Operation::Begin)?;
        state.open_transactions += 1;

        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            writes: Vec::new(),
            reservations: Vec::new(),
            open: true,
        }))
    }

    async fn fetch_all(
        &self,
        ctx: &CancellationToken,
        sql: &str,
        _params: &[DatabaseValue],
    ) -> StoreResult<Vec<Box<dyn DatabaseRow>>> {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let mut state = self.lock();
        state.record_call(Operation::FetchAll)?;

        match classify(sql) {
            Statement::SelectApplied(table) => state.applied_rows(&table),
            _ => Ok(Vec::new()),
        }
    }
}

/// In-memory implementation of [`DatabaseTransaction`]
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    writes: Vec<PendingWrite>,
    reservations: Vec<RowKey>,
    open: bool,
}

impl MemoryTransaction {
    /// Drop buffered writes and give back reserved keys
    fn discard(&mut self, state: &mut MemoryState) {
        for key in self.reservations.drain(..) {
            state.reserved.remove(&key);
        }
        self.writes.clear();
        if self.open {
            self.open = false;
            state.open_transactions -= 1;
        }
    }

    fn reserve(&mut self, state: &mut MemoryState, key: RowKey) -> StoreResult<()> {
        let taken = match &key {
            RowKey::Migration(version) => state.migrations.contains_key(version),
            RowKey::Seed(name) => state.seeds.contains_key(name),
        };

        if taken || state.reserved.contains(&key) {
            return Err(StoreError::UniqueViolation(format!(
                "duplicate key value violates unique constraint ({:?})",
                key
            )));
        }

        state.reserved.insert(key.clone());
        self.reservations.push(key);
        Ok(())
    }

    fn insert(
        &mut self,
        state: &mut MemoryState,
        table: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<()> {
        state.require_table(table)?;

        if table == MIGRATIONS_TABLE {
            let version = params
                .first()
                .ok_or_else(|| StoreError::Query("missing version parameter".to_string()))?
                .as_i64()?;
            let description = params
                .get(1)
                .ok_or_else(|| StoreError::Query("missing description parameter".to_string()))?
                .as_str()?
                .to_string();

            self.reserve(state, RowKey::Migration(version))?;
            self.writes.push(PendingWrite::InsertMigration { version, description });
        } else {
            let name = params
                .first()
                .ok_or_else(|| StoreError::Query("missing name parameter".to_string()))?
                .as_str()?
                .to_string();

            self.reserve(state, RowKey::Seed(name.clone()))?;
            self.writes.push(PendingWrite::InsertSeed { name });
        }

        Ok(())
    }
}

#[async_trait]
impl DatabaseTransaction for MemoryTransaction {
    async fn execute(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<u64> {
        if !self.open {
            return Err(StoreError::TransactionClosed);
        }
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let barrier = lock_state(&self.state).barrier_for(sql);
        if let Some(barrier) = barrier {
            cancellable(ctx, async {
                barrier.wait().await;
                Ok::<_, StoreError>(())
            })
            .await?;
        }

        let state_handle = self.state.clone();
        let mut state = lock_state(&state_handle);
        state.record_call(Operation::Execute)?;

        match classify(sql) {
            Statement::CreateTable(table) => {
                self.writes.push(PendingWrite::CreateTable(table));
                Ok(0)
            }
            Statement::Insert(table) => {
                self.insert(&mut state, &table, params)?;
                Ok(1)
            }
            Statement::SelectApplied(_) | Statement::Script => {
                state.attempted_scripts.push(sql.to_string());
                if let Some(error) = state.script_fault(sql) {
                    return Err(error);
                }
                self.writes.push(PendingWrite::Script(sql.to_string()));
                Ok(0)
            }
        }
    }

    async fn fetch_optional(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        _params: &[DatabaseValue],
    ) -> StoreResult<Option<Box<dyn DatabaseRow>>> {
        if !self.open {
            return Err(StoreError::TransactionClosed);
        }
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let mut state = lock_state(&self.state);
        state.record_call(Operation::FetchOptional)?;

        match classify(sql) {
            Statement::SelectApplied(table) => Ok(state.applied_rows(&table)?.into_iter().next()),
            _ => Ok(None),
        }
    }

    async fn commit(&mut self) -> StoreResult<()> {
        if !self.open {
            return Err(StoreError::TransactionClosed);
        }

        let state_handle = self.state.clone();
        let mut state = lock_state(&state_handle);

        // A failed commit leaves nothing behind, as an aborted COMMIT would.
        if let Err(error) = state.record_call(Operation::Commit) {
            self.discard(&mut state);
            return Err(error);
        }

        let now = Utc::now();
        for write in self.writes.drain(..) {
            match write {
                PendingWrite::CreateTable(table) => {
                    state.tables.insert(table);
                }
                PendingWrite::InsertMigration { version, description } => {
                    state.migrations.insert(version, (description, now));
                }
                PendingWrite::InsertSeed { name } => {
                    state.seeds.insert(name, now);
                }
                PendingWrite::Script(script) => state.committed_scripts.push(script),
            }
        }
        self.discard(&mut state);
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let state_handle = self.state.clone();
        let mut state = lock_state(&state_handle);
        state.record_call(Operation::Rollback)?;
        self.discard(&mut state);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.open {
            let state_handle = self.state.clone();
            let mut state = lock_state(&state_handle);
            self.discard(&mut state);
        }
    }
}

/// Row produced by the in-memory store
pub struct MemoryRow {
    columns: Vec<(&'static str, DatabaseValue)>,
}

impl MemoryRow {
    fn new(columns: Vec<(&'static str, DatabaseValue)>) -> Box<dyn DatabaseRow> {
        Box::new(Self { columns })
    }
}

impl DatabaseRow for MemoryRow {
    fn get_by_index(&self, index: usize) -> StoreResult<DatabaseValue> {
        self.columns
            .get(index)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| StoreError::Decode(format!("Column index {} out of range", index)))
    }

    fn get_by_name(&self, name: &str) -> StoreResult<DatabaseValue> {
        self.columns
            .iter()
            .find(|(column, _)| *column == name)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| StoreError::Decode(format!("Column '{}' not found", name)))
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    // A panicking test thread must not wedge every other handle.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn classify(sql: &str) -> Statement {
    let normalized = sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    for table in [MIGRATIONS_TABLE, SEEDS_TABLE] {
        if normalized.starts_with(&format!("create table if not exists {} ", table)) {
            return Statement::CreateTable(table.to_string());
        }
        if normalized.starts_with(&format!("insert into {} ", table)) {
            return Statement::Insert(table.to_string());
        }
        if normalized.starts_with("select ") && normalized.contains(&format!(" from {}", table)) {
            return Statement::SelectApplied(table.to_string());
        }
    }

    Statement::Script
}
