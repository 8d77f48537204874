//! PostgreSQL Backend Implementation
//!
//! Binds the store traits to sqlx's PostgreSQL pool and transaction types.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Column, Executor, PgPool, Postgres, Row as SqlxRow};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::core::*;
use crate::config::DatabaseConfig;
use crate::error::{MigrationError, MigrationResult, StoreError, StoreResult};

/// PostgreSQL connection pool implementation
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Wrap an existing sqlx pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pool from configuration and verify the store is reachable
    pub async fn connect(config: &DatabaseConfig) -> MigrationResult<Self> {
        let ssl_mode: PgSslMode = config.ssl_mode.parse().map_err(|e| MigrationError::Connection {
            source: StoreError::Connection(format!("Invalid sslmode '{}': {}", config.ssl_mode, e)),
        })?;

        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.database)
            .ssl_mode(ssl_mode);

        if !config.use_iam_auth {
            if let Some(password) = &config.password {
                options = options.password(password);
            }
        }

        if let Some(schema) = &config.schema {
            options = options.options([("search_path", schema.as_str())]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(config.max_idle_time)
            .max_lifetime(config.max_lifetime)
            .connect_with(options)
            .await
            .map_err(|e| MigrationError::Connection {
                source: StoreError::from(e),
            })?;

        let pool = Self::from_pool(pool);
        if let Err(source) = pool.health_check(&CancellationToken::new()).await {
            pool.close().await;
            return Err(MigrationError::Connection { source });
        }

        debug!(
            "Connected to {}:{}/{} (max connections: {})",
            config.host, config.port, config.database, config.max_connections
        );
        Ok(pool)
    }

    /// Get the underlying sqlx pool
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Round-trip a trivial query and report its latency
    pub async fn health_check(&self, ctx: &CancellationToken) -> StoreResult<Duration> {
        let start = Instant::now();
        cancellable(ctx, async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok::<_, StoreError>(())
        })
        .await?;
        Ok(start.elapsed())
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn begin_transaction(
        &self,
        ctx: &CancellationToken,
    ) -> StoreResult<Box<dyn DatabaseTransaction>> {
        cancellable(ctx, async {
            let tx = self.pool.begin().await?;
            Ok::<_, StoreError>(Box::new(PostgresTransaction::new(tx)) as Box<dyn DatabaseTransaction>)
        })
        .await
    }

    async fn fetch_all(
        &self,
        ctx: &CancellationToken,
        sql: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<Vec<Box<dyn DatabaseRow>>> {
        cancellable(ctx, async {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_database_value(query, param);
            }

            let rows = query.fetch_all(&self.pool).await?;
            Ok::<_, StoreError>(rows
                .into_iter()
                .map(|row| Box::new(PostgresRow::new(row)) as Box<dyn DatabaseRow>)
                .collect())
        })
        .await
    }
}

/// PostgreSQL transaction implementation
///
/// Holds `None` once committed or rolled back, which makes a later rollback a
/// no-op.
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx: Some(tx) }
    }

    fn active(&mut self) -> StoreResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl DatabaseTransaction for PostgresTransaction {
    async fn execute(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<u64> {
        let tx = self.active()?;
        cancellable(ctx, async move {
            // Unparameterised scripts go through the simple query protocol so
            // a multi-statement script runs as a single call.
            if params.is_empty() {
                let result = (&mut **tx).execute(sql).await?;
                return Ok(result.rows_affected());
            }

            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_database_value(query, param);
            }
            let result = query.execute(&mut **tx).await?;
            Ok::<_, StoreError>(result.rows_affected())
        })
        .await
    }

    async fn fetch_optional(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<Option<Box<dyn DatabaseRow>>> {
        let tx = self.active()?;
        cancellable(ctx, async move {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_database_value(query, param);
            }

            let row = query.fetch_optional(&mut **tx).await?;
            Ok::<_, StoreError>(row.map(|r| Box::new(PostgresRow::new(r)) as Box<dyn DatabaseRow>))
        })
        .await
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        match self.tx.take() {
            Some(tx) => {
                tx.rollback().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// PostgreSQL row implementation
pub struct PostgresRow {
    row: sqlx::postgres::PgRow,
}

impl PostgresRow {
    pub fn new(row: sqlx::postgres::PgRow) -> Self {
        Self { row }
    }
}

impl DatabaseRow for PostgresRow {
    fn get_by_index(&self, index: usize) -> StoreResult<DatabaseValue> {
        postgres_value_to_database_value(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> StoreResult<DatabaseValue> {
        let index = self
            .row
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| StoreError::Decode(format!("Column '{}' not found", name)))?;

        postgres_value_to_database_value(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(
    query: sqlx::query::Query<'a, Postgres, sqlx::postgres::PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'a, Postgres, sqlx::postgres::PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
    }
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(
    row: &sqlx::postgres::PgRow,
    index: usize,
) -> StoreResult<DatabaseValue> {
    use sqlx::{TypeInfo, ValueRef};

    let column = row
        .columns()
        .get(index)
        .ok_or_else(|| StoreError::Decode(format!("Column index {} out of range", index)))?;

    if row.try_get_raw(index)?.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let value = match column.type_info().name() {
        "BOOL" => DatabaseValue::Bool(row.try_get(index)?),
        "INT2" => DatabaseValue::Int32(row.try_get::<i16, _>(index)? as i32),
        "INT4" => DatabaseValue::Int32(row.try_get(index)?),
        "INT8" => DatabaseValue::Int64(row.try_get(index)?),
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index)?),
        "TIMESTAMP" => {
            let naive: chrono::NaiveDateTime = row.try_get(index)?;
            DatabaseValue::DateTime(chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc))
        }
        _ => DatabaseValue::String(row.try_get(index)?),
    };

    Ok(value)
}
