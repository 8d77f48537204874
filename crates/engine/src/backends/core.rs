//! Core Store Traits
//!
//! The two capability sets the engine needs from a relational store: pool-level
//! operations (open a transaction, read outside a transaction) and
//! transaction-level operations (execute, query a row, commit, roll back).
//! Every call that touches the store takes a cancellation token; a cancelled
//! token turns the call into [`StoreError::Cancelled`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};

/// Abstract connection pool
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Begin a transaction
    async fn begin_transaction(
        &self,
        ctx: &CancellationToken,
    ) -> StoreResult<Box<dyn DatabaseTransaction>>;

    /// Execute a query outside any transaction and return all rows
    async fn fetch_all(
        &self,
        ctx: &CancellationToken,
        sql: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<Vec<Box<dyn DatabaseRow>>>;
}

/// Abstract transaction
///
/// Implementations must treat `rollback` after a completed `commit` (or a
/// second `rollback`) as `Ok(())`. The engine relies on that to release every
/// transaction unconditionally.
#[async_trait]
pub trait DatabaseTransaction: Send + Sync {
    /// Execute a statement and return affected rows count
    async fn execute(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<u64>;

    /// Execute a query and return the first row, if any
    async fn fetch_optional(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<Option<Box<dyn DatabaseRow>>>;

    /// Commit the transaction
    async fn commit(&mut self) -> StoreResult<()>;

    /// Roll the transaction back; a no-op once the transaction is complete
    async fn rollback(&mut self) -> StoreResult<()>;
}

/// Abstract result row
pub trait DatabaseRow: Send + Sync {
    /// Get a column value by index
    fn get_by_index(&self, index: usize) -> StoreResult<DatabaseValue>;

    /// Get a column value by name
    fn get_by_name(&self, name: &str) -> StoreResult<DatabaseValue>;

    /// Get column count
    fn column_count(&self) -> usize;
}

/// Database value enumeration for parameter binding and row access
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    DateTime(chrono::DateTime<chrono::Utc>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Read an integer column, widening `Int32`
    pub fn as_i64(&self) -> StoreResult<i64> {
        match self {
            DatabaseValue::Int32(i) => Ok(*i as i64),
            DatabaseValue::Int64(i) => Ok(*i),
            other => Err(StoreError::Decode(format!("expected integer, found {:?}", other))),
        }
    }

    pub fn as_str(&self) -> StoreResult<&str> {
        match self {
            DatabaseValue::String(s) => Ok(s),
            other => Err(StoreError::Decode(format!("expected text, found {:?}", other))),
        }
    }

    /// Read a nullable timestamp column
    pub fn as_datetime(&self) -> StoreResult<Option<chrono::DateTime<chrono::Utc>>> {
        match self {
            DatabaseValue::Null => Ok(None),
            DatabaseValue::DateTime(dt) => Ok(Some(*dt)),
            other => Err(StoreError::Decode(format!("expected timestamp, found {:?}", other))),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// Race a store future against cancellation
pub async fn cancellable<T, F>(ctx: &CancellationToken, fut: F) -> StoreResult<T>
where
    F: std::future::Future<Output = StoreResult<T>>,
{
    if ctx.is_cancelled() {
        return Err(StoreError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(StoreError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widening() {
        assert_eq!(DatabaseValue::Int32(7).as_i64().unwrap(), 7);
        assert_eq!(DatabaseValue::Int64(i64::MAX).as_i64().unwrap(), i64::MAX);
        assert!(DatabaseValue::from("7").as_i64().is_err());
    }

    #[test]
    fn test_option_conversion() {
        assert!(DatabaseValue::from(None::<String>).is_null());
        assert_eq!(DatabaseValue::from(Some(3i32)), DatabaseValue::Int32(3));
    }

    #[tokio::test]
    async fn test_cancellable_short_circuits() {
        let ctx = CancellationToken::new();
        ctx.cancel();

        let result = cancellable(&ctx, async { Ok::<_, StoreError>(1) }).await;
        assert_eq!(result, Err(StoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let ctx = CancellationToken::new();
        let result = cancellable(&ctx, async { Ok::<_, StoreError>(42) }).await;
        assert_eq!(result, Ok(42));
    }
}
