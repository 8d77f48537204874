//! Transaction Handle
//!
//! Owned wrapper around a backend transaction that tracks whether it is still
//! open. The engine calls [`Transaction::release`] on every exit path once a
//! unit's work is done; after a commit that call does nothing.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backends::{DatabasePool, DatabaseRow, DatabaseTransaction, DatabaseValue};
use crate::error::{StoreError, StoreResult};

/// Lifecycle of a transaction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    /// Commit returned an error; the backend may still hold the transaction
    CommitFailed,
    RolledBack,
}

/// Transaction handle passed to migrations and seeds
pub struct Transaction {
    inner: Box<dyn DatabaseTransaction>,
    state: TransactionState,
}

impl Transaction {
    /// Begin a transaction on the given pool
    pub async fn begin(pool: &dyn DatabasePool, ctx: &CancellationToken) -> StoreResult<Self> {
        let inner = pool.begin_transaction(ctx).await?;
        Ok(Self::from_backend(inner))
    }

    /// Wrap a transaction already opened on a backend
    pub fn from_backend(inner: Box<dyn DatabaseTransaction>) -> Self {
        Self {
            inner,
            state: TransactionState::Open,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Check if the transaction is still active (not committed or rolled back)
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Execute a statement within the transaction
    pub async fn execute(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<u64> {
        self.ensure_open()?;
        self.inner.execute(ctx, sql, params).await
    }

    /// Execute a query and return its first row, if any
    pub async fn fetch_optional(
        &mut self,
        ctx: &CancellationToken,
        sql: &str,
        params: &[DatabaseValue],
    ) -> StoreResult<Option<Box<dyn DatabaseRow>>> {
        self.ensure_open()?;
        self.inner.fetch_optional(ctx, sql, params).await
    }

    /// Commit the transaction
    ///
    /// A failed commit leaves the handle closed for further statements, but
    /// [`Transaction::release`] still issues a rollback.
    pub(crate) async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        match self.inner.commit().await {
            Ok(()) => {
                self.state = TransactionState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::CommitFailed;
                Err(e)
            }
        }
    }

    /// Roll back unless committed or already rolled back
    ///
    /// Failures are logged rather than returned so they never mask the error
    /// that led here.
    pub(crate) async fn release(&mut self) {
        if !matches!(self.state, TransactionState::Open | TransactionState::CommitFailed) {
            return;
        }

        self.state = TransactionState::RolledBack;
        match self.inner.rollback().await {
            Ok(()) => debug!("Transaction rolled back"),
            Err(e) => warn!("Failed to roll back transaction: {}", e),
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.state, TransactionState::Open | TransactionState::CommitFailed) {
            warn!("Transaction dropped while still open; the backend will discard it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryPool, Operation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_release_after_commit_is_noop() {
        let pool = MemoryPool::new();
        let ctx = CancellationToken::new();

        let mut tx = Transaction::begin(&pool, &ctx).await.unwrap();
        tx.execute(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();
        tx.commit().await.unwrap();
        tx.release().await;

        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(pool.call_count(Operation::Rollback), 0);
        assert_eq!(pool.committed_scripts(), vec!["CREATE TABLE t (id INT)"]);
    }

    #[tokio::test]
    async fn test_release_rolls_back_open_transaction() {
        let pool = MemoryPool::new();
        let ctx = CancellationToken::new();

        let mut tx = Transaction::begin(&pool, &ctx).await.unwrap();
        tx.execute(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();
        tx.release().await;

        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(pool.open_transactions(), 0);
        assert!(pool.committed_scripts().is_empty());
        assert_eq!(
            tx.execute(&ctx, "SELECT 1", &[]).await,
            Err(StoreError::TransactionClosed)
        );
    }

    #[tokio::test]
    async fn test_failed_commit_is_still_rolled_back() {
        let pool = MemoryPool::new();
        let ctx = CancellationToken::new();
        pool.fail_call(Operation::Commit, 1, StoreError::Query("serialization failure".to_string()));

        let mut tx = Transaction::begin(&pool, &ctx).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert_eq!(tx.state(), TransactionState::CommitFailed);
        assert_eq!(
            tx.execute(&ctx, "SELECT 1", &[]).await,
            Err(StoreError::TransactionClosed)
        );

        tx.release().await;
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(pool.call_count(Operation::Rollback), 1);
        assert_eq!(pool.open_transactions(), 0);
    }

    /// Backend whose commit fails without closing the transaction
    struct StickyCommit {
        rollbacks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DatabaseTransaction for StickyCommit {
        async fn execute(
            &mut self,
            _ctx: &CancellationToken,
            _sql: &str,
            _params: &[DatabaseValue],
        ) -> StoreResult<u64> {
            Ok(0)
        }

        async fn fetch_optional(
            &mut self,
            _ctx: &CancellationToken,
            _sql: &str,
            _params: &[DatabaseValue],
        ) -> StoreResult<Option<Box<dyn DatabaseRow>>> {
            Ok(None)
        }

        async fn commit(&mut self) -> StoreResult<()> {
            Err(StoreError::Connection("timeout".to_string()))
        }

        async fn rollback(&mut self) -> StoreResult<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_release_after_failed_commit_reaches_backend() {
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let mut tx = Transaction::from_backend(Box::new(StickyCommit {
            rollbacks: rollbacks.clone(),
        }));

        assert!(tx.commit().await.is_err());
        tx.release().await;
        tx.release().await;

        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }
}
