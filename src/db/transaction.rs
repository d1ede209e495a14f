//! Transaction coordination.
//!
//! A [`TransactionHandle`] owns one lease for the lifetime of a transaction,
//! so every statement runs on the same connection in submission order. Each
//! statement is wrapped in a savepoint: a failing statement is undone on its
//! own and the transaction stays usable.
//!
//! The handle gives its lease back exactly once:
//! - commit or rollback release it immediately
//! - a connection-fatal error, a timeout or a cancellation discards it
//! - a failed savepoint on a usable connection rolls back, then releases it
//! - dropping an active handle spawns a rollback, then releases it

use crate::context::RequestContext;
use crate::db::connector::DbConnection;
use crate::db::executor::{self, StatementExecutor};
use crate::db::pool::{DbLease, DbPool};
use crate::error::{DbError, DbResult};
use crate::models::{QueryRequest, QueryResult, TransactionState};
use futures_util::future::BoxFuture;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// An open transaction on a dedicated connection.
pub struct TransactionHandle {
    id: String,
    lease: Option<DbLease>,
    executor: StatementExecutor,
    state: TransactionState,
    savepoints: u32,
    started_at: Instant,
}

impl TransactionHandle {
    /// Start a transaction on the leased connection.
    pub async fn begin(mut lease: DbLease, executor: StatementExecutor) -> DbResult<Self> {
        let timeout = executor.settings().statement_timeout;
        run_control(&mut lease, "BEGIN", timeout).await?;

        let id = generate_transaction_id();
        debug!(transaction_id = %id, "Transaction started");
        Ok(Self {
            id,
            lease: Some(lease),
            executor,
            state: TransactionState::Active,
            savepoints: 0,
            started_at: Instant::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Run one statement inside the transaction.
    pub async fn execute(
        &mut self,
        request: &QueryRequest,
        ctx: &RequestContext,
    ) -> DbResult<QueryResult> {
        self.ensure_active("execute")?;
        let timeout = self.executor.settings().statement_timeout;
        let savepoint = format!("stmt_{}", self.savepoints);
        self.savepoints += 1;

        let lease = self.lease_mut()?;
        if let Err(e) = run_control(lease, &format!("SAVEPOINT {}", savepoint), timeout).await {
            return Err(self.give_up(e).await);
        }

        let executor = self.executor.clone();
        let lease = self.lease_mut()?;
        let result = executor.run(lease, request, ctx).await;
        match result {
            Ok(result) => {
                let release = format!("RELEASE SAVEPOINT {}", savepoint);
                match run_control(lease, &release, timeout).await {
                    Ok(()) => Ok(result),
                    Err(e) => Err(self.give_up(e).await),
                }
            }
            Err(e) if lease.is_broken() => Err(self.fail(e)),
            Err(e) => {
                let undo = format!("ROLLBACK TO SAVEPOINT {}", savepoint);
                match run_control(lease, &undo, timeout).await {
                    Ok(()) => {
                        debug!(
                            transaction_id = %self.id,
                            error = %e,
                            "Statement failed; transaction still active"
                        );
                        Err(e)
                    }
                    Err(undo_err) => {
                        self.give_up(undo_err).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Commit and release the connection.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_active("commit")?;
        let timeout = self.executor.settings().statement_timeout;
        let lease = self.lease_mut()?;

        match run_control(lease, "COMMIT", timeout).await {
            Ok(()) => {
                self.state = TransactionState::Committed;
                info!(
                    transaction_id = %self.id,
                    statements = self.savepoints,
                    elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                    "Transaction committed"
                );
                self.lease = None;
                Ok(())
            }
            Err(e) => {
                // A refused COMMIT can leave the transaction open (SQLite busy).
                if !lease.is_broken() && run_control(lease, "ROLLBACK", timeout).await.is_err() {
                    lease.mark_broken();
                }
                self.finish_rolled_back("commit failed", &e);
                Err(e)
            }
        }
    }

    /// Roll back and release the connection.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_active("rollback")?;
        let timeout = self.executor.settings().statement_timeout;
        let lease = self.lease_mut()?;

        let result = run_control(lease, "ROLLBACK", timeout).await;
        if result.is_err() {
            lease.mark_broken();
        }
        self.state = TransactionState::RolledBack;
        info!(
            event = "transaction_rolled_back",
            transaction_id = %self.id,
            reason = "requested",
            statements = self.savepoints,
            "Transaction rolled back"
        );
        self.lease = None;
        result
    }

    fn ensure_active(&self, operation: &str) -> DbResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(DbError::invalid_transaction_state(operation, self.state))
        }
    }

    fn lease_mut(&mut self) -> DbResult<&mut DbLease> {
        self.lease
            .as_mut()
            .ok_or_else(|| DbError::invalid_transaction_state("use", self.state))
    }

    /// A transaction-control statement failed. A connection that is still
    /// usable gets an explicit ROLLBACK and is released, and the error keeps
    /// its kind. Otherwise the connection is discarded.
    async fn give_up(&mut self, error: DbError) -> DbError {
        let timeout = self.executor.settings().statement_timeout;
        match self.lease.as_mut() {
            Some(lease) if !lease.is_broken() => {
                if run_control(lease, "ROLLBACK", timeout).await.is_err() {
                    lease.mark_broken();
                }
                self.finish_rolled_back("transaction control failed", &error);
                error
            }
            _ => self.fail(error),
        }
    }

    /// The connection can no longer be trusted: give up on the transaction
    /// and discard it. The server rolls back when the session ends.
    fn fail(&mut self, error: DbError) -> DbError {
        if let Some(lease) = self.lease.as_mut() {
            lease.mark_broken();
        }
        self.finish_rolled_back("connection unusable", &error);
        match error {
            DbError::QueryTimeout { .. } | DbError::Cancelled | DbError::ConnectionLost { .. } => {
                error
            }
            other => DbError::connection_lost(other.to_string()),
        }
    }

    fn finish_rolled_back(&mut self, reason: &str, error: &DbError) {
        self.state = TransactionState::RolledBack;
        warn!(
            event = "transaction_rolled_back",
            transaction_id = %self.id,
            reason,
            error = %error,
            statements = self.savepoints,
            "Transaction rolled back"
        );
        self.lease = None;
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("statements", &self.savepoints)
            .finish()
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if !self.state.is_active() {
            return;
        }
        self.state = TransactionState::RolledBack;
        let Some(mut lease) = self.lease.take() else {
            return;
        };
        warn!(
            event = "transaction_rolled_back",
            transaction_id = %self.id,
            reason = "handle dropped while active",
            "Transaction rolled back"
        );

        // A statement still running means the session is in an unknown
        // state; the lease discards it on drop.
        if lease.is_in_flight() {
            return;
        }
        let timeout = self.executor.settings().statement_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if run_control(&mut lease, "ROLLBACK", timeout).await.is_err() {
                        lease.mark_broken();
                    }
                });
            }
            Err(_) => lease.mark_broken(),
        }
    }
}

/// Run a transaction-control statement (no parameters, no rows).
async fn run_control(lease: &mut DbLease, sql: &str, timeout: Duration) -> DbResult<()> {
    use sqlx::Executor;

    lease.set_in_flight(true);
    let outcome = {
        let conn = lease.connection_mut()?;
        let work = async {
            match conn {
                DbConnection::Postgres { conn, .. } => (&mut *conn).execute(sql).await.map(|_| ()),
                DbConnection::SQLite { conn, .. } => (&mut *conn).execute(sql).await.map(|_| ()),
            }
        };
        tokio::time::timeout(timeout, work).await
    };

    match outcome {
        Ok(result) => {
            lease.set_in_flight(false);
            result.map_err(|e| {
                let e = DbError::from(e);
                if e.is_connection_fatal() {
                    lease.mark_broken();
                }
                e
            })
        }
        Err(_) => {
            warn!(
                event = "query_timeout",
                sql,
                timeout_ms = timeout.as_millis() as u64,
                "Transaction control statement exceeded its deadline; cancelling"
            );
            executor::abort(lease);
            Err(DbError::query_timeout(timeout))
        }
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Opens transactions on pooled connections.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    pool: DbPool,
    executor: StatementExecutor,
}

impl TransactionCoordinator {
    pub fn new(pool: DbPool, executor: StatementExecutor) -> Self {
        Self { pool, executor }
    }

    /// Lease a connection and begin a transaction on it.
    pub async fn begin(&self, ctx: &RequestContext) -> DbResult<TransactionHandle> {
        let lease = self.pool.acquire_with(ctx).await?;
        TransactionHandle::begin(lease, self.executor.clone()).await
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn run<R, F>(&self, ctx: &RequestContext, f: F) -> DbResult<R>
    where
        F: for<'t> FnOnce(&'t mut TransactionHandle) -> BoxFuture<'t, DbResult<R>>,
    {
        let mut tx = self.begin(ctx).await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if tx.state().is_active() {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(
                            transaction_id = %tx.id(),
                            error = %rollback_err,
                            "Rollback after failure did not complete"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Run `statements` in order as one transaction.
    ///
    /// Fail-fast: the first failing statement rolls back the whole batch and
    /// its error names the statement index (0-based). Nothing is partially
    /// applied.
    pub async fn execute_batch(
        &self,
        ctx: &RequestContext,
        statements: &[QueryRequest],
    ) -> DbResult<Vec<QueryResult>> {
        let mut tx = self.begin(ctx).await?;
        let mut results = Vec::with_capacity(statements.len());

        for (index, statement) in statements.iter().enumerate() {
            match tx.execute(statement, ctx).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    if tx.state().is_active() {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(
                                transaction_id = %tx.id(),
                                error = %rollback_err,
                                "Rollback of failed batch did not complete"
                            );
                        }
                    }
                    return Err(e.at_statement(index));
                }
            }
        }

        tx.commit().await?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connector::DbConnector;
    use crate::db::pool::{ConnectionPool, PoolSettings};
    use crate::models::ConnectionConfig;

    fn memory_pool() -> DbPool {
        let config = ConnectionConfig::new("sqlite::memory:", Duration::from_secs(5)).unwrap();
        ConnectionPool::new(DbConnector::new(&config).unwrap(), PoolSettings::new(1, 1)).unwrap()
    }

    async fn open_transaction() -> (DbPool, TransactionHandle) {
        let pool = memory_pool();
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let tx = TransactionHandle::begin(lease, StatementExecutor::default())
            .await
            .unwrap();
        (pool, tx)
    }

    #[tokio::test]
    async fn test_abandoned_control_statement_discards_connection() {
        use futures_util::FutureExt;

        let pool = memory_pool();
        let mut lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        // Polled once, then dropped while the worker still runs BEGIN.
        let abandoned = run_control(&mut lease, "BEGIN", Duration::from_secs(5)).now_or_never();
        assert!(abandoned.is_none());
        assert!(lease.is_in_flight());
        drop(lease);

        let status = pool.status();
        assert_eq!(status.acquired, status.released);
        assert_eq!(status.discarded, 1);
        assert_eq!(status.idle, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_discards_connection() {
        let (pool, mut tx) = open_transaction().await;
        let err = tx.fail(DbError::connection_lost("socket closed"));
        assert_eq!(err.kind(), "connection_lost");
        assert_eq!(tx.state(), TransactionState::RolledBack);

        let status = pool.status();
        assert_eq!(status.acquired, status.released);
        assert_eq!(status.discarded, 1);
    }

    #[tokio::test]
    async fn test_control_failure_on_usable_connection_rolls_back_and_releases() {
        let (pool, mut tx) = open_transaction().await;
        let err = tx
            .give_up(DbError::database("savepoint refused", None, "retry"))
            .await;
        assert_eq!(err.kind(), "database_error");
        assert_eq!(tx.state(), TransactionState::RolledBack);

        let status = pool.status();
        assert_eq!(status.acquired, status.released);
        assert_eq!(status.discarded, 0);
        assert_eq!(status.idle, 1);

        // The released connection is out of the transaction.
        let mut tx = TransactionHandle::begin(
            pool.acquire(Duration::from_secs(1)).await.unwrap(),
            StatementExecutor::default(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[test]
    fn test_generate_transaction_id() {
        let id1 = generate_transaction_id();
        let id2 = generate_transaction_id();
        assert!(id1.starts_with("tx_"));
        assert_ne!(id1, id2);
    }
}
