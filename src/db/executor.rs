//! Statement execution.
//!
//! Runs one bound statement on a leased connection under a deadline:
//! - parameters are always bound positionally (see `db::params`)
//! - the deadline is the earlier of the request deadline and the statement
//!   timeout; on expiry the statement is abandoned, the server is asked to
//!   cancel it and the connection is discarded
//! - `FetchMode::All` results are streamed and cut at the row cap
//!
//! # Architecture
//!
//! Database-specific fetching lives in the `postgres` and `sqlite`
//! submodules. Both produce driver rows that are normalized through
//! [`DecodeRow`].

use crate::context::RequestContext;
use crate::db::connector::DbConnection;
use crate::db::pool::DbLease;
use crate::db::types::DecodeRow;
use crate::error::{DbError, DbResult};
use crate::models::{
    DEFAULT_MAX_RESULT_ROWS, DEFAULT_QUERY_TIMEOUT_SECS, FetchMode, QueryRequest, QueryResult,
    Row,
};
use futures_util::TryStreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Limits applied to every statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub statement_timeout: Duration,
    pub max_result_rows: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            max_result_rows: DEFAULT_MAX_RESULT_ROWS,
        }
    }
}

/// Runs statements on leased connections.
#[derive(Debug, Clone, Default)]
pub struct StatementExecutor {
    settings: ExecutorSettings,
}

/// Rows fetched by a database-specific submodule, before shaping.
struct Fetched<R> {
    rows: Vec<R>,
    rows_affected: u64,
    truncated: bool,
}

enum Outcome {
    Done(DbResult<QueryResult>),
    TimedOut,
    Cancelled,
}

impl StatementExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Row cap for a request: its own limit, never above the configured maximum.
    pub fn row_cap(&self, request: &QueryRequest) -> usize {
        let max = self.settings.max_result_rows.max(1);
        request.limit.map(|l| l.clamp(1, max)).unwrap_or(max)
    }

    /// Time budget for a request: its own timeout or the configured one,
    /// bounded by the request deadline.
    pub fn budget(&self, request: &QueryRequest, ctx: &RequestContext) -> Duration {
        let timeout = request
            .timeout
            .map(|t| t.min(self.settings.statement_timeout))
            .unwrap_or(self.settings.statement_timeout);
        ctx.bound(timeout)
    }

    /// Run one statement on the leased connection.
    pub async fn run(
        &self,
        lease: &mut DbLease,
        request: &QueryRequest,
        ctx: &RequestContext,
    ) -> DbResult<QueryResult> {
        if ctx.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let budget = self.budget(request, ctx);
        if budget.is_zero() {
            return Err(DbError::query_timeout(budget));
        }

        let cap = self.row_cap(request);
        debug!(
            request_id = %ctx.request_id(),
            sql = %request.sql,
            params = request.params.len(),
            fetch_mode = ?request.fetch_mode,
            timeout_ms = budget.as_millis() as u64,
            "Executing statement"
        );

        lease.set_in_flight(true);
        let outcome = {
            let conn = lease.connection_mut()?;
            tokio::select! {
                biased;
                _ = ctx.cancelled() => Outcome::Cancelled,
                result = execute_on(conn, request, cap) => Outcome::Done(result),
                _ = tokio::time::sleep(budget) => Outcome::TimedOut,
            }
        };

        match outcome {
            Outcome::Done(result) => {
                lease.set_in_flight(false);
                if let Err(e) = &result {
                    if e.is_connection_fatal() {
                        lease.mark_broken();
                    }
                }
                let result = result?;
                if result.truncated {
                    warn!(
                        event = "result_truncated",
                        request_id = %ctx.request_id(),
                        limit = cap,
                        "Result truncated at row cap"
                    );
                }
                Ok(result)
            }
            Outcome::TimedOut => {
                warn!(
                    event = "query_timeout",
                    request_id = %ctx.request_id(),
                    timeout_ms = budget.as_millis() as u64,
                    "Statement exceeded its deadline; cancelling"
                );
                abort(lease);
                Err(DbError::query_timeout(budget))
            }
            Outcome::Cancelled => {
                debug!(request_id = %ctx.request_id(), "Request cancelled mid-statement");
                abort(lease);
                Err(DbError::Cancelled)
            }
        }
    }
}

/// Discard the lease's connection and cancel its statement in the background.
pub(crate) fn abort(lease: &mut DbLease) {
    let cancel = lease.abort_statement();
    tokio::spawn(async move {
        if let Err(e) = cancel.await {
            warn!(error = %e, "Server-side cancel failed");
        }
    });
}

async fn execute_on(
    conn: &mut DbConnection,
    request: &QueryRequest,
    cap: usize,
) -> DbResult<QueryResult> {
    let started = Instant::now();
    match conn {
        DbConnection::Postgres { conn, .. } => {
            let fetched = postgres::fetch(conn, request, cap).await?;
            Ok(shape(fetched, started))
        }
        DbConnection::SQLite { conn, .. } => {
            let fetched = sqlite::fetch(conn, request, cap).await?;
            Ok(shape(fetched, started))
        }
    }
}

fn shape<R: DecodeRow>(fetched: Fetched<R>, started: Instant) -> QueryResult {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let Some(first) = fetched.rows.first() else {
        return QueryResult {
            truncated: fetched.truncated,
            ..QueryResult::affected(fetched.rows_affected, elapsed_ms)
        };
    };

    let columns: Arc<[String]> = first.column_names().into();
    let rows: Vec<Row> = fetched
        .rows
        .iter()
        .map(|r| Row::new(Arc::clone(&columns), r.decode_values()))
        .collect();

    QueryResult {
        columns: columns.to_vec(),
        row_count: rows.len(),
        rows,
        rows_affected: None,
        elapsed_ms,
        truncated: fetched.truncated,
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_all;
    use sqlx::Either;
    use sqlx::postgres::{PgConnection, PgRow};

    pub async fn fetch(
        conn: &mut PgConnection,
        request: &QueryRequest,
        cap: usize,
    ) -> DbResult<Fetched<PgRow>> {
        use sqlx::Executor;

        let query = bind_postgres_all(&request.sql, &request.params);
        match request.fetch_mode {
            FetchMode::None => {
                let done = query.execute(&mut *conn).await?;
                Ok(Fetched {
                    rows: Vec::new(),
                    rows_affected: done.rows_affected(),
                    truncated: false,
                })
            }
            FetchMode::One | FetchMode::Scalar => {
                let row = query.fetch_optional(&mut *conn).await?;
                Ok(Fetched {
                    rows: row.into_iter().collect(),
                    rows_affected: 0,
                    truncated: false,
                })
            }
            FetchMode::All => {
                let mut stream = (&mut *conn).fetch_many(query);
                let mut fetched = Fetched {
                    rows: Vec::new(),
                    rows_affected: 0,
                    truncated: false,
                };
                while let Some(item) = stream.try_next().await? {
                    match item {
                        Either::Left(done) => fetched.rows_affected += done.rows_affected(),
                        Either::Right(_) if fetched.rows.len() == cap => {
                            fetched.truncated = true;
                            break;
                        }
                        Either::Right(row) => fetched.rows.push(row),
                    }
                }
                Ok(fetched)
            }
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_all;
    use sqlx::Either;
    use sqlx::sqlite::{SqliteConnection, SqliteRow};

    pub async fn fetch(
        conn: &mut SqliteConnection,
        request: &QueryRequest,
        cap: usize,
    ) -> DbResult<Fetched<SqliteRow>> {
        use sqlx::Executor;

        let query = bind_sqlite_all(&request.sql, &request.params);
        match request.fetch_mode {
            FetchMode::None => {
                let done = query.execute(&mut *conn).await?;
                Ok(Fetched {
                    rows: Vec::new(),
                    rows_affected: done.rows_affected(),
                    truncated: false,
                })
            }
            FetchMode::One | FetchMode::Scalar => {
                let row = query.fetch_optional(&mut *conn).await?;
                Ok(Fetched {
                    rows: row.into_iter().collect(),
                    rows_affected: 0,
                    truncated: false,
                })
            }
            FetchMode::All => {
                let mut stream = (&mut *conn).fetch_many(query);
                let mut fetched = Fetched {
                    rows: Vec::new(),
                    rows_affected: 0,
                    truncated: false,
                };
                while let Some(item) = stream.try_next().await? {
                    match item {
                        Either::Left(done) => fetched.rows_affected += done.rows_affected(),
                        Either::Right(_) if fetched.rows.len() == cap => {
                            fetched.truncated = true;
                            break;
                        }
                        Either::Right(row) => fetched.rows.push(row),
                    }
                }
                Ok(fetched)
            }
        }
    }
}
