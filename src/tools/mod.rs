//! Tool catalog and dispatcher.
//!
//! The catalog is static: [`Operation`] lists every tool with its name and
//! the access kind it requires. [`Dispatcher`] owns the shared pool,
//! executor, transaction coordinator and policy, and routes a named call to
//! its handler:
//! - `query`: `execute_query`, `execute_raw_query`, `execute_transaction`
//! - `schema`: `list_tables`, `describe_table`
//! - `data`: `insert_data`, `update_data`, `delete_data`
//! - `admin`: `vacuum_table`, `health_check`

pub mod admin;
pub mod data;
pub mod query;
pub mod schema;

use crate::context::RequestContext;
use crate::db::{DbPool, SchemaInspector, StatementExecutor, TransactionCoordinator};
use crate::error::{DbError, DbResult};
use crate::models::{DEFAULT_MAX_QUERY_LENGTH, DatabaseType, QueryRequest, QueryResult};
use crate::security::{AccessKind, AccessPolicy};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

pub use admin::{HealthCheckInput, HealthCheckOutput, VacuumTableInput, VacuumTableOutput};
pub use data::{DeleteDataInput, InsertDataInput, OnConflict, UpdateDataInput, WriteOutput};
pub use query::{
    ExecuteQueryInput, ExecuteRawQueryInput, ExecuteTransactionInput, QueryOutput,
    StatementInput, TransactionOutput,
};
pub use schema::{DescribeTableInput, ListTablesInput, ListTablesOutput};

/// Every operation the server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ExecuteQuery,
    ExecuteRawQuery,
    ExecuteTransaction,
    ListTables,
    DescribeTable,
    InsertData,
    UpdateData,
    DeleteData,
    VacuumTable,
    HealthCheck,
}

impl Operation {
    pub const ALL: [Operation; 10] = [
        Self::ExecuteQuery,
        Self::ExecuteRawQuery,
        Self::ExecuteTransaction,
        Self::ListTables,
        Self::DescribeTable,
        Self::InsertData,
        Self::UpdateData,
        Self::DeleteData,
        Self::VacuumTable,
        Self::HealthCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecuteQuery => "execute_query",
            Self::ExecuteRawQuery => "execute_raw_query",
            Self::ExecuteTransaction => "execute_transaction",
            Self::ListTables => "list_tables",
            Self::DescribeTable => "describe_table",
            Self::InsertData => "insert_data",
            Self::UpdateData => "update_data",
            Self::DeleteData => "delete_data",
            Self::VacuumTable => "vacuum_table",
            Self::HealthCheck => "health_check",
        }
    }

    /// Access kind checked before the handler runs. Query operations are
    /// additionally checked against the kind of the statement they carry.
    pub fn access_kind(&self) -> AccessKind {
        match self {
            Self::ExecuteQuery
            | Self::ExecuteRawQuery
            | Self::ListTables
            | Self::DescribeTable
            | Self::HealthCheck => AccessKind::Read,
            Self::ExecuteTransaction | Self::InsertData | Self::UpdateData | Self::DeleteData => {
                AccessKind::Write
            }
            Self::VacuumTable => AccessKind::Admin,
        }
    }

    fn position(&self) -> usize {
        match self {
            Self::ExecuteQuery => 0,
            Self::ExecuteRawQuery => 1,
            Self::ExecuteTransaction => 2,
            Self::ListTables => 3,
            Self::DescribeTable => 4,
            Self::InsertData => 5,
            Self::UpdateData => 6,
            Self::DeleteData => 7,
            Self::VacuumTable => 8,
            Self::HealthCheck => 9,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = DbError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.name() == name)
            .ok_or_else(|| DbError::unknown_operation(name))
    }
}

/// Check that [`Operation::ALL`] lists every variant once under a unique name.
pub fn validate_registry() -> DbResult<()> {
    let mut names = HashSet::new();
    for (index, op) in Operation::ALL.iter().enumerate() {
        if op.position() != index {
            return Err(DbError::internal(format!(
                "operation registry out of order at {}: {}",
                index, op
            )));
        }
        if !names.insert(op.name()) {
            return Err(DbError::internal(format!(
                "duplicate operation name: {}",
                op.name()
            )));
        }
        if op.name().parse::<Operation>()? != *op {
            return Err(DbError::internal(format!(
                "operation name does not resolve: {}",
                op.name()
            )));
        }
    }
    Ok(())
}

/// Limits applied by the dispatcher before anything reaches the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchLimits {
    pub max_query_length: usize,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
        }
    }
}

/// Routes operations to their handlers over shared database state.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: DbPool,
    executor: StatementExecutor,
    coordinator: TransactionCoordinator,
    inspector: SchemaInspector,
    policy: Arc<AccessPolicy>,
    limits: DispatchLimits,
    db_type: DatabaseType,
}

impl Dispatcher {
    pub fn new(
        pool: DbPool,
        executor: StatementExecutor,
        policy: AccessPolicy,
        limits: DispatchLimits,
    ) -> Self {
        let db_type = pool.connector().db_type();
        Self {
            coordinator: TransactionCoordinator::new(pool.clone(), executor.clone()),
            inspector: SchemaInspector::new(db_type, executor.clone()),
            pool,
            executor,
            policy: Arc::new(policy),
            limits,
            db_type,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Run the operation called `name` with JSON arguments.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Map<String, JsonValue>,
        ctx: &RequestContext,
    ) -> DbResult<JsonValue> {
        let operation: Operation = name.parse()?;
        debug!(request_id = %ctx.request_id(), operation = %operation, "Dispatching");
        let args = JsonValue::Object(arguments);

        match operation {
            Operation::ExecuteQuery => to_json(self.execute_query(parse(args)?, ctx).await?),
            Operation::ExecuteRawQuery => {
                to_json(self.execute_raw_query(parse(args)?, ctx).await?)
            }
            Operation::ExecuteTransaction => {
                to_json(self.execute_transaction(parse(args)?, ctx).await?)
            }
            Operation::ListTables => to_json(self.list_tables(parse(args)?, ctx).await?),
            Operation::DescribeTable => to_json(self.describe_table(parse(args)?, ctx).await?),
            Operation::InsertData => to_json(self.insert_data(parse(args)?, ctx).await?),
            Operation::UpdateData => to_json(self.update_data(parse(args)?, ctx).await?),
            Operation::DeleteData => to_json(self.delete_data(parse(args)?, ctx).await?),
            Operation::VacuumTable => to_json(self.vacuum_table(parse(args)?, ctx).await?),
            Operation::HealthCheck => to_json(self.health_check(parse(args)?, ctx).await?),
        }
    }

    fn check_length(&self, sql: &str) -> DbResult<()> {
        if sql.trim().is_empty() {
            return Err(DbError::invalid_input("SQL must not be empty"));
        }
        if sql.len() > self.limits.max_query_length {
            return Err(DbError::invalid_input(format!(
                "SQL is {} bytes; the limit is {}",
                sql.len(),
                self.limits.max_query_length
            )));
        }
        Ok(())
    }

    /// Lease a connection, run one request and give the connection back.
    async fn run_single(
        &self,
        request: &QueryRequest,
        ctx: &RequestContext,
    ) -> DbResult<QueryResult> {
        let mut lease = self.pool.acquire_with(ctx).await?;
        let result = self.executor.run(&mut lease, request, ctx).await;
        lease.release();
        result
    }

    fn log_completed(&self, operation: Operation, ctx: &RequestContext, result: &QueryResult) {
        info!(
            request_id = %ctx.request_id(),
            operation = %operation,
            rows = result.row_count,
            rows_affected = result.rows_affected.unwrap_or(0),
            elapsed_ms = result.elapsed_ms,
            truncated = result.truncated,
            "Operation completed"
        );
    }
}

fn parse<T: DeserializeOwned>(args: JsonValue) -> DbResult<T> {
    serde_json::from_value(args)
        .map_err(|e| DbError::invalid_input(format!("Invalid arguments: {}", e)))
}

fn to_json<T: Serialize>(output: T) -> DbResult<JsonValue> {
    serde_json::to_value(output).map_err(|e| DbError::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_valid() {
        validate_registry().unwrap();
    }

    #[test]
    fn test_every_operation_resolves_by_name() {
        for op in Operation::ALL {
            assert_eq!(op.name().parse::<Operation>().unwrap(), op);
        }
        let err = "drop_everything".parse::<Operation>().unwrap_err();
        assert_eq!(err.kind(), "unknown_operation");
    }

    #[test]
    fn test_access_kinds() {
        assert_eq!(Operation::ExecuteQuery.access_kind(), AccessKind::Read);
        assert_eq!(Operation::InsertData.access_kind(), AccessKind::Write);
        assert_eq!(Operation::VacuumTable.access_kind(), AccessKind::Admin);
        assert_eq!(Operation::HealthCheck.access_kind(), AccessKind::Read);
    }
}
