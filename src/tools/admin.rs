//! Maintenance tools: `vacuum_table` and `health_check`.

use crate::context::RequestContext;
use crate::db::PoolStatus;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, FetchMode, QueryRequest};
use crate::security::QualifiedName;
use crate::tools::{Dispatcher, Operation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Input for the vacuum_table tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VacuumTableInput {
    /// Table name, optionally schema-qualified
    pub table: String,
    /// Rewrite the whole table (takes an exclusive lock)
    #[serde(default)]
    pub full: bool,
    /// Update planner statistics afterwards
    #[serde(default)]
    pub analyze: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VacuumTableOutput {
    pub table: String,
    pub full: bool,
    pub analyze: bool,
    pub elapsed_ms: u64,
}

/// Input for the health_check tool. Takes no arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct HealthCheckInput {}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct HealthCheckOutput {
    pub healthy: bool,
    pub database: String,
    pub pool: PoolStatus,
}

pub(crate) fn vacuum_sql(table: &QualifiedName, full: bool, analyze: bool) -> String {
    let mut sql = String::from("VACUUM");
    if full {
        sql.push_str(" FULL");
    }
    if analyze {
        sql.push_str(" ANALYZE");
    }
    sql.push(' ');
    sql.push_str(&table.quoted());
    sql
}

impl Dispatcher {
    /// VACUUM one table. PostgreSQL only.
    pub async fn vacuum_table(
        &self,
        input: VacuumTableInput,
        ctx: &RequestContext,
    ) -> DbResult<VacuumTableOutput> {
        let table = QualifiedName::parse(&input.table)?;
        self.policy
            .authorize(&table.to_string(), Operation::VacuumTable.access_kind())?;
        if self.db_type == DatabaseType::SQLite {
            return Err(DbError::invalid_input(
                "vacuum_table is only supported on PostgreSQL; SQLite vacuums whole files",
            ));
        }

        let request = QueryRequest::new(vacuum_sql(&table, input.full, input.analyze))
            .with_fetch_mode(FetchMode::None);
        let result = self.run_single(&request, ctx).await?;
        self.log_completed(Operation::VacuumTable, ctx, &result);

        Ok(VacuumTableOutput {
            table: table.to_string(),
            full: input.full,
            analyze: input.analyze,
            elapsed_ms: result.elapsed_ms,
        })
    }

    /// Pool status plus a live ping.
    pub async fn health_check(
        &self,
        _input: HealthCheckInput,
        ctx: &RequestContext,
    ) -> DbResult<HealthCheckOutput> {
        self.policy
            .authorize_kind(Operation::HealthCheck.access_kind())?;
        let pool = self.pool.health_check_with(ctx).await;
        info!(
            request_id = %ctx.request_id(),
            operation = %Operation::HealthCheck,
            healthy = pool.healthy,
            "Operation completed"
        );
        Ok(HealthCheckOutput {
            healthy: pool.healthy,
            database: self.db_type.to_string(),
            pool,
        })
    }
}
