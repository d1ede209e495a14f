//! Schema introspection tools: `list_tables` and `describe_table`.

use crate::context::RequestContext;
use crate::error::DbResult;
use crate::models::{TableInfo, TableSchema};
use crate::security::{AccessKind, QualifiedName, validate_identifier};
use crate::tools::{Dispatcher, Operation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Input for the list_tables tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListTablesInput {
    /// Schema to list. Defaults to the configured default schema.
    #[serde(default)]
    pub schema: Option<String>,
}

/// Output from the list_tables tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListTablesOutput {
    pub schema: String,
    pub tables: Vec<TableInfo>,
    pub count: usize,
}

/// Input for the describe_table tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DescribeTableInput {
    /// Table name, optionally schema-qualified (`schema.table`)
    pub table: String,
    /// Schema, when not part of `table`
    #[serde(default)]
    pub schema: Option<String>,
}

impl Dispatcher {
    /// List the tables and views of a schema the caller may read.
    pub async fn list_tables(
        &self,
        input: ListTablesInput,
        ctx: &RequestContext,
    ) -> DbResult<ListTablesOutput> {
        self.policy
            .authorize_kind(Operation::ListTables.access_kind())?;
        let schema = match input.schema.as_deref() {
            Some(schema) => validate_identifier(schema)?.to_string(),
            None => self.policy.default_schema().to_string(),
        };

        let mut lease = self.pool.acquire_with(ctx).await?;
        let tables = self.inspector.list_tables(&mut lease, &schema, ctx).await;
        lease.release();

        // Hidden rather than denied: a listing is not an access attempt.
        let tables: Vec<TableInfo> = tables?
            .into_iter()
            .filter(|t| {
                self.policy
                    .is_allowed(&format!("{}.{}", t.schema, t.name), AccessKind::Read)
            })
            .collect();

        info!(
            request_id = %ctx.request_id(),
            operation = %Operation::ListTables,
            schema = %schema,
            count = tables.len(),
            "Operation completed"
        );
        Ok(ListTablesOutput {
            schema,
            count: tables.len(),
            tables,
        })
    }

    /// Describe the columns of one table.
    pub async fn describe_table(
        &self,
        input: DescribeTableInput,
        ctx: &RequestContext,
    ) -> DbResult<TableSchema> {
        let name = QualifiedName::parse(&input.table)?;
        let schema = match (&input.schema, &name.schema) {
            (Some(schema), _) => validate_identifier(schema)?.to_string(),
            (None, Some(schema)) => schema.clone(),
            (None, None) => self.policy.default_schema().to_string(),
        };
        self.policy.authorize(
            &format!("{}.{}", schema, name.name),
            Operation::DescribeTable.access_kind(),
        )?;

        let mut lease = self.pool.acquire_with(ctx).await?;
        let described = self
            .inspector
            .describe_table(&mut lease, &schema, &name.name, ctx)
            .await;
        lease.release();
        let described = described?;

        info!(
            request_id = %ctx.request_id(),
            operation = %Operation::DescribeTable,
            table = %described.qualified_name(),
            columns = described.columns.len(),
            "Operation completed"
        );
        Ok(described)
    }
}
