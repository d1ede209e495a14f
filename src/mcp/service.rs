//! MCP service implementation using rmcp.
//!
//! Each tool decodes its typed input, builds a request context from the
//! call's cancellation token and the configured request timeout, and hands
//! off to the [`Dispatcher`].

use crate::context::RequestContext;
use crate::models::TableSchema;
use crate::tools::{
    DeleteDataInput, DescribeTableInput, Dispatcher, ExecuteQueryInput, ExecuteRawQueryInput,
    ExecuteTransactionInput, HealthCheckInput, HealthCheckOutput, InsertDataInput,
    ListTablesInput, ListTablesOutput, QueryOutput, TransactionOutput, UpdateDataInput,
    VacuumTableInput, VacuumTableOutput, WriteOutput,
};
use rmcp::Json;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    service::RequestContext as McpContext,
    tool, tool_handler, tool_router,
};
use std::time::Duration;

#[derive(Clone)]
pub struct DbService {
    dispatcher: Dispatcher,
    /// Deadline for a whole tool call, including waiting for a connection
    request_timeout: Duration,
    tool_router: ToolRouter<Self>,
}

impl DbService {
    pub fn new(dispatcher: Dispatcher, request_timeout: Duration) -> Self {
        Self {
            dispatcher,
            request_timeout,
            tool_router: Self::tool_router(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn context(&self, call: &McpContext<RoleServer>) -> RequestContext {
        RequestContext::with_cancellation(self.request_timeout, call.ct.child_token())
    }
}

#[tool_router]
impl DbService {
    #[tool(
        description = "Execute one parameterized SQL statement.\nBind values through `params` ($1, $2... on PostgreSQL, ?1, ?2... on SQLite); never inline them.\nfetch_mode: all (default), one, none (affected rows only) or scalar.\nThe statement is authorized by its kind (read/write/ddl/admin)."
    )]
    async fn execute_query(
        &self,
        Parameters(input): Parameters<ExecuteQueryInput>,
        call: McpContext<RoleServer>,
    ) -> Result<Json<QueryOutput>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .execute_query(input, &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Execute one SQL statement without bound parameters.\nSame authorization and row limit as execute_query; every call is audited as raw."
    )]
    async fn execute_raw_query(
        &self,
        Parameters(input): Parameters<ExecuteRawQueryInput>,
        call: McpContext<RoleServer>,
    ) -> Result<Json<QueryOutput>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .execute_raw_query(input, &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Run several statements as one transaction.\nStatements run in order on one connection; the first failure rolls back all of them and the error names the failing statement (0-based)."
    )]
    async fn execute_transaction(
        &self,
        Parameters(input): Parameters<ExecuteTransactionInput>,
        call: McpContext<RoleServer>,
    ) -> Result<Json<TransactionOutput>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .execute_transaction(input, &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "List tables and views in a schema.\nDefaults to the configured schema (public on PostgreSQL, main on SQLite). Objects hidden by the access policy are omitted."
    )]
    async fn list_tables(
        &self,
        Parameters(input): Parameters<ListTablesInput>,
        call: McpContext<RoleServer>,
    ) -> Result<Json<ListTablesOutput>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .list_tables(input, &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Describe a table: columns with type, nullability, default and primary-key flag."
    )]
    async fn describe_table(
        &self,
        Parameters(input): Parameters<DescribeTableInput>,
        call: McpContext<RoleServer>,
    ) -> Result<Json<TableSchema>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .describe_table(input, &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Insert one row.\n`data` maps column names to values. on_conflict: error (default) or ignore. `returning` lists columns to return (`*` for all)."
    )]
    async fn insert_data(
        &self,
        Parameters(input): Parameters<InsertDataInput>,
        call: McpContext<RoleServer>,
    ) -> Result<Json<WriteOutput>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .insert_data(input, &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Update rows matching `where` (column equality, joined with AND) with the values in `set`.\n`where` must not be empty."
    )]
    async fn update_data(
        &self,
        Parameters(input): Parameters<UpdateDataInput>,
        call: McpContext<RoleServer>,
    ) -> Result<Json<WriteOutput>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .update_data(input, &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Delete rows matching `where` (column equality, joined with AND).\n`where` must not be empty."
    )]
    async fn delete_data(
        &self,
        Parameters(input): Parameters<DeleteDataInput>,
        call: McpContext<RoleServer>,
    ) -> Result<Json<WriteOutput>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .delete_data(input, &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "VACUUM a table, optionally FULL and/or ANALYZE.\nPostgreSQL only; requires the admin operation kind."
    )]
    async fn vacuum_table(
        &self,
        Parameters(input): Parameters<VacuumTableInput>,
        call: McpContext<RoleServer>,
    ) -> Result<Json<VacuumTableOutput>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .vacuum_table(input, &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(description = "Report connection pool status and ping the database.")]
    async fn health_check(
        &self,
        call: McpContext<RoleServer>,
    ) -> Result<Json<HealthCheckOutput>, McpError> {
        let ctx = self.context(&call);
        self.dispatcher
            .health_check(HealthCheckInput::default(), &ctx)
            .await
            .map(Json)
            .map_err(McpError::from)
    }
}

#[tool_handler]
impl ServerHandler for DbService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "db-mcp-gateway".to_owned(),
                title: Some("DB MCP Gateway".to_owned()),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Tools for one {} database.\n\
                \n\
                ## Rules\n\
                - One statement per call; use `execute_transaction` for several.\n\
                - Always pass values through `params`; identifiers are validated.\n\
                - Allowed operation kinds: {}.\n\
                - System catalogs may be hidden by the access policy.\n\
                \n\
                ## Errors\n\
                Error data carries `kind` and, when useful, a `suggestion`. \
                `pool_exhausted` is worth retrying after a pause; \
                `access_denied` never is.",
                self.dispatcher.db_type(),
                self.dispatcher
                    .policy()
                    .enabled_kinds()
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, DbConnector, PoolSettings, StatementExecutor};
    use crate::models::{ConnectionConfig, DatabaseType};
    use crate::security::AccessPolicy;
    use crate::tools::{DispatchLimits, Operation};

    fn create_test_service() -> DbService {
        let config =
            ConnectionConfig::new("sqlite::memory:", Duration::from_secs(5)).unwrap();
        let connector = DbConnector::new(&config).unwrap();
        let pool = ConnectionPool::new(connector, PoolSettings::new(1, 2)).unwrap();
        let dispatcher = Dispatcher::new(
            pool,
            StatementExecutor::default(),
            AccessPolicy::permissive(DatabaseType::SQLite),
            DispatchLimits::default(),
        );
        DbService::new(dispatcher, Duration::from_secs(30))
    }

    #[test]
    fn test_server_info() {
        let service = create_test_service();
        let info = service.get_info();
        assert_eq!(info.server_info.name, "db-mcp-gateway");
        assert!(info.capabilities.tools.is_some());
        assert!(info.instructions.unwrap().contains("SQLite"));
    }

    #[test]
    fn test_every_operation_is_exposed_as_a_tool() {
        let service = create_test_service();
        let mut tools: Vec<String> = service
            .tool_router
            .list_all()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        tools.sort();
        let mut operations: Vec<String> =
            Operation::ALL.iter().map(|op| op.name().to_string()).collect();
        operations.sort();
        assert_eq!(tools, operations);
    }
}
