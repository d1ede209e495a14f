//! Query tools: parameterized, raw and transactional execution.

use crate::context::RequestContext;
use crate::error::{DbError, DbResult};
use crate::models::{FetchMode, MAX_QUERY_TIMEOUT_SECS, QueryParam, QueryRequest, QueryResult};
use crate::security::AccessKind;
use crate::tools::{Dispatcher, Operation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Input for the execute_query tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteQueryInput {
    /// One SQL statement with positional placeholders ($1, $2... or ?1, ?2... on SQLite)
    pub sql: String,
    /// Values bound to the placeholders, in order
    #[serde(default)]
    pub params: Vec<JsonValue>,
    /// Result shape: all (default), one, none or scalar
    #[serde(default)]
    pub fetch_mode: FetchMode,
    /// Maximum rows to return; never above the server limit
    #[serde(default)]
    pub limit: Option<usize>,
    /// Statement timeout in seconds; never above the server limit
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Input for the execute_raw_query tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteRawQueryInput {
    /// One SQL statement without placeholders
    pub sql: String,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// One statement of a transaction batch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatementInput {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<JsonValue>,
    #[serde(default)]
    pub fetch_mode: FetchMode,
}

/// Input for the execute_transaction tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteTransactionInput {
    /// Statements run in order; the first failure rolls back all of them
    pub statements: Vec<StatementInput>,
    /// Timeout per statement in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Result of one statement.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    /// Rows as column -> value maps. Binary values are base64.
    pub rows: Vec<Map<String, JsonValue>>,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// First column of the first row (scalar fetch mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    /// True if the row limit cut the result short
    pub truncated: bool,
    pub elapsed_ms: u64,
}

impl QueryOutput {
    pub fn from_result(result: QueryResult, fetch_mode: FetchMode) -> Self {
        let value = match fetch_mode {
            FetchMode::Scalar => Some(
                result
                    .scalar()
                    .map(|v| v.to_json())
                    .unwrap_or(JsonValue::Null),
            ),
            _ => None,
        };
        let rows: Vec<Map<String, JsonValue>> = match fetch_mode {
            FetchMode::All | FetchMode::One => result
                .rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|(column, v)| (column.to_string(), v.to_json()))
                        .collect()
                })
                .collect(),
            FetchMode::None | FetchMode::Scalar => Vec::new(),
        };

        Self {
            columns: result.columns,
            row_count: rows.len(),
            rows,
            rows_affected: result.rows_affected,
            value,
            truncated: result.truncated,
            elapsed_ms: result.elapsed_ms,
        }
    }
}

/// Result of the execute_transaction tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransactionOutput {
    pub committed: bool,
    pub statement_count: usize,
    /// One entry per statement, in order
    pub results: Vec<QueryOutput>,
    pub elapsed_ms: u64,
}

fn timeout(secs: Option<u64>) -> Option<Duration> {
    secs.map(|s| Duration::from_secs(s.clamp(1, MAX_QUERY_TIMEOUT_SECS)))
}

fn request(
    sql: String,
    params: Vec<JsonValue>,
    fetch_mode: FetchMode,
    limit: Option<usize>,
    timeout_secs: Option<u64>,
) -> QueryRequest {
    let mut request = QueryRequest::new(sql)
        .with_params(params.iter().map(QueryParam::from_json).collect())
        .with_fetch_mode(fetch_mode);
    if let Some(limit) = limit {
        request = request.with_limit(limit);
    }
    if let Some(timeout) = timeout(timeout_secs) {
        request = request.with_timeout(timeout);
    }
    request
}

impl Dispatcher {
    /// Run one parameterized statement, authorized by its own kind.
    pub async fn execute_query(
        &self,
        input: ExecuteQueryInput,
        ctx: &RequestContext,
    ) -> DbResult<QueryOutput> {
        self.check_length(&input.sql)?;
        let analysis = self.policy.authorize_statement(&input.sql, self.db_type)?;

        let fetch_mode = input.fetch_mode;
        let request = request(
            input.sql,
            input.params,
            fetch_mode,
            input.limit,
            input.timeout_secs,
        );
        let result = self.run_single(&request, ctx).await?;
        self.log_completed(Operation::ExecuteQuery, ctx, &result);
        info!(kind = %analysis.kind, statement = analysis.operation, "Query executed");
        Ok(QueryOutput::from_result(result, fetch_mode))
    }

    /// Run one statement with no bound values.
    ///
    /// Goes through the same classification, authorization and row cap as
    /// [`execute_query`](Self::execute_query); every call is logged as raw.
    pub async fn execute_raw_query(
        &self,
        input: ExecuteRawQueryInput,
        ctx: &RequestContext,
    ) -> DbResult<QueryOutput> {
        self.check_length(&input.sql)?;
        let analysis = self.policy.authorize_statement(&input.sql, self.db_type)?;
        warn!(
            request_id = %ctx.request_id(),
            raw = true,
            kind = %analysis.kind,
            statement = analysis.operation,
            "Executing raw query"
        );

        let fetch_mode = input.fetch_mode;
        let request = request(
            input.sql,
            Vec::new(),
            fetch_mode,
            input.limit,
            input.timeout_secs,
        );
        let result = self.run_single(&request, ctx).await?;
        self.log_completed(Operation::ExecuteRawQuery, ctx, &result);
        Ok(QueryOutput::from_result(result, fetch_mode))
    }

    /// Run a batch of statements as one transaction.
    pub async fn execute_transaction(
        &self,
        input: ExecuteTransactionInput,
        ctx: &RequestContext,
    ) -> DbResult<TransactionOutput> {
        self.policy
            .authorize_kind(Operation::ExecuteTransaction.access_kind())?;
        if input.statements.is_empty() {
            return Err(DbError::invalid_input(
                "execute_transaction needs at least one statement",
            ));
        }

        let mut fetch_modes = Vec::with_capacity(input.statements.len());
        let mut requests = Vec::with_capacity(input.statements.len());
        for (index, statement) in input.statements.into_iter().enumerate() {
            self.check_length(&statement.sql)
                .map_err(|e| e.at_statement(index))?;
            let analysis = self
                .policy
                .authorize_statement(&statement.sql, self.db_type)
                .map_err(|e| e.at_statement(index))?;
            if analysis.kind == AccessKind::Admin {
                return Err(DbError::invalid_input(format!(
                    "statement {}: {} cannot run inside a transaction batch",
                    index, analysis.operation
                )));
            }
            fetch_modes.push(statement.fetch_mode);
            requests.push(request(
                statement.sql,
                statement.params,
                statement.fetch_mode,
                None,
                input.timeout_secs,
            ));
        }

        let started = Instant::now();
        let results = self.coordinator.execute_batch(ctx, &requests).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            request_id = %ctx.request_id(),
            operation = %Operation::ExecuteTransaction,
            statements = results.len(),
            elapsed_ms,
            "Transaction committed"
        );

        Ok(TransactionOutput {
            committed: true,
            statement_count: results.len(),
            results: results
                .into_iter()
                .zip(fetch_modes)
                .map(|(result, mode)| QueryOutput::from_result(result, mode))
                .collect(),
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Row, SqlValue};
    use std::sync::Arc;

    fn result() -> QueryResult {
        let columns: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();
        let rows = vec![
            Row::new(
                Arc::clone(&columns),
                vec![SqlValue::Int(1), SqlValue::Text("a".into())],
            ),
            Row::new(
                Arc::clone(&columns),
                vec![SqlValue::Int(2), SqlValue::Text("b".into())],
            ),
        ];
        QueryResult {
            columns: columns.to_vec(),
            row_count: rows.len(),
            rows,
            rows_affected: None,
            elapsed_ms: 3,
            truncated: true,
        }
    }

    #[test]
    fn test_output_all_rows() {
        let out = QueryOutput::from_result(result(), FetchMode::All);
        assert_eq!(out.row_count, 2);
        assert_eq!(out.rows[1]["name"], "b");
        assert!(out.truncated);
        assert!(out.value.is_none());
    }

    #[test]
    fn test_output_scalar() {
        let out = QueryOutput::from_result(result(), FetchMode::Scalar);
        assert_eq!(out.value, Some(serde_json::json!(1)));
        assert!(out.rows.is_empty());

        let out = QueryOutput::from_result(QueryResult::default(), FetchMode::Scalar);
        assert_eq!(out.value, Some(JsonValue::Null));
    }

    #[test]
    fn test_timeout_is_clamped() {
        assert_eq!(timeout(None), None);
        assert_eq!(timeout(Some(0)), Some(Duration::from_secs(1)));
        assert_eq!(
            timeout(Some(10_000)),
            Some(Duration::from_secs(MAX_QUERY_TIMEOUT_SECS))
        );
    }

    #[test]
    fn test_request_binds_params_in_order() {
        let req = request(
            "SELECT $1, $2".into(),
            vec![serde_json::json!("O'Brien"), serde_json::json!(7)],
            FetchMode::One,
            Some(5),
            None,
        );
        assert_eq!(
            req.params,
            vec![QueryParam::Text("O'Brien".into()), QueryParam::Int(7)]
        );
        assert_eq!(req.limit, Some(5));
        assert_eq!(req.fetch_mode, FetchMode::One);
    }
}
