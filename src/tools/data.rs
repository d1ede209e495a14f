//! CRUD tools: `insert_data`, `update_data` and `delete_data`.
//!
//! Statements are generated from validated, double-quoted identifiers; every
//! value is bound as a positional parameter.

use crate::context::RequestContext;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, FetchMode, QueryParam, QueryRequest, QueryResult};
use crate::security::{QualifiedName, quote_identifier};
use crate::tools::{Dispatcher, Operation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// What an insert does when it hits a unique constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    /// Fail with a constraint violation
    #[default]
    Error,
    /// Skip the conflicting row
    Ignore,
}

/// Input for the insert_data tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InsertDataInput {
    /// Table name, optionally schema-qualified
    pub table: String,
    /// Column -> value
    pub data: Map<String, JsonValue>,
    /// Columns to return from the inserted row; `*` for all
    #[serde(default)]
    pub returning: Vec<String>,
    #[serde(default)]
    pub on_conflict: OnConflict,
}

/// Input for the update_data tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdateDataInput {
    pub table: String,
    /// Column -> new value
    pub set: Map<String, JsonValue>,
    /// Column -> value equality filter, joined with AND. Must not be empty.
    #[serde(rename = "where")]
    pub filter: Map<String, JsonValue>,
    #[serde(default)]
    pub returning: Vec<String>,
}

/// Input for the delete_data tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeleteDataInput {
    pub table: String,
    /// Column -> value equality filter, joined with AND. Must not be empty.
    #[serde(rename = "where")]
    pub filter: Map<String, JsonValue>,
    #[serde(default)]
    pub returning: Vec<String>,
}

/// Output of the write tools.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WriteOutput {
    pub rows_affected: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub returning: Vec<Map<String, JsonValue>>,
    pub elapsed_ms: u64,
}

impl WriteOutput {
    fn from_result(result: QueryResult) -> Self {
        let returning: Vec<Map<String, JsonValue>> = result
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(column, v)| (column.to_string(), v.to_json()))
                    .collect()
            })
            .collect();
        Self {
            rows_affected: result.rows_affected.unwrap_or(returning.len() as u64),
            returning,
            elapsed_ms: result.elapsed_ms,
        }
    }
}

/// Collects bound values and hands out matching placeholders.
struct Binder {
    db_type: DatabaseType,
    params: Vec<QueryParam>,
}

impl Binder {
    fn new(db_type: DatabaseType) -> Self {
        Self {
            db_type,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: &JsonValue) -> String {
        self.params.push(QueryParam::from_json(value));
        let n = self.params.len();
        match self.db_type {
            DatabaseType::PostgreSQL => format!("${}", n),
            DatabaseType::SQLite => format!("?{}", n),
        }
    }

    fn filter(&mut self, filter: &Map<String, JsonValue>) -> DbResult<String> {
        if filter.is_empty() {
            return Err(DbError::invalid_input(
                "A non-empty 'where' is required; refusing to touch every row",
            ));
        }
        let mut terms = Vec::with_capacity(filter.len());
        for (column, value) in filter {
            let column = quote_identifier(column)?;
            if value.is_null() {
                terms.push(format!("{} IS NULL", column));
            } else {
                terms.push(format!("{} = {}", column, self.bind(value)));
            }
        }
        Ok(terms.join(" AND "))
    }

    fn assignments(&mut self, set: &Map<String, JsonValue>) -> DbResult<String> {
        let mut terms = Vec::with_capacity(set.len());
        for (column, value) in set {
            terms.push(format!("{} = {}", quote_identifier(column)?, self.bind(value)));
        }
        Ok(terms.join(", "))
    }

    fn finish(self, sql: String, returning: &[String]) -> QueryRequest {
        let fetch_mode = if returning.is_empty() {
            FetchMode::None
        } else {
            FetchMode::All
        };
        QueryRequest::new(sql)
            .with_params(self.params)
            .with_fetch_mode(fetch_mode)
    }
}

fn returning_clause(returning: &[String]) -> DbResult<String> {
    if returning.is_empty() {
        return Ok(String::new());
    }
    if returning.iter().any(|c| c == "*") {
        return Ok(" RETURNING *".to_string());
    }
    let columns = returning
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(format!(" RETURNING {}", columns.join(", ")))
}

pub(crate) fn build_insert(
    db_type: DatabaseType,
    table: &QualifiedName,
    data: &Map<String, JsonValue>,
    returning: &[String],
    on_conflict: OnConflict,
) -> DbResult<QueryRequest> {
    if data.is_empty() {
        return Err(DbError::invalid_input("'data' must name at least one column"));
    }
    let mut binder = Binder::new(db_type);
    let mut columns = Vec::with_capacity(data.len());
    let mut values = Vec::with_capacity(data.len());
    for (column, value) in data {
        columns.push(quote_identifier(column)?);
        values.push(binder.bind(value));
    }

    let verb = match (on_conflict, db_type) {
        (OnConflict::Ignore, DatabaseType::SQLite) => "INSERT OR IGNORE INTO",
        _ => "INSERT INTO",
    };
    let conflict = match (on_conflict, db_type) {
        (OnConflict::Ignore, DatabaseType::PostgreSQL) => " ON CONFLICT DO NOTHING",
        _ => "",
    };
    let sql = format!(
        "{} {} ({}) VALUES ({}){}{}",
        verb,
        table.quoted(),
        columns.join(", "),
        values.join(", "),
        conflict,
        returning_clause(returning)?
    );
    Ok(binder.finish(sql, returning))
}

pub(crate) fn build_update(
    db_type: DatabaseType,
    table: &QualifiedName,
    set: &Map<String, JsonValue>,
    filter: &Map<String, JsonValue>,
    returning: &[String],
) -> DbResult<QueryRequest> {
    if set.is_empty() {
        return Err(DbError::invalid_input("'set' must name at least one column"));
    }
    let mut binder = Binder::new(db_type);
    let assignments = binder.assignments(set)?;
    let filter = binder.filter(filter)?;
    let sql = format!(
        "UPDATE {} SET {} WHERE {}{}",
        table.quoted(),
        assignments,
        filter,
        returning_clause(returning)?
    );
    Ok(binder.finish(sql, returning))
}

pub(crate) fn build_delete(
    db_type: DatabaseType,
    table: &QualifiedName,
    filter: &Map<String, JsonValue>,
    returning: &[String],
) -> DbResult<QueryRequest> {
    let mut binder = Binder::new(db_type);
    let filter = binder.filter(filter)?;
    let sql = format!(
        "DELETE FROM {} WHERE {}{}",
        table.quoted(),
        filter,
        returning_clause(returning)?
    );
    Ok(binder.finish(sql, returning))
}

impl Dispatcher {
    fn write_target(&self, operation: Operation, table: &str) -> DbResult<QualifiedName> {
        let name = QualifiedName::parse(table)?;
        self.policy
            .authorize(&name.to_string(), operation.access_kind())?;
        Ok(name)
    }

    async fn run_write(
        &self,
        operation: Operation,
        request: QueryRequest,
        ctx: &RequestContext,
    ) -> DbResult<WriteOutput> {
        let result = self.run_single(&request, ctx).await?;
        self.log_completed(operation, ctx, &result);
        Ok(WriteOutput::from_result(result))
    }

    pub async fn insert_data(
        &self,
        input: InsertDataInput,
        ctx: &RequestContext,
    ) -> DbResult<WriteOutput> {
        let table = self.write_target(Operation::InsertData, &input.table)?;
        let request = build_insert(
            self.db_type,
            &table,
            &input.data,
            &input.returning,
            input.on_conflict,
        )?;
        self.run_write(Operation::InsertData, request, ctx).await
    }

    pub async fn update_data(
        &self,
        input: UpdateDataInput,
        ctx: &RequestContext,
    ) -> DbResult<WriteOutput> {
        let table = self.write_target(Operation::UpdateData, &input.table)?;
        let request = build_update(
            self.db_type,
            &table,
            &input.set,
            &input.filter,
            &input.returning,
        )?;
        self.run_write(Operation::UpdateData, request, ctx).await
    }

    pub async fn delete_data(
        &self,
        input: DeleteDataInput,
        ctx: &RequestContext,
    ) -> DbResult<WriteOutput> {
        let table = self.write_target(Operation::DeleteData, &input.table)?;
        let request = build_delete(self.db_type, &table, &input.filter, &input.returning)?;
        self.run_write(Operation::DeleteData, request, ctx).await
    }
}
