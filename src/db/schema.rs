//! Schema introspection.
//!
//! Catalog queries run through the [`StatementExecutor`] like any other
//! statement, so they share its deadline, cancellation and row cap. Names are
//! always bound as parameters.
//!
//! # Architecture
//!
//! SQL text lives in the `queries` submodule; database-specific result
//! mapping is in the `postgres` and `sqlite` submodules.

use crate::context::RequestContext;
use crate::db::executor::StatementExecutor;
use crate::db::pool::DbLease;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDefinition, DatabaseType, QueryRequest, Row, SqlValue, TableInfo, TableSchema,
    TableType,
};
use tracing::debug;

/// Schema inspector for database introspection.
#[derive(Debug, Clone)]
pub struct SchemaInspector {
    db_type: DatabaseType,
    executor: StatementExecutor,
}

impl SchemaInspector {
    pub fn new(db_type: DatabaseType, executor: StatementExecutor) -> Self {
        Self { db_type, executor }
    }

    /// List tables and views in `schema`.
    pub async fn list_tables(
        &self,
        lease: &mut DbLease,
        schema: &str,
        ctx: &RequestContext,
    ) -> DbResult<Vec<TableInfo>> {
        let request = match self.db_type {
            DatabaseType::PostgreSQL => {
                QueryRequest::new(queries::postgres::LIST_TABLES).with_param(schema)
            }
            DatabaseType::SQLite => QueryRequest::new(queries::sqlite::list_tables(schema)?),
        };
        let result = self.executor.run(lease, &request, ctx).await?;

        let tables: Vec<TableInfo> = result
            .rows
            .iter()
            .filter_map(|row| {
                let name = text(row, "table_name")?;
                let table_type = text(row, "table_type").unwrap_or_default();
                Some(TableInfo {
                    name,
                    schema: schema.to_string(),
                    table_type: TableType::parse(&table_type),
                })
            })
            .collect();

        debug!(count = tables.len(), schema, db_type = %self.db_type, "Listed tables");
        Ok(tables)
    }

    /// Describe the columns and primary key of `schema.table`.
    pub async fn describe_table(
        &self,
        lease: &mut DbLease,
        schema: &str,
        table: &str,
        ctx: &RequestContext,
    ) -> DbResult<TableSchema> {
        let request = match self.db_type {
            DatabaseType::PostgreSQL => QueryRequest::new(queries::postgres::DESCRIBE_COLUMNS)
                .with_param(table)
                .with_param(schema),
            DatabaseType::SQLite => QueryRequest::new(queries::sqlite::DESCRIBE_COLUMNS)
                .with_param(table)
                .with_param(schema),
        };
        let result = self.executor.run(lease, &request, ctx).await?;

        let columns: Vec<ColumnDefinition> = match self.db_type {
            DatabaseType::PostgreSQL => result.rows.iter().filter_map(postgres::column).collect(),
            DatabaseType::SQLite => result.rows.iter().filter_map(sqlite::column).collect(),
        };
        if columns.is_empty() {
            return Err(DbError::invalid_input(format!(
                "Table '{}.{}' not found",
                schema, table
            )));
        }

        let primary_key = columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect();

        Ok(TableSchema {
            schema: schema.to_string(),
            table_name: table.to_string(),
            columns,
            primary_key,
        })
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(SqlValue::as_str).map(str::to_string)
}

mod queries {
    pub mod postgres {
        pub const LIST_TABLES: &str = r#"
            SELECT t.table_name::text AS table_name, t.table_type::text AS table_type
            FROM information_schema.tables t
            WHERE t.table_schema = $1
            AND t.table_type IN ('BASE TABLE', 'VIEW')
            ORDER BY t.table_name
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT
                c.column_name::text AS column_name,
                format_type(a.atttypid, a.atttypmod) AS column_type,
                c.is_nullable::text AS is_nullable,
                c.column_default::text AS column_default,
                (pk.column_name IS NOT NULL) AS is_primary_key
            FROM information_schema.columns c
            JOIN pg_namespace n ON n.nspname = c.table_schema
            JOIN pg_class t ON t.relname = c.table_name AND t.relnamespace = n.oid
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
            LEFT JOIN (
                SELECT kcu.column_name
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                WHERE tc.table_name = $1
                AND tc.table_schema = $2
                AND tc.constraint_type = 'PRIMARY KEY'
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_name = $1 AND c.table_schema = $2
            ORDER BY c.ordinal_position
            "#;
    }

    pub mod sqlite {
        use crate::error::DbResult;
        use crate::security::identifier::quote_identifier;

        /// The catalog table is per attached schema, so the schema name is
        /// part of the SQL text; it is validated and quoted first.
        pub fn list_tables(schema: &str) -> DbResult<String> {
            Ok(format!(
                "SELECT name AS table_name, type AS table_type FROM {}.sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
                quote_identifier(schema)?
            ))
        }

        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT name, type, "notnull", dflt_value, pk
            FROM pragma_table_info(?1, ?2)
            ORDER BY cid
            "#;
    }
}

mod postgres {
    use super::*;

    pub fn column(row: &Row) -> Option<ColumnDefinition> {
        Some(ColumnDefinition {
            name: text(row, "column_name")?,
            data_type: text(row, "column_type").unwrap_or_default(),
            nullable: text(row, "is_nullable").is_some_and(|v| v == "YES"),
            default_value: text(row, "column_default"),
            is_primary_key: row
                .get("is_primary_key")
                .and_then(SqlValue::as_bool)
                .unwrap_or(false),
        })
    }
}

mod sqlite {
    use super::*;

    pub fn column(row: &Row) -> Option<ColumnDefinition> {
        let flag = |name: &str| row.get(name).and_then(SqlValue::as_i64).unwrap_or(0);
        Some(ColumnDefinition {
            name: text(row, "name")?,
            data_type: text(row, "type").unwrap_or_default(),
            nullable: flag("notnull") == 0,
            default_value: text(row, "dflt_value"),
            is_primary_key: flag("pk") > 0,
        })
    }
}
