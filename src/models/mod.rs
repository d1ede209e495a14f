//! Data models for the DB MCP Gateway.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{
    ConnectionConfig, ConnectionConfigError, DatabaseType, TlsMode, TransactionState,
};
pub use query::{
    DEFAULT_MAX_QUERY_LENGTH, DEFAULT_MAX_RESULT_ROWS, DEFAULT_QUERY_TIMEOUT_SECS, FetchMode,
    MAX_QUERY_TIMEOUT_SECS, QueryParam, QueryRequest, QueryResult, Row, SqlValue,
};
pub use schema::{ColumnDefinition, TableInfo, TableSchema, TableType};
