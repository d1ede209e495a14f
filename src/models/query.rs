//! Query-related data models.
//!
//! This module defines types for SQL query requests and results, including the
//! driver-independent [`SqlValue`] that every result cell is normalized into.

use schemars::JsonSchema;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Default cap on rows materialized by `FetchMode::All`.
pub const DEFAULT_MAX_RESULT_ROWS: usize = 10_000;

/// Default statement timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Maximum statement timeout a caller may request, in seconds.
pub const MAX_QUERY_TIMEOUT_SECS: u64 = 300;

/// Default maximum accepted SQL text length in bytes.
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 10_000;

/// A parameter value for parameterized queries.
///
/// Values are always handed to the driver's positional binding, never
/// formatted into SQL text.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Objects and arrays, bound as JSON
    Json(JsonValue),
}

impl QueryParam {
    /// Convert a decoded JSON argument into a bindable parameter.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Self::Text(s.clone()),
            JsonValue::Array(_) | JsonValue::Object(_) => Self::Json(value.clone()),
        }
    }

    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Caller-selected shape of a query's result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// All rows, up to the configured row cap
    #[default]
    All,
    /// At most one row
    One,
    /// No rows; only the affected row count
    None,
    /// The first column of the first row
    #[serde(alias = "val", alias = "value")]
    Scalar,
}

/// One statement to run: SQL text with positional placeholders plus its bound values.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub fetch_mode: FetchMode,
    /// Per-request row cap; never raises the configured maximum
    pub limit: Option<usize>,
    /// Per-request statement timeout; bounded by the request deadline
    pub timeout: Option<Duration>,
}

impl QueryRequest {
    /// Create a new query request with default options.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            fetch_mode: FetchMode::All,
            limit: None,
            timeout: None,
        }
    }

    /// Add a parameter to this query.
    pub fn with_param(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Replace all parameters.
    pub fn with_params(mut self, params: Vec<QueryParam>) -> Self {
        self.params = params;
        self
    }

    pub fn with_fetch_mode(mut self, fetch_mode: FetchMode) -> Self {
        self.fetch_mode = fetch_mode;
        self
    }

    /// Set the row limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the timeout, clamped to the maximum statement timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.min(Duration::from_secs(MAX_QUERY_TIMEOUT_SECS)));
        self
    }
}

/// A result cell normalized into a driver-independent semantic type.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// ISO 8601 rendering of date, time and timestamp columns
    Timestamp(String),
    Binary(Vec<u8>),
    /// Arrays, records, JSON documents and unrecognized types rendered as text
    Composite(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Semantic type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Timestamp(_) => "timestamp",
            Self::Binary(_) => "binary",
            Self::Composite(_) => "composite",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Timestamp(s) | Self::Composite(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Render as a JSON value (binary as base64).
    pub fn to_json(&self) -> JsonValue {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::Number((*v).into()),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            Self::Text(s) | Self::Timestamp(s) | Self::Composite(s) => {
                JsonValue::String(s.clone())
            }
            Self::Binary(bytes) => JsonValue::String(STANDARD.encode(bytes)),
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// One result row: an ordered column-name to value mapping.
///
/// Column names are shared across all rows of one result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Look up a value by column name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn get_index(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Iterate over (column, value) pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Normalized result of one statement.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Number of rows returned (after truncation)
    pub row_count: usize,
    /// Rows affected by a write, when the driver reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub elapsed_ms: u64,
    /// True when the row cap cut the result short
    pub truncated: bool,
}

impl QueryResult {
    /// Result of a statement that returned no rows.
    pub fn affected(rows_affected: u64, elapsed_ms: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            elapsed_ms,
            ..Self::default()
        }
    }

    /// First column of the first row.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|r| r.get_index(0))
    }
}
