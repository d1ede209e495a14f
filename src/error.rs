//! Error types for the DB MCP Gateway.
//!
//! Every failure the core can produce maps to one `DbError` variant. Each
//! variant carries a stable kind tag (see [`DbError::kind`]) and a message that
//! has already been scrubbed of credentials and filesystem paths, so it is safe
//! to hand back to a remote caller.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection pool exhausted: no connection became available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64, max_size: u32 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection failed: {message}")]
    ConnectFailed { message: String, suggestion: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Access denied: {reason}")]
    AccessDenied {
        object: String,
        kind: String,
        reason: String,
    },

    #[error("Query timeout: {detail}")]
    QueryTimeout { detail: String },

    #[error("Constraint violation: {message}")]
    ConstraintViolation {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
    },

    #[error("Syntax error: {message}")]
    SyntaxError {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Invalid transaction state: cannot {operation} a transaction that is {state}")]
    InvalidTransactionState { operation: String, state: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Unknown operation: {name}")]
    UnknownOperation { name: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a pool exhausted error.
    pub fn pool_exhausted(waited: Duration, max_size: u32) -> Self {
        Self::PoolExhausted {
            waited_ms: waited.as_millis() as u64,
            max_size,
        }
    }

    /// Create a connect error with a helpful suggestion.
    pub fn connect_failed(message: impl AsRef<str>, suggestion: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: sanitize_message(message.as_ref()),
            suggestion: suggestion.into(),
        }
    }

    /// Create a connection lost error.
    pub fn connection_lost(message: impl AsRef<str>) -> Self {
        Self::ConnectionLost {
            message: sanitize_message(message.as_ref()),
        }
    }

    /// Create an access denied error.
    pub fn access_denied(
        object: impl Into<String>,
        kind: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::AccessDenied {
            object: object.into(),
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error for a statement that exceeded its deadline.
    pub fn query_timeout(limit: Duration) -> Self {
        Self::QueryTimeout {
            detail: format!("statement exceeded {}ms", limit.as_millis()),
        }
    }

    /// Create a constraint violation error.
    pub fn constraint_violation(message: impl AsRef<str>, sql_state: Option<String>) -> Self {
        Self::ConstraintViolation {
            message: sanitize_message(message.as_ref()),
            sql_state,
        }
    }

    /// Create a syntax error.
    pub fn syntax_error(message: impl AsRef<str>, sql_state: Option<String>) -> Self {
        Self::SyntaxError {
            message: sanitize_message(message.as_ref()),
            sql_state,
        }
    }

    /// Create an invalid transaction state error.
    pub fn invalid_transaction_state(
        operation: impl Into<String>,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransactionState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl AsRef<str>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: sanitize_message(message.as_ref()),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an unknown operation error.
    pub fn unknown_operation(name: impl Into<String>) -> Self {
        Self::UnknownOperation { name: name.into() }
    }

    /// Create an internal error.
    pub fn internal(message: impl AsRef<str>) -> Self {
        Self::Internal {
            message: sanitize_message(message.as_ref()),
        }
    }

    /// Name the failing statement of a batch (0-based) in the error message.
    pub fn at_statement(mut self, index: usize) -> Self {
        match &mut self {
            Self::ConnectionLost { message }
            | Self::ConstraintViolation { message, .. }
            | Self::SyntaxError { message, .. }
            | Self::Database { message, .. }
            | Self::InvalidInput { message }
            | Self::Internal { message } => {
                *message = format!("statement {}: {}", index, message);
            }
            Self::QueryTimeout { detail } => {
                *detail = format!("statement {}: {}", index, detail);
            }
            _ => {}
        }
        self
    }

    /// Stable, machine-readable tag for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::PoolClosed => "pool_closed",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::AccessDenied { .. } => "access_denied",
            Self::QueryTimeout { .. } => "query_timeout",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::SyntaxError { .. } => "syntax_error",
            Self::InvalidTransactionState { .. } => "invalid_transaction_state",
            Self::Database { .. } => "database_error",
            Self::InvalidInput { .. } => "invalid_input",
            Self::UnknownOperation { .. } => "unknown_operation",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectFailed { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => Some("Retry after a short backoff"),
            Self::ConnectionLost { .. } => {
                Some("Retry the whole operation; any open transaction was rolled back")
            }
            Self::QueryTimeout { .. } => {
                Some("Narrow the query or raise the timeout, then retry the operation")
            }
            Self::SyntaxError { .. } => Some("Check the SQL syntax"),
            Self::ConstraintViolation { .. } => {
                Some("Check unique, foreign key, not-null and check constraints")
            }
            _ => None,
        }
    }

    /// Check if the whole operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::ConnectFailed { .. }
                | Self::ConnectionLost { .. }
                | Self::QueryTimeout { .. }
        )
    }

    /// Check if the error means the physical connection can no longer be trusted.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }
}

static URL_CREDENTIALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z][a-z0-9+.\-]*://)[^\s/@]+@").expect("valid credentials regex")
});

static PASSWORD_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(password|passwd|pwd)\s*=\s*('[^']*'|"[^"]*"|\S+)"#)
        .expect("valid password regex")
});

static ABSOLUTE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[\s:=('\x22])(/[\w.\-]+){2,}/?").expect("valid path regex"));

/// Remove credentials and absolute filesystem paths from a message that may
/// end up in front of a remote caller.
pub fn sanitize_message(message: &str) -> String {
    let masked = URL_CREDENTIALS.replace_all(message, "${1}***@");
    let masked = PASSWORD_PAIR.replace_all(&masked, "${1}=***");
    ABSOLUTE_PATH
        .replace_all(&masked, "${1}<path>")
        .into_owned()
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connect_failed(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => classify_database_error(db_err.as_ref()),
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted {
                waited_ms: 0,
                max_size: 0,
            },
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection_lost(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::connect_failed(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => {
                DbError::connection_lost(format!("Protocol error: {}", msg))
            }
            sqlx::Error::WorkerCrashed => DbError::connection_lost("Database worker crashed"),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the column names in the statement",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::internal(format!("Type not found: {}", type_name))
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Map a driver-reported database error onto the taxonomy using the error
/// kind first and the SQLSTATE class second.
fn classify_database_error(db_err: &dyn sqlx::error::DatabaseError) -> DbError {
    use sqlx::error::ErrorKind;

    let code = db_err.code().map(|c| c.to_string());
    let message = db_err.message();

    match db_err.kind() {
        ErrorKind::UniqueViolation
        | ErrorKind::ForeignKeyViolation
        | ErrorKind::NotNullViolation
        | ErrorKind::CheckViolation => return DbError::constraint_violation(message, code),
        _ => {}
    }

    let state = code.clone().unwrap_or_default();
    match state.as_str() {
        c if c.starts_with("23") => DbError::constraint_violation(message, code),
        // SQLITE_CONSTRAINT primary result code
        "19" => DbError::constraint_violation(message, code),
        "42601" => DbError::syntax_error(message, code),
        c if c.starts_with("08") => DbError::connection_lost(message),
        "57014" => DbError::QueryTimeout {
            detail: "statement cancelled by the server".to_string(),
        },
        c if c.starts_with("25") => DbError::database(
            message,
            code,
            "The transaction is in an invalid state; roll it back and retry",
        ),
        _ if message.contains("syntax error") => DbError::syntax_error(message, code),
        _ => DbError::database(message, code, "Check the SQL and referenced objects"),
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Build the error data object: kind tag plus suggestion when available.
fn error_data(err: &DbError) -> Option<serde_json::Value> {
    let mut data = serde_json::json!({ "kind": err.kind() });
    if let Some(suggestion) = err.suggestion() {
        data["suggestion"] = serde_json::Value::String(suggestion.to_string());
    }
    if err.is_retryable() {
        data["retryable"] = serde_json::Value::Bool(true);
    }
    Some(data)
}

/// Convert DbError to MCP ErrorData for semantic error categorization.
impl From<DbError> for rmcp::ErrorData {
    fn from(err: DbError) -> Self {
        let data = error_data(&err);
        match &err {
            // Caller mistakes -> invalid_params
            DbError::AccessDenied { .. }
            | DbError::InvalidInput { .. }
            | DbError::UnknownOperation { .. }
            | DbError::InvalidTransactionState { .. }
            | DbError::ConstraintViolation { .. }
            | DbError::SyntaxError { .. } => rmcp::ErrorData::invalid_params(err.to_string(), data),

            DbError::Database {
                message, sql_state, ..
            } => {
                let msg = match sql_state {
                    Some(code) => format!("Database error: {} (SQLSTATE: {})", message, code),
                    None => err.to_string(),
                };
                rmcp::ErrorData::invalid_params(msg, data)
            }

            // Infrastructure -> internal_error
            DbError::PoolExhausted { .. }
            | DbError::PoolClosed
            | DbError::ConnectFailed { .. }
            | DbError::ConnectionLost { .. }
            | DbError::QueryTimeout { .. }
            | DbError::Cancelled
            | DbError::Internal { .. } => rmcp::ErrorData::internal_error(err.to_string(), data),
        }
    }
}
