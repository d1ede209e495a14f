//! Validation that runs before any statement reaches the database.
//!
//! - `identifier`: whitelist and quoting for table and column names
//! - `sql_analyzer`: statement kind and touched objects
//! - `policy`: allow/deny rules per object and operation kind

pub mod identifier;
pub mod policy;
pub mod sql_analyzer;

pub use identifier::{QualifiedName, quote_identifier, validate_identifier};
pub use policy::{AccessKind, AccessPolicy, DEFAULT_DENY_PATTERNS, DefaultAccess, PolicyConfig};
pub use sql_analyzer::{StatementAnalysis, analyze};
