//! DB MCP Gateway library.
//!
//! Exposes one PostgreSQL or SQLite database to MCP clients as a fixed set
//! of tools. Every call goes through a bounded connection pool, an access
//! policy and a statement executor with timeouts and row caps.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod mcp;
pub mod models;
pub mod security;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use context::RequestContext;
pub use error::{DbError, DbResult};
pub use mcp::DbService;
pub use tools::{Dispatcher, Operation};
