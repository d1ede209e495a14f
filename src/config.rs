//! Configuration handling for the DB MCP Gateway.
//!
//! Every option is a CLI flag with an `MCP_*` environment fallback. The
//! database is given either as one URL (`--database`, or `DATABASE_URL`) or
//! as discrete PostgreSQL `--db-*` flags. Pool sizing may also ride on the
//! URL query (`?max_connections=4&min_connections=2`); those keys are
//! stripped before the URL reaches the driver.

use crate::db::{ExecutorSettings, PoolSettings};
use crate::models::{
    ConnectionConfig, DEFAULT_MAX_QUERY_LENGTH, DEFAULT_MAX_RESULT_ROWS, DEFAULT_QUERY_TIMEOUT_SECS,
    DatabaseType, TlsMode,
};
use crate::security::{
    AccessKind, AccessPolicy, DEFAULT_DENY_PATTERNS, DefaultAccess, PolicyConfig,
    validate_identifier,
};
use crate::tools::DispatchLimits;
use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DB_PORT: u16 = 5432;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 30;

/// Pool option keys accepted in the URL query string.
const URL_OPTION_KEYS: &[&str] = &["max_connections", "min_connections"];

/// Pool sizing taken from the URL query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlPoolOptions {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
}

/// The database URL after pool options have been removed from it.
#[derive(Debug, Clone)]
pub struct DatabaseTarget {
    /// Contains sensitive data - never log
    pub connection_string: String,
    pub db_type: DatabaseType,
    pub pool_options: UrlPoolOptions,
}

impl DatabaseTarget {
    /// Parse a connection URL, splitting off the pool option keys.
    pub fn parse(s: &str) -> Result<Self, String> {
        let db_type = DatabaseType::from_connection_string(s).ok_or_else(|| {
            "Unsupported database URL: expected postgres://, postgresql:// or sqlite:".to_string()
        })?;

        let mut url = Url::parse(s).map_err(|e| format!("Invalid database URL: {e}"))?;
        let mut opts = extract_options(&mut url, URL_OPTION_KEYS);
        let pool_options = UrlPoolOptions {
            max_connections: parse_count(&mut opts, "max_connections")?,
            min_connections: parse_count(&mut opts, "min_connections")?,
        };

        // Leave URLs without our keys byte-for-byte intact; sqlite paths in
        // particular do not survive re-serialization unchanged.
        let connection_string = if pool_options == UrlPoolOptions::default() {
            s.to_string()
        } else {
            url.to_string()
        };

        Ok(Self {
            connection_string,
            db_type,
            pool_options,
        })
    }
}

fn parse_count(opts: &mut HashMap<String, String>, key: &str) -> Result<Option<u32>, String> {
    opts.remove(key)
        .map(|v| {
            v.parse::<u32>()
                .map_err(|_| format!("{key} in the database URL must be a positive integer"))
        })
        .transpose()
}

/// Extract gateway options from URL query params, keeping others for the driver.
fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            let key_lower = k.to_ascii_lowercase();
            if keys.contains(&key_lower.as_str()) {
                opts.insert(key_lower, v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
    opts
}

/// Configuration for the DB MCP Gateway.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-mcp-gateway",
    about = "MCP gateway exposing one PostgreSQL or SQLite database through pooled, policy-checked tools",
    version
)]
pub struct Config {
    /// Database URL (postgres://... or sqlite:...). Falls back to DATABASE_URL.
    #[arg(short = 'd', long = "database", value_name = "URL", env = "MCP_DATABASE")]
    pub database: Option<String>,

    /// PostgreSQL host, used when no database URL is given
    #[arg(long, env = "MCP_DB_HOST")]
    pub db_host: Option<String>,

    #[arg(long, default_value_t = DEFAULT_DB_PORT, env = "MCP_DB_PORT")]
    pub db_port: u16,

    #[arg(long, env = "MCP_DB_USER")]
    pub db_user: Option<String>,

    #[arg(long, env = "MCP_DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,

    #[arg(long, env = "MCP_DB_NAME")]
    pub db_name: Option<String>,

    /// TLS mode for PostgreSQL (overrides any sslmode in the URL)
    #[arg(long, value_enum, env = "MCP_TLS_MODE")]
    pub tls_mode: Option<TlsMode>,

    /// Connections opened at startup and kept warm
    #[arg(long, env = "MCP_MIN_CONNECTIONS")]
    pub min_connections: Option<u32>,

    /// Upper bound on open connections (default: 10, or 1 for SQLite)
    #[arg(long, env = "MCP_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, env = "MCP_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Seconds to wait for a free connection before failing with pool_exhausted
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS, env = "MCP_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: u64,

    /// Seconds an idle connection is kept above the minimum
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, env = "MCP_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    /// Idle seconds after which a connection is pinged before reuse
    #[arg(long, default_value_t = DEFAULT_STALE_AFTER_SECS, env = "MCP_STALE_AFTER")]
    pub stale_after: u64,

    /// Per-statement timeout in seconds
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS, env = "MCP_QUERY_TIMEOUT")]
    pub query_timeout: u64,

    /// Deadline for a whole tool call in seconds, including the pool wait
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS, env = "MCP_REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    /// Rows returned before a result is truncated
    #[arg(long, default_value_t = DEFAULT_MAX_RESULT_ROWS, env = "MCP_MAX_RESULT_ROWS")]
    pub max_result_rows: usize,

    /// Longest SQL text accepted, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_QUERY_LENGTH, env = "MCP_MAX_QUERY_LENGTH")]
    pub max_query_length: usize,

    /// Object patterns to allow, e.g. "public.*" or "orders"
    #[arg(long, value_name = "PATTERN", env = "MCP_ALLOW", value_delimiter = ',')]
    pub allow: Vec<String>,

    /// Object patterns to deny; deny always wins over allow
    #[arg(
        long,
        value_name = "PATTERN",
        env = "MCP_DENY",
        value_delimiter = ',',
        default_values_t = default_deny_patterns()
    )]
    pub deny: Vec<String>,

    /// Enabled operation kinds
    #[arg(
        long,
        value_enum,
        env = "MCP_OPERATIONS",
        value_delimiter = ',',
        default_values = ["read", "write"]
    )]
    pub operations: Vec<AccessKind>,

    /// Outcome for objects when no allow pattern is configured
    #[arg(long, value_enum, default_value = "allow", env = "MCP_DEFAULT_ACCESS")]
    pub default_access: DefaultAccess,

    /// Schema for unqualified names (default: public, or main for SQLite)
    #[arg(long, env = "MCP_DEFAULT_SCHEMA")]
    pub default_schema: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "MCP_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Resolve the database target from `--database`, `DATABASE_URL` or the `--db-*` flags.
    pub fn database_target(&self) -> Result<DatabaseTarget, String> {
        self.database_target_with(std::env::var("DATABASE_URL").ok())
    }

    fn database_target_with(&self, env_url: Option<String>) -> Result<DatabaseTarget, String> {
        if let Some(url) = self.database.as_deref().filter(|s| !s.is_empty()) {
            return DatabaseTarget::parse(url);
        }
        if let Some(host) = self.db_host.as_deref() {
            return DatabaseTarget::parse(&self.discrete_url(host)?);
        }
        if let Some(url) = env_url.filter(|s| !s.is_empty()) {
            return DatabaseTarget::parse(&url);
        }
        Err(
            "No database configured: pass --database <URL> (or set MCP_DATABASE / DATABASE_URL), \
             or --db-host with --db-name"
                .to_string(),
        )
    }

    fn discrete_url(&self, host: &str) -> Result<String, String> {
        let name = self
            .db_name
            .as_deref()
            .ok_or_else(|| "--db-name is required with --db-host".to_string())?;

        let mut url = Url::parse(&format!("postgres://{}:{}", host, self.db_port))
            .map_err(|e| format!("Invalid --db-host: {e}"))?;
        if let Some(user) = self.db_user.as_deref() {
            url.set_username(user)
                .map_err(|_| "Invalid --db-user".to_string())?;
        }
        if let Some(password) = self.db_password.as_deref() {
            url.set_password(Some(password))
                .map_err(|_| "Invalid --db-password".to_string())?;
        }
        url.set_path(name);
        Ok(url.to_string())
    }

    /// Build the per-connection configuration.
    pub fn connection_config(&self, target: &DatabaseTarget) -> Result<ConnectionConfig, String> {
        let config = ConnectionConfig::new(
            target.connection_string.clone(),
            Duration::from_secs(self.connect_timeout),
        )
        .map_err(|e| e.to_string())?;
        Ok(match self.tls_mode {
            Some(mode) => config.with_tls_mode(mode),
            None => config,
        })
    }

    /// Pool settings; CLI flags take precedence over URL query keys.
    pub fn pool_settings(&self, target: &DatabaseTarget) -> Result<PoolSettings, String> {
        let default_max = match target.db_type {
            DatabaseType::SQLite => DEFAULT_MAX_CONNECTIONS_SQLITE,
            DatabaseType::PostgreSQL => DEFAULT_MAX_CONNECTIONS,
        };
        let max_size = self
            .max_connections
            .or(target.pool_options.max_connections)
            .unwrap_or(default_max);
        let min_size = self
            .min_connections
            .or(target.pool_options.min_connections)
            .unwrap_or(DEFAULT_MIN_CONNECTIONS.min(max_size));

        let settings = PoolSettings::new(min_size, max_size)
            .with_acquire_timeout(Duration::from_secs(self.acquire_timeout))
            .with_idle_timeout(Duration::from_secs(self.idle_timeout))
            .with_stale_after(Duration::from_secs(self.stale_after));
        settings.validate()?;
        Ok(settings)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            statement_timeout: Duration::from_secs(self.query_timeout),
            max_result_rows: self.max_result_rows,
        }
    }

    /// Compile the access policy for the resolved database.
    pub fn access_policy(&self, db_type: DatabaseType) -> Result<AccessPolicy, String> {
        let default_schema = match self.default_schema.as_deref() {
            Some(schema) => validate_identifier(schema)
                .map_err(|e| format!("--default-schema: {e}"))?
                .to_string(),
            None => db_type.default_schema().to_string(),
        };
        AccessPolicy::new(PolicyConfig {
            allow: non_empty(&self.allow),
            deny: non_empty(&self.deny),
            enabled_kinds: self.operations.clone(),
            default_access: self.default_access,
            default_schema,
        })
        .map_err(|e| e.to_string())
    }

    pub fn dispatch_limits(&self) -> DispatchLimits {
        DispatchLimits {
            max_query_length: self.max_query_length,
        }
    }

    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Validate the whole configuration without touching the database.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("query_timeout", self.query_timeout),
            ("request_timeout", self.request_timeout),
        ] {
            if value == 0 {
                return Err(format!("{} must be greater than 0", name));
            }
        }
        if self.max_result_rows == 0 {
            return Err("max_result_rows must be greater than 0".to_string());
        }
        if self.max_query_length == 0 {
            return Err("max_query_length must be greater than 0".to_string());
        }
        if self.operations.is_empty() {
            return Err("at least one operation kind must be enabled".to_string());
        }

        let target = self.database_target()?;
        self.connection_config(&target)?;
        self.pool_settings(&target)?;
        self.access_policy(target.db_type)?;
        Ok(())
    }
}

fn default_deny_patterns() -> Vec<String> {
    DEFAULT_DENY_PATTERNS.iter().map(|p| p.to_string()).collect()
}

/// `--deny ""` clears the list; drop the empty entry it leaves behind.
fn non_empty(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}
