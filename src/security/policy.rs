//! Access policy engine.
//!
//! Every object an operation touches is checked in a fixed order:
//! 1. the operation kind must be enabled
//! 2. the name is normalized to lowercase `schema.table`
//! 3. any deny pattern match denies
//! 4. a non-empty allow list must match
//! 5. with no allow list, `default_access` decides
//!
//! Patterns are globs where `*` matches any run of characters, compared
//! case-insensitively. A pattern with a dot matches the full `schema.table`;
//! one without a dot matches the table part in any schema.

use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use crate::security::sql_analyzer::{StatementAnalysis, analyze};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Deny patterns applied unless configuration replaces them.
pub const DEFAULT_DENY_PATTERNS: &[&str] =
    &["pg_catalog.*", "information_schema.*", "pg_*", "sqlite_*"];

/// Category of database access an operation needs, weakest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
    Ddl,
    Admin,
}

impl AccessKind {
    pub const ALL: [AccessKind; 4] = [Self::Read, Self::Write, Self::Ddl, Self::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Ddl => "ddl",
            Self::Admin => "admin",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome for names when no allow pattern is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAccess {
    #[default]
    Allow,
    Deny,
}

/// Inputs for building an [`AccessPolicy`].
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub enabled_kinds: Vec<AccessKind>,
    pub default_access: DefaultAccess,
    /// Schema assumed for unqualified names
    pub default_schema: String,
}

impl PolicyConfig {
    /// Defaults for a database: system catalogs denied, read and write enabled.
    pub fn for_database(db_type: DatabaseType) -> Self {
        Self {
            allow: Vec::new(),
            deny: DEFAULT_DENY_PATTERNS.iter().map(|p| p.to_string()).collect(),
            enabled_kinds: vec![AccessKind::Read, AccessKind::Write],
            default_access: DefaultAccess::Allow,
            default_schema: db_type.default_schema().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    regex: Regex,
    qualified: bool,
}

impl Pattern {
    fn compile(glob: &str) -> DbResult<Self> {
        let glob = glob.trim().to_lowercase();
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("(?i)^{}$", body)).map_err(|e| {
            DbError::invalid_input(format!("Invalid access pattern '{}': {}", glob, e))
        })?;
        Ok(Self {
            qualified: glob.contains('.'),
            source: glob,
            regex,
        })
    }

    fn matches(&self, name: &NormalizedName) -> bool {
        if self.qualified {
            self.regex.is_match(&name.qualified)
        } else {
            self.regex.is_match(name.table())
        }
    }
}

struct Denial {
    object: String,
    rule: String,
    reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NormalizedName {
    qualified: String,
    split: usize,
}

impl NormalizedName {
    fn table(&self) -> &str {
        &self.qualified[self.split + 1..]
    }
}

/// Compiled allow/deny rules plus the enabled operation kinds.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
    enabled: u8,
    default_access: DefaultAccess,
    default_schema: String,
}

impl AccessPolicy {
    pub fn new(config: PolicyConfig) -> DbResult<Self> {
        let compile = |patterns: &[String]| -> DbResult<Vec<Pattern>> {
            patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| Pattern::compile(p))
                .collect()
        };

        Ok(Self {
            allow: compile(&config.allow)?,
            deny: compile(&config.deny)?,
            enabled: config.enabled_kinds.iter().fold(0, |acc, k| acc | k.bit()),
            default_access: config.default_access,
            default_schema: config.default_schema.to_lowercase(),
        })
    }

    /// Policy that allows every kind on every object. Intended for tests
    /// and local tooling.
    pub fn permissive(db_type: DatabaseType) -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            enabled: AccessKind::ALL.iter().fold(0, |acc, k| acc | k.bit()),
            default_access: DefaultAccess::Allow,
            default_schema: db_type.default_schema().to_string(),
        }
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    pub fn is_enabled(&self, kind: AccessKind) -> bool {
        self.enabled & kind.bit() != 0
    }

    /// Kinds currently enabled, in declaration order.
    pub fn enabled_kinds(&self) -> Vec<AccessKind> {
        AccessKind::ALL
            .into_iter()
            .filter(|k| self.is_enabled(*k))
            .collect()
    }

    /// Check only the operation kind, for operations that name no object.
    pub fn authorize_kind(&self, kind: AccessKind) -> DbResult<()> {
        if self.is_enabled(kind) {
            return Ok(());
        }
        Err(deny(
            "*",
            kind,
            &format!("operation:{}", kind),
            format!("{} operations are disabled", kind),
        ))
    }

    /// Authorize `kind` access to `object` (`table` or `schema.table`).
    pub fn authorize(&self, object: &str, kind: AccessKind) -> DbResult<()> {
        match self.evaluate(object, kind) {
            None => Ok(()),
            Some(denial) => Err(deny(&denial.object, kind, &denial.rule, denial.reason)),
        }
    }

    /// Same decision as [`authorize`](Self::authorize) without an audit
    /// event. Used to filter listings.
    pub fn is_allowed(&self, object: &str, kind: AccessKind) -> bool {
        self.evaluate(object, kind).is_none()
    }

    fn evaluate(&self, object: &str, kind: AccessKind) -> Option<Denial> {
        if !self.is_enabled(kind) {
            return Some(Denial {
                object: object.to_string(),
                rule: format!("operation:{}", kind),
                reason: format!("{} operations are disabled", kind),
            });
        }

        let name = self.normalize(object);
        if let Some(rule) = self.deny.iter().find(|p| p.matches(&name)) {
            return Some(Denial {
                reason: format!("'{}' matches deny pattern '{}'", name.qualified, rule.source),
                rule: rule.source.clone(),
                object: name.qualified,
            });
        }

        if !self.allow.is_empty() {
            if self.allow.iter().any(|p| p.matches(&name)) {
                return None;
            }
            return Some(Denial {
                reason: format!("'{}' matches no allow pattern", name.qualified),
                rule: "allow_list".to_string(),
                object: name.qualified,
            });
        }

        match self.default_access {
            DefaultAccess::Allow => None,
            DefaultAccess::Deny => Some(Denial {
                reason: format!("'{}' is not explicitly allowed", name.qualified),
                rule: "default_access".to_string(),
                object: name.qualified,
            }),
        }
    }

    /// Classify `sql` and authorize every object it touches.
    pub fn authorize_statement(
        &self,
        sql: &str,
        db_type: DatabaseType,
    ) -> DbResult<StatementAnalysis> {
        let analysis = analyze(sql, db_type)?;
        self.authorize_kind(analysis.kind)?;
        for object in &analysis.objects {
            self.authorize(object, analysis.kind)?;
        }
        for function in &analysis.functions {
            self.authorize_function(function, analysis.kind)?;
        }
        Ok(analysis)
    }

    /// Check a called function against the deny patterns. The allow list
    /// names relations, so it does not apply here.
    pub fn authorize_function(&self, function: &str, kind: AccessKind) -> DbResult<()> {
        let name = self.normalize(function);
        match self.deny.iter().find(|p| p.matches(&name)) {
            None => Ok(()),
            Some(rule) => Err(deny(
                &name.qualified,
                kind,
                &rule.source,
                format!(
                    "function '{}' matches deny pattern '{}'",
                    name.qualified, rule.source
                ),
            )),
        }
    }

    fn normalize(&self, object: &str) -> NormalizedName {
        let cleaned: String = object
            .chars()
            .filter(|c| !matches!(c, '"' | '`' | '[' | ']'))
            .collect::<String>()
            .trim()
            .to_lowercase();

        // `db.schema.table` keeps only the last two parts.
        let mut parts = cleaned.rsplitn(3, '.');
        let table = parts.next().unwrap_or_default();
        let schema = parts.next().unwrap_or(self.default_schema.as_str());

        NormalizedName {
            qualified: format!("{}.{}", schema, table),
            split: schema.len(),
        }
    }
}

fn deny(object: &str, kind: AccessKind, rule: &str, reason: String) -> DbError {
    warn!(
        target: "audit",
        event = "access_denied",
        object,
        kind = %kind,
        rule,
        "Access denied"
    );
    DbError::access_denied(object, kind.as_str(), reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow: &[&str], deny: &[&str], kinds: &[AccessKind]) -> AccessPolicy {
        AccessPolicy::new(PolicyConfig {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            enabled_kinds: kinds.to_vec(),
            default_access: DefaultAccess::Allow,
            default_schema: "public".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let p = policy(&["*"], &["pg_*"], &[AccessKind::Read]);
        let err = p.authorize("pg_shadow", AccessKind::Read).unwrap_err();
        assert_eq!(err.kind(), "access_denied");
        assert!(p.authorize("users", AccessKind::Read).is_ok());
    }

    #[test]
    fn test_kind_mask_checked_first() {
        let p = policy(&["*"], &[], &[AccessKind::Read]);
        assert!(p.authorize("users", AccessKind::Read).is_ok());
        assert!(p.authorize("users", AccessKind::Write).is_err());
        assert!(p.authorize_kind(AccessKind::Admin).is_err());
    }

    #[test]
    fn test_dotless_pattern_matches_any_schema() {
        let p = policy(&[], &["secret_*"], &[AccessKind::Read]);
        assert!(p.authorize("secret_keys", AccessKind::Read).is_err());
        assert!(p.authorize("audit.secret_keys", AccessKind::Read).is_err());
        assert!(p.authorize("audit.public_keys", AccessKind::Read).is_ok());
    }

    #[test]
    fn test_qualified_pattern_matches_full_name() {
        let p = policy(&["sales.*"], &[], &[AccessKind::Read]);
        assert!(p.authorize("sales.orders", AccessKind::Read).is_ok());
        assert!(p.authorize("orders", AccessKind::Read).is_err());
        assert!(p.authorize("hr.orders", AccessKind::Read).is_err());
    }

    #[test]
    fn test_matching_is_case_insensitive_and_strips_quotes() {
        let p = policy(&[], &["Pg_Catalog.*"], &[AccessKind::Read]);
        assert!(p.authorize("\"PG_CATALOG\".\"pg_class\"", AccessKind::Read).is_err());
        assert!(p.authorize("PG_CATALOG.PG_ROLES", AccessKind::Read).is_err());
    }

    #[test]
    fn test_unqualified_names_use_default_schema() {
        let p = policy(&["public.users"], &[], &[AccessKind::Read]);
        assert!(p.authorize("users", AccessKind::Read).is_ok());
        assert!(p.authorize("Users", AccessKind::Read).is_ok());
        assert!(p.authorize("mydb.public.users", AccessKind::Read).is_ok());
    }

    #[test]
    fn test_default_access_deny() {
        let p = AccessPolicy::new(PolicyConfig {
            default_access: DefaultAccess::Deny,
            ..PolicyConfig::for_database(DatabaseType::PostgreSQL)
        })
        .unwrap();
        assert!(p.authorize("users", AccessKind::Read).is_err());
    }

    #[test]
    fn test_default_config_denies_system_catalogs() {
        let p = AccessPolicy::new(PolicyConfig::for_database(DatabaseType::PostgreSQL)).unwrap();
        assert!(p.authorize("information_schema.tables", AccessKind::Read).is_err());
        assert!(p.authorize("pg_catalog.pg_class", AccessKind::Read).is_err());
        assert!(p.authorize("users", AccessKind::Read).is_ok());
        assert!(p.authorize("users", AccessKind::Ddl).is_err());
    }

    #[test]
    fn test_authorize_statement_checks_every_object() {
        let p = policy(&[], &["salaries"], &[AccessKind::Read]);
        assert!(
            p.authorize_statement("SELECT * FROM users", DatabaseType::PostgreSQL)
                .is_ok()
        );
        let err = p
            .authorize_statement(
                "SELECT * FROM users WHERE id IN (SELECT id FROM salaries)",
                DatabaseType::PostgreSQL,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "access_denied");
        assert!(
            p.authorize_statement("DELETE FROM users WHERE id = 1", DatabaseType::PostgreSQL)
                .is_err()
        );
    }

    #[test]
    fn test_statement_without_objects_checks_kind() {
        let p = policy(&[], &[], &[AccessKind::Read]);
        assert!(p.authorize_statement("SELECT 1", DatabaseType::SQLite).is_ok());
        assert!(p.authorize_statement("VACUUM", DatabaseType::SQLite).is_err());
    }

    #[test]
    fn test_is_allowed_matches_authorize() {
        let p = policy(&[], &["pg_*"], &[AccessKind::Read]);
        assert!(p.is_allowed("users", AccessKind::Read));
        assert!(!p.is_allowed("pg_shadow", AccessKind::Read));
        assert!(!p.is_allowed("users", AccessKind::Write));
    }

    #[test]
    fn test_glob_metacharacters_are_literal() {
        let p = policy(&[], &["a.b+c"], &[AccessKind::Read]);
        assert!(p.authorize("a.b+c", AccessKind::Read).is_err());
        assert!(p.authorize("a.bbc", AccessKind::Read).is_ok());
    }
}
