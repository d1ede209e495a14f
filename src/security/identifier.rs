//! Structural identifier whitelist.
//!
//! Table and column names cannot be bound as parameters, so every name that
//! ends up in generated SQL text must pass this whitelist first and is then
//! emitted double-quoted.

use crate::error::{DbError, DbResult};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// PostgreSQL's NAMEDATALEN - 1.
pub const MAX_IDENTIFIER_LEN: usize = 63;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

/// Check one unqualified identifier against the whitelist.
pub fn validate_identifier(name: &str) -> DbResult<&str> {
    if name.is_empty() {
        return Err(DbError::invalid_input("Identifier must not be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(DbError::invalid_input(format!(
            "Identifier '{}' is longer than {} bytes",
            truncate_for_display(name),
            MAX_IDENTIFIER_LEN
        )));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(DbError::invalid_input(format!(
            "Invalid identifier '{}': only letters, digits and underscores are allowed, \
             and it must not start with a digit",
            truncate_for_display(name)
        )));
    }
    Ok(name)
}

/// Validate `name` and return it double-quoted.
pub fn quote_identifier(name: &str) -> DbResult<String> {
    validate_identifier(name).map(|n| format!("\"{}\"", n))
}

fn truncate_for_display(name: &str) -> String {
    name.chars().take(MAX_IDENTIFIER_LEN + 1).collect()
}

/// A validated object name with an optional schema prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    /// Parse `table` or `schema.table`.
    pub fn parse(input: &str) -> DbResult<Self> {
        let mut parts = input.split('.');
        let (schema, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => (None, name),
            (Some(schema), Some(name), None) => (Some(validate_identifier(schema)?), name),
            _ => {
                return Err(DbError::invalid_input(format!(
                    "Invalid object name '{}': expected 'table' or 'schema.table'",
                    input
                )));
            }
        };
        Ok(Self {
            schema: schema.map(str::to_string),
            name: validate_identifier(name)?.to_string(),
        })
    }

    /// Schema to use, falling back to `default`.
    pub fn schema_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.schema.as_deref().unwrap_or(default)
    }

    /// Quoted form for generated SQL: `"schema"."name"` or `"name"`.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{}\".\"{}\"", schema, self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        for name in ["users", "_tmp", "Order_Items2", "a"] {
            assert!(validate_identifier(name).is_ok(), "{name}");
        }
        let longest = "a".repeat(MAX_IDENTIFIER_LEN);
        assert!(validate_identifier(&longest).is_ok());
    }

    #[test]
    fn test_rejects_invalid_identifiers() {
        let too_long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        for name in [
            "",
            "1users",
            "users;",
            "users\"",
            "us ers",
            "users--",
            "naïve",
            "x; DROP TABLE y",
            too_long.as_str(),
        ] {
            let err = validate_identifier(name).unwrap_err();
            assert_eq!(err.kind(), "invalid_input", "{name}");
        }
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users").unwrap(), "\"users\"");
        assert!(quote_identifier("a\"b").is_err());
    }

    #[test]
    fn test_parse_qualified_name() {
        let q = QualifiedName::parse("public.users").unwrap();
        assert_eq!(q.schema.as_deref(), Some("public"));
        assert_eq!(q.name, "users");
        assert_eq!(q.quoted(), "\"public\".\"users\"");
        assert_eq!(q.to_string(), "public.users");

        let q = QualifiedName::parse("users").unwrap();
        assert_eq!(q.schema, None);
        assert_eq!(q.schema_or("main"), "main");
        assert_eq!(q.quoted(), "\"users\"");
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        assert!(QualifiedName::parse("a.b.c").is_err());
        assert!(QualifiedName::parse(".users").is_err());
        assert!(QualifiedName::parse("public.").is_err());
        assert!(QualifiedName::parse("public.users; --").is_err());
    }
}
