//! SQL statement analysis.
//!
//! Classifies a statement into the [`AccessKind`] it needs and lists the
//! objects and functions it touches, so the policy engine can authorize each
//! of them. The kind is the strongest one found anywhere in the tree: a
//! `DELETE` inside a CTE makes the whole statement a write, `SELECT ... INTO`
//! needs DDL and server functions such as `pg_read_file` need admin.
//!
//! Uses [sqlparser](https://docs.rs/sqlparser/) with the dialect of the
//! connected database. Anything the parser cannot read is rejected rather
//! than guessed at, and exactly one statement is accepted per request.

use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use crate::security::policy::AccessKind;
use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, Visit, Visitor};
use sqlparser::dialect::{Dialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::ops::ControlFlow;

/// Server functions that act on the server rather than on data.
const ADMIN_FUNCTIONS: &[&str] = &[
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "pg_promote",
    "pg_switch_wal",
    "set_config",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "lo_import",
    "lo_export",
    "dblink",
    "dblink_exec",
    "load_extension",
];

/// What a single statement does and which objects it reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementAnalysis {
    pub kind: AccessKind,
    /// Statement keyword for messages, e.g. `SELECT` or `DROP`
    pub operation: &'static str,
    /// Object names as written, deduplicated in first-seen order
    pub objects: Vec<String>,
    /// Called function names as written, deduplicated
    pub functions: Vec<String>,
}

fn dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Parse and classify exactly one statement.
pub fn analyze(sql: &str, db_type: DatabaseType) -> DbResult<StatementAnalysis> {
    let dialect = dialect(db_type);
    let mut statements = Parser::parse_sql(dialect.as_ref(), sql)
        .map_err(|e| DbError::invalid_input(format!("Failed to parse SQL statement: {}", e)))?;

    let statement = match statements.len() {
        0 => return Err(DbError::invalid_input("Empty SQL statement")),
        1 => statements.remove(0),
        n => {
            return Err(DbError::invalid_input(format!(
                "Expected exactly one SQL statement, found {}. \
                 Use execute_transaction to run several statements.",
                n
            )));
        }
    };

    let mut collector = Collector::default();
    let _ = statement.visit(&mut collector);
    Ok(collector.finish(&statement))
}

/// Walks every node of a statement. Nested statements (data-modifying CTEs,
/// the target of EXPLAIN) count toward the required kind.
#[derive(Default)]
struct Collector {
    strongest: Option<(AccessKind, &'static str)>,
    objects: Vec<String>,
    functions: Vec<String>,
    creates_table: bool,
}

impl Collector {
    fn raise(&mut self, kind: AccessKind, operation: &'static str) {
        if self.strongest.is_none_or(|(current, _)| kind > current) {
            self.strongest = Some((kind, operation));
        }
    }

    fn finish(mut self, statement: &Statement) -> StatementAnalysis {
        if self.creates_table {
            self.raise(AccessKind::Ddl, "SELECT INTO");
        }
        if self.functions.iter().any(|f| is_admin_function(f)) {
            self.raise(AccessKind::Admin, "ADMIN FUNCTION");
        }
        let (kind, operation) = self.strongest.unwrap_or_else(|| classify(statement));
        StatementAnalysis {
            kind,
            operation,
            objects: self.objects,
            functions: self.functions,
        }
    }
}

impl Visitor for Collector {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<()> {
        let (kind, operation) = classify(statement);
        self.raise(kind, operation);
        // DROP targets are not reliably visited as relations.
        if let Statement::Drop { names, .. } = statement {
            for name in names {
                push_unique(&mut self.objects, name);
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<()> {
        push_unique(&mut self.objects, relation);
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if let Some(target) = select_into(&query.body) {
            self.creates_table = true;
            push_unique(&mut self.objects, target);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let Expr::Function(function) = expr {
            push_unique(&mut self.functions, &function.name);
        }
        ControlFlow::Continue(())
    }
}

fn push_unique(names: &mut Vec<String>, name: &ObjectName) {
    let name = name.to_string();
    if !names.contains(&name) {
        names.push(name);
    }
}

/// Target of `SELECT ... INTO table`, which creates that table.
fn select_into(body: &SetExpr) -> Option<&ObjectName> {
    match body {
        SetExpr::Select(select) => select.into.as_ref().map(|into| &into.name),
        SetExpr::Query(query) => select_into(&query.body),
        SetExpr::SetOperation { left, right, .. } => {
            select_into(left).or_else(|| select_into(right))
        }
        _ => None,
    }
}

/// True for server functions that need the admin kind, in any schema.
pub fn is_admin_function(name: &str) -> bool {
    let unquoted: String = name.chars().filter(|c| *c != '"').collect();
    let base = unquoted.rsplit('.').next().unwrap_or_default().to_lowercase();
    ADMIN_FUNCTIONS.contains(&base.as_str())
}

/// Map a parsed statement to the access kind it requires.
fn classify(statement: &Statement) -> (AccessKind, &'static str) {
    use AccessKind::*;

    match statement {
        Statement::Query(_) => (Read, "SELECT"),
        Statement::ShowTables { .. } => (Read, "SHOW TABLES"),
        Statement::ShowColumns { .. } => (Read, "SHOW COLUMNS"),
        Statement::ShowVariable { .. } => (Read, "SHOW"),
        Statement::ExplainTable { .. } => (Read, "EXPLAIN TABLE"),
        // EXPLAIN ANALYZE runs the inner statement.
        Statement::Explain { statement, .. } => {
            let (kind, _) = classify(statement);
            (kind, "EXPLAIN")
        }

        Statement::Insert(_) => (Write, "INSERT"),
        Statement::Update { .. } => (Write, "UPDATE"),
        Statement::Delete(_) => (Write, "DELETE"),
        Statement::Merge { .. } => (Write, "MERGE"),
        Statement::Copy { .. } => (Write, "COPY"),

        Statement::CreateTable { .. } => (Ddl, "CREATE TABLE"),
        Statement::CreateView { .. } => (Ddl, "CREATE VIEW"),
        Statement::CreateIndex(_) => (Ddl, "CREATE INDEX"),
        Statement::CreateSchema { .. } => (Ddl, "CREATE SCHEMA"),
        Statement::CreateSequence { .. } => (Ddl, "CREATE SEQUENCE"),
        Statement::CreateType { .. } => (Ddl, "CREATE TYPE"),
        Statement::CreateFunction { .. } => (Ddl, "CREATE FUNCTION"),
        Statement::CreateTrigger { .. } => (Ddl, "CREATE TRIGGER"),
        Statement::CreateVirtualTable { .. } => (Ddl, "CREATE VIRTUAL TABLE"),
        Statement::AlterTable { .. } => (Ddl, "ALTER TABLE"),
        Statement::AlterView { .. } => (Ddl, "ALTER VIEW"),
        Statement::AlterIndex { .. } => (Ddl, "ALTER INDEX"),
        Statement::AlterType { .. } => (Ddl, "ALTER TYPE"),
        Statement::Drop { .. } => (Ddl, "DROP"),
        Statement::DropFunction { .. } => (Ddl, "DROP FUNCTION"),
        Statement::DropTrigger { .. } => (Ddl, "DROP TRIGGER"),
        Statement::Truncate { .. } => (Ddl, "TRUNCATE"),
        Statement::Comment { .. } => (Ddl, "COMMENT"),

        // Transaction control would break the per-statement savepoints.
        Statement::StartTransaction { .. } => (Admin, "BEGIN"),
        Statement::Commit { .. } => (Admin, "COMMIT"),
        Statement::Rollback { .. } => (Admin, "ROLLBACK"),
        Statement::Savepoint { .. } => (Admin, "SAVEPOINT"),
        Statement::ReleaseSavepoint { .. } => (Admin, "RELEASE SAVEPOINT"),

        Statement::CreateRole { .. } => (Admin, "CREATE ROLE"),
        Statement::CreateDatabase { .. } => (Admin, "CREATE DATABASE"),
        Statement::CreateExtension { .. } => (Admin, "CREATE EXTENSION"),
        Statement::CreatePolicy { .. } => (Admin, "CREATE POLICY"),
        Statement::AlterRole { .. } => (Admin, "ALTER ROLE"),
        Statement::AlterPolicy { .. } => (Admin, "ALTER POLICY"),
        Statement::DropPolicy { .. } => (Admin, "DROP POLICY"),
        Statement::Grant { .. } => (Admin, "GRANT"),
        Statement::Revoke { .. } => (Admin, "REVOKE"),
        Statement::Set(_) => (Admin, "SET"),
        Statement::Vacuum { .. } => (Admin, "VACUUM"),
        Statement::Analyze { .. } => (Admin, "ANALYZE"),
        Statement::Discard { .. } => (Admin, "DISCARD"),
        Statement::Pragma { .. } => (Admin, "PRAGMA"),
        Statement::AttachDatabase { .. } => (Admin, "ATTACH"),
        Statement::Call { .. } => (Admin, "CALL"),
        Statement::Execute { .. } => (Admin, "EXECUTE"),
        Statement::Prepare { .. } => (Admin, "PREPARE"),
        Statement::Deallocate { .. } => (Admin, "DEALLOCATE"),
        Statement::LISTEN { .. } => (Admin, "LISTEN"),
        Statement::UNLISTEN { .. } => (Admin, "UNLISTEN"),
        Statement::NOTIFY { .. } => (Admin, "NOTIFY"),

        // Unknown statements need the broadest permission.
        _ => (Admin, "UNKNOWN"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PG: DatabaseType = DatabaseType::PostgreSQL;

    #[test]
    fn test_classifies_reads() {
        let a = analyze("SELECT * FROM users u JOIN orders o ON o.user_id = u.id", PG).unwrap();
        assert_eq!(a.kind, AccessKind::Read);
        assert_eq!(a.objects, vec!["users", "orders"]);
    }

    #[test]
    fn test_subqueries_are_visited() {
        let sql = "SELECT name FROM users WHERE id IN (SELECT user_id FROM pg_catalog.pg_shadow)";
        let a = analyze(sql, PG).unwrap();
        assert_eq!(a.kind, AccessKind::Read);
        assert!(a.objects.contains(&"pg_catalog.pg_shadow".to_string()));
    }

    #[test]
    fn test_classifies_writes() {
        for sql in [
            "INSERT INTO users (name) VALUES ($1)",
            "UPDATE users SET name = $1 WHERE id = $2",
            "DELETE FROM users WHERE id = $1",
        ] {
            let a = analyze(sql, PG).unwrap();
            assert_eq!(a.kind, AccessKind::Write, "{sql}");
            assert_eq!(a.objects, vec!["users"], "{sql}");
        }
    }

    #[test]
    fn test_insert_select_reports_both_tables() {
        let a = analyze("INSERT INTO archive SELECT * FROM users", PG).unwrap();
        assert_eq!(a.kind, AccessKind::Write);
        assert!(a.objects.contains(&"archive".to_string()));
        assert!(a.objects.contains(&"users".to_string()));
    }

    #[test]
    fn test_classifies_ddl() {
        let a = analyze("DROP TABLE accounts", PG).unwrap();
        assert_eq!(a.kind, AccessKind::Ddl);
        assert_eq!(a.objects, vec!["accounts"]);

        let a = analyze("CREATE TABLE t (id INT)", PG).unwrap();
        assert_eq!(a.kind, AccessKind::Ddl);
    }

    #[test]
    fn test_classifies_admin() {
        for sql in ["GRANT SELECT ON users TO bob", "COMMIT", "SET search_path TO x"] {
            assert_eq!(analyze(sql, PG).unwrap().kind, AccessKind::Admin, "{sql}");
        }
    }

    #[test]
    fn test_explain_takes_inner_kind() {
        let a = analyze("EXPLAIN ANALYZE DELETE FROM users WHERE id = 1", PG).unwrap();
        assert_eq!(a.kind, AccessKind::Write);
        assert_eq!(analyze("EXPLAIN SELECT 1", PG).unwrap().kind, AccessKind::Read);
    }

    #[test]
    fn test_data_modifying_cte_is_a_write() {
        let sql = "WITH gone AS (DELETE FROM users RETURNING *) SELECT count(*) FROM gone";
        let a = analyze(sql, PG).unwrap();
        assert_eq!(a.kind, AccessKind::Write);
        assert_eq!(a.operation, "DELETE");
        assert!(a.objects.contains(&"users".to_string()));

        let sql = "WITH moved AS (UPDATE users SET name = 'x' RETURNING id) SELECT * FROM moved";
        assert_eq!(analyze(sql, PG).unwrap().kind, AccessKind::Write);

        let sql = "WITH recent AS (SELECT id FROM users) SELECT * FROM recent";
        assert_eq!(analyze(sql, PG).unwrap().kind, AccessKind::Read);
    }

    #[test]
    fn test_select_into_creates_a_table() {
        let a = analyze("SELECT * INTO stolen FROM users", PG).unwrap();
        assert_eq!(a.kind, AccessKind::Ddl);
        assert_eq!(a.operation, "SELECT INTO");
        assert!(a.objects.contains(&"stolen".to_string()));
        assert!(a.objects.contains(&"users".to_string()));

        let a = analyze("SELECT id INTO copy FROM users UNION SELECT id FROM orders", PG).unwrap();
        assert_eq!(a.kind, AccessKind::Ddl);
    }

    #[test]
    fn test_server_functions_need_admin() {
        for sql in [
            "SELECT pg_read_file('/etc/passwd')",
            "SELECT pg_terminate_backend(1234)",
            "SELECT name FROM users WHERE pg_catalog.set_config('role', 'admin', false) = ''",
        ] {
            let a = analyze(sql, PG).unwrap();
            assert_eq!(a.kind, AccessKind::Admin, "{sql}");
        }

        let a = analyze("SELECT count(*), lower(name) FROM users", PG).unwrap();
        assert_eq!(a.kind, AccessKind::Read);
        assert_eq!(a.functions, vec!["count", "lower"]);
    }

    #[test]
    fn test_is_admin_function_ignores_schema_and_case() {
        assert!(is_admin_function("PG_READ_FILE"));
        assert!(is_admin_function("pg_catalog.\"pg_ls_dir\""));
        assert!(!is_admin_function("pg_size_pretty"));
        assert!(!is_admin_function("count"));
    }

    #[test]
    fn test_rejects_multiple_statements() {
        let err = analyze("SELECT 1; DROP TABLE x", PG).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(analyze("SELECT 1;", PG).is_ok());
    }

    #[test]
    fn test_rejects_empty_and_garbage() {
        assert!(analyze("", PG).is_err());
        assert!(analyze("SELEKT nothing", PG).is_err());
    }

    #[test]
    fn test_sqlite_placeholders() {
        let a = analyze("SELECT * FROM users WHERE id = ?1", DatabaseType::SQLite).unwrap();
        assert_eq!(a.kind, AccessKind::Read);
        assert_eq!(a.objects, vec!["users"]);
    }
}
