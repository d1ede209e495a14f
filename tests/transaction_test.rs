//! Integration tests for transactions and result limits against a SQLite file.

use db_mcp_gateway::context::RequestContext;
use db_mcp_gateway::db::{
    ConnectionPool, DbConnector, DbPool, ExecutorSettings, PoolSettings, StatementExecutor,
    TransactionCoordinator,
};
use db_mcp_gateway::error::DbError;
use db_mcp_gateway::models::{
    ConnectionConfig, DatabaseType, FetchMode, QueryRequest, TransactionState,
};
use db_mcp_gateway::security::AccessPolicy;
use db_mcp_gateway::tools::{DispatchLimits, Dispatcher};
use futures_util::FutureExt;
use serde_json::{Map, Value as JsonValue, json};
use std::time::Duration;
use tempfile::TempDir;

const MAX_ROWS: usize = 5;

struct TestDb {
    dispatcher: Dispatcher,
    coordinator: TransactionCoordinator,
    pool: DbPool,
    _dir: TempDir,
}

fn ctx() -> RequestContext {
    RequestContext::new(Duration::from_secs(10))
}

fn args(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("arguments must be an object, got {other}"),
    }
}

async fn setup() -> TestDb {
    setup_with_timeout(Duration::from_secs(5)).await
}

async fn setup_with_timeout(statement_timeout: Duration) -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("tx.db").display());
    let config = ConnectionConfig::new(url, Duration::from_secs(5)).unwrap();
    let pool = ConnectionPool::new(
        DbConnector::new(&config).unwrap(),
        PoolSettings::new(1, 2).with_acquire_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    pool.initialize().await.unwrap();

    let executor = StatementExecutor::new(ExecutorSettings {
        statement_timeout,
        max_result_rows: MAX_ROWS,
    });
    let dispatcher = Dispatcher::new(
        pool.clone(),
        executor.clone(),
        AccessPolicy::permissive(DatabaseType::SQLite),
        DispatchLimits::default(),
    );

    dispatcher
        .dispatch(
            "execute_query",
            args(json!({
                "sql": "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER NOT NULL)"
            })),
            &ctx(),
        )
        .await
        .unwrap();

    TestDb {
        coordinator: TransactionCoordinator::new(pool.clone(), executor),
        dispatcher,
        pool,
        _dir: dir,
    }
}

async fn count_accounts(db: &TestDb) -> i64 {
    let out = db
        .dispatcher
        .dispatch(
            "execute_query",
            args(json!({"sql": "SELECT COUNT(*) FROM accounts", "fetch_mode": "scalar"})),
            &ctx(),
        )
        .await
        .unwrap();
    out["value"].as_i64().unwrap()
}

#[tokio::test]
async fn test_batch_commits_all_statements() {
    let db = setup().await;
    let out = db
        .dispatcher
        .dispatch(
            "execute_transaction",
            args(json!({
                "statements": [
                    {"sql": "INSERT INTO accounts (id, owner, balance) VALUES (?1, ?2, ?3)", "params": [1, "alice", 100]},
                    {"sql": "INSERT INTO accounts (id, owner, balance) VALUES (?1, ?2, ?3)", "params": [2, "bob", 50]},
                    {"sql": "UPDATE accounts SET balance = balance - 30 WHERE id = ?1", "params": [1]}
                ]
            })),
            &ctx(),
        )
        .await
        .unwrap();

    assert_eq!(out["committed"], true);
    assert_eq!(out["statement_count"], 3);
    assert_eq!(out["results"][2]["rows_affected"], 1);
    assert_eq!(count_accounts(&db).await, 2);
}

#[tokio::test]
async fn test_failed_second_statement_rolls_back_the_first() {
    let db = setup().await;
    let err = db
        .dispatcher
        .dispatch(
            "execute_transaction",
            args(json!({
                "statements": [
                    {"sql": "INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 100)"},
                    {"sql": "INSERT INTO accounts (id, owner, balance) VALUES (1, 'mallory', 0)"}
                ]
            })),
            &ctx(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "constraint_violation");
    assert!(err.to_string().contains("statement 1"), "{err}");
    assert_eq!(count_accounts(&db).await, 0);

    let status = db.pool.status();
    assert_eq!(status.acquired, status.released);
}

#[tokio::test]
async fn test_batch_rejects_admin_statements_before_running() {
    let db = setup().await;
    let err = db
        .dispatcher
        .dispatch(
            "execute_transaction",
            args(json!({
                "statements": [
                    {"sql": "INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 100)"},
                    {"sql": "PRAGMA journal_mode = WAL"}
                ]
            })),
            &ctx(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert_eq!(count_accounts(&db).await, 0);
}

#[tokio::test]
async fn test_double_commit_is_invalid() {
    let db = setup().await;
    let mut tx = db.coordinator.begin(&ctx()).await.unwrap();
    tx.execute(
        &QueryRequest::new("INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 1)")
            .with_fetch_mode(FetchMode::None),
        &ctx(),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::InvalidTransactionState { .. }), "{err}");
    let err = tx.rollback().await.unwrap_err();
    assert!(matches!(err, DbError::InvalidTransactionState { .. }));
    let err = tx
        .execute(&QueryRequest::new("SELECT 1"), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidTransactionState { .. }));

    assert_eq!(count_accounts(&db).await, 1);
}

#[tokio::test]
async fn test_rollback_discards_changes() {
    let db = setup().await;
    let mut tx = db.coordinator.begin(&ctx()).await.unwrap();
    tx.execute(
        &QueryRequest::new("INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 1)"),
        &ctx(),
    )
    .await
    .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(count_accounts(&db).await, 0);
    assert!(matches!(
        tx.commit().await,
        Err(DbError::InvalidTransactionState { .. })
    ));
}

#[tokio::test]
async fn test_failed_statement_keeps_transaction_usable() {
    let db = setup().await;
    let mut tx = db.coordinator.begin(&ctx()).await.unwrap();
    tx.execute(
        &QueryRequest::new("INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 1)"),
        &ctx(),
    )
    .await
    .unwrap();

    let err = tx
        .execute(
            &QueryRequest::new("INSERT INTO accounts (id, owner, balance) VALUES (1, 'dup', 1)"),
            &ctx(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "constraint_violation");
    assert!(tx.state().is_active());

    tx.commit().await.unwrap();
    assert_eq!(count_accounts(&db).await, 1);
}

#[tokio::test]
async fn test_scoped_transaction_commits_or_rolls_back() {
    let db = setup().await;

    let inserted = db
        .coordinator
        .run(&ctx(), |tx| {
            async move {
                let request = QueryRequest::new(
                    "INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 10)",
                )
                .with_fetch_mode(FetchMode::None);
                let result = tx.execute(&request, &ctx()).await?;
                Ok(result.rows_affected.unwrap_or(0))
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let err = db
        .coordinator
        .run(&ctx(), |tx| {
            async move {
                let request = QueryRequest::new(
                    "INSERT INTO accounts (id, owner, balance) VALUES (2, 'bob', 10)",
                );
                tx.execute(&request, &ctx()).await?;
                Err::<(), _>(DbError::invalid_input("abort"))
            }
            .boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert_eq!(count_accounts(&db).await, 1);

    let status = db.pool.status();
    assert_eq!(status.acquired, status.released);
}

/// Never finishes on its own; only an interrupt stops it.
const ENDLESS: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                       SELECT count(*) FROM c WHERE x > (SELECT COUNT(*) FROM accounts)";

async fn wait_for_leases(pool: &DbPool) {
    for _ in 0..50 {
        let status = pool.status();
        if status.acquired == status.released {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_sqlite_timeout_interrupts_statement_and_pool_recovers() {
    let db = setup_with_timeout(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    let err = db
        .dispatcher
        .dispatch("execute_query", args(json!({"sql": ENDLESS})), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "query_timeout", "{err}");
    assert!(started.elapsed() < Duration::from_secs(3));

    // A writer would hit "database is locked" if the reader kept running.
    db.dispatcher
        .dispatch(
            "insert_data",
            args(json!({"table": "accounts", "data": {"id": 1, "owner": "alice", "balance": 1}})),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(count_accounts(&db).await, 1);

    wait_for_leases(&db.pool).await;
    let status = db.pool.status();
    assert_eq!(status.acquired, status.released);
    assert!(status.discarded >= 1);
}

#[tokio::test]
async fn test_timeout_inside_transaction_rolls_it_back() {
    let db = setup_with_timeout(Duration::from_millis(300)).await;
    let mut tx = db.coordinator.begin(&ctx()).await.unwrap();
    tx.execute(
        &QueryRequest::new("INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 1)"),
        &ctx(),
    )
    .await
    .unwrap();

    let err = tx
        .execute(&QueryRequest::new(ENDLESS), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "query_timeout", "{err}");
    assert_eq!(tx.state(), TransactionState::RolledBack);

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::InvalidTransactionState { .. }), "{err}");

    wait_for_leases(&db.pool).await;
    assert_eq!(count_accounts(&db).await, 0);
    let status = db.pool.status();
    assert_eq!(status.acquired, status.released);
    assert!(status.discarded >= 1);
}

#[tokio::test]
async fn test_batch_timeout_applies_nothing() {
    let db = setup_with_timeout(Duration::from_millis(300)).await;
    let err = db
        .dispatcher
        .dispatch(
            "execute_transaction",
            args(json!({
                "statements": [
                    {"sql": "INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 100)"},
                    {"sql": ENDLESS}
                ]
            })),
            &ctx(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "query_timeout", "{err}");
    assert!(err.to_string().contains("statement 1"), "{err}");

    wait_for_leases(&db.pool).await;
    assert_eq!(count_accounts(&db).await, 0);
    let status = db.pool.status();
    assert_eq!(status.acquired, status.released);
}

#[tokio::test]
async fn test_failed_savepoint_release_keeps_error_kind() {
    let db = setup().await;
    let mut tx = db.coordinator.begin(&ctx()).await.unwrap();
    tx.execute(
        &QueryRequest::new("INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 1)"),
        &ctx(),
    )
    .await
    .unwrap();

    // Ending the transaction from inside leaves no savepoint to release.
    let err = tx
        .execute(&QueryRequest::new("ROLLBACK"), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "database_error", "{err}");
    assert_eq!(tx.state(), TransactionState::RolledBack);

    wait_for_leases(&db.pool).await;
    assert_eq!(count_accounts(&db).await, 0);
    let status = db.pool.status();
    assert_eq!(status.acquired, status.released);
}

#[tokio::test]
async fn test_dropped_transaction_returns_its_connection() {
    let db = setup().await;
    {
        let mut tx = db.coordinator.begin(&ctx()).await.unwrap();
        tx.execute(
            &QueryRequest::new("INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 1)"),
            &ctx(),
        )
        .await
        .unwrap();
    }

    // The rollback runs in the background; wait for the lease to come home.
    for _ in 0..50 {
        let status = db.pool.status();
        if status.acquired == status.released {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let status = db.pool.status();
    assert_eq!(status.acquired, status.released);
    assert_eq!(count_accounts(&db).await, 0);
}

#[tokio::test]
async fn test_result_truncated_at_row_cap() {
    let db = setup().await;
    for id in 0..(MAX_ROWS as i64 + 3) {
        db.dispatcher
            .dispatch(
                "insert_data",
                args(json!({"table": "accounts", "data": {"id": id, "owner": "o", "balance": 0}})),
                &ctx(),
            )
            .await
            .unwrap();
    }

    let out = db
        .dispatcher
        .dispatch(
            "execute_query",
            args(json!({"sql": "SELECT id FROM accounts ORDER BY id"})),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(out["row_count"], MAX_ROWS);
    assert_eq!(out["truncated"], true);

    let out = db
        .dispatcher
        .dispatch(
            "execute_query",
            args(json!({"sql": "SELECT id FROM accounts ORDER BY id", "limit": 2})),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(out["row_count"], 2);
    assert_eq!(out["truncated"], true);
}

#[tokio::test]
async fn test_result_at_exact_cap_is_not_truncated() {
    let db = setup().await;
    for id in 0..MAX_ROWS as i64 {
        db.dispatcher
            .dispatch(
                "insert_data",
                args(json!({"table": "accounts", "data": {"id": id, "owner": "o", "balance": 0}})),
                &ctx(),
            )
            .await
            .unwrap();
    }

    let out = db
        .dispatcher
        .dispatch(
            "execute_query",
            args(json!({"sql": "SELECT id FROM accounts"})),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(out["row_count"], MAX_ROWS);
    assert_eq!(out["truncated"], false);
}
