//! Integration tests for the connection pool, driven by an in-memory connector.
//!
//! The connector hands out plain integers, so these tests exercise only the
//! pool mechanics: capacity, waiting, release accounting and shutdown.

use db_mcp_gateway::context::RequestContext;
use db_mcp_gateway::db::{ConnectionPool, Connector, PoolSettings};
use db_mcp_gateway::error::{DbError, DbResult};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockConnector {
    opened: AtomicUsize,
    closed: AtomicUsize,
    pings: AtomicUsize,
    fail_ping: AtomicBool,
}

impl Connector for MockConnector {
    type Connection = usize;

    async fn connect(&self) -> DbResult<usize> {
        Ok(self.opened.fetch_add(1, Ordering::SeqCst))
    }

    async fn ping(&self, _conn: &mut usize) -> DbResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_ping.load(Ordering::SeqCst) {
            Err(DbError::connection_lost("server went away"))
        } else {
            Ok(())
        }
    }

    async fn close(&self, _conn: usize) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn create_pool(min: u32, max: u32) -> ConnectionPool<MockConnector> {
    ConnectionPool::new(MockConnector::default(), PoolSettings::new(min, max)).unwrap()
}

#[tokio::test]
async fn test_acquire_beyond_max_fails_after_timeout() {
    let pool = create_pool(1, 2);
    let _a = assert_ok!(pool.acquire(Duration::from_secs(1)).await);
    let _b = assert_ok!(pool.acquire(Duration::from_secs(1)).await);

    let started = Instant::now();
    let result = pool.acquire(Duration::from_millis(100)).await;
    let waited = started.elapsed();

    match result {
        Err(DbError::PoolExhausted { max_size, .. }) => assert_eq!(max_size, 2),
        other => panic!("expected PoolExhausted, got {:?}", other.map(|_| ())),
    }
    assert!(waited >= Duration::from_millis(100), "gave up after {:?}", waited);
    assert!(waited < Duration::from_secs(1));

    let status = pool.status();
    assert_eq!(status.exhausted, 1);
    assert_eq!(status.size, 2);
}

#[tokio::test]
async fn test_waiter_is_served_when_a_lease_is_released() {
    let pool = create_pool(1, 1);
    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);

    waiter.await.unwrap().unwrap();
    assert_eq!(pool.status().created, 1);
}

#[tokio::test]
async fn test_third_request_waits_for_a_release() {
    let pool = create_pool(1, 2);
    let hold = Duration::from_millis(100);

    // Each holder's sleep starts after this instant, so the third acquire
    // cannot finish before `hold` has passed.
    let started = Instant::now();
    for _ in 0..2 {
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            drop(lease);
        });
    }

    let third = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let waited = started.elapsed();
    drop(third);

    assert!(waited >= hold, "waited only {:?}", waited);
    assert!(waited <= 2 * hold, "waited {:?}", waited);
    assert!(pool.status().size <= 2);
}

#[tokio::test]
async fn test_counters_balance_after_errors_panics_and_cancellation() {
    let pool = create_pool(1, 3);
    let mut tasks = Vec::new();

    for i in 0..30 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let lease = pool.acquire(Duration::from_secs(5)).await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
            match i % 3 {
                0 => {
                    drop(lease);
                    Ok(())
                }
                1 => Err(DbError::internal("operation failed while holding a lease")),
                _ => panic!("operation panicked while holding a lease"),
            }
        }));
    }

    // Cancelled mid-hold: the future owning the lease is dropped.
    for _ in 0..5 {
        let pool = pool.clone();
        let task = tokio::spawn(async move {
            let _lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.abort();
        let _ = task.await;
    }

    let mut panicked = 0;
    for task in tasks {
        match task.await {
            Ok(_) => {}
            Err(e) if e.is_panic() => panicked += 1,
            Err(e) => panic!("unexpected join error: {e}"),
        }
    }
    assert_eq!(panicked, 10);

    let status = pool.status();
    assert_eq!(status.acquired, status.released);
    assert_eq!(status.in_use, 0);
    assert!(status.size <= 3);
    assert_eq!(status.idle as u32, status.size);

    // Capacity is fully restored.
    let leases = futures_util::future::try_join_all(
        (0..3).map(|_| pool.acquire(Duration::from_millis(200))),
    )
    .await
    .unwrap();
    assert_eq!(leases.len(), 3);
}

#[tokio::test]
async fn test_cancelled_waiter_gives_up_its_place() {
    let pool = create_pool(1, 1);
    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let token = CancellationToken::new();
    let ctx = RequestContext::with_cancellation(Duration::from_secs(5), token.clone());
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_with(&ctx).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(DbError::Cancelled)));

    drop(held);
    let status = pool.status();
    assert_eq!(status.acquired, status.released);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_new_acquires() {
    let pool = create_pool(2, 4);
    pool.initialize().await.unwrap();
    assert_eq!(pool.status().size, 2);

    pool.close().await;
    pool.close().await;

    assert!(pool.is_closed());
    assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.status().size, 0);

    let result = pool.acquire(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(DbError::PoolClosed)));
}

#[tokio::test]
async fn test_close_wakes_waiting_acquirers() {
    let pool = create_pool(1, 1);
    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.close().await;

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(DbError::PoolClosed)));

    drop(held);
    assert_eq!(pool.status().size, 0);
}

#[tokio::test]
async fn test_stale_connection_is_revalidated_before_reuse() {
    let settings = PoolSettings::new(1, 1).with_stale_after(Duration::from_millis(20));
    let pool = ConnectionPool::new(MockConnector::default(), settings).unwrap();
    drop(pool.acquire(Duration::from_secs(1)).await.unwrap());

    // Fresh: reused without a probe.
    drop(pool.acquire(Duration::from_secs(1)).await.unwrap());
    assert_eq!(pool.connector().pings.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(40)).await;
    pool.connector().fail_ping.store(true, Ordering::SeqCst);
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();

    assert_eq!(pool.connector().pings.load(Ordering::SeqCst), 1);
    assert_eq!(*lease.connection().unwrap(), 1, "dead connection must be replaced");
    assert_eq!(pool.status().discarded, 1);
}

#[tokio::test]
async fn test_concurrent_load_never_exceeds_max() {
    let pool = Arc::new(create_pool(1, 4));
    let peak = Arc::new(AtomicUsize::new(0));
    let live = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let peak = Arc::clone(&peak);
            let live = Arc::clone(&live);
            let hold = Duration::from_millis(rand::thread_rng().gen_range(1..=5));
            tokio::spawn(async move {
                let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                live.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert!(pool.connector().opened.load(Ordering::SeqCst) <= 4);
    let status = pool.status();
    assert_eq!(status.acquired, 40);
    assert_eq!(status.released, 40);
}
