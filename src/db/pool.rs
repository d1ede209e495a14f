//! Connection pool.
//!
//! A bounded set of physical connections handed out as [`Lease`]s. Capacity is
//! a `tokio::sync::Semaphore` with `max_size` permits, so waiters queue in FIFO
//! order without polling. Idle connections sit in a short-lived
//! `std::sync::Mutex<VecDeque>`; the lock is never held across an `.await`.
//!
//! A lease gives its connection back exactly once, from `Drop`. That covers
//! normal release, `?` propagation, panics and dropped futures alike.

use crate::context::RequestContext;
use crate::db::connector::{Connector, DbConnector};
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use schemars::JsonSchema;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default minimum number of connections.
pub const DEFAULT_MIN_SIZE: u32 = 1;
/// Default maximum number of connections.
pub const DEFAULT_MAX_SIZE: u32 = 10;
/// Default time to wait for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default idle lifetime before a connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
/// Default idle age after which a connection is pinged before reuse.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);
/// Default interval of the idle reaper.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Validated pool sizing and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_size: u32,
    pub max_size: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub stale_after: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

impl PoolSettings {
    pub fn new(min_size: u32, max_size: u32) -> Self {
        Self {
            min_size,
            max_size,
            ..Self::default()
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, after: Duration) -> Self {
        self.stale_after = after;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Check `max >= min >= 1` and that every timeout is non-zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_size == 0 {
            return Err("min_connections must be at least 1".to_string());
        }
        if self.max_size < self.min_size {
            return Err(format!(
                "max_connections ({}) must be >= min_connections ({})",
                self.max_size, self.min_size
            ));
        }
        for (name, value) in [
            ("acquire_timeout", self.acquire_timeout),
            ("idle_timeout", self.idle_timeout),
            ("stale_after", self.stale_after),
            ("reap_interval", self.reap_interval),
        ] {
            if value.is_zero() {
                return Err(format!("{} must be greater than 0", name));
            }
        }
        Ok(())
    }
}

/// Snapshot of pool occupancy and lifetime counters.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PoolStatus {
    pub healthy: bool,
    pub closed: bool,
    /// Live physical connections, idle or leased.
    pub size: u32,
    pub idle: usize,
    pub in_use: u64,
    pub min_size: u32,
    pub max_size: u32,
    pub acquired: u64,
    pub released: u64,
    pub created: u64,
    pub discarded: u64,
    pub exhausted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
}

struct IdleConnection<T> {
    conn: T,
    idle_since: Instant,
}

struct PoolInner<C: Connector> {
    connector: C,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    size: AtomicU32,
    closed: AtomicBool,
    counters: Counters,
}

impl<C: Connector> PoolInner<C> {
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection<C::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a connection, or hand it back if the pool closed in the meantime.
    fn push_idle(&self, conn: C::Connection) -> Result<(), C::Connection> {
        let mut idle = self.lock_idle();
        if self.closed.load(Ordering::Acquire) {
            return Err(conn);
        }
        idle.push_back(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
        Ok(())
    }

    fn forget(&self) {
        self.size.fetch_sub(1, Ordering::AcqRel);
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn in_use(&self) -> u64 {
        let acquired = self.counters.acquired.load(Ordering::Acquire);
        let released = self.counters.released.load(Ordering::Acquire);
        acquired.saturating_sub(released)
    }
}

/// Close a connection that is leaving the pool, off the caller's stack when
/// a runtime is available.
fn discard_detached<C: Connector>(pool: &Arc<PoolInner<C>>, conn: C::Connection, reason: &str) {
    pool.forget();
    warn!(
        event = "connection_discarded",
        reason,
        size = pool.size.load(Ordering::Relaxed),
        "Discarding connection"
    );
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let pool = Arc::clone(pool);
            handle.spawn(async move { pool.connector.close(conn).await });
        }
        Err(_) => drop(conn),
    }
}

/// Holds a connection that has been counted in `size` but not yet handed
/// out, so that a dropped acquire future still accounts for it.
struct Checkout<'a, C: Connector> {
    pool: &'a PoolInner<C>,
    conn: Option<C::Connection>,
}

impl<'a, C: Connector> Checkout<'a, C> {
    fn new(pool: &'a PoolInner<C>, conn: C::Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    fn take(mut self) -> Option<C::Connection> {
        self.conn.take()
    }

    async fn discard(mut self, reason: &str) {
        if let Some(conn) = self.conn.take() {
            self.pool.forget();
            debug!(event = "connection_discarded", reason, "Discarding idle connection");
            self.pool.connector.close(conn).await;
        }
    }
}

impl<C: Connector> Drop for Checkout<'_, C> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.forget();
        }
    }
}

/// Bounded connection pool. Cheap to clone; clones share the same connections.
pub struct ConnectionPool<C: Connector = DbConnector> {
    inner: Arc<PoolInner<C>>,
}

/// The production pool type.
pub type DbPool = ConnectionPool<DbConnector>;
/// The production lease type.
pub type DbLease = Lease<DbConnector>;

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.inner.settings)
            .field("size", &self.inner.size.load(Ordering::Relaxed))
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool. Connections are opened lazily; call
    /// [`initialize`](Self::initialize) to warm `min_size` of them.
    pub fn new(connector: C, settings: PoolSettings) -> DbResult<Self> {
        settings.validate().map_err(DbError::invalid_input)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                permits: Arc::new(Semaphore::new(settings.max_size as usize)),
                settings,
                idle: Mutex::new(VecDeque::new()),
                size: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Open connections until `min_size` are live.
    pub async fn initialize(&self) -> DbResult<()> {
        let inner = &self.inner;
        while inner.size.load(Ordering::Acquire) < inner.settings.min_size {
            let conn = inner.connector.connect().await?;
            inner.size.fetch_add(1, Ordering::AcqRel);
            inner.counters.created.fetch_add(1, Ordering::Relaxed);
            if let Err(conn) = inner.push_idle(conn) {
                inner.forget();
                inner.connector.close(conn).await;
                return Err(DbError::PoolClosed);
            }
        }
        info!(
            min_size = inner.settings.min_size,
            max_size = inner.settings.max_size,
            "Connection pool initialized"
        );
        Ok(())
    }

    /// Lease a connection, waiting at most `timeout` for capacity.
    pub async fn acquire(&self, timeout: Duration) -> DbResult<Lease<C>> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let started = Instant::now();
        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&inner.permits).acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DbError::PoolClosed),
                Err(_) => {
                    inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event = "pool_exhausted",
                        waited_ms = started.elapsed().as_millis() as u64,
                        max_size = inner.settings.max_size,
                        in_use = inner.in_use(),
                        "Timed out waiting for a pooled connection"
                    );
                    return Err(DbError::pool_exhausted(
                        started.elapsed(),
                        inner.settings.max_size,
                    ));
                }
            };

        let conn = self.checkout().await?;
        if self.is_closed() {
            inner.forget();
            inner.connector.close(conn).await;
            return Err(DbError::PoolClosed);
        }

        inner.counters.acquired.fetch_add(1, Ordering::AcqRel);
        debug!(
            waited_ms = started.elapsed().as_millis() as u64,
            in_use = inner.in_use(),
            "Connection acquired"
        );
        Ok(Lease {
            conn: Some(conn),
            pool: Arc::clone(inner),
            _permit: permit,
            broken: false,
            in_flight: false,
            acquired_at: Instant::now(),
        })
    }

    /// Lease a connection within the request's deadline, giving up early if
    /// the request is cancelled.
    pub async fn acquire_with(&self, ctx: &RequestContext) -> DbResult<Lease<C>> {
        let timeout = ctx.bound(self.inner.settings.acquire_timeout);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(DbError::Cancelled),
            result = self.acquire(timeout) => result,
        }
    }

    /// Give a lease back. Equivalent to dropping it.
    pub fn release(&self, lease: Lease<C>) {
        drop(lease);
    }

    /// Reuse an idle connection when one is still usable, otherwise open one.
    async fn checkout(&self) -> DbResult<C::Connection> {
        let inner = &*self.inner;
        loop {
            let Some(idle) = inner.lock_idle().pop_back() else {
                break;
            };
            let idle_for = idle.idle_since.elapsed();
            let mut slot = Checkout::new(inner, idle.conn);

            if idle_for >= inner.settings.idle_timeout {
                slot.discard("idle timeout").await;
                continue;
            }
            if idle_for >= inner.settings.stale_after {
                let probe = match slot.conn.as_mut() {
                    Some(conn) => inner.connector.ping(conn).await,
                    None => continue,
                };
                if let Err(e) = probe {
                    warn!(
                        event = "connection_discarded",
                        reason = "failed liveness probe",
                        idle_ms = idle_for.as_millis() as u64,
                        error = %e,
                        "Stale connection failed its probe"
                    );
                    slot.discard("failed liveness probe").await;
                    continue;
                }
            }
            if let Some(conn) = slot.take() {
                return Ok(conn);
            }
        }

        let conn = inner.connector.connect().await?;
        inner.size.fetch_add(1, Ordering::AcqRel);
        inner.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Occupancy and counters without touching the database.
    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let closed = self.is_closed();
        PoolStatus {
            healthy: !closed,
            closed,
            size: inner.size.load(Ordering::Acquire),
            idle: inner.lock_idle().len(),
            in_use: inner.in_use(),
            min_size: inner.settings.min_size,
            max_size: inner.settings.max_size,
            acquired: inner.counters.acquired.load(Ordering::Acquire),
            released: inner.counters.released.load(Ordering::Acquire),
            created: inner.counters.created.load(Ordering::Relaxed),
            discarded: inner.counters.discarded.load(Ordering::Relaxed),
            exhausted: inner.counters.exhausted.load(Ordering::Relaxed),
            probe_latency_ms: None,
            error: None,
        }
    }

    /// Probe one connection and report pool status.
    pub async fn health_check(&self) -> PoolStatus {
        let ctx = RequestContext::new(self.inner.settings.acquire_timeout);
        self.health_check_with(&ctx).await
    }

    /// Ping one connection within the request's deadline. Cancelling the
    /// request abandons the ping and discards that connection.
    pub async fn health_check_with(&self, ctx: &RequestContext) -> PoolStatus {
        if self.is_closed() {
            let mut status = self.status();
            status.error = Some(DbError::PoolClosed.to_string());
            return status;
        }

        let probe = async {
            let mut lease = self.acquire_with(ctx).await?;
            let budget = ctx.bound(self.inner.settings.acquire_timeout);
            let started = Instant::now();
            lease.set_in_flight(true);
            let result = {
                let conn = lease.connection_mut()?;
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => Err(DbError::Cancelled),
                    result = self.inner.connector.ping(conn) => result,
                    _ = tokio::time::sleep(budget) => Err(DbError::query_timeout(budget)),
                }
            };
            match result {
                Ok(()) => {
                    lease.set_in_flight(false);
                    Ok(started.elapsed())
                }
                Err(e) => {
                    lease.mark_broken();
                    Err(e)
                }
            }
        };
        let outcome = probe.await;

        let mut status = self.status();
        match outcome {
            Ok(latency) => status.probe_latency_ms = Some(latency.as_millis() as u64),
            Err(e) => {
                status.healthy = false;
                status.error = Some(e.to_string());
            }
        }
        status
    }

    /// Close idle connections that outlived the idle timeout, keeping
    /// `min_size` alive. Returns the number closed.
    pub async fn reap_idle(&self) -> usize {
        let inner = &self.inner;
        let expired: Vec<C::Connection> = {
            let mut idle = inner.lock_idle();
            let mut live = inner.size.load(Ordering::Acquire);
            let mut expired = Vec::new();
            // Oldest entries sit at the front.
            while live > inner.settings.min_size
                && idle
                    .front()
                    .is_some_and(|c| c.idle_since.elapsed() >= inner.settings.idle_timeout)
            {
                if let Some(entry) = idle.pop_front() {
                    expired.push(entry.conn);
                    live -= 1;
                }
            }
            expired
        };

        let count = expired.len();
        for conn in expired {
            inner.forget();
            inner.connector.close(conn).await;
        }
        if count > 0 {
            debug!(closed = count, "Reaped idle connections");
        }
        count
    }

    /// Run [`reap_idle`](Self::reap_idle) periodically until the pool closes
    /// or every handle to it is dropped.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let weak: Weak<PoolInner<C>> = Arc::downgrade(&self.inner);
        let period = self.inner.settings.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }
                pool.reap_idle().await;
            }
        })
    }

    /// Stop handing out connections and close the idle ones. Leased
    /// connections are closed as their leases end. Safe to call repeatedly.
    pub async fn close(&self) {
        let inner = &self.inner;
        let drained: Vec<IdleConnection<C::Connection>> = {
            let mut idle = inner.lock_idle();
            if inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            inner.permits.close();
            idle.drain(..).collect()
        };

        info!(
            idle_closed = drained.len(),
            in_use = inner.in_use(),
            "Closing connection pool"
        );
        for entry in drained {
            inner.forget();
            inner.connector.close(entry.conn).await;
        }
    }
}

/// Exclusive use of one pooled connection.
///
/// Dropping the lease returns the connection to the pool, unless it was
/// marked broken, a statement was still running on it, or the pool has
/// closed; in those cases the connection is closed instead.
pub struct Lease<C: Connector = DbConnector> {
    conn: Option<C::Connection>,
    pool: Arc<PoolInner<C>>,
    // Dropped after `drop` has parked the connection, so the next waiter
    // finds it idle.
    _permit: OwnedSemaphorePermit,
    broken: bool,
    in_flight: bool,
    acquired_at: Instant,
}

impl<C: Connector> Lease<C> {
    pub fn connection(&self) -> DbResult<&C::Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| DbError::internal("lease no longer holds a connection"))
    }

    pub fn connection_mut(&mut self) -> DbResult<&mut C::Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("lease no longer holds a connection"))
    }

    /// Do not return this connection to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn set_in_flight(&mut self, in_flight: bool) {
        self.in_flight = in_flight;
    }

    /// True while a statement started on this connection has not completed.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// How long this lease has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Mark the connection broken and return a future that asks the server
    /// to abort the running statement.
    pub fn abort_statement(&mut self) -> BoxFuture<'static, DbResult<()>> {
        self.broken = true;
        self.in_flight = false;
        match &self.conn {
            Some(conn) => self.pool.connector.cancel(conn),
            None => Box::pin(std::future::ready(Ok(()))),
        }
    }

    /// Give the connection back now.
    pub fn release(self) {
        drop(self);
    }
}

impl<C: Connector> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("broken", &self.broken)
            .field("in_flight", &self.in_flight)
            .field("held_ms", &(self.held_for().as_millis() as u64))
            .finish()
    }
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = &self.pool;
        pool.counters.released.fetch_add(1, Ordering::AcqRel);

        if self.in_flight {
            // Abandoned mid-statement: the session state is unknown.
            let cancel = pool.connector.cancel(&conn);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = cancel.await {
                        debug!(error = %e, "Cancel of abandoned statement failed");
                    }
                });
            }
            discard_detached(pool, conn, "statement abandoned");
            return;
        }
        if self.broken {
            discard_detached(pool, conn, "marked broken");
            return;
        }
        if let Err(conn) = pool.push_idle(conn) {
            discard_detached(pool, conn, "pool closed");
        }
    }
}
