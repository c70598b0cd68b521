use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::connection::Connection;
use crate::client::Context;
use crate::errors::{ConnectionError, ConnectionPoolError, QueryError};

/// Delay between reconnect attempts once dialing has been short-circuited.
const DIAL_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Opens ready-to-use connections for a pool.
#[async_trait]
pub(crate) trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Connection, ConnectionError>;
}

#[derive(Clone, Debug)]
pub(crate) struct PoolConfig {
    /// Number of connections that may be leased at once.
    pub(crate) size: usize,
    /// How long `get` waits for a free slot before dialing past the limit.
    pub(crate) timeout: Duration,
    pub(crate) max_idle: usize,
    pub(crate) max_idle_time: Option<Duration>,
    pub(crate) max_lifetime: Option<Duration>,
}

/// Counters of a pool. Each is read atomically; there is no consistency between
/// fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Leases served by an idle connection.
    pub hits: u64,
    /// Leases that had to dial.
    pub misses: u64,
    /// Waits for a free slot that ran out of time.
    pub timeouts: u64,
    /// Idle connections found dead or expired on checkout.
    pub stale_conns: u64,
    /// Open connections, leased or idle.
    pub total_conns: usize,
    pub idle_conns: usize,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Connection>,
    open: usize,
}

struct PoolInner {
    addr: String,
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,

    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale: AtomicU64,

    dial_errors: AtomicUsize,
    last_dial_error: RwLock<Option<ConnectionError>>,
    closed: AtomicBool,
}

/// A bounded set of connections to one server.
///
/// At most `size` connections are leased at a time. Returned connections are
/// kept for reuse and handed out last-in first-out after a liveness check.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.inner.addr)
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    pub(crate) fn new(addr: String, config: PoolConfig, dialer: Arc<dyn Dialer>) -> Self {
        let permits = Arc::new(Semaphore::new(config.size));
        ConnectionPool {
            inner: Arc::new(PoolInner {
                addr,
                config,
                dialer,
                permits,
                state: Mutex::new(PoolState::default()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                stale: AtomicU64::new(0),
                dial_errors: AtomicUsize::new(0),
                last_dial_error: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Leases a connection: an idle one that passes the health check, or a new one.
    ///
    /// Waits for a free slot for at most the pool timeout. After that the wait is
    /// counted as a timeout and an unpooled connection is dialed, which is closed
    /// instead of kept when returned.
    pub(crate) async fn get(&self, ctx: &Context) -> Result<PooledConnection, QueryError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ConnectionPoolError::Closed.into());
        }
        let permit = self.wait_turn(ctx).await?;

        loop {
            let idle = self.inner.lock_state().idle.pop();
            let Some(mut conn) = idle else {
                break;
            };
            if self.inner.is_healthy(&mut conn) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.lease(conn, permit));
            }
            self.inner.discard(conn);
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        // On error the permit is dropped here, which frees the slot.
        let conn = self.inner.dial().await?;
        self.inner.lock_state().open += 1;
        Ok(self.lease(conn, permit))
    }

    fn lease(&self, conn: Connection, permit: Option<OwnedSemaphorePermit>) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            permit,
            pool: self.inner.clone(),
        }
    }

    async fn wait_turn(&self, ctx: &Context) -> Result<Option<OwnedSemaphorePermit>, QueryError> {
        if let Some(err) = ctx.error() {
            return Err(err);
        }
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => return Ok(Some(permit)),
            Err(TryAcquireError::Closed) => return Err(ConnectionPoolError::Closed.into()),
            Err(TryAcquireError::NoPermits) => {}
        }

        tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            permit = self.inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => Err(ConnectionPoolError::Closed.into()),
            },
            _ = tokio::time::sleep(self.inner.config.timeout) => {
                self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "[{}] No free connection within {:?}, dialing past the pool limit",
                    self.inner.addr, self.inner.config.timeout
                );
                Ok(None)
            }
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let (total_conns, idle_conns) = {
            let state = self.inner.lock_state();
            (state.open, state.idle.len())
        };
        PoolStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            stale_conns: self.inner.stale.load(Ordering::Relaxed),
            total_conns,
            idle_conns,
        }
    }

    /// Closes all idle connections and rejects further leases. Leased connections
    /// are closed when they come back.
    pub(crate) fn close(&self) -> Result<(), ConnectionPoolError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(ConnectionPoolError::Closed);
        }
        self.inner.permits.close();
        let idle = {
            let mut state = self.inner.lock_state();
            let idle = std::mem::take(&mut state.idle);
            state.open -= idle.len();
            idle
        };
        debug!("[{}] Closing pool with {} idle connections", self.inner.addr, idle.len());
        drop(idle);
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether both handles belong to the same pool.
    pub(crate) fn same_pool(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // The state is consistent between statements, so a panic elsewhere does not
        // invalidate it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_healthy(&self, conn: &mut Connection) -> bool {
        let now = Instant::now();
        if let Some(max_lifetime) = self.config.max_lifetime {
            if now.duration_since(conn.created_at()) >= max_lifetime {
                trace!("[{}] Connection reached its max lifetime", self.addr);
                self.stale.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        if let Some(max_idle_time) = self.config.max_idle_time {
            if now.duration_since(conn.used_at()) >= max_idle_time {
                trace!("[{}] Connection idle for too long", self.addr);
                self.stale.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        if let Err(err) = conn.probe() {
            debug!("[{}] Idle connection is unusable: {}", self.addr, err);
            self.stale.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn discard(&self, conn: Connection) {
        self.lock_state().open -= 1;
        drop(conn);
    }

    async fn dial(self: &Arc<Self>) -> Result<Connection, ConnectionPoolError> {
        if self.dial_errors.load(Ordering::Acquire) >= self.config.size {
            let last = self
                .last_dial_error
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            if let Some(err) = last {
                return Err(err.into());
            }
        }

        match self.dialer.dial().await {
            Ok(conn) => {
                trace!("[{}] Dialed a new connection", self.addr);
                self.dial_errors.store(0, Ordering::Release);
                Ok(conn)
            }
            Err(err) => {
                debug!("[{}] Dial failed: {}", self.addr, err);
                self.set_last_dial_error(err.clone());
                let failures = self.dial_errors.fetch_add(1, Ordering::AcqRel) + 1;
                if failures == self.config.size {
                    warn!(
                        "[{}] {} consecutive dial failures, failing fast until the server is reachable: {}",
                        self.addr, failures, err
                    );
                    tokio::spawn(probe_dial(Arc::downgrade(self), self.dialer.clone()));
                }
                Err(err.into())
            }
        }
    }

    fn set_last_dial_error(&self, err: ConnectionError) {
        *self
            .last_dial_error
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err);
    }

    fn put(&self, mut conn: Connection, permit: Option<OwnedSemaphorePermit>) {
        if self.closed.load(Ordering::Acquire) || permit.is_none() {
            self.discard(conn);
            return;
        }
        let pending = conn.pending();
        if pending > 0 {
            warn!(
                "[{}] Connection has {} bytes of unread data, removing",
                self.addr, pending
            );
            self.discard(conn);
            return;
        }
        conn.touch();
        let mut state = self.lock_state();
        if state.idle.len() < self.config.max_idle {
            state.idle.push(conn);
        } else {
            state.open -= 1;
            drop(state);
            drop(conn);
        }
        // The permit is released after the connection is back in the idle list.
        drop(permit);
    }
}

/// Keeps dialing in the background until the server answers, then lets leases
/// dial again.
async fn probe_dial(pool: Weak<PoolInner>, dialer: Arc<dyn Dialer>) {
    loop {
        let result = dialer.dial().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if pool.closed.load(Ordering::Acquire) {
            return;
        }
        match result {
            Ok(conn) => {
                drop(conn);
                pool.dial_errors.store(0, Ordering::Release);
                info!("[{}] Server is reachable again", pool.addr);
                return;
            }
            Err(err) => pool.set_last_dial_error(err),
        }
        drop(pool);
        tokio::time::sleep(DIAL_PROBE_INTERVAL).await;
    }
}

/// A leased connection. Use [`put`](Self::put) to return it after a clean
/// exchange; dropping it, or [`remove`](Self::remove), closes it.
pub(crate) struct PooledConnection {
    // Present until the lease is consumed.
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("addr", &self.pool.addr)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Returns the connection for reuse.
    pub(crate) fn put(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, self.permit.take());
        }
    }

    /// Closes the connection. `reason` is logged.
    pub(crate) fn remove(mut self, reason: &QueryError) {
        if let Some(conn) = self.conn.take() {
            debug!("[{}] Removing connection: {}", conn.addr(), reason);
            self.pool.discard(conn);
        }
    }

    /// Whether the lease holds a pool slot. Unpooled leases are handed out when
    /// waiting for a slot timed out.
    pub(crate) fn is_pooled(&self) -> bool {
        self.permit.is_some()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self.conn {
            Some(ref conn) => conn,
            None => unreachable!("lease used after it was consumed"),
        }
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match self.conn {
            Some(ref mut conn) => conn,
            None => unreachable!("lease used after it was consumed"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            trace!("[{}] Lease dropped mid-exchange, closing the connection", conn.addr());
            self.pool.discard(conn);
        }
    }
}
