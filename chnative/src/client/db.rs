//! `Db` is the main object used in the driver.\
//! It manages a pool of connections to one server and runs requests over it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chnative_proto::block::Block;
use chnative_proto::column::TypeRegistry;
use chnative_proto::frame::request::{ClientInfo, Query};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::config::Config;
use super::context::Context;
use super::query_result::{read_result, read_sample_block, BlockStream, QueryResult};
use crate::errors::{ConnectionError, NewDbError, QueryError};
use crate::network::tls::TlsConfig;
use crate::network::{
    Connection, ConnectionConfig, ConnectionPool, Dialer, PoolConfig, PoolStats, PooledConnection,
    Timeouts,
};
use crate::policies::retry::{RequestInfo, RetryDecision};

/// Upper bound on writing a cancel packet when the write timeout is disabled.
const CANCEL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Request counters of a [`Db`]. Every attempt counts, retries included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct DbStats {
    pub queries: u64,
    pub errors: u64,
}

struct DbInner {
    config: Config,
    pool: ConnectionPool,
    registry: Arc<TypeRegistry>,
    client_info: ClientInfo,
    queries: AtomicU64,
    errors: AtomicU64,
}

/// A handle to one server: a connection pool plus the request logic on top of it.
///
/// `Db` is cheap to clone; clones share the pool and the counters. It is meant to
/// be created once and shared by the whole application.
///
/// ```rust,no_run
/// # use chnative::{Context, DbBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let db = DbBuilder::from_dsn("clickhouse://localhost:9000/default?sslmode=disable")?
///     .build()?;
/// let ctx = Context::background();
/// db.exec(&ctx, "CREATE TABLE IF NOT EXISTS t (n UInt64) ENGINE = Memory").await?;
/// let block = db.query_block(&ctx, "SELECT count() FROM t").await?;
/// println!("{} rows", block.columns()[0].get::<u64>(0)?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
    timeouts: Timeouts,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("addr", &self.inner.config.addr)
            .field("timeouts", &self.timeouts)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Creates a `Db` from a configuration. No connection is opened until the
    /// first request.
    pub fn new(config: Config) -> Result<Db, NewDbError> {
        Db::with_registry(config, Arc::new(TypeRegistry::new()))
    }

    /// Like [`Db::new`], with a type registry holding named enums.
    pub fn with_registry(config: Config, registry: Arc<TypeRegistry>) -> Result<Db, NewDbError> {
        if config.pool_size == 0 {
            return Err(NewDbError::EmptyPool);
        }
        let tls = TlsConfig::resolve(config.tls_mode, config.tls_context.as_ref())?;
        let timeouts = Timeouts {
            read: config.read_timeout,
            write: config.write_timeout,
        };
        let connection_config = ConnectionConfig {
            compression: config.compression,
            verify_checksum: config.verify_checksum,
            connect_timeout: config.dial_timeout,
            tcp_nodelay: config.tcp_nodelay,
            tcp_keepalive_interval: config.tcp_keepalive_interval,
            tls,
            timeouts,
        };
        let dialer = ServerDialer {
            addr: config.addr.clone(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            config: connection_config,
            registry: registry.clone(),
        };
        Ok(Db::with_dialer(config, registry, Arc::new(dialer)))
    }

    pub(crate) fn with_dialer(
        config: Config,
        registry: Arc<TypeRegistry>,
        dialer: Arc<dyn Dialer>,
    ) -> Db {
        let pool_config = PoolConfig {
            size: config.pool_size,
            timeout: config.pool_timeout,
            max_idle: config.max_idle_conns,
            max_idle_time: config.conn_max_idle_time,
            max_lifetime: config.conn_max_lifetime,
        };
        let timeouts = Timeouts {
            read: config.read_timeout,
            write: config.write_timeout,
        };
        let pool = ConnectionPool::new(config.addr.clone(), pool_config, dialer);
        Db {
            inner: Arc::new(DbInner {
                config,
                pool,
                registry,
                client_info: ClientInfo::local(),
                queries: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
            timeouts,
        }
    }

    /// Closes idle connections and fails all further requests. Requests in flight
    /// finish, and their connections are closed afterwards.
    pub fn close(&self) -> Result<(), QueryError> {
        debug!("[{}] Closing database", self.inner.config.addr);
        Ok(self.inner.pool.close()?)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn addr(&self) -> &str {
        &self.inner.config.addr
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    /// A handle sharing this pool whose requests use `timeout` for every socket
    /// read and write.
    pub fn with_timeout(&self, timeout: Duration) -> Db {
        Db {
            inner: self.inner.clone(),
            timeouts: Timeouts {
                read: Some(timeout),
                write: Some(timeout),
            },
        }
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            queries: self.inner.queries.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Name of the distributed table over `table` when the database is
    /// distributed, `table` itself otherwise.
    pub fn dist_table(&self, table: &str) -> String {
        if self.inner.config.distributed {
            format!("dist_{table}")
        } else {
            table.to_owned()
        }
    }

    /// Like [`dist_table`](Self::dist_table), for the table spanning all shards.
    pub fn all_dist_table(&self, table: &str) -> String {
        if self.inner.config.distributed {
            format!("dist_all_{table}")
        } else {
            table.to_owned()
        }
    }

    /// Checks that a connection can be leased and the server answers.
    pub async fn ping(&self, ctx: &Context) -> Result<(), QueryError> {
        let res = self.ping_once(ctx).await;
        self.record(&res);
        res
    }

    async fn ping_once(&self, ctx: &Context) -> Result<(), QueryError> {
        let mut conn = self.lease(ctx).await?;
        let res = ctx.run(conn.ping()).await;
        self.finish(conn, res).await
    }

    /// Runs a statement and discards any rows it returns.
    pub async fn exec(&self, ctx: &Context, sql: &str) -> Result<QueryResult, QueryError> {
        self.with_retries(ctx, sql, move || self.exec_once(ctx, sql))
            .await
    }

    async fn exec_once(&self, ctx: &Context, sql: &str) -> Result<QueryResult, QueryError> {
        let mut conn = self.lease(ctx).await?;
        let query_id = new_query_id();
        let query = self.query_packet(&conn, &query_id, sql);
        let res = ctx
            .run(async {
                conn.send_query(&query).await?;
                read_result(&mut conn).await
            })
            .await;
        self.finish(conn, res).await
    }

    /// Starts a query and returns its blocks as they arrive.
    ///
    /// Only sending the query is retried; once blocks are flowing, errors end the
    /// stream. Use [`query_block`](Self::query_block) to retry the whole read.
    pub async fn query(&self, ctx: &Context, sql: &str) -> Result<BlockStream, QueryError> {
        self.with_retries(ctx, sql, move || self.query_once(ctx, sql))
            .await
    }

    async fn query_once(&self, ctx: &Context, sql: &str) -> Result<BlockStream, QueryError> {
        let mut conn = self.lease(ctx).await?;
        let query_id = new_query_id();
        let query = self.query_packet(&conn, &query_id, sql);
        let res = ctx.run(conn.send_query(&query)).await;
        match res {
            Ok(Ok(())) => Ok(BlockStream::new(self.clone(), ctx.clone(), conn)),
            Ok(Err(err)) => Err(self.release_err(conn, err).await),
            Err(err) => Err(self.abort(conn, err).await),
        }
    }

    /// Runs a query and collects all its rows into one block.
    pub async fn query_block(&self, ctx: &Context, sql: &str) -> Result<Block, QueryError> {
        self.with_retries(ctx, sql, move || async move {
            self.query_once(ctx, sql).await?.collect().await
        })
        .await
    }

    /// Inserts the rows of `block`. `sql` is the insert statement without data,
    /// such as `INSERT INTO t VALUES`.
    pub async fn insert(
        &self,
        ctx: &Context,
        sql: &str,
        block: &Block,
    ) -> Result<QueryResult, QueryError> {
        self.with_retries(ctx, sql, move || self.insert_once(ctx, sql, block))
            .await
    }

    async fn insert_once(
        &self,
        ctx: &Context,
        sql: &str,
        block: &Block,
    ) -> Result<QueryResult, QueryError> {
        let mut conn = self.lease(ctx).await?;
        let query_id = new_query_id();
        let query = self.query_packet(&conn, &query_id, sql);
        let res = ctx
            .run(async {
                conn.send_query(&query).await?;
                let sample = read_sample_block(&mut conn).await?;
                trace!(
                    "[{}] Server expects columns {:?}",
                    conn.addr(),
                    sample.column_names().collect::<Vec<_>>()
                );
                conn.send_block(block).await?;
                read_result(&mut conn).await
            })
            .await;
        self.finish(conn, res).await
    }

    /// Data blocks of the query are compressed the way the connection writes them.
    fn query_packet<'a>(&'a self, conn: &Connection, query_id: &'a str, sql: &'a str) -> Query<'a> {
        Query {
            query_id,
            sql,
            client_info: &self.inner.client_info,
            settings: &self.inner.config.query_settings,
            compression: conn.compression().is_enabled(),
        }
    }

    async fn lease(&self, ctx: &Context) -> Result<PooledConnection, QueryError> {
        let mut conn = self.inner.pool.get(ctx).await?;
        conn.set_timeouts(self.timeouts);
        Ok(conn)
    }

    fn record<T>(&self, res: &Result<T, QueryError>) {
        self.inner.queries.fetch_add(1, Ordering::Relaxed);
        if res.is_err() {
            self.inner.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn with_retries<T, F, Fut>(
        &self,
        ctx: &Context,
        sql: &str,
        mut attempt: F,
    ) -> Result<T, QueryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let mut session = self.inner.config.retry_policy.new_session();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let res = attempt().await;
            self.record(&res);
            let error = match res {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            match session.decide_should_retry(RequestInfo {
                error: &error,
                attempts,
            }) {
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        "[{}] Attempt #{} of {:?} failed, retrying in {:?}: {}",
                        self.inner.config.addr, attempts, sql, delay, error
                    );
                    ctx.sleep(delay).await?;
                }
                RetryDecision::DontRetry => return Err(error),
            }
        }
    }

    /// Settles a lease after an exchange raced against `ctx`. The outer error is
    /// the context ending first.
    pub(crate) async fn finish<T>(
        &self,
        conn: PooledConnection,
        res: Result<Result<T, QueryError>, QueryError>,
    ) -> Result<T, QueryError> {
        match res {
            Ok(Ok(value)) => {
                conn.put();
                Ok(value)
            }
            Ok(Err(err)) => Err(self.release_err(conn, err).await),
            Err(err) => Err(self.abort(conn, err).await),
        }
    }

    /// A server exception ends the exchange cleanly and the connection is reused.
    /// Any other failure leaves the stream at an unknown position.
    async fn release_err(&self, conn: PooledConnection, err: QueryError) -> QueryError {
        if err.keeps_connection() {
            conn.put();
            return err;
        }
        if matches!(err, QueryError::Timeout(_)) {
            return self.abort(conn, err).await;
        }
        conn.remove(&err);
        err
    }

    /// Tells the server to stop the query, then closes the connection.
    async fn abort(&self, mut conn: PooledConnection, err: QueryError) -> QueryError {
        let limit = self.timeouts.write.unwrap_or(CANCEL_WRITE_TIMEOUT);
        match tokio::time::timeout(limit, conn.cancel()).await {
            Ok(Ok(())) => trace!("[{}] Sent cancel after: {}", conn.addr(), err),
            Ok(Err(cancel_err)) => {
                debug!("[{}] Failed to send cancel: {}", conn.addr(), cancel_err)
            }
            Err(_) => warn!(
                "[{}] Cancel packet not written within {:?}",
                conn.addr(),
                limit
            ),
        }
        conn.remove(&err);
        err
    }
}

fn new_query_id() -> String {
    Uuid::new_v4().to_string()
}

/// Opens connections for the pool of a [`Db`]: connect, then handshake.
struct ServerDialer {
    addr: String,
    database: String,
    user: String,
    password: String,
    config: ConnectionConfig,
    registry: Arc<TypeRegistry>,
}

#[async_trait]
impl Dialer for ServerDialer {
    async fn dial(&self) -> Result<Connection, ConnectionError> {
        let mut conn = Connection::open(&self.addr, &self.config, self.registry.clone()).await?;
        conn.handshake(&self.database, &self.user, &self.password)
            .await?;
        Ok(conn)
    }
}
