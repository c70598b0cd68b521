//! DbBuilder provides an easy way to create new Dbs

use std::sync::Arc;
use std::time::Duration;

use chnative_proto::column::TypeRegistry;
use chnative_proto::frame::request::SettingValue;
use chnative_proto::frame::Compression;

use super::config::Config;
use super::db::Db;
use crate::errors::{DsnParseError, NewDbError};
use crate::network::tls::{TlsContext, TlsMode};
use crate::policies::retry::RetryPolicy;

/// DbBuilder is used to create new Db instances
/// # Example
///
/// ```
/// # use chnative::{Db, DbBuilder};
/// # use chnative::Compression;
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let db: Db = DbBuilder::new()
///     .addr("127.0.0.1:9000")
///     .compression(Compression::Zstd)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct DbBuilder {
    pub config: Config,
    registry: Option<Arc<TypeRegistry>>,
}

impl DbBuilder {
    /// Creates new DbBuilder with default configuration
    /// # Default configuration
    /// * Address: localhost:9000
    /// * User and database: default
    /// * Compression: LZ4
    /// * Pool size: twice the number of CPUs
    pub fn new() -> Self {
        DbBuilder::default()
    }

    /// Starts from a parsed connection string, see [`Config::from_dsn`].
    ///
    /// # Example
    /// ```
    /// # use chnative::DbBuilder;
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let db = DbBuilder::from_dsn("ch://default:@localhost:9000/logs?sslmode=disable")?
    ///     .pool_size(4)
    ///     .build()?;
    /// assert_eq!(db.config().database, "logs");
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_dsn(dsn: &str) -> Result<Self, DsnParseError> {
        Ok(DbBuilder {
            config: Config::from_dsn(dsn)?,
            registry: None,
        })
    }

    /// Server address as `host:port`.
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Credentials sent in the handshake.
    ///
    /// # Example
    /// ```
    /// # use chnative::DbBuilder;
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let db = DbBuilder::new()
    ///     .user("reader", "secret")
    ///     .database("metrics")
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.user = user.into();
        self.config.password = password.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    /// TLS mode. Modes other than [`TlsMode::Disable`] need a context from
    /// [`tls_context`](Self::tls_context) unless the `openssl-010` feature is on.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.config.tls_mode = mode;
        self
    }

    /// Provide DbBuilder with a TLS context. Setting a context without a mode
    /// switches the mode to [`TlsMode::Require`].
    pub fn tls_context(mut self, context: Option<impl Into<TlsContext>>) -> Self {
        self.config.tls_context = context.map(Into::into);
        if self.config.tls_context.is_some() && self.config.tls_mode == TlsMode::Disable {
            self.config.tls_mode = TlsMode::Require;
        }
        self
    }

    /// Timeout of establishing a TCP connection. `None` waits for the OS.
    pub fn dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Number of connections that may be in use at once. Also raises the number
    /// of idle connections kept to the same value.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self.config.max_idle_conns = size;
        self
    }

    /// How long a request waits for a free connection. When it runs out, the
    /// request dials a connection of its own that is closed afterwards.
    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_timeout = timeout;
        self
    }

    pub fn max_idle_conns(mut self, max: usize) -> Self {
        self.config.max_idle_conns = max;
        self
    }

    pub fn conn_max_idle_time(mut self, max: Option<Duration>) -> Self {
        self.config.conn_max_idle_time = max;
        self
    }

    pub fn conn_max_lifetime(mut self, max: Option<Duration>) -> Self {
        self.config.conn_max_lifetime = max;
        self
    }

    /// Set the nodelay TCP flag.
    /// The default is true.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Set the TCP keepalive interval.
    /// The default is `None`, which implies that no keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    /// Note: CPU time of the server is not spent on answering them.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Compression of data blocks.
    /// The default is LZ4.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Whether checksums of compressed blocks are verified on read.
    pub fn verify_checksum(mut self, verify: bool) -> Self {
        self.config.verify_checksum = verify;
        self
    }

    /// Sets the policy deciding which failed requests are sent again.
    ///
    /// # Example
    /// ```
    /// # use std::sync::Arc;
    /// # use chnative::DbBuilder;
    /// # use chnative::policies::retry::FallthroughRetryPolicy;
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let db = DbBuilder::new()
    ///     .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Adds a setting sent with every query.
    pub fn setting(mut self, name: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.config.query_settings.insert(name.into(), value.into());
        self
    }

    /// Name of the cluster, for `ON CLUSTER` statements.
    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.config.cluster = Some(cluster.into());
        self
    }

    pub fn replicated(mut self, replicated: bool) -> Self {
        self.config.replicated = replicated;
        self
    }

    pub fn distributed(mut self, distributed: bool) -> Self {
        self.config.distributed = distributed;
        self
    }

    /// Marks the server as a backup replica of its shard.
    pub fn backup(mut self, is_backup: bool) -> Self {
        self.config.is_backup = is_backup;
        self
    }

    /// Type registry shared with other `Db`s, holding named enums.
    pub fn registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the Db. No connection is opened yet.
    pub fn build(self) -> Result<Db, NewDbError> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(TypeRegistry::new()));
        Db::with_registry(self.config, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn setters_reach_the_config() {
        let builder = DbBuilder::new()
            .addr("ch-1:9000")
            .user("bob", "pw")
            .database("logs")
            .pool_size(3)
            .compression(Compression::None)
            .read_timeout(None)
            .setting("max_threads", 4i64)
            .cluster("main")
            .distributed(true)
            .backup(true);
        let config = &builder.config;
        assert_eq!(config.addr, "ch-1:9000");
        assert_eq!((config.user.as_str(), config.password.as_str()), ("bob", "pw"));
        assert_eq!((config.pool_size, config.max_idle_conns), (3, 3));
        assert_eq!(config.read_timeout, None);
        assert_eq!(
            config.query_settings.get("max_threads"),
            Some(&SettingValue::Int(4))
        );
        assert!(config.distributed && config.is_backup);

        let db = builder.build().unwrap();
        assert_eq!(db.dist_table("t"), "dist_t");
        assert_eq!(db.config().cluster.as_deref(), Some("main"));
    }

    #[test]
    fn invalid_configurations_fail_to_build() {
        assert_matches!(
            DbBuilder::new().pool_size(0).build(),
            Err(NewDbError::EmptyPool)
        );
        assert_matches!(
            DbBuilder::from_dsn("http://localhost"),
            Err(DsnParseError::InvalidScheme(_))
        );
    }

    #[cfg(not(feature = "openssl-010"))]
    #[test]
    fn required_tls_needs_a_context() {
        assert_matches!(
            DbBuilder::new().tls_mode(TlsMode::VerifyFull).build(),
            Err(NewDbError::Tls(_))
        );
        // Prefer falls back to plaintext.
        DbBuilder::new().tls_mode(TlsMode::Prefer).build().unwrap();
    }
}
