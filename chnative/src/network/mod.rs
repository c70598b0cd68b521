mod connection;
pub(crate) use connection::{Connection, ConnectionConfig, Timeouts};

mod connection_pool;
pub use connection_pool::PoolStats;
pub(crate) use connection_pool::{ConnectionPool, Dialer, PoolConfig, PooledConnection};

pub(crate) mod tls;
