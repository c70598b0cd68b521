//! Errors returned by the driver.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

pub use chnative_proto::errors::{codes, DbError};

use chnative_proto::column::ColumnError;
use chnative_proto::frame::frame_errors::{FrameError, ParseError, RequestSerializationError};
use chnative_proto::frame::ServerPacket;
use thiserror::Error;

pub use crate::network::tls::TlsError;

/// Error that occurred during query execution.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum QueryError {
    /// The server answered with an exception.
    #[error("Database returned an error: {0}")]
    DbError(#[from] DbError),

    /// The socket failed or the stream ended; the connection is discarded.
    #[error(transparent)]
    BadConnection(#[from] BadConnectionError),

    /// No connection could be leased.
    #[error(transparent)]
    ConnectionPoolError(#[from] ConnectionPoolError),

    /// A server packet could not be decoded. The connection is discarded.
    #[error("Failed to decode server packet: {0}")]
    ParseError(Arc<ParseError>),

    /// A block could not be encoded, or a column rejected a value.
    #[error("Column error: {0}")]
    ColumnError(Arc<ColumnError>),

    /// The caller's context was cancelled.
    #[error("Request was cancelled")]
    Cancelled,

    /// The caller's context deadline passed.
    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    /// A socket read or write did not finish within the configured timeout.
    #[error("Timeout Error: no progress within {0:?}")]
    Timeout(Duration),

    /// The server sent something the client does not expect at this point.
    #[error("Protocol Error: {0}")]
    ProtocolError(&'static str),

    /// A well-formed packet that makes no sense in the current state.
    #[error("Unexpected packet from server: {0}")]
    UnexpectedPacket(ServerPacket),
}

impl QueryError {
    /// Whether the connection that produced this error may be returned to the pool.
    ///
    /// A server exception ends the exchange cleanly; anything else leaves the
    /// stream in an unknown position.
    pub fn keeps_connection(&self) -> bool {
        matches!(self, QueryError::DbError(_))
    }

    /// Whether the server reported a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            QueryError::DbError(e) => e.is_timeout(),
            QueryError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<ParseError> for QueryError {
    fn from(error: ParseError) -> QueryError {
        match error {
            ParseError::Frame(e) => e.into(),
            ParseError::Column(ColumnError::Frame(e)) if e.is_io() => e.into(),
            e => QueryError::ParseError(Arc::new(e)),
        }
    }
}

impl From<FrameError> for QueryError {
    fn from(error: FrameError) -> QueryError {
        match error {
            FrameError::StdIoError(e) => BadConnectionError::from(e).into(),
            e @ FrameError::ConnectionClosed(_, _) => {
                BadConnectionError::from(std::io::Error::new(ErrorKind::UnexpectedEof, e)).into()
            }
            e => QueryError::ParseError(Arc::new(ParseError::Frame(e))),
        }
    }
}

impl From<ColumnError> for QueryError {
    fn from(error: ColumnError) -> QueryError {
        QueryError::ColumnError(Arc::new(error))
    }
}

impl From<RequestSerializationError> for QueryError {
    fn from(error: RequestSerializationError) -> QueryError {
        match error {
            RequestSerializationError::Frame(e) => e.into(),
            RequestSerializationError::Column(e) => e.into(),
            _ => QueryError::ProtocolError("request could not be serialized"),
        }
    }
}

/// The socket behind a connection failed. Such a connection is always removed
/// from the pool rather than reused.
#[derive(Error, Debug, Clone)]
#[error("Connection is in a bad state: {0}")]
pub struct BadConnectionError(Arc<std::io::Error>);

impl BadConnectionError {
    /// The underlying I/O error.
    pub fn io_error(&self) -> &std::io::Error {
        &self.0
    }
}

impl From<std::io::Error> for BadConnectionError {
    fn from(error: std::io::Error) -> Self {
        BadConnectionError(Arc::new(error))
    }
}

/// Failure to open a new connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The TCP connect did not finish in time.
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// Name resolution produced no address.
    #[error("Could not resolve {0}")]
    NoAddress(String),

    /// Socket or TLS failure.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// The server rejected the hello, or answered it with garbage.
    #[error("Handshake failed: {0}")]
    Handshake(Arc<QueryError>),
}

impl From<QueryError> for ConnectionError {
    fn from(error: QueryError) -> Self {
        ConnectionError::Handshake(Arc::new(error))
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(error: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(error))
    }
}

/// The pool could not hand out a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// The pool (and the [`Db`](crate::Db) owning it) was closed.
    #[error("database is closed")]
    Closed,

    /// Dialing a new connection failed. After as many consecutive failures as the
    /// pool has slots, the last error is returned without dialing until a
    /// background probe succeeds.
    #[error("Failed to open a connection: {0}")]
    Dial(#[from] ConnectionError),
}

/// A [`Db`](crate::Db) could not be created from its configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NewDbError {
    /// The pool must allow at least one connection.
    #[error("pool_size must be at least 1")]
    EmptyPool,

    /// The requested TLS mode cannot be satisfied.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The connection string is invalid.
    #[error(transparent)]
    Dsn(#[from] DsnParseError),
}

/// A replica failed its periodic health check.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HealthCheckError {
    /// The replica did not answer pings.
    #[error("[{addr}] Replica is unreachable: {source}")]
    Unreachable { addr: String, source: QueryError },

    /// An introspection query failed.
    #[error("[{addr}] Health query failed: {source}")]
    Query { addr: String, source: QueryError },

    /// Merges fall behind inserts in some partition.
    #[error("[{addr}] Table {table:?} has too many parts ({parts}) in partition {partition:?}")]
    TooManyParts {
        addr: String,
        table: String,
        partition: String,
        parts: u64,
    },

    /// The replica lags behind the rest of its shard.
    #[error("[{addr}] Replication queue is too large: {len}")]
    ReplicationQueue { addr: String, len: u64 },
}

impl HealthCheckError {
    /// Address of the replica that failed.
    pub fn addr(&self) -> &str {
        match self {
            HealthCheckError::Unreachable { addr, .. }
            | HealthCheckError::Query { addr, .. }
            | HealthCheckError::TooManyParts { addr, .. }
            | HealthCheckError::ReplicationQueue { addr, .. } => addr,
        }
    }
}

/// Invalid connection string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DsnParseError {
    /// Not a URL at all.
    #[error("Invalid connection string: {0}")]
    Url(#[from] url::ParseError),

    /// Scheme other than `ch` or `clickhouse`.
    #[error("Invalid scheme: {0:?}")]
    InvalidScheme(String),

    /// Unknown `sslmode` value.
    #[error("sslmode {0:?} is not supported")]
    UnsupportedSslMode(String),

    /// A timeout parameter is neither an integer nor a duration.
    #[error("Invalid {name} duration {value:?}")]
    InvalidDuration {
        /// Parameter name.
        name: String,
        /// Raw value.
        value: String,
    },

    /// A parameter with a fixed meaning has a value of the wrong shape.
    #[error("Invalid value {value:?} of {name}")]
    InvalidValue {
        /// Parameter name.
        name: String,
        /// Raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn db_error(code: i32) -> DbError {
        DbError {
            code,
            name: "DB::Exception".to_owned(),
            message: "boom".to_owned(),
            stack_trace: String::new(),
            nested: None,
        }
    }

    #[test]
    fn io_frame_errors_become_bad_connection() {
        let err: QueryError = FrameError::ConnectionClosed(4, 8).into();
        assert_matches!(err, QueryError::BadConnection(_));

        let err: QueryError = ParseError::Frame(FrameError::StdIoError(
            std::io::ErrorKind::BrokenPipe.into(),
        ))
        .into();
        assert_matches!(err, QueryError::BadConnection(ref e) if e.io_error().kind() == std::io::ErrorKind::BrokenPipe);

        let err: QueryError = FrameError::UnknownMethod(0x42).into();
        assert_matches!(err, QueryError::ParseError(_));
        assert!(!err.keeps_connection());
    }

    #[test]
    fn server_exceptions_keep_the_connection() {
        let err = QueryError::from(db_error(60));
        assert!(err.keeps_connection());
        assert!(!err.is_timeout());
        assert!(QueryError::from(db_error(159)).is_timeout());
        assert_eq!(
            err.to_string(),
            "Database returned an error: DB::Exception: boom (code 60)"
        );
    }
}
