use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chnative_proto::block::Block;
use chnative_proto::column::TypeRegistry;
use chnative_proto::frame::frame_errors::RequestSerializationError;
use chnative_proto::frame::request::{Cancel, Data, Hello, Ping, Query, SerializableRequest};
use chnative_proto::frame::response::{Response, ServerHello};
use chnative_proto::frame::{Compression, PacketReader, PacketWriter};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::tls::TlsConfig;
use crate::errors::{ConnectionError, QueryError};

/// Unanswered keepalive probes before the kernel drops the connection.
const KEEPALIVE_PROBES: u32 = 9;

/// Any byte stream a connection can run over: TCP, TLS over TCP, or an in-memory
/// pipe in tests.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type BoxedStream = Box<dyn AsyncStream>;

/// Socket-level settings of every connection of a pool.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionConfig {
    pub(crate) compression: Compression,
    pub(crate) verify_checksum: bool,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) timeouts: Timeouts,
}

/// Bounds on a single socket read or write. `None` waits forever.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Timeouts {
    pub(crate) read: Option<Duration>,
    pub(crate) write: Option<Duration>,
}

/// One socket to one server: the packet codec on both directions and what the
/// server said about itself in the handshake.
///
/// A connection is used by exactly one caller at a time; the pool hands it out
/// behind a lease.
pub(crate) struct Connection {
    addr: String,
    reader: PacketReader,
    writer: WriteHalf<BoxedStream>,
    packet: PacketWriter,
    registry: Arc<TypeRegistry>,
    server: Option<ServerHello>,
    timeouts: Timeouts,
    created_at: Instant,
    used_at: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("server", &self.server)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wraps an already connected stream. No packets are exchanged yet.
    pub(crate) fn new(
        stream: impl AsyncStream + 'static,
        addr: impl Into<String>,
        config: &ConnectionConfig,
        registry: Arc<TypeRegistry>,
    ) -> Connection {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, writer) = split(boxed);
        let mut reader = PacketReader::new(read_half);
        reader.set_verify_checksum(config.verify_checksum);
        let now = Instant::now();
        Connection {
            addr: addr.into(),
            reader,
            writer,
            packet: PacketWriter::new(config.compression),
            registry,
            server: None,
            timeouts: config.timeouts,
            created_at: now,
            used_at: now,
        }
    }

    /// Resolves `addr` and connects to the first address that accepts, then
    /// sets up the socket and TLS.
    pub(crate) async fn open(
        addr: &str,
        config: &ConnectionConfig,
        registry: Arc<TypeRegistry>,
    ) -> Result<Connection, ConnectionError> {
        let mut last_error = ConnectionError::NoAddress(addr.to_owned());
        for socket_addr in tokio::net::lookup_host(addr).await? {
            match Self::connect(socket_addr, config).await {
                Ok(stream) => {
                    let stream = match config.tls {
                        Some(ref tls) => {
                            trace!("[{}] TLS handshake in {:?} mode", addr, tls.mode());
                            tls.connect(host_of(addr), socket_addr.ip(), stream).await?
                        }
                        None => Box::new(stream),
                    };
                    return Ok(Connection::new(stream, addr, config, registry));
                }
                Err(err) => {
                    debug!("[{}] Failed to connect to {}: {}", addr, socket_addr, err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn connect(
        socket_addr: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<TcpStream, ConnectionError> {
        let stream = match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(socket_addr))
                .await
                .map_err(|_| ConnectionError::ConnectTimeout(limit))??,
            None => TcpStream::connect(socket_addr).await?,
        };
        stream.set_nodelay(config.tcp_nodelay)?;
        if let Some(interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, interval)?;
        }
        Ok(stream)
    }

    /// Probes start after `idle` without traffic and repeat at the same period.
    /// The connection is dropped after [`KEEPALIVE_PROBES`] unanswered probes on
    /// platforms that let the count be set.
    fn setup_tcp_keepalive(stream: &TcpStream, idle: Duration) -> std::io::Result<()> {
        let keepalive = TcpKeepalive::new().with_time(idle);
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "macos",
            target_os = "ios",
            target_os = "windows",
        ))]
        let keepalive = keepalive.with_interval(idle);
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "macos",
            target_os = "ios",
        ))]
        let keepalive = keepalive.with_retries(KEEPALIVE_PROBES);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// What the server announced in its hello, once the handshake is done.
    pub(crate) fn server(&self) -> Option<&ServerHello> {
        self.server.as_ref()
    }

    /// Negotiated protocol revision. Zero before the handshake, which makes every
    /// revision-gated field stay off.
    pub(crate) fn revision(&self) -> u64 {
        self.server
            .as_ref()
            .map(ServerHello::negotiated_revision)
            .unwrap_or(0)
    }

    pub(crate) fn compression(&self) -> Compression {
        self.packet.compression()
    }

    pub(crate) fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn used_at(&self) -> Instant {
        self.used_at
    }

    pub(crate) fn touch(&mut self) {
        self.used_at = Instant::now();
    }

    /// Bytes received but not consumed by any exchange.
    pub(crate) fn pending(&self) -> usize {
        self.reader.pending()
    }

    /// Non-blocking liveness check of an idle connection.
    pub(crate) fn probe(&mut self) -> Result<(), QueryError> {
        self.reader.probe().map_err(QueryError::from)
    }

    /// Serializes one or more packets with `build` and writes them in one flush.
    pub(crate) async fn send(
        &mut self,
        build: impl FnOnce(&mut PacketWriter, u64) -> Result<(), RequestSerializationError>,
    ) -> Result<(), QueryError> {
        let revision = self.revision();
        if let Err(err) = build(&mut self.packet, revision) {
            // Nothing was written; the half-built packet must not leak into the next one.
            self.packet.take();
            return Err(err.into());
        }
        let limit = self.timeouts.write;
        let flush = async {
            self.packet
                .flush_to(&mut self.writer)
                .await
                .map_err(QueryError::from)
        };
        with_timeout(limit, flush).await
    }

    /// Reads the next server packet.
    pub(crate) async fn receive(&mut self) -> Result<Response, QueryError> {
        let revision = self.revision();
        let compressed = self.compression().is_enabled();
        let limit = self.timeouts.read;
        let read = async {
            Response::read(&mut self.reader, revision, compressed, &self.registry)
                .await
                .map_err(QueryError::from)
        };
        let response = with_timeout(limit, read).await?;
        trace!("[{}] Received {}", self.addr, response.packet());
        Ok(response)
    }

    /// Introduces the client and authenticates. The server answers with its own
    /// hello, or an exception when the credentials or the database are wrong.
    pub(crate) async fn handshake(
        &mut self,
        database: &str,
        user: &str,
        password: &str,
    ) -> Result<&ServerHello, QueryError> {
        let hello = Hello {
            database,
            user,
            password,
        };
        self.send(|w, revision| hello.write_to(w, revision)).await?;
        match self.receive().await? {
            Response::Hello(server) => {
                debug!(
                    "[{}] Connected to {} {} (revision {})",
                    self.addr,
                    server.name,
                    server.version(),
                    server.negotiated_revision()
                );
                Ok(self.server.insert(server))
            }
            Response::Exception(err) => Err(err.into()),
            other => Err(QueryError::UnexpectedPacket(other.packet())),
        }
    }

    /// Sends a ping and waits for the pong.
    pub(crate) async fn ping(&mut self) -> Result<(), QueryError> {
        self.send(|w, revision| Ping.write_to(w, revision)).await?;
        loop {
            match self.receive().await? {
                Response::Pong => return Ok(()),
                Response::Exception(err) => return Err(err.into()),
                // Leftovers of a profiling-enabled server.
                Response::Progress(_) | Response::Log(_) | Response::ProfileEvents(_) => {}
                other => return Err(QueryError::UnexpectedPacket(other.packet())),
            }
        }
    }

    /// Sends a query followed by the empty block that ends its (absent) external data.
    pub(crate) async fn send_query(&mut self, query: &Query<'_>) -> Result<(), QueryError> {
        self.send(|w, revision| {
            query.write_to(w, revision)?;
            Data::end().write_to(w, revision)
        })
        .await
    }

    /// Sends the rows of an insert and the empty block that ends them. A block
    /// without rows sends only the terminator.
    pub(crate) async fn send_block(&mut self, block: &Block) -> Result<(), QueryError> {
        self.send(|w, revision| {
            if block.rows() > 0 {
                Data { block }.write_to(w, revision)?;
            }
            Data::end().write_to(w, revision)
        })
        .await
    }

    /// Asks the server to stop the running query.
    pub(crate) async fn cancel(&mut self) -> Result<(), QueryError> {
        self.send(|w, revision| Cancel.write_to(w, revision)).await
    }

    /// Closes the write side so the server sees the disconnect promptly.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Host part of `host:port`, without the brackets of an IPv6 literal.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T, QueryError>>,
) -> Result<T, QueryError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| QueryError::Timeout(limit))?,
        None => fut.await,
    }
}
