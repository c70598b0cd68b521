//! Helpers shared by the unit tests: tracing setup and an in-memory server that
//! speaks the server side of the native protocol.

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chnative_proto::block::Block;
use chnative_proto::column::{Column, TypeRegistry, Value};
use chnative_proto::frame::revision::{self, TCP_PROTOCOL_VERSION};
use chnative_proto::frame::{ClientPacket, Compression, PacketReader, PacketWriter, ServerPacket};
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::errors::ConnectionError;
use crate::network::{Connection, ConnectionConfig, Dialer, Timeouts};

type MockResult<T = ()> = Result<T, Box<dyn Error + Send + Sync>>;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Plain connection settings for in-memory streams, compressing data blocks.
pub(crate) fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        compression: Compression::Lz4,
        verify_checksum: true,
        connect_timeout: None,
        tcp_nodelay: true,
        tcp_keepalive_interval: None,
        tls: None,
        timeouts: Timeouts::default(),
    }
}

/// `id UInt64` counting up from zero and `name Nullable(String)`, null on every
/// third row.
pub(crate) fn sample_insert_block(rows: u64) -> Block {
    let registry = TypeRegistry::new();
    let ids = Column::with_values("id", "UInt64", &registry, (0..rows).map(Value::UInt64));
    let names = Column::with_values(
        "name",
        "Nullable(String)",
        &registry,
        (0..rows).map(|i| {
            if i % 3 == 0 {
                Value::Null
            } else {
                Value::String(format!("row {i}"))
            }
        }),
    );
    Block::with_columns([ids.unwrap(), names.unwrap()]).unwrap()
}

/// Credentials a client sent in its hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientHello {
    pub(crate) client_name: String,
    pub(crate) revision: u64,
    pub(crate) database: String,
    pub(crate) user: String,
    pub(crate) password: String,
}

/// What one mock connection observed.
#[derive(Debug, Default)]
pub(crate) struct Seen {
    pub(crate) hello: Option<ClientHello>,
    pub(crate) queries: Vec<String>,
}

/// Observations shared by all connections of one [`MockServer`].
#[derive(Debug, Default)]
struct MockEvents {
    hellos: Mutex<Vec<ClientHello>>,
    inserted: Mutex<Vec<Block>>,
    cancels: AtomicUsize,
    failures_left: AtomicUsize,
}

/// Server side of the protocol over any byte stream.
///
/// Answers pings, runs `SELECT`-like queries by streaming blocks of a single
/// `n UInt64` column, and accepts inserts into a table of `id UInt64, name
/// Nullable(String)`.
#[derive(Debug, Clone)]
pub(crate) struct MockServer {
    revision: u64,
    reject_hello: Option<i32>,
    blocks: Vec<usize>,
    fail_code: i32,
    stall: bool,
    registry: Arc<TypeRegistry>,
    events: Arc<MockEvents>,
}

impl MockServer {
    pub(crate) fn new() -> Self {
        MockServer {
            revision: TCP_PROTOCOL_VERSION,
            reject_hello: None,
            blocks: Vec::new(),
            fail_code: 0,
            stall: false,
            registry: Arc::new(TypeRegistry::new()),
            events: Arc::new(MockEvents::default()),
        }
    }

    /// Revision announced in the server hello.
    pub(crate) fn revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// Answers the hello with an exception.
    pub(crate) fn reject_hello(mut self, code: i32) -> Self {
        self.reject_hello = Some(code);
        self
    }

    /// Row counts of the data blocks sent for each query.
    pub(crate) fn respond_with_blocks(mut self, blocks: Vec<usize>) -> Self {
        self.blocks = blocks;
        self
    }

    /// The next `times` queries, on any connection, fail with `code`.
    pub(crate) fn fail_queries(mut self, code: i32, times: usize) -> Self {
        self.fail_code = code;
        self.events.failures_left.store(times, Ordering::SeqCst);
        self
    }

    /// Queries are read but never answered.
    pub(crate) fn stall_queries(mut self) -> Self {
        self.stall = true;
        self
    }

    pub(crate) fn spawn<S>(self, stream: S) -> JoinHandle<Seen>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let (read, write) = split(stream);
            let mut conn = ServerConn {
                reader: PacketReader::new(read),
                writer: write,
                revision: 0,
                seen: Seen::default(),
            };
            if let Err(err) = self.serve(&mut conn).await {
                tracing::trace!("Mock connection ended: {}", err);
            }
            conn.seen
        })
    }

    async fn serve<W: AsyncWrite + Unpin>(&self, conn: &mut ServerConn<W>) -> MockResult {
        let hello = conn.read_hello().await?;
        self.events.hellos.lock().unwrap().push(hello.clone());
        conn.revision = self.revision.min(hello.revision);
        conn.seen.hello = Some(hello);

        if let Some(code) = self.reject_hello {
            return conn.write_exception(code, "Authentication failed").await;
        }
        conn.write_hello(self.revision).await?;

        loop {
            let tag = conn.reader.read_uvarint().await?;
            match tag {
                t if t == ClientPacket::Ping.code() as u64 => {
                    let mut w = PacketWriter::new(Compression::None);
                    w.write_uvarint(ServerPacket::Pong as u64)?;
                    conn.flush(&mut w).await?;
                }
                t if t == ClientPacket::Cancel.code() as u64 => {
                    self.events.cancels.fetch_add(1, Ordering::SeqCst);
                }
                t if t == ClientPacket::Query.code() as u64 => {
                    let (sql, compressed) = conn.read_query(&self.registry).await?;
                    conn.seen.queries.push(sql.clone());
                    self.answer(conn, &sql, compressed).await?;
                }
                other => return Err(format!("unexpected client packet {other}").into()),
            }
        }
    }

    async fn answer<W: AsyncWrite + Unpin>(
        &self,
        conn: &mut ServerConn<W>,
        sql: &str,
        compressed: bool,
    ) -> MockResult {
        let failed = self
            .events
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return conn.write_exception(self.fail_code, "Mock failure").await;
        }
        if self.stall {
            return Ok(());
        }
        let compression = if compressed {
            Compression::Lz4
        } else {
            Compression::None
        };
        let mut w = PacketWriter::new(compression);

        if sql.starts_with("INSERT") {
            w.write_uvarint(ServerPacket::TableColumns as u64)?;
            w.write_string("")?;
            w.write_string("columns format version: 1\n2 columns:\n`id` UInt64\n`name` Nullable(String)\n")?;
            write_data(&mut w, &sample_insert_block(0))?;
            conn.flush(&mut w).await?;

            let mut rows = 0;
            loop {
                let block = conn.read_data(&self.registry, compressed).await?;
                if block.is_empty() {
                    break;
                }
                rows += block.rows() as u64;
                self.events.inserted.lock().unwrap().push(block);
            }
            write_progress(&mut w, conn.revision, 0, rows)?;
        } else {
            let registry = TypeRegistry::new();
            write_data(&mut w, &numbers(&registry, 0)?)?;
            for &n in &self.blocks {
                write_data(&mut w, &numbers(&registry, n)?)?;
                write_progress(&mut w, conn.revision, n as u64, 0)?;
            }
        }
        w.write_uvarint(ServerPacket::EndOfStream as u64)?;
        conn.flush(&mut w).await
    }
}

fn numbers(registry: &TypeRegistry, rows: usize) -> MockResult<Block> {
    let column = Column::with_values("n", "UInt64", registry, (0..rows as u64).map(Value::UInt64))?;
    Ok(Block::with_columns([column])?)
}

fn write_data(w: &mut PacketWriter, block: &Block) -> MockResult {
    w.write_uvarint(ServerPacket::Data as u64)?;
    w.write_string("")?;
    w.begin_compression();
    block.write(w)?;
    w.end_compression()?;
    Ok(())
}

fn write_progress(w: &mut PacketWriter, rev: u64, rows: u64, wrote_rows: u64) -> MockResult {
    w.write_uvarint(ServerPacket::Progress as u64)?;
    w.write_uvarint(rows)?;
    w.write_uvarint(rows * 8)?;
    w.write_uvarint(rows)?;
    if rev >= revision::CLIENT_WRITE_INFO {
        w.write_uvarint(wrote_rows)?;
        w.write_uvarint(wrote_rows * 8)?;
    }
    if rev >= revision::SERVER_QUERY_TIME_IN_PROGRESS {
        w.write_uvarint(1_000)?;
    }
    Ok(())
}

struct ServerConn<W> {
    reader: PacketReader,
    writer: W,
    revision: u64,
    seen: Seen,
}

impl<W: AsyncWrite + Unpin> ServerConn<W> {
    async fn flush(&mut self, w: &mut PacketWriter) -> MockResult {
        w.flush_to(&mut self.writer).await?;
        Ok(())
    }

    async fn read_hello(&mut self) -> MockResult<ClientHello> {
        let r = &mut self.reader;
        let tag = r.read_uvarint().await?;
        if tag != ClientPacket::Hello.code() as u64 {
            return Err(format!("expected hello, got packet {tag}").into());
        }
        let client_name = r.read_string().await?;
        let _major = r.read_uvarint().await?;
        let _minor = r.read_uvarint().await?;
        let revision = r.read_uvarint().await?;
        Ok(ClientHello {
            client_name,
            revision,
            database: r.read_string().await?,
            user: r.read_string().await?,
            password: r.read_string().await?,
        })
    }

    async fn write_hello(&mut self, server_revision: u64) -> MockResult {
        let mut w = PacketWriter::new(Compression::None);
        w.write_uvarint(ServerPacket::Hello as u64)?;
        w.write_string("ClickHouse")?;
        w.write_uvarint(24)?;
        w.write_uvarint(3)?;
        w.write_uvarint(server_revision)?;
        if server_revision >= revision::SERVER_TIMEZONE {
            w.write_string("UTC")?;
        }
        if server_revision >= revision::SERVER_DISPLAY_NAME {
            w.write_string("mock")?;
        }
        if server_revision >= revision::VERSION_PATCH {
            w.write_uvarint(1)?;
        }
        self.flush(&mut w).await
    }

    async fn write_exception(&mut self, code: i32, message: &str) -> MockResult {
        let mut w = PacketWriter::new(Compression::None);
        w.write_uvarint(ServerPacket::Exception as u64)?;
        w.write_i32(code)?;
        w.write_string("DB::Exception")?;
        w.write_string(&format!("DB::Exception: {message}"))?;
        w.write_string("")?;
        w.write_bool(false)?;
        self.flush(&mut w).await
    }

    /// Reads the rest of a query packet and the external data block after it.
    /// Returns the query text and whether its data blocks are compressed.
    async fn read_query(&mut self, registry: &TypeRegistry) -> MockResult<(String, bool)> {
        let rev = self.revision;
        let r = &mut self.reader;
        let _query_id = r.read_string().await?;
        if rev >= revision::CLIENT_INFO {
            let _kind = r.read_u8().await?;
            let _initial_user = r.read_string().await?;
            let _initial_query_id = r.read_string().await?;
            let _address = r.read_string().await?;
            if rev >= revision::INITIAL_QUERY_START_TIME {
                let _start_time = r.read_i64().await?;
            }
            let _interface = r.read_u8().await?;
            let _os_user = r.read_string().await?;
            let _hostname = r.read_string().await?;
            let _client_name = r.read_string().await?;
            let _major = r.read_uvarint().await?;
            let _minor = r.read_uvarint().await?;
            let _revision = r.read_uvarint().await?;
            if rev >= revision::QUOTA_KEY_IN_CLIENT_INFO {
                let _quota_key = r.read_string().await?;
            }
            if rev >= revision::DISTRIBUTED_DEPTH {
                let _depth = r.read_uvarint().await?;
            }
            if rev >= revision::VERSION_PATCH {
                let _patch = r.read_uvarint().await?;
            }
            if rev >= revision::OPENTELEMETRY && r.read_u8().await? != 0 {
                return Err("trace context is not supported".into());
            }
            if rev >= revision::PARALLEL_REPLICAS {
                for _ in 0..3 {
                    r.read_uvarint().await?;
                }
            }
        }
        loop {
            let name = r.read_string().await?;
            if name.is_empty() {
                break;
            }
            if rev <= revision::SETTINGS_SERIALIZED_AS_STRINGS {
                return Err("binary settings are not supported".into());
            }
            let _flags = r.read_uvarint().await?;
            let _value = r.read_string().await?;
        }
        if rev >= revision::INTERSERVER_SECRET {
            let _secret = r.read_string().await?;
        }
        let _stage = r.read_uvarint().await?;
        let compressed = r.read_bool().await?;
        let sql = r.read_string().await?;

        let external = self.read_data(registry, compressed).await?;
        if !external.is_empty() {
            return Err("external tables are not supported".into());
        }
        Ok((sql, compressed))
    }

    async fn read_data(&mut self, registry: &TypeRegistry, compressed: bool) -> MockResult<Block> {
        let r = &mut self.reader;
        let tag = r.read_uvarint().await?;
        if tag != ClientPacket::Data.code() as u64 {
            return Err(format!("expected data, got packet {tag}").into());
        }
        r.skip_string().await?;
        if !compressed {
            return Ok(Block::read(r, registry).await?);
        }
        r.enable_compression();
        let block = Block::read(r, registry).await?;
        r.disable_compression()?;
        Ok(block)
    }
}

/// Dials in-memory connections to a [`MockServer`] and runs the handshake.
pub(crate) struct MockDialer {
    server: MockServer,
    config: ConnectionConfig,
    registry: Arc<TypeRegistry>,
    dials: AtomicUsize,
}

impl MockDialer {
    pub(crate) fn new(server: MockServer, config: ConnectionConfig) -> Self {
        MockDialer {
            server,
            config,
            registry: Arc::new(TypeRegistry::new()),
            dials: AtomicUsize::new(0),
        }
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn hellos(&self) -> Vec<ClientHello> {
        self.server.events.hellos.lock().unwrap().clone()
    }

    pub(crate) fn inserted(&self) -> Vec<Block> {
        self.server.events.inserted.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for_cancels(&self, n: usize) {
        while self.server.events.cancels.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self) -> Result<Connection, ConnectionError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(256 * 1024);
        self.server.clone().spawn(server);
        let mut conn = Connection::new(client, "mock:9000", &self.config, self.registry.clone());
        conn.handshake("default", "default", "").await?;
        Ok(conn)
    }
}

