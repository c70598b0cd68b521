//! Results of queries and the packet loops that collect them.

use chnative_proto::block::Block;
use chnative_proto::frame::response::{ProfileInfo, Progress, Response};
use futures::Stream;
use tracing::trace;

use super::context::Context;
use super::db::Db;
use crate::errors::QueryError;
use crate::network::{Connection, PooledConnection};

/// Outcome of a statement whose rows are not returned: `exec` and `insert`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct QueryResult {
    /// Rows in the data blocks the server sent back.
    pub rows: u64,
    /// Progress reported by the server, summed over all progress packets.
    pub progress: Progress,
}

/// Everything a query sends besides its data blocks.
#[derive(Debug, Default)]
pub(crate) struct ResponseMeta {
    pub(crate) progress: Progress,
    pub(crate) profile_info: Option<ProfileInfo>,
    pub(crate) totals: Option<Block>,
    pub(crate) extremes: Option<Block>,
    /// The first block of a result carries the columns and no rows.
    pub(crate) header: Option<Block>,
}

impl ResponseMeta {
    /// Absorbs a packet that is not a data block. Fails on an exception, or on a
    /// packet that does not belong to a query response.
    fn absorb(&mut self, response: Response) -> Result<(), QueryError> {
        match response {
            Response::Exception(err) => return Err(err.into()),
            Response::Progress(delta) => self.progress.add(&delta),
            Response::ProfileInfo(info) => self.profile_info = Some(info),
            Response::Totals(block) => self.totals = Some(block),
            Response::Extremes(block) => self.extremes = Some(block),
            Response::TableColumns(_)
            | Response::Log(_)
            | Response::ProfileEvents(_)
            | Response::PartUuids(_) => {}
            other => return Err(QueryError::UnexpectedPacket(other.packet())),
        }
        Ok(())
    }
}

/// Reads packets until the next block with rows. `None` once the server ends the
/// stream.
pub(crate) async fn read_next_block(
    conn: &mut Connection,
    meta: &mut ResponseMeta,
) -> Result<Option<Block>, QueryError> {
    loop {
        match conn.receive().await? {
            Response::Data(block) if block.rows() == 0 => {
                if meta.header.is_none() && !block.is_empty() {
                    meta.header = Some(block);
                }
            }
            Response::Data(block) => return Ok(Some(block)),
            Response::EndOfStream => return Ok(None),
            other => meta.absorb(other)?,
        }
    }
}

/// Drains the response of a statement, counting the rows.
pub(crate) async fn read_result(conn: &mut Connection) -> Result<QueryResult, QueryError> {
    let mut meta = ResponseMeta::default();
    let mut rows = 0;
    while let Some(block) = read_next_block(conn, &mut meta).await? {
        rows += block.rows() as u64;
    }
    Ok(QueryResult {
        rows,
        progress: meta.progress,
    })
}

/// Reads the empty block an insert is answered with; it describes the columns
/// the server expects.
pub(crate) async fn read_sample_block(conn: &mut Connection) -> Result<Block, QueryError> {
    loop {
        match conn.receive().await? {
            Response::Data(block) => return Ok(block),
            Response::Exception(err) => return Err(err.into()),
            Response::TableColumns(columns) => {
                trace!("[{}] Insert into {}", conn.addr(), columns.table);
            }
            Response::Progress(_) | Response::Log(_) | Response::ProfileEvents(_) => {}
            other => return Err(QueryError::UnexpectedPacket(other.packet())),
        }
    }
}

/// Blocks of a running query, pulled one at a time.
///
/// The stream holds its connection until the server ends the result. Dropping it
/// earlier closes the connection, since the rest of the result would still be on
/// the wire.
///
/// ```rust,no_run
/// # use chnative::{Context, Db};
/// # async fn example(db: &Db) -> Result<(), Box<dyn std::error::Error>> {
/// let ctx = Context::background();
/// let mut blocks = db.query(&ctx, "SELECT number FROM system.numbers LIMIT 10").await?;
/// while let Some(block) = blocks.next().await? {
///     let numbers: Vec<u64> = block.columns()[0].values()?;
///     println!("{numbers:?}");
/// }
/// println!("read {} rows", blocks.progress().rows);
/// # Ok(())
/// # }
/// ```
pub struct BlockStream {
    db: Db,
    ctx: Context,
    conn: Option<PooledConnection>,
    meta: ResponseMeta,
    rows: u64,
}

impl std::fmt::Debug for BlockStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStream")
            .field("finished", &self.is_finished())
            .field("rows", &self.rows)
            .field("progress", &self.meta.progress)
            .finish_non_exhaustive()
    }
}

impl BlockStream {
    pub(crate) fn new(db: Db, ctx: Context, conn: PooledConnection) -> Self {
        BlockStream {
            db,
            ctx,
            conn: Some(conn),
            meta: ResponseMeta::default(),
            rows: 0,
        }
    }

    /// The next block with at least one row, or `None` at the end of the result.
    ///
    /// An error ends the stream; the connection is then returned or closed the same
    /// way as for any other request.
    pub async fn next(&mut self) -> Result<Option<Block>, QueryError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(None);
        };
        let res = self
            .ctx
            .run(read_next_block(&mut conn, &mut self.meta))
            .await;
        match res {
            Ok(Ok(Some(block))) => {
                self.rows += block.rows() as u64;
                self.conn = Some(conn);
                Ok(Some(block))
            }
            other => self.db.finish(conn, other).await,
        }
    }

    /// Reads the remaining blocks into one.
    ///
    /// A result without rows comes back as the header block: the columns with no
    /// values.
    pub async fn collect(mut self) -> Result<Block, QueryError> {
        let mut out = Block::new();
        while let Some(block) = self.next().await? {
            out.append(&block)?;
        }
        if out.is_empty() {
            if let Some(header) = self.meta.header.take() {
                return Ok(header);
            }
        }
        Ok(out)
    }

    /// Adapts the stream to [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Block, QueryError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut blocks = state?;
            match blocks.next().await {
                Ok(Some(block)) => Some((Ok(block), Some(blocks))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Whether the result was read to the end or failed.
    pub fn is_finished(&self) -> bool {
        self.conn.is_none()
    }

    /// Rows returned so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Progress accumulated so far.
    pub fn progress(&self) -> &Progress {
        &self.meta.progress
    }

    /// Column names and types of the result, known once the first packet arrived.
    pub fn header(&self) -> Option<&Block> {
        self.meta.header.as_ref()
    }

    /// Totals row of a `WITH TOTALS` query, sent after the data.
    pub fn totals(&self) -> Option<&Block> {
        self.meta.totals.as_ref()
    }

    /// Minimums and maximums of each column, when the `extremes` setting is on.
    pub fn extremes(&self) -> Option<&Block> {
        self.meta.extremes.as_ref()
    }

    pub fn profile_info(&self) -> Option<&ProfileInfo> {
        self.meta.profile_info.as_ref()
    }
}
