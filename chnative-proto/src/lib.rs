//! Wire-level building blocks of the ClickHouse native TCP protocol.
//!
//! The crate covers the primitive codec and packet framing ([`frame`]), the
//! checksummed block compression layer, the column codecs ([`column`]) and
//! [`Block`], the unit of data exchanged in both directions. It does no I/O of
//! its own beyond reading from an [`AsyncRead`](tokio::io::AsyncRead) and
//! flushing to an [`AsyncWrite`](tokio::io::AsyncWrite), and is mainly meant to
//! be used by the `chnative` driver.

pub mod block;
pub mod column;
pub mod errors;
pub mod frame;

pub use crate::block::{Block, BlockInfo};
pub use crate::column::{Column, ColumnType, TypeRegistry, Value};
pub use crate::errors::DbError;
pub use crate::frame::Compression;
