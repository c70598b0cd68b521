//! Async Rust client for the [ClickHouse](https://clickhouse.com) native TCP protocol.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Db]: the client of one server, owning
//! a bounded pool of connections to it.
//! A `Db` is built with a [DbBuilder] or from a connection string:
//!
//! ```rust,no_run
//! use chnative::{Context, Db, DbBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let db: Db = DbBuilder::from_dsn("ch://default:@localhost:9000/default?sslmode=disable")?
//!         .pool_size(8)
//!         .build()?;
//!     db.ping(&Context::background()).await?;
//!     Ok(())
//! }
//! ```
//! No connection is opened until the first request needs one.
//!
//! ### Making queries
//! Every request takes a [Context], which carries its deadline and cancellation:
//! * [exec](Db::exec) runs a statement and discards its rows,
//! * [query](Db::query) streams the result block by block,
//! * [query_block](Db::query_block) collects the whole result into one [Block],
//! * [insert](Db::insert) sends a [Block] of rows.
//!
//! ```rust,no_run
//! # use chnative::{Block, Column, Context, Db, TypeRegistry, Value};
//! # async fn check_only_compiles(db: &Db) -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::with_timeout(std::time::Duration::from_secs(30));
//! db.exec(&ctx, "CREATE TABLE IF NOT EXISTS t (id UInt64, name String) ENGINE = Memory")
//!     .await?;
//!
//! let registry = TypeRegistry::new();
//! let ids = Column::with_values("id", "UInt64", &registry, (0..3).map(Value::UInt64))?;
//! let names = Column::with_values(
//!     "name",
//!     "String",
//!     &registry,
//!     ["a", "b", "c"].map(|s| Value::String(s.to_owned())),
//! )?;
//! let block = Block::with_columns([ids, names])?;
//! db.insert(&ctx, "INSERT INTO t VALUES", &block).await?;
//!
//! let result = db.query_block(&ctx, "SELECT id, name FROM t ORDER BY id").await?;
//! let names: Vec<String> = result.column("name").unwrap().values()?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Clusters
//! The [cluster] module routes requests over shards and replicas, each of them a
//! [Db], and keeps unhealthy replicas out of rotation.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod client;
pub mod cluster;
pub mod errors;
pub(crate) mod network;
pub mod policies;

pub(crate) mod utils;

pub use chnative_proto::block::{Block, BlockInfo};
pub use chnative_proto::column::{Column, ColumnType, TypeRegistry, Value};
pub use chnative_proto::frame::request::{SettingValue, Settings};
pub use chnative_proto::frame::response::{ProfileInfo, Progress};

pub use client::{
    BlockStream, Compression, Config, Context, Db, DbBuilder, DbStats, QueryResult, DEFAULT_PORT,
};
pub use network::tls::{TlsContext, TlsMode};
pub use network::PoolStats;

pub use errors::{DbError, QueryError};
