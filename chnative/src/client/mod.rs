//! The client of a single server: [`Db`] and everything needed to configure it
//! and read its results.

pub(crate) mod config;
pub use config::{Config, DEFAULT_PORT};

mod context;
pub use context::Context;

pub(crate) mod db;
pub use db::{Db, DbStats};

pub mod db_builder;
pub use db_builder::DbBuilder;

mod query_result;
pub use query_result::{BlockStream, QueryResult};

pub use chnative_proto::frame::Compression;
