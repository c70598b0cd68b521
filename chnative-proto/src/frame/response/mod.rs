pub mod exception;
pub mod hello;
pub mod profile_info;
pub mod progress;

pub use hello::ServerHello;
pub use profile_info::{ProfileInfo, TableColumns};
pub use progress::Progress;

use uuid::Uuid;

use crate::block::Block;
use crate::column::TypeRegistry;
use crate::errors::DbError;
use crate::frame::frame_errors::ParseError;
use crate::frame::{PacketReader, ServerPacket};

/// Upper bound on the number of part UUIDs accepted in one packet.
const MAX_PART_UUIDS: u64 = 1 << 20;

/// A decoded server packet.
#[derive(Debug)]
#[non_exhaustive]
pub enum Response {
    Hello(ServerHello),
    Data(Block),
    Exception(DbError),
    Progress(Progress),
    Pong,
    EndOfStream,
    ProfileInfo(ProfileInfo),
    Totals(Block),
    Extremes(Block),
    Log(Block),
    TableColumns(TableColumns),
    PartUuids(Vec<Uuid>),
    ReadTaskRequest,
    ProfileEvents(Block),
}

impl Response {
    /// Reads one packet: the tag, then its body. `compressed` tells whether data
    /// blocks of this query are wrapped in compressed frames.
    pub async fn read(
        r: &mut PacketReader,
        revision: u64,
        compressed: bool,
        registry: &TypeRegistry,
    ) -> Result<Response, ParseError> {
        let tag = r.read_uvarint().await?;
        let packet = ServerPacket::try_from(tag)?;
        let response = match packet {
            ServerPacket::Hello => Response::Hello(ServerHello::deserialize(r).await?),
            ServerPacket::Data => Response::Data(read_data_block(r, compressed, registry).await?),
            ServerPacket::Totals => {
                Response::Totals(read_data_block(r, compressed, registry).await?)
            }
            ServerPacket::Extremes => {
                Response::Extremes(read_data_block(r, compressed, registry).await?)
            }
            ServerPacket::Exception => Response::Exception(exception::deserialize(r).await?),
            ServerPacket::Progress => Response::Progress(Progress::deserialize(r, revision).await?),
            ServerPacket::Pong => Response::Pong,
            ServerPacket::EndOfStream => Response::EndOfStream,
            ServerPacket::ProfileInfo => Response::ProfileInfo(ProfileInfo::deserialize(r).await?),
            ServerPacket::Log => Response::Log(read_data_block(r, false, registry).await?),
            ServerPacket::ProfileEvents => {
                Response::ProfileEvents(read_data_block(r, false, registry).await?)
            }
            ServerPacket::TableColumns => {
                Response::TableColumns(TableColumns::deserialize(r).await?)
            }
            ServerPacket::PartUuids => {
                let n = r.read_uvarint().await?;
                if n > MAX_PART_UUIDS {
                    return Err(ParseError::BadData(format!("{n} part uuids")));
                }
                let mut uuids = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    uuids.push(r.read_uuid().await?);
                }
                Response::PartUuids(uuids)
            }
            ServerPacket::ReadTaskRequest => Response::ReadTaskRequest,
            ServerPacket::TablesStatusResponse => {
                return Err(ParseError::BadData(
                    "unexpected TablesStatusResponse packet".to_owned(),
                ))
            }
        };
        Ok(response)
    }

    pub fn packet(&self) -> ServerPacket {
        match self {
            Response::Hello(_) => ServerPacket::Hello,
            Response::Data(_) => ServerPacket::Data,
            Response::Exception(_) => ServerPacket::Exception,
            Response::Progress(_) => ServerPacket::Progress,
            Response::Pong => ServerPacket::Pong,
            Response::EndOfStream => ServerPacket::EndOfStream,
            Response::ProfileInfo(_) => ServerPacket::ProfileInfo,
            Response::Totals(_) => ServerPacket::Totals,
            Response::Extremes(_) => ServerPacket::Extremes,
            Response::Log(_) => ServerPacket::Log,
            Response::TableColumns(_) => ServerPacket::TableColumns,
            Response::PartUuids(_) => ServerPacket::PartUuids,
            Response::ReadTaskRequest => ServerPacket::ReadTaskRequest,
            Response::ProfileEvents(_) => ServerPacket::ProfileEvents,
        }
    }
}

/// Table name (always plain), then the block, inside a compressed frame when enabled.
async fn read_data_block(
    r: &mut PacketReader,
    compressed: bool,
    registry: &TypeRegistry,
) -> Result<Block, ParseError> {
    r.skip_string().await?;
    if !compressed {
        return Block::read(r, registry).await;
    }
    r.enable_compression();
    let block = Block::read(r, registry).await;
    r.disable_compression()?;
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{Column, Value};
    use crate::frame::revision::TCP_PROTOCOL_VERSION;
    use crate::frame::{Compression, PacketWriter};
    use assert_matches::assert_matches;

    fn sample_block() -> Block {
        let registry = TypeRegistry::new();
        let n = Column::with_values("n", "UInt64", &registry, (0..5u64).map(Value::UInt64));
        Block::with_columns([n.unwrap()]).unwrap()
    }

    async fn decode(wire: Vec<u8>, compressed: bool) -> Vec<Response> {
        let registry = TypeRegistry::new();
        let mut r = PacketReader::new(std::io::Cursor::new(wire));
        let mut out = Vec::new();
        loop {
            let resp = Response::read(&mut r, TCP_PROTOCOL_VERSION, compressed, &registry)
                .await
                .unwrap();
            let done = matches!(resp, Response::EndOfStream);
            out.push(resp);
            if done {
                return out;
            }
        }
    }

    #[tokio::test]
    async fn compressed_data_then_end_of_stream() {
        let mut w = PacketWriter::new(Compression::Lz4);
        w.write_uvarint(ServerPacket::Data as u64).unwrap();
        w.write_string("").unwrap();
        w.begin_compression();
        sample_block().write(&mut w).unwrap();
        w.end_compression().unwrap();
        w.write_uvarint(ServerPacket::Pong as u64).unwrap();
        w.write_uvarint(ServerPacket::EndOfStream as u64).unwrap();

        let responses = decode(w.take(), true).await;
        assert_eq!(responses.len(), 3);
        assert_matches!(&responses[0], Response::Data(b) if b.rows() == 5);
        assert_matches!(responses[1], Response::Pong);
    }

    #[tokio::test]
    async fn log_blocks_are_never_compressed() {
        let mut w = PacketWriter::new(Compression::Lz4);
        w.write_uvarint(ServerPacket::Log as u64).unwrap();
        w.write_string("").unwrap();
        sample_block().write(&mut w).unwrap();
        w.write_uvarint(ServerPacket::EndOfStream as u64).unwrap();

        let responses = decode(w.take(), true).await;
        assert_matches!(&responses[0], Response::Log(b) if b.rows() == 5);
    }

    #[tokio::test]
    async fn part_uuids_and_unknown_packets() {
        let id = Uuid::from_u128(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        let mut w = PacketWriter::new(Compression::None);
        w.write_uvarint(ServerPacket::PartUuids as u64).unwrap();
        w.write_uvarint(1).unwrap();
        w.write_uuid(&id).unwrap();
        w.write_uvarint(ServerPacket::EndOfStream as u64).unwrap();
        let responses = decode(w.take(), false).await;
        assert_matches!(&responses[0], Response::PartUuids(ids) if ids == &vec![id]);

        let registry = TypeRegistry::new();
        let mut r = PacketReader::new(std::io::Cursor::new(vec![42]));
        let err = Response::read(&mut r, TCP_PROTOCOL_VERSION, false, &registry)
            .await
            .unwrap_err();
        assert_matches!(err, ParseError::UnknownPacket(e) if e.primitive() == 42);
    }
}
