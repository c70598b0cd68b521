//! Native protocol framing: packet tags, protocol revisions, primitive codecs
//! and the checksummed block compression layer.

pub mod cityhash;
pub mod compression;
pub mod frame_errors;
pub mod reader;
pub mod request;
pub mod response;
pub mod types;
pub mod writer;

use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

pub use compression::{Compression, BLOCK_SIZE};
pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Protocol revisions gating optional fields of the handshake and query packets.
pub mod revision {
    pub const CLIENT_INFO: u64 = 54032;
    pub const SERVER_TIMEZONE: u64 = 54058;
    pub const QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
    pub const SERVER_DISPLAY_NAME: u64 = 54372;
    pub const VERSION_PATCH: u64 = 54401;
    pub const CLIENT_WRITE_INFO: u64 = 54420;
    pub const SETTINGS_SERIALIZED_AS_STRINGS: u64 = 54429;
    pub const INTERSERVER_SECRET: u64 = 54441;
    pub const OPENTELEMETRY: u64 = 54442;
    pub const DISTRIBUTED_DEPTH: u64 = 54448;
    pub const INITIAL_QUERY_START_TIME: u64 = 54449;
    pub const SERVER_QUERY_TIME_IN_PROGRESS: u64 = 54449;
    pub const INCREMENTAL_PROFILE_EVENTS: u64 = 54451;
    pub const PARALLEL_REPLICAS: u64 = 54453;

    /// The revision this client announces in its hello packet.
    pub const TCP_PROTOCOL_VERSION: u64 = PARALLEL_REPLICAS;
}

/// Packets sent by the client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientPacket {
    Hello = 0,
    Query = 1,
    Data = 2,
    Cancel = 3,
    Ping = 4,
    TablesStatusRequest = 5,
    KeepAlive = 6,
}

impl ClientPacket {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Packets sent by the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerPacket {
    Hello = 0,
    Data = 1,
    Exception = 2,
    Progress = 3,
    Pong = 4,
    EndOfStream = 5,
    ProfileInfo = 6,
    Totals = 7,
    Extremes = 8,
    TablesStatusResponse = 9,
    Log = 10,
    TableColumns = 11,
    PartUuids = 12,
    ReadTaskRequest = 13,
    ProfileEvents = 14,
}

impl TryFrom<u64> for ServerPacket {
    type Error = TryFromPrimitiveError<u64>;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ServerPacket::Hello),
            1 => Ok(ServerPacket::Data),
            2 => Ok(ServerPacket::Exception),
            3 => Ok(ServerPacket::Progress),
            4 => Ok(ServerPacket::Pong),
            5 => Ok(ServerPacket::EndOfStream),
            6 => Ok(ServerPacket::ProfileInfo),
            7 => Ok(ServerPacket::Totals),
            8 => Ok(ServerPacket::Extremes),
            9 => Ok(ServerPacket::TablesStatusResponse),
            10 => Ok(ServerPacket::Log),
            11 => Ok(ServerPacket::TableColumns),
            12 => Ok(ServerPacket::PartUuids),
            13 => Ok(ServerPacket::ReadTaskRequest),
            14 => Ok(ServerPacket::ProfileEvents),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ServerPacket",
                primitive: value,
            }),
        }
    }
}

impl Display for ServerPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Kind of query carried in the client info section.
pub const QUERY_KIND_INITIAL: u8 = 1;

/// Interface the client info section claims the query came from.
pub const INTERFACE_TCP: u8 = 1;

/// `Complete` query processing stage.
pub const STAGE_COMPLETE: u64 = 2;

/// Client version announced in the hello packet.
pub const CLIENT_NAME: &str = "chnative";
pub const CLIENT_VERSION_MAJOR: u64 = 1;
pub const CLIENT_VERSION_MINOR: u64 = 1;

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

impl<T: Copy + std::fmt::Debug> TryFromPrimitiveError<T> {
    pub fn primitive(&self) -> T {
        self.primitive
    }
}

/// Unknown compression name in a configuration string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown compression method: {0:?}")]
pub struct UnknownCompression(pub String);

impl FromStr for Compression {
    type Err = UnknownCompression;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "false" | "off" | "0" => Ok(Compression::None),
            "lz4" | "true" | "on" | "1" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(UnknownCompression(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_packet_from_code() {
        assert_eq!(ServerPacket::try_from(5).unwrap(), ServerPacket::EndOfStream);
        assert_eq!(ServerPacket::try_from(14).unwrap(), ServerPacket::ProfileEvents);
        let err = ServerPacket::try_from(99).unwrap_err();
        assert_eq!(err.primitive(), 99);
    }

    #[test]
    fn compression_from_str() {
        assert_eq!("lz4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert_eq!("ZSTD".parse::<Compression>().unwrap(), Compression::Zstd);
        assert_eq!("false".parse::<Compression>().unwrap(), Compression::None);
        assert!("snappy".parse::<Compression>().is_err());
    }
}
