//! Packets sent by the client.

pub mod data;
pub mod hello;
pub mod query;

pub use data::Data;
pub use hello::Hello;
pub use query::{ClientInfo, Query, SettingValue, Settings};

use super::frame_errors::RequestSerializationError;
use super::{ClientPacket, PacketWriter};

/// Packets that can be written to a connection.
pub trait SerializableRequest {
    /// Tag written before the packet body.
    const PACKET: ClientPacket;

    /// Writes the packet body. `revision` is the negotiated protocol revision and
    /// gates optional fields.
    fn serialize(&self, w: &mut PacketWriter, revision: u64)
        -> Result<(), RequestSerializationError>;

    /// Writes the tag followed by the body.
    fn write_to(&self, w: &mut PacketWriter, revision: u64) -> Result<(), RequestSerializationError> {
        w.write_uvarint(Self::PACKET.code() as u64)?;
        self.serialize(w, revision)
    }
}

/// Liveness probe; answered with `Pong`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

impl SerializableRequest for Ping {
    const PACKET: ClientPacket = ClientPacket::Ping;

    fn serialize(&self, _: &mut PacketWriter, _: u64) -> Result<(), RequestSerializationError> {
        Ok(())
    }
}

/// Asks the server to stop the running query.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cancel;

impl SerializableRequest for Cancel {
    const PACKET: ClientPacket = ClientPacket::Cancel;

    fn serialize(&self, _: &mut PacketWriter, _: u64) -> Result<(), RequestSerializationError> {
        Ok(())
    }
}
