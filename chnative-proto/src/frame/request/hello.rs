//! First packet of every connection.

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::SerializableRequest;
use crate::frame::revision::TCP_PROTOCOL_VERSION;
use crate::frame::{ClientPacket, PacketWriter, CLIENT_NAME, CLIENT_VERSION_MAJOR, CLIENT_VERSION_MINOR};

/// Client identity plus credentials. The server answers with its own hello or an
/// exception.
#[derive(Debug, Clone)]
pub struct Hello<'a> {
    pub database: &'a str,
    pub user: &'a str,
    pub password: &'a str,
}

impl SerializableRequest for Hello<'_> {
    const PACKET: ClientPacket = ClientPacket::Hello;

    // The revision announced here is always the one this client speaks; the server
    // answers with the lower of the two.
    fn serialize(&self, w: &mut PacketWriter, _: u64) -> Result<(), RequestSerializationError> {
        w.write_string(CLIENT_NAME)?;
        w.write_uvarint(CLIENT_VERSION_MAJOR)?;
        w.write_uvarint(CLIENT_VERSION_MINOR)?;
        w.write_uvarint(TCP_PROTOCOL_VERSION)?;
        w.write_string(self.database)?;
        w.write_string(self.user)?;
        w.write_string(self.password)?;
        Ok(())
    }
}
