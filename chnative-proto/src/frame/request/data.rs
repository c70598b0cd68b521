//! The `Data` packet carrying one block from the client.

use crate::block::Block;
use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::SerializableRequest;
use crate::frame::{ClientPacket, PacketWriter};

/// A block sent to the server. An empty block terminates the data stream of a
/// query or insert.
#[derive(Debug, Clone, Copy)]
pub struct Data<'a> {
    pub block: &'a Block,
}

impl Data<'static> {
    /// The terminating empty block.
    pub fn end() -> Self {
        static EMPTY: std::sync::OnceLock<Block> = std::sync::OnceLock::new();
        Data {
            block: EMPTY.get_or_init(Block::new),
        }
    }
}

impl SerializableRequest for Data<'_> {
    const PACKET: ClientPacket = ClientPacket::Data;

    // The table name stays outside the compressed region.
    fn serialize(&self, w: &mut PacketWriter, _: u64) -> Result<(), RequestSerializationError> {
        w.write_string("")?;
        w.begin_compression();
        self.block.write(w)?;
        w.end_compression()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::TypeRegistry;
    use crate::frame::{Compression, PacketReader};

    #[test]
    fn empty_data_packet() {
        let mut w = PacketWriter::new(Compression::None);
        Data::end().write_to(&mut w, 0).unwrap();
        assert_eq!(w.take(), [2, 0, 1, 0, 2, 0xff, 0xff, 0xff, 0xff, 0, 0, 0]);
    }

    #[tokio::test]
    async fn compressed_block_follows_plain_table_name() {
        let mut w = PacketWriter::new(Compression::Lz4);
        Data::end().write_to(&mut w, 0).unwrap();
        let wire = w.take();
        assert_eq!(&wire[..2], &[2, 0]);

        let mut r = PacketReader::new(std::io::Cursor::new(wire[2..].to_vec()));
        r.enable_compression();
        let block = Block::read(&mut r, &TypeRegistry::new()).await.unwrap();
        r.disable_compression().unwrap();
        assert!(block.is_empty());
    }
}
