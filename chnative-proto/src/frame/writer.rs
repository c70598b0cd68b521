//! In-memory packet builder.
//!
//! A whole client packet is assembled in memory and then flushed to the socket in
//! one go. Between [`PacketWriter::begin_compression`] and
//! [`PacketWriter::end_compression`] bytes are staged separately and cut into
//! compressed blocks of at most `block_size` uncompressed bytes.

use bytes::BufMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::compression::{compress_block, Compression, BLOCK_SIZE};
use super::frame_errors::FrameError;
use super::types;

#[derive(Debug)]
pub struct PacketWriter {
    out: Vec<u8>,
    block: Vec<u8>,
    compression: Compression,
    compressing: bool,
    block_size: usize,
}

impl Default for PacketWriter {
    fn default() -> Self {
        PacketWriter::new(Compression::None)
    }
}

impl PacketWriter {
    pub fn new(compression: Compression) -> Self {
        PacketWriter::with_block_size(compression, BLOCK_SIZE)
    }

    pub fn with_block_size(compression: Compression, block_size: usize) -> Self {
        PacketWriter {
            out: Vec::new(),
            block: Vec::new(),
            compression,
            compressing: false,
            block_size: block_size.max(1),
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Routes subsequent writes through the block compressor. No-op when the writer
    /// was created with [`Compression::None`].
    pub fn begin_compression(&mut self) {
        self.compressing = self.compression.is_enabled();
    }

    /// Emits the trailing partial block and switches back to plain writes.
    pub fn end_compression(&mut self) -> Result<(), FrameError> {
        if !self.compressing {
            return Ok(());
        }
        self.emit_full_blocks()?;
        if !self.block.is_empty() {
            compress_block(&self.block, self.compression, &mut self.out)?;
            self.block.clear();
        }
        self.compressing = false;
        Ok(())
    }

    fn emit_full_blocks(&mut self) -> Result<(), FrameError> {
        let mut start = 0;
        while self.block.len() - start >= self.block_size {
            compress_block(
                &self.block[start..start + self.block_size],
                self.compression,
                &mut self.out,
            )?;
            start += self.block_size;
        }
        self.block.drain(..start);
        Ok(())
    }

    fn sink(&mut self) -> &mut Vec<u8> {
        if self.compressing {
            &mut self.block
        } else {
            &mut self.out
        }
    }

    /// Writes raw bytes. Full blocks are compressed as soon as they are complete, so
    /// staging memory stays bounded by the block size plus the last write.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.sink().extend_from_slice(data);
        if self.compressing && self.block.len() >= self.block_size {
            self.emit_full_blocks()?;
        }
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), FrameError> {
        self.write_raw(&[v])
    }

    pub fn write_bool(&mut self, v: bool) -> Result<(), FrameError> {
        self.write_u8(v as u8)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), FrameError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), FrameError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), FrameError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<(), FrameError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<(), FrameError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<(), FrameError> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_uvarint(&mut self, v: u64) -> Result<(), FrameError> {
        let mut tmp = [0u8; types::MAX_UVARINT_LEN];
        let mut cursor = &mut tmp[..];
        types::write_uvarint(v, &mut cursor);
        let n = types::MAX_UVARINT_LEN - cursor.remaining_mut();
        self.write_raw(&tmp[..n])
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> Result<(), FrameError> {
        self.write_uvarint(v.len() as u64)?;
        self.write_raw(v)
    }

    pub fn write_string(&mut self, v: &str) -> Result<(), FrameError> {
        self.write_bytes(v.as_bytes())
    }

    pub fn write_uuid(&mut self, v: &Uuid) -> Result<(), FrameError> {
        self.write_raw(&types::uuid_to_wire(v))
    }

    /// Bytes ready to be sent. Staged, not yet compressed bytes are not included.
    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Takes the finished bytes, leaving the writer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    /// Closes any open compression scope and writes everything to `dst`.
    pub async fn flush_to(
        &mut self,
        dst: &mut (impl AsyncWrite + Unpin + ?Sized),
    ) -> Result<(), FrameError> {
        self.end_compression()?;
        dst.write_all(&self.out).await?;
        dst.flush().await?;
        self.out.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::compression::HEADER_SIZE;
    use crate::frame::reader::PacketReader;

    fn block_sizes(mut wire: &[u8]) -> Vec<usize> {
        let mut sizes = Vec::new();
        while !wire.is_empty() {
            let compressed = u32::from_le_bytes(wire[17..21].try_into().unwrap()) as usize;
            let raw = u32::from_le_bytes(wire[21..25].try_into().unwrap()) as usize;
            sizes.push(raw);
            wire = &wire[16 + compressed..];
        }
        sizes
    }

    #[test]
    fn plain_writes_go_straight_out() {
        let mut w = PacketWriter::new(Compression::None);
        w.write_uvarint(300).unwrap();
        w.write_string("ab").unwrap();
        w.begin_compression();
        w.write_u8(7).unwrap();
        w.end_compression().unwrap();
        assert_eq!(w.take(), vec![0xac, 0x02, 2, b'a', b'b', 7]);
        assert!(w.is_empty());
    }

    #[test]
    fn blocks_are_cut_at_block_size() {
        for (len, expected) in [
            (15, vec![15]),
            (16, vec![16]),
            (17, vec![16, 1]),
            (40, vec![16, 16, 8]),
        ] {
            let mut w = PacketWriter::with_block_size(Compression::Lz4, 16);
            w.write_u8(1).unwrap();
            w.begin_compression();
            w.write_raw(&vec![0x5a; len]).unwrap();
            w.end_compression().unwrap();
            w.write_u8(2).unwrap();

            let out = w.take();
            assert_eq!(out[0], 1);
            assert_eq!(*out.last().unwrap(), 2);
            let blocks = &out[1..out.len() - 1];
            assert_eq!(block_sizes(blocks), expected, "len {len}");
            assert!(blocks.len() >= expected.len() * HEADER_SIZE);
        }
    }

    #[tokio::test]
    async fn reader_decodes_writer_output() {
        let mut w = PacketWriter::with_block_size(Compression::Zstd, 8);
        w.write_string("plain").unwrap();
        w.begin_compression();
        for i in 0..10u64 {
            w.write_u64(i * 1000).unwrap();
        }
        w.write_string("tail").unwrap();
        w.end_compression().unwrap();

        let mut wire = Vec::new();
        w.flush_to(&mut wire).await.unwrap();

        let mut rd = PacketReader::new(std::io::Cursor::new(wire));
        assert_eq!(rd.read_string().await.unwrap(), "plain");
        rd.enable_compression();
        for i in 0..10u64 {
            assert_eq!(rd.read_u64().await.unwrap(), i * 1000);
        }
        assert_eq!(rd.read_string().await.unwrap(), "tail");
        rd.disable_compression().unwrap();
    }
}
