//! Streaming reader for server packets.
//!
//! The native protocol has no length prefix on packets, so decoding pulls primitives
//! straight from the socket. While compression is enabled (inside data blocks) the
//! reader decodes one compressed block at a time into an internal buffer and serves
//! reads from it.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, BufReader};

use super::compression::{decompress_block, BlockHeader, HEADER_SIZE, MAX_BLOCK_SIZE};
use super::frame_errors::FrameError;
use super::types::{uuid_from_wire, MAX_UVARINT_LEN};
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub struct PacketReader {
    inner: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    compressed: bool,
    verify_checksum: bool,
    // Decoded bytes of the current compressed block and the read position in it.
    block: Vec<u8>,
    pos: usize,
    zbuf: Vec<u8>,
    scratch: Vec<u8>,
}

impl std::fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("compressed", &self.compressed)
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}

impl PacketReader {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        PacketReader {
            inner: BufReader::with_capacity(READ_BUFFER_SIZE, Box::new(reader)),
            compressed: false,
            verify_checksum: true,
            block: Vec::new(),
            pos: 0,
            zbuf: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn set_verify_checksum(&mut self, verify: bool) {
        self.verify_checksum = verify;
    }

    /// Switches to reading compressed blocks.
    pub fn enable_compression(&mut self) {
        self.compressed = true;
    }

    /// Switches back to plain reads. Fails if decoded bytes were left unconsumed,
    /// which means the caller and the server disagree about the block layout.
    pub fn disable_compression(&mut self) -> Result<(), FrameError> {
        self.compressed = false;
        self.release()
    }

    /// Drops decoded data. Returns [`FrameError::UnreadData`] if any was left.
    pub fn release(&mut self) -> Result<(), FrameError> {
        let unread = self.buffered();
        self.block.clear();
        self.pos = 0;
        if unread > 0 {
            return Err(FrameError::UnreadData(unread));
        }
        Ok(())
    }

    /// Decoded but not yet consumed bytes of the current compressed block.
    pub fn buffered(&self) -> usize {
        self.block.len() - self.pos
    }

    /// Bytes received from the socket or decoded from a block that nobody has consumed yet.
    pub fn pending(&self) -> usize {
        self.buffered() + self.inner.buffer().len()
    }

    /// Checks without waiting whether the idle stream is still usable. Fails if the
    /// peer closed it or sent bytes nobody asked for.
    pub fn probe(&mut self) -> Result<(), FrameError> {
        let pending = self.pending();
        if pending > 0 {
            return Err(FrameError::UnreadData(pending));
        }
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        match Pin::new(&mut self.inner).poll_fill_buf(&mut cx) {
            Poll::Pending => Ok(()),
            Poll::Ready(Ok([])) => Err(FrameError::StdIoError(
                std::io::ErrorKind::UnexpectedEof.into(),
            )),
            Poll::Ready(Ok(buf)) => Err(FrameError::UnreadData(buf.len())),
            Poll::Ready(Err(e)) => Err(e.into()),
        }
    }

    async fn read_block(&mut self) -> Result<(), FrameError> {
        let mut raw = [0u8; HEADER_SIZE];
        read_exact_plain(&mut self.inner, &mut raw).await?;
        let header = BlockHeader::parse(&raw)?;
        self.zbuf.resize(header.payload_size, 0);
        read_exact_plain(&mut self.inner, &mut self.zbuf).await?;
        decompress_block(
            &raw,
            &header,
            &self.zbuf,
            self.verify_checksum,
            &mut self.block,
        )?;
        self.pos = 0;
        Ok(())
    }

    /// Fills `out` completely or fails; no partial values are exposed.
    pub async fn read_exact(&mut self, out: &mut [u8]) -> Result<(), FrameError> {
        if !self.compressed {
            return read_exact_plain(&mut self.inner, out).await;
        }
        let mut filled = 0;
        while filled < out.len() {
            if self.pos == self.block.len() {
                self.read_block().await?;
                continue;
            }
            let n = (out.len() - filled).min(self.block.len() - self.pos);
            out[filled..filled + n].copy_from_slice(&self.block[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }

    /// Reads `count` values of `width` bytes each as one byte run. The buffer grows
    /// with the data received, so a corrupt count fails on the stream instead of
    /// allocating its full size up front.
    pub async fn read_fixed(&mut self, count: usize, width: usize) -> Result<Vec<u8>, FrameError> {
        let len = count
            .checked_mul(width)
            .filter(|len| *len <= MAX_BLOCK_SIZE)
            .ok_or(FrameError::LengthTooLarge(
                (count as u64).saturating_mul(width as u64),
            ))?;
        let mut out = Vec::with_capacity(len.min(READ_BUFFER_SIZE));
        while out.len() < len {
            let start = out.len();
            out.resize(start + (len - start).min(READ_BUFFER_SIZE), 0);
            self.read_exact(&mut out[start..]).await?;
        }
        Ok(out)
    }

    async fn read_array<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_u8(&mut self) -> Result<u8, FrameError> {
        if self.compressed && self.pos < self.block.len() {
            let b = self.block[self.pos];
            self.pos += 1;
            return Ok(b);
        }
        Ok(self.read_array::<1>().await?[0])
    }

    pub async fn read_bool(&mut self) -> Result<bool, FrameError> {
        Ok(self.read_u8().await? != 0)
    }

    pub async fn read_i8(&mut self) -> Result<i8, FrameError> {
        Ok(self.read_u8().await? as i8)
    }

    pub async fn read_u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_le_bytes(self.read_array().await?))
    }

    pub async fn read_u32(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_le_bytes(self.read_array().await?))
    }

    pub async fn read_i32(&mut self) -> Result<i32, FrameError> {
        Ok(i32::from_le_bytes(self.read_array().await?))
    }

    pub async fn read_u64(&mut self) -> Result<u64, FrameError> {
        Ok(u64::from_le_bytes(self.read_array().await?))
    }

    pub async fn read_i64(&mut self) -> Result<i64, FrameError> {
        Ok(i64::from_le_bytes(self.read_array().await?))
    }

    pub async fn read_f32(&mut self) -> Result<f32, FrameError> {
        Ok(f32::from_le_bytes(self.read_array().await?))
    }

    pub async fn read_uvarint(&mut self) -> Result<u64, FrameError> {
        let mut v: u64 = 0;
        for i in 0..MAX_UVARINT_LEN {
            let b = self.read_u8().await?;
            if i == MAX_UVARINT_LEN - 1 && b > 1 {
                return Err(FrameError::VarintOverflow);
            }
            v |= ((b & 0x7f) as u64) << (7 * i);
            if b < 0x80 {
                return Ok(v);
            }
        }
        Err(FrameError::VarintOverflow)
    }

    async fn read_len(&mut self) -> Result<usize, FrameError> {
        let len = self.read_uvarint().await?;
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= MAX_BLOCK_SIZE)
            .ok_or(FrameError::LengthTooLarge(len))
    }

    /// Reads a length-prefixed byte string into an internal buffer and returns a view
    /// of it. The view is invalidated by the next read call.
    pub async fn read_bytes_view(&mut self) -> Result<&[u8], FrameError> {
        let len = self.read_len().await?;
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.resize(len, 0);
        let res = self.read_exact(&mut scratch).await;
        self.scratch = scratch;
        res?;
        Ok(&self.scratch)
    }

    pub async fn read_bytes(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = self.read_len().await?;
        let mut out = vec![0u8; len];
        self.read_exact(&mut out).await?;
        Ok(out)
    }

    /// Reads a length-prefixed string. Invalid UTF-8 is replaced, since strings read
    /// through this path are protocol metadata (names, messages), not user data.
    pub async fn read_string(&mut self) -> Result<String, FrameError> {
        let raw = self.read_bytes().await?;
        Ok(String::from_utf8(raw)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }

    pub async fn skip_string(&mut self) -> Result<(), FrameError> {
        self.read_bytes_view().await.map(|_| ())
    }

    pub async fn read_uuid(&mut self) -> Result<Uuid, FrameError> {
        Ok(uuid_from_wire(&self.read_array().await?))
    }
}

async fn read_exact_plain(
    reader: &mut (impl AsyncRead + Unpin),
    out: &mut [u8],
) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < out.len() {
        let n = reader.read(&mut out[filled..]).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed(out.len() - filled, out.len()));
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::compression::{compress_block, Compression};
    use crate::frame::types::{write_string, write_uvarint};
    use assert_matches::assert_matches;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn probe_detects_closed_peer_and_stray_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut r = PacketReader::new(client);
        r.probe().unwrap();
        server.write_all(&[1]).await.unwrap();
        assert_matches!(r.probe(), Err(FrameError::UnreadData(1)));
        assert_eq!(r.pending(), 1);

        let (client, server) = tokio::io::duplex(64);
        let mut r = PacketReader::new(client);
        drop(server);
        assert_matches!(r.probe(), Err(FrameError::StdIoError(_)));
    }

    #[tokio::test]
    async fn fixed_reads_reject_oversized_counts() {
        let mut rd = PacketReader::new(std::io::Cursor::new(vec![7u8; 24]));
        assert_matches!(
            rd.read_fixed(usize::MAX / 4, 8).await,
            Err(FrameError::LengthTooLarge(_))
        );
        assert_matches!(
            rd.read_fixed(MAX_BLOCK_SIZE / 8 + 1, 8).await,
            Err(FrameError::LengthTooLarge(_))
        );
        // In range, but longer than the stream.
        assert_matches!(
            rd.read_fixed(1 << 20, 8).await,
            Err(FrameError::ConnectionClosed(..))
        );

        let mut rd = PacketReader::new(std::io::Cursor::new(vec![7u8; 24]));
        assert_eq!(rd.read_fixed(3, 8).await.unwrap(), vec![7u8; 24]);
    }

    #[tokio::test]
    async fn reads_plain_primitives() {
        let mut buf = Vec::new();
        write_uvarint(300, &mut buf);
        write_string("hello", &mut buf);
        buf.extend_from_slice(&(-5i32).to_le_bytes());
        buf.push(1);

        let mut rd = PacketReader::new(std::io::Cursor::new(buf));
        assert_eq!(rd.read_uvarint().await.unwrap(), 300);
        assert_eq!(rd.read_bytes_view().await.unwrap(), b"hello");
        assert_eq!(rd.read_i32().await.unwrap(), -5);
        assert!(rd.read_bool().await.unwrap());
        assert_matches!(rd.read_u8().await, Err(FrameError::ConnectionClosed(1, 1)));
    }

    #[tokio::test]
    async fn reads_across_compressed_blocks() {
        let mut payload = Vec::new();
        write_string("first block", &mut payload);
        let mut second = Vec::new();
        second.extend_from_slice(&42u64.to_le_bytes());

        let mut wire = Vec::new();
        // A u64 split over two blocks.
        payload.extend_from_slice(&second[..3]);
        compress_block(&payload, Compression::Lz4, &mut wire).unwrap();
        compress_block(&second[3..], Compression::Zstd, &mut wire).unwrap();
        wire.push(0x7f);

        let mut rd = PacketReader::new(std::io::Cursor::new(wire));
        rd.enable_compression();
        assert_eq!(rd.read_string().await.unwrap(), "first block");
        assert_eq!(rd.read_u64().await.unwrap(), 42);
        rd.disable_compression().unwrap();
        assert_eq!(rd.read_u8().await.unwrap(), 0x7f);
    }

    #[tokio::test]
    async fn unread_data_is_reported() {
        let mut wire = Vec::new();
        compress_block(&[1, 2, 3, 4], Compression::Lz4, &mut wire).unwrap();
        let mut rd = PacketReader::new(std::io::Cursor::new(wire));
        rd.enable_compression();
        assert_eq!(rd.read_u8().await.unwrap(), 1);
        assert_eq!(rd.buffered(), 3);
        assert_matches!(rd.disable_compression(), Err(FrameError::UnreadData(3)));
        assert_eq!(rd.buffered(), 0);
    }

    #[tokio::test]
    async fn truncated_block_fails() {
        let mut wire = Vec::new();
        compress_block(&[9u8; 128], Compression::None, &mut wire).unwrap();
        wire.truncate(wire.len() - 10);
        let mut rd = PacketReader::new(std::io::Cursor::new(wire));
        rd.enable_compression();
        let mut out = [0u8; 128];
        assert_matches!(
            rd.read_exact(&mut out).await,
            Err(FrameError::ConnectionClosed(10, 128))
        );
    }
}
