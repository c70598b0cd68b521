//! Checksummed compressed blocks.
//!
//! ```text
//! [16B checksum][1B method][4B compressed size][4B uncompressed size][payload]
//! ```
//!
//! The checksum covers everything after itself. The compressed size counts the
//! 9-byte method+sizes header together with the payload.

use std::fmt::Display;

use super::cityhash::{city_hash_128, Hash128};
use super::frame_errors::FrameError;

pub const CHECKSUM_SIZE: usize = 16;
/// Method byte plus the two size words.
pub const COMPRESSION_HEADER_SIZE: usize = 9;
pub const HEADER_SIZE: usize = CHECKSUM_SIZE + COMPRESSION_HEADER_SIZE;

/// Uncompressed bytes accumulated before a block is emitted.
pub const BLOCK_SIZE: usize = 1 << 20;

/// Upper bound accepted for a single block, to reject corrupted headers early.
pub const MAX_BLOCK_SIZE: usize = 1 << 30;

pub const METHOD_NONE: u8 = 0x02;
pub const METHOD_LZ4: u8 = 0x82;
pub const METHOD_ZSTD: u8 = 0x90;

/// Block compression used for data packets.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum Compression {
    /// Data packets are sent as plain bytes.
    None,
    /// LZ4 block compression.
    #[default]
    Lz4,
    /// Zstandard compression.
    Zstd,
}

impl Compression {
    pub fn is_enabled(self) -> bool {
        self != Compression::None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    fn method(self) -> u8 {
        match self {
            Compression::None => METHOD_NONE,
            Compression::Lz4 => METHOD_LZ4,
            Compression::Zstd => METHOD_ZSTD,
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level used for zstd blocks. Blocks are small, so speed wins over ratio.
const ZSTD_LEVEL: i32 = 1;

/// Compresses `data` into a complete block (header included) appended to `out`.
///
/// `Compression::None` produces a block with method byte 0x02 carrying `data` as is.
pub fn compress_block(
    data: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    let start = out.len();
    out.resize(start + HEADER_SIZE, 0);
    match compression {
        Compression::None => out.extend_from_slice(data),
        Compression::Lz4 => {
            let bound = lz4_flex::block::get_maximum_output_size(data.len());
            out.resize(start + HEADER_SIZE + bound, 0);
            let written = lz4_flex::block::compress_into(data, &mut out[start + HEADER_SIZE..])?;
            out.truncate(start + HEADER_SIZE + written);
        }
        Compression::Zstd => {
            let compressed =
                zstd::bulk::compress(data, ZSTD_LEVEL).map_err(FrameError::ZstdError)?;
            out.extend_from_slice(&compressed);
        }
    }

    let compressed_size = (out.len() - start - CHECKSUM_SIZE) as u32;
    let header = &mut out[start + CHECKSUM_SIZE..start + HEADER_SIZE];
    header[0] = compression.method();
    header[1..5].copy_from_slice(&compressed_size.to_le_bytes());
    header[5..9].copy_from_slice(&(data.len() as u32).to_le_bytes());

    let checksum = city_hash_128(&out[start + CHECKSUM_SIZE..]);
    out[start..start + CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes());
    Ok(())
}

/// Parsed block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub checksum: Hash128,
    pub method: u8,
    /// Payload length, without the 9-byte method+sizes header.
    pub payload_size: usize,
    pub uncompressed_size: usize,
}

impl BlockHeader {
    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&raw[..CHECKSUM_SIZE]);
        let method = raw[CHECKSUM_SIZE];
        let mut word = [0u8; 4];
        word.copy_from_slice(&raw[17..21]);
        let compressed_size = u32::from_le_bytes(word);
        word.copy_from_slice(&raw[21..25]);
        let uncompressed_size = u32::from_le_bytes(word) as usize;

        if (compressed_size as usize) < COMPRESSION_HEADER_SIZE
            || compressed_size as usize > MAX_BLOCK_SIZE
        {
            return Err(FrameError::BadCompressedSize(compressed_size));
        }
        if uncompressed_size > MAX_BLOCK_SIZE {
            return Err(FrameError::SizeMismatch {
                got: uncompressed_size,
                declared: MAX_BLOCK_SIZE,
            });
        }
        match method {
            METHOD_NONE | METHOD_LZ4 | METHOD_ZSTD => {}
            other => return Err(FrameError::UnknownMethod(other)),
        }
        Ok(BlockHeader {
            checksum: Hash128::from_le_bytes(&checksum),
            method,
            payload_size: compressed_size as usize - COMPRESSION_HEADER_SIZE,
            uncompressed_size,
        })
    }
}

/// Verifies and decompresses one block. `raw_header` is the full 25-byte header.
pub fn decompress_block(
    raw_header: &[u8; HEADER_SIZE],
    header: &BlockHeader,
    payload: &[u8],
    verify_checksum: bool,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    if payload.len() != header.payload_size {
        return Err(FrameError::ConnectionClosed(
            header.payload_size - payload.len().min(header.payload_size),
            header.payload_size,
        ));
    }
    if verify_checksum {
        let mut hashed = Vec::with_capacity(COMPRESSION_HEADER_SIZE + payload.len());
        hashed.extend_from_slice(&raw_header[CHECKSUM_SIZE..]);
        hashed.extend_from_slice(payload);
        let computed = city_hash_128(&hashed);
        if computed != header.checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: header.checksum.as_u128(),
                computed: computed.as_u128(),
            });
        }
    }

    out.clear();
    match header.method {
        METHOD_NONE => out.extend_from_slice(payload),
        METHOD_LZ4 => {
            out.resize(header.uncompressed_size, 0);
            let n = lz4_flex::block::decompress_into(payload, out)?;
            out.truncate(n);
        }
        METHOD_ZSTD => {
            let data = zstd::bulk::decompress(payload, header.uncompressed_size)
                .map_err(FrameError::ZstdError)?;
            *out = data;
        }
        other => return Err(FrameError::UnknownMethod(other)),
    }
    if out.len() != header.uncompressed_size {
        return Err(FrameError::SizeMismatch {
            got: out.len(),
            declared: header.uncompressed_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn split_block(block: &[u8]) -> ([u8; HEADER_SIZE], &[u8]) {
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&block[..HEADER_SIZE]);
        (header, &block[HEADER_SIZE..])
    }

    fn roundtrip(data: &[u8], compression: Compression) -> Vec<u8> {
        let mut block = Vec::new();
        compress_block(data, compression, &mut block).unwrap();
        let (raw, payload) = split_block(&block);
        let header = BlockHeader::parse(&raw).unwrap();
        assert_eq!(header.payload_size, payload.len());
        let mut out = Vec::new();
        decompress_block(&raw, &header, payload, true, &mut out).unwrap();
        out
    }

    #[test]
    fn test_block_roundtrip_all_methods() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 97).to_le_bytes()).collect();
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd] {
            assert_eq!(roundtrip(&data, compression), data, "{compression}");
            assert_eq!(roundtrip(&[], compression), Vec::<u8>::new());
        }
    }

    #[test]
    fn test_header_layout() {
        let mut block = Vec::new();
        compress_block(b"abc", Compression::None, &mut block).unwrap();
        assert_eq!(block.len(), HEADER_SIZE + 3);
        assert_eq!(block[16], METHOD_NONE);
        assert_eq!(&block[17..21], &12u32.to_le_bytes());
        assert_eq!(&block[21..25], &3u32.to_le_bytes());
        assert_eq!(&block[25..], b"abc");
    }

    #[test]
    fn test_corrupted_payload_is_rejected() {
        let mut block = Vec::new();
        compress_block(&[7u8; 4096], Compression::Lz4, &mut block).unwrap();
        let last = block.len() - 1;
        block[last] ^= 0xff;
        let (raw, payload) = split_block(&block);
        let header = BlockHeader::parse(&raw).unwrap();
        let mut out = Vec::new();
        assert_matches!(
            decompress_block(&raw, &header, payload, true, &mut out),
            Err(FrameError::ChecksumMismatch { .. })
        );
    }

    #[test]
    fn test_declared_size_is_enforced() {
        let mut block = Vec::new();
        compress_block(b"hello", Compression::None, &mut block).unwrap();
        // Lie about the uncompressed size and recompute the checksum so only the size check fires.
        block[21..25].copy_from_slice(&6u32.to_le_bytes());
        let checksum = city_hash_128(&block[CHECKSUM_SIZE..]);
        block[..CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes());
        let (raw, payload) = split_block(&block);
        let header = BlockHeader::parse(&raw).unwrap();
        let mut out = Vec::new();
        assert_matches!(
            decompress_block(&raw, &header, payload, true, &mut out),
            Err(FrameError::SizeMismatch {
                got: 5,
                declared: 6
            })
        );
    }

    #[test]
    fn test_unknown_method() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[16] = 0x42;
        raw[17..21].copy_from_slice(&9u32.to_le_bytes());
        assert_matches!(BlockHeader::parse(&raw), Err(FrameError::UnknownMethod(0x42)));
    }

    #[test]
    fn test_short_compressed_size() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[16] = METHOD_LZ4;
        raw[17..21].copy_from_slice(&3u32.to_le_bytes());
        assert_matches!(BlockHeader::parse(&raw), Err(FrameError::BadCompressedSize(3)));
    }
}
