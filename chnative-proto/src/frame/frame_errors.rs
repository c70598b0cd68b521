use thiserror::Error;

use crate::column::ColumnError;

use super::TryFromPrimitiveError;

/// Failure of the checksummed block layer or of the byte stream under it.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FrameError {
    #[error("Connection was closed before the block was read: missing {0} out of {1} bytes")]
    ConnectionClosed(usize, usize),
    #[error("Block checksum mismatch: expected {expected:032x}, computed {computed:032x}")]
    ChecksumMismatch { expected: u128, computed: u128 },
    #[error("Unsupported compression method: 0x{0:02x}")]
    UnknownMethod(u8),
    #[error("Invalid compressed size in block header: {0}")]
    BadCompressedSize(u32),
    #[error("Unexpected uncompressed block size: got {got}, declared {declared}")]
    SizeMismatch { got: usize, declared: usize },
    #[error("Block reader released with {0} unread bytes")]
    UnreadData(usize),
    #[error("Error compressing lz4 data: {0}")]
    Lz4CompressError(#[from] lz4_flex::block::CompressError),
    #[error("Error decompressing lz4 data: {0}")]
    Lz4DecompressError(#[from] lz4_flex::block::DecompressError),
    #[error("Zstd codec failed: {0}")]
    ZstdError(std::io::Error),
    #[error("Uvarint is longer than 10 bytes")]
    VarintOverflow,
    #[error("Length prefix {0} exceeds the largest accepted value")]
    LengthTooLarge(u64),
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the error originates in the transport rather than in the data.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            FrameError::StdIoError(_) | FrameError::ConnectionClosed(_, _)
        )
    }
}

/// Error while writing a client packet.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestSerializationError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Failed to serialize block: {0}")]
    Column(#[from] ColumnError),
}

/// Low-level error returned by the slice based primitive readers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Uvarint is longer than 10 bytes")]
    VarintOverflow,
    #[error("Length {0} does not fit into usize")]
    LengthOverflow(u64),
}

/// Error while decoding a server packet.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ParseError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    UnknownPacket(#[from] TryFromPrimitiveError<u64>),
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("Malformed packet: {0}")]
    BadData(String),
}

impl ParseError {
    pub fn is_io(&self) -> bool {
        match self {
            ParseError::Frame(e) => e.is_io(),
            ParseError::Column(ColumnError::Frame(e)) => e.is_io(),
            _ => false,
        }
    }
}
