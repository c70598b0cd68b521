use crate::frame::frame_errors::ParseError;
use crate::frame::PacketReader;

/// Execution summary sent once per query, before `EndOfStream`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
}

impl ProfileInfo {
    pub async fn deserialize(r: &mut PacketReader) -> Result<Self, ParseError> {
        Ok(ProfileInfo {
            rows: r.read_uvarint().await?,
            blocks: r.read_uvarint().await?,
            bytes: r.read_uvarint().await?,
            applied_limit: r.read_bool().await?,
            rows_before_limit: r.read_uvarint().await?,
            calculated_rows_before_limit: r.read_bool().await?,
        })
    }
}

/// Column description of the table an insert targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableColumns {
    /// Name of the external table, usually empty.
    pub table: String,
    /// Columns in `CREATE TABLE` syntax, with defaults.
    pub description: String,
}

impl TableColumns {
    pub async fn deserialize(r: &mut PacketReader) -> Result<Self, ParseError> {
        Ok(TableColumns {
            table: r.read_string().await?,
            description: r.read_string().await?,
        })
    }
}
