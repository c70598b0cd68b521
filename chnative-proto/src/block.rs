//! Row batches exchanged in `Data`, `Totals`, `Extremes`, `Log` and
//! `ProfileEvents` packets.

use crate::column::{Column, ColumnError, TypeRegistry, Value};
use crate::frame::compression::MAX_BLOCK_SIZE;
use crate::frame::frame_errors::ParseError;
use crate::frame::{PacketReader, PacketWriter};

const BLOCK_INFO_END: u64 = 0;
const BLOCK_INFO_IS_OVERFLOWS: u64 = 1;
const BLOCK_INFO_BUCKET_NUM: u64 = 2;

/// Block metadata that precedes the columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Set on the totals row of a `GROUP BY ... WITH TOTALS` overflow.
    pub is_overflows: bool,
    /// Two-level aggregation bucket, -1 when unused.
    pub bucket_num: i32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        BlockInfo {
            is_overflows: false,
            bucket_num: -1,
        }
    }
}

impl BlockInfo {
    pub async fn read(r: &mut PacketReader) -> Result<Self, ParseError> {
        let mut info = BlockInfo::default();
        loop {
            match r.read_uvarint().await? {
                BLOCK_INFO_END => return Ok(info),
                BLOCK_INFO_IS_OVERFLOWS => info.is_overflows = r.read_bool().await?,
                BLOCK_INFO_BUCKET_NUM => info.bucket_num = r.read_i32().await?,
                field => {
                    return Err(ParseError::BadData(format!(
                        "unknown block info field {field}"
                    )))
                }
            }
        }
    }

    pub fn write(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        w.write_uvarint(BLOCK_INFO_IS_OVERFLOWS)?;
        w.write_bool(self.is_overflows)?;
        w.write_uvarint(BLOCK_INFO_BUCKET_NUM)?;
        w.write_i32(self.bucket_num)?;
        w.write_uvarint(BLOCK_INFO_END)?;
        Ok(())
    }
}

/// An ordered set of equally long named columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    info: BlockInfo,
    columns: Vec<Column>,
    rows: usize,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a block, checking that all columns have the same length.
    pub fn with_columns(columns: impl IntoIterator<Item = Column>) -> Result<Self, ColumnError> {
        let mut block = Block::new();
        for column in columns {
            block.add_column(column)?;
        }
        Ok(block)
    }

    pub fn info(&self) -> &BlockInfo {
        &self.info
    }

    /// Appends a column. Its length must match the rows already in the block.
    pub fn add_column(&mut self, column: Column) -> Result<(), ColumnError> {
        if self.columns.is_empty() {
            self.rows = column.len();
        } else if column.len() != self.rows {
            return Err(ColumnError::RowCountMismatch {
                column: column.name().to_owned(),
                expected: self.rows,
                got: column.len(),
            });
        }
        self.columns.push(column);
        Ok(())
    }

    /// Appends one row, one value per column in column order. On error the block is
    /// left unchanged.
    pub fn push_row(&mut self, row: impl IntoIterator<Item = Value>) -> Result<(), ColumnError> {
        let values: Vec<Value> = row.into_iter().collect();
        if values.len() != self.columns.len() {
            return Err(ColumnError::RowCountMismatch {
                column: "<row>".to_owned(),
                expected: self.columns.len(),
                got: values.len(),
            });
        }
        for (i, value) in values.into_iter().enumerate() {
            if let Err(err) = self.columns[i].push(value) {
                for column in &mut self.columns[..i] {
                    *column = column.slice(0, self.rows);
                }
                return Err(err);
            }
        }
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// A block with no columns; sent to terminate a stream of data packets.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(Column::name)
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    /// Row `row` as one value per column.
    pub fn row(&self, row: usize) -> Result<Vec<Value>, ColumnError> {
        self.columns.iter().map(|c| c.value(row)).collect()
    }

    /// Removes all rows, keeping the columns.
    pub fn clear(&mut self) {
        self.columns.iter_mut().for_each(Column::clear);
        self.rows = 0;
    }

    /// Appends the rows of `other`. An empty block adopts the columns of `other`;
    /// otherwise names and types must match column by column.
    pub fn append(&mut self, other: &Block) -> Result<(), ColumnError> {
        if self.columns.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        if other.columns.is_empty() {
            return Ok(());
        }
        if other.columns.len() != self.columns.len()
            || self
                .columns
                .iter()
                .zip(&other.columns)
                .any(|(a, b)| a.name() != b.name())
        {
            return Err(ColumnError::TypeMismatch {
                column_type: self.column_names().collect::<Vec<_>>().join(", "),
                value: other.column_names().collect::<Vec<_>>().join(", "),
            });
        }
        for (column, extra) in self.columns.iter_mut().zip(&other.columns) {
            column.append(extra)?;
        }
        self.rows += other.rows;
        Ok(())
    }

    /// Reads block info, then the columns. Type names are resolved through `registry`.
    pub async fn read(r: &mut PacketReader, registry: &TypeRegistry) -> Result<Block, ParseError> {
        let info = BlockInfo::read(r).await?;
        let num_columns = r.read_uvarint().await?;
        let rows = r.read_uvarint().await?;
        let rows = usize::try_from(rows)
            .ok()
            .filter(|rows| *rows <= MAX_BLOCK_SIZE)
            .ok_or_else(|| ParseError::BadData(format!("row count {rows} is too large")))?;

        let mut columns = Vec::new();
        for _ in 0..num_columns {
            let name = r.read_string().await?;
            let type_name = r.read_string().await?;
            if type_name.is_empty() {
                return Err(ParseError::BadData(format!(
                    "column {name:?} has an empty type"
                )));
            }
            let mut column = Column::new(name, &type_name, registry)?;
            // Zero rows are encoded as no bytes at all, prefix included.
            if rows > 0 {
                let data = column.data_mut();
                data.read_prefix(r).await?;
                data.read_data(r, rows).await?;
            }
            columns.push(column);
        }
        Ok(Block {
            info,
            columns,
            rows,
        })
    }

    pub fn write(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        self.info.write(w)?;
        w.write_uvarint(self.columns.len() as u64)?;
        w.write_uvarint(self.rows as u64)?;
        for column in &self.columns {
            w.write_string(column.name())?;
            w.write_string(column.type_name())?;
            if self.rows > 0 {
                column.data().write_prefix(w)?;
                column.data().write_data(w)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_errors::FrameError;
    use crate::frame::Compression;
    use assert_matches::assert_matches;

    async fn reencode(block: &Block, compression: Compression) -> Block {
        let mut w = PacketWriter::new(compression);
        w.begin_compression();
        block.write(&mut w).unwrap();
        w.end_compression().unwrap();

        let mut r = PacketReader::new(std::io::Cursor::new(w.take()));
        if compression.is_enabled() {
            r.enable_compression();
        }
        let decoded = Block::read(&mut r, &TypeRegistry::new()).await.unwrap();
        if compression.is_enabled() {
            r.disable_compression().unwrap();
        }
        decoded
    }

    fn sample(rows: u64) -> Block {
        let registry = TypeRegistry::new();
        let ids = Column::with_values("id", "UInt64", &registry, (0..rows).map(Value::UInt64));
        let names = Column::with_values(
            "name",
            "Nullable(String)",
            &registry,
            (0..rows).map(|i| {
                if i % 3 == 0 {
                    Value::Null
                } else {
                    Value::String(format!("row {i}"))
                }
            }),
        );
        Block::with_columns([ids.unwrap(), names.unwrap()]).unwrap()
    }

    #[tokio::test]
    async fn thousand_rows_roundtrip() {
        let block = sample(1000);
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd] {
            let decoded = reencode(&block, compression).await;
            assert_eq!(decoded, block, "{compression:?}");
        }
        let names = block.column("name").unwrap();
        assert_eq!(names.get::<Option<String>>(0).unwrap(), None);
        assert_eq!(names.get::<Option<String>>(4).unwrap().as_deref(), Some("row 4"));
    }

    fn header(rows: u64) -> Vec<u8> {
        use crate::frame::types::{write_string, write_uvarint};
        let mut buf = Vec::new();
        buf.extend_from_slice(&[1, 0, 2, 0xff, 0xff, 0xff, 0xff, 0]);
        write_uvarint(1, &mut buf);
        write_uvarint(rows, &mut buf);
        write_string("id", &mut buf);
        write_string("UInt64", &mut buf);
        buf
    }

    #[tokio::test]
    async fn oversized_row_counts_fail_without_allocating() {
        let registry = TypeRegistry::new();
        let mut r = PacketReader::new(std::io::Cursor::new(header(u64::MAX)));
        assert_matches!(
            Block::read(&mut r, &registry).await,
            Err(ParseError::BadData(_))
        );

        // Under the block limit, but the column bytes would not fit it.
        let mut r = PacketReader::new(std::io::Cursor::new(header(MAX_BLOCK_SIZE as u64)));
        assert_matches!(
            Block::read(&mut r, &registry).await,
            Err(ParseError::Column(ColumnError::Frame(FrameError::LengthTooLarge(_))))
        );

        // A plausible count with the data missing fails on the stream.
        let mut buf = header(1 << 20);
        buf.extend_from_slice(&[0u8; 16]);
        let mut r = PacketReader::new(std::io::Cursor::new(buf));
        let err = Block::read(&mut r, &registry).await.unwrap_err();
        assert!(err.is_io(), "{err:?}");
    }

    #[tokio::test]
    async fn empty_block_layout() {
        let mut w = PacketWriter::new(Compression::None);
        Block::new().write(&mut w).unwrap();
        assert_eq!(w.take(), [1, 0, 2, 0xff, 0xff, 0xff, 0xff, 0, 0, 0]);
    }

    #[tokio::test]
    async fn zero_rows_keep_column_headers() {
        let block = sample(0);
        let decoded = reencode(&block, Compression::None).await;
        assert_eq!(decoded.rows(), 0);
        assert_eq!(
            decoded.column_names().collect::<Vec<_>>(),
            ["id", "name"]
        );
    }

    #[test]
    fn columns_must_agree_on_rows() {
        let registry = TypeRegistry::new();
        let a = Column::with_values("a", "UInt8", &registry, [Value::UInt8(1)]).unwrap();
        let b = Column::new("b", "UInt8", &registry).unwrap();
        assert_matches!(
            Block::with_columns([a, b]),
            Err(ColumnError::RowCountMismatch { expected: 1, got: 0, .. })
        );
    }

    #[test]
    fn push_row_is_atomic() {
        let mut block = sample(2);
        assert!(block
            .push_row([Value::UInt64(9), Value::UInt64(1)])
            .is_err());
        assert_eq!(block.rows(), 2);
        assert!(block.columns().iter().all(|c| c.len() == 2));

        block.push_row([Value::UInt64(9), Value::from("nine")]).unwrap();
        assert_eq!(block.row(2).unwrap(), [Value::UInt64(9), Value::from("nine")]);
    }

    #[test]
    fn append_blocks() {
        let mut all = Block::new();
        all.append(&sample(3)).unwrap();
        all.append(&sample(2)).unwrap();
        assert_eq!(all.rows(), 5);
        assert_eq!(all.column("id").unwrap().get::<u64>(4).unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_block_info_field() {
        let mut r = PacketReader::new(std::io::Cursor::new(vec![7u8]));
        assert_matches!(BlockInfo::read(&mut r).await, Err(ParseError::BadData(_)));
    }
}
