use super::column_type::ColumnType;
use super::value::Value;
use super::{ColumnError, Columnar};
use crate::frame::{PacketReader, PacketWriter};

/// `Array(T)`: cumulative UInt64 end offsets, one per row, then the flattened
/// inner column.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayColumn {
    offsets: Vec<u64>,
    inner: Box<Columnar>,
}

impl ArrayColumn {
    pub fn new(inner: &ColumnType) -> Self {
        ArrayColumn {
            offsets: Vec::new(),
            inner: Box::new(Columnar::new(inner)),
        }
    }

    pub fn inner(&self) -> &Columnar {
        &self.inner
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    fn bounds(&self, row: usize) -> (usize, usize) {
        let start = if row == 0 { 0 } else { self.offsets[row - 1] };
        (start as usize, self.offsets[row] as usize)
    }

    fn last_offset(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.inner.clear();
    }

    pub fn value(&self, row: usize) -> Value {
        let (start, end) = self.bounds(row);
        Value::Array((start..end).map(|i| self.inner.value(i)).collect())
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        let items = match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(ColumnError::TypeMismatch {
                    column_type: "Array".to_owned(),
                    value: other.kind_name().to_owned(),
                })
            }
        };
        let count = items.len();
        let mut scratch = self.inner.slice(0, 0);
        for item in items {
            scratch.push(item)?;
        }
        for i in 0..count {
            self.inner.push(scratch.value(i))?;
        }
        self.offsets.push(self.last_offset() + count as u64);
        Ok(())
    }

    /// Appends an empty array.
    pub fn push_default(&mut self) {
        self.offsets.push(self.last_offset());
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        if lo >= hi {
            return ArrayColumn {
                offsets: Vec::new(),
                inner: Box::new(self.inner.slice(0, 0)),
            };
        }
        let (first, _) = self.bounds(lo);
        let (_, last) = self.bounds(hi - 1);
        ArrayColumn {
            offsets: self.offsets[lo..hi]
                .iter()
                .map(|o| o - first as u64)
                .collect(),
            inner: Box::new(self.inner.slice(first, last)),
        }
    }

    pub async fn read_prefix(&mut self, r: &mut PacketReader) -> Result<(), ColumnError> {
        self.inner.read_prefix(r).await
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        let base = self.last_offset();
        let raw = r.read_fixed(rows, 8).await?;
        let mut prev = 0u64;
        self.offsets.reserve(rows);
        for (row, chunk) in raw.chunks_exact(8).enumerate() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            let offset = u64::from_le_bytes(bytes);
            if offset < prev {
                return Err(ColumnError::BadOffsets(row));
            }
            prev = offset;
            self.offsets.push(base + offset);
        }
        let total = usize::try_from(prev).map_err(|_| ColumnError::BadOffsets(rows))?;
        self.inner.read_data(r, total).await
    }

    pub fn write_prefix(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        self.inner.write_prefix(w)
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        let mut raw = Vec::with_capacity(self.offsets.len() * 8);
        for offset in &self.offsets {
            raw.extend_from_slice(&offset.to_le_bytes());
        }
        w.write_raw(&raw)?;
        self.inner.write_data(w)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{column_of, reencode};
    use super::*;
    use assert_matches::assert_matches;

    fn ints(values: &[i32]) -> Value {
        Value::Array(values.iter().map(|&v| Value::Int32(v)).collect())
    }

    #[tokio::test]
    async fn offsets_and_empty_rows() {
        let ty = ColumnType::parse("Array(Int32)").unwrap();
        let col = column_of(&ty, [ints(&[1, 2]), ints(&[]), ints(&[3]), ints(&[])]);
        let Columnar::Array(arr) = &col else {
            panic!("wrong column variant");
        };
        assert_eq!(arr.offsets(), &[2, 2, 3, 3]);

        let decoded = reencode(&ty, &col).await;
        assert_eq!(decoded, col);
        assert_eq!(decoded.value(1), ints(&[]));
        assert_eq!(decoded.value(2), ints(&[3]));
    }

    #[tokio::test]
    async fn all_empty_arrays() {
        let ty = ColumnType::parse("Array(String)").unwrap();
        let col = column_of(&ty, [ints(&[]), ints(&[]), ints(&[])]);
        let decoded = reencode(&ty, &col).await;
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.value(2), Value::Array(vec![]));
    }

    #[tokio::test]
    async fn nested_arrays_with_nulls() {
        let ty = ColumnType::parse("Array(Array(Nullable(UInt8)))").unwrap();
        let row = Value::Array(vec![
            Value::Array(vec![Value::UInt8(1), Value::Null]),
            Value::Array(vec![]),
        ]);
        let col = column_of(&ty, [row.clone(), Value::Array(vec![])]);
        let decoded = reencode(&ty, &col).await;
        assert_eq!(decoded.value(0), row);
    }

    #[test]
    fn bad_element_rolls_back() {
        let ty = ColumnType::parse("Array(UInt8)").unwrap();
        let mut col = Columnar::new(&ty);
        col.push(Value::Array(vec![Value::UInt8(1)])).unwrap();
        assert!(col
            .push(Value::Array(vec![Value::UInt8(2), Value::from("x")]))
            .is_err());
        assert_eq!(col.len(), 1);
        let Columnar::Array(arr) = &col else {
            panic!("wrong column variant");
        };
        assert_eq!(arr.inner().len(), 1);
    }

    #[test]
    fn slice_rebases_offsets() {
        let ty = ColumnType::parse("Array(Int32)").unwrap();
        let col = column_of(&ty, [ints(&[1, 2]), ints(&[3]), ints(&[4, 5, 6])]);
        let Columnar::Array(arr) = col.slice(1, 3) else {
            panic!("wrong column variant");
        };
        assert_eq!(arr.offsets(), &[1, 4]);
        assert_eq!(arr.value(1), ints(&[4, 5, 6]));
    }

    #[tokio::test]
    async fn decreasing_offsets_are_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&2u64.to_le_bytes());
        wire.extend_from_slice(&1u64.to_le_bytes());
        let mut col = Columnar::new(&ColumnType::parse("Array(UInt8)").unwrap());
        let mut r = PacketReader::new(std::io::Cursor::new(wire));
        assert_matches!(col.read_data(&mut r, 2).await, Err(ColumnError::BadOffsets(1)));
    }
}
