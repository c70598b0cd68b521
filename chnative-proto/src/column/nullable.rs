use super::column_type::ColumnType;
use super::value::Value;
use super::{ColumnError, Columnar};
use crate::frame::{PacketReader, PacketWriter};

/// `Nullable(T)`: a null map (one byte per row, 1 = null) followed by the inner
/// column. Null rows still occupy a default value in the inner column.
#[derive(Debug, Clone, PartialEq)]
pub struct NullableColumn {
    nulls: Vec<u8>,
    inner: Box<Columnar>,
}

impl NullableColumn {
    pub fn new(inner: &ColumnType) -> Self {
        NullableColumn {
            nulls: Vec::new(),
            inner: Box::new(Columnar::new(inner)),
        }
    }

    pub fn inner(&self) -> &Columnar {
        &self.inner
    }

    pub fn is_null(&self, row: usize) -> bool {
        self.nulls[row] != 0
    }

    pub fn len(&self) -> usize {
        self.nulls.len()
    }

    pub fn clear(&mut self) {
        self.nulls.clear();
        self.inner.clear();
    }

    pub fn value(&self, row: usize) -> Value {
        if self.is_null(row) {
            Value::Null
        } else {
            self.inner.value(row)
        }
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        if value.is_null() {
            self.push_default();
        } else {
            self.inner.push(value)?;
            self.nulls.push(0);
        }
        Ok(())
    }

    /// Appends a null row.
    pub fn push_default(&mut self) {
        self.inner.push_default();
        self.nulls.push(1);
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        NullableColumn {
            nulls: self.nulls[lo..hi].to_vec(),
            inner: Box::new(self.inner.slice(lo, hi)),
        }
    }

    pub async fn read_prefix(&mut self, r: &mut PacketReader) -> Result<(), ColumnError> {
        self.inner.read_prefix(r).await
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        let nulls = r.read_fixed(rows, 1).await?;
        self.nulls.extend_from_slice(&nulls);
        self.inner.read_data(r, rows).await
    }

    pub fn write_prefix(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        self.inner.write_prefix(w)
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        w.write_raw(&self.nulls)?;
        self.inner.write_data(w)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{column_of, reencode};
    use super::*;

    #[tokio::test]
    async fn null_rows_keep_placeholders() {
        let ty = ColumnType::parse("Nullable(String)").unwrap();
        let col = column_of(
            &ty,
            [Value::from("a"), Value::Null, Value::from("c"), Value::Null],
        );
        let decoded = reencode(&ty, &col).await;
        assert_eq!(decoded, col);

        let Columnar::Nullable(n) = &decoded else {
            panic!("wrong column variant");
        };
        assert_eq!(n.inner().len(), 4);
        assert_eq!(n.inner().value(1), Value::String(String::new()));
        assert_eq!(n.value(1), Value::Null);
        assert_eq!(n.value(2), Value::from("c"));
    }

    #[test]
    fn rejected_value_leaves_column_unchanged() {
        let mut col = NullableColumn::new(&ColumnType::UInt8);
        assert!(col.push(Value::from("x")).is_err());
        assert_eq!(col.len(), 0);
        assert_eq!(col.inner().len(), 0);
    }
}
