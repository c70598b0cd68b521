use super::column_type::ColumnType;
use super::value::Value;
use super::{ColumnError, Columnar, NULL_DISCRIMINANT};
use crate::frame::{PacketReader, PacketWriter};

/// Discriminators are written one byte per row.
const BASIC_MODE: u64 = 0;

/// `Variant(T1, T2, ...)`: a tagged union.
///
/// Alternatives are kept in canonical order (sorted by type name), which is the
/// order the server numbers them in. Each row stores a discriminant and an offset
/// into the column of its alternative.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantColumn {
    types: Vec<ColumnType>,
    columns: Vec<Columnar>,
    discriminators: Vec<u8>,
    offsets: Vec<usize>,
}

impl VariantColumn {
    pub fn new(types: &[ColumnType]) -> Self {
        VariantColumn {
            types: types.to_vec(),
            columns: types.iter().map(Columnar::new).collect(),
            discriminators: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub fn types(&self) -> &[ColumnType] {
        &self.types
    }

    pub fn discriminators(&self) -> &[u8] {
        &self.discriminators
    }

    pub fn len(&self) -> usize {
        self.discriminators.len()
    }

    pub fn clear(&mut self) {
        self.discriminators.clear();
        self.offsets.clear();
        self.columns.iter_mut().for_each(Columnar::clear);
    }

    pub fn value(&self, row: usize) -> Value {
        match self.discriminators[row] {
            NULL_DISCRIMINANT => Value::Null,
            d => self.columns[d as usize].value(self.offsets[row]),
        }
    }

    fn push_null(&mut self) {
        self.discriminators.push(NULL_DISCRIMINANT);
        self.offsets.push(0);
    }

    fn push_to(&mut self, discriminant: u8, value: Value) -> Result<(), ColumnError> {
        let column = &mut self.columns[discriminant as usize];
        let offset = column.len();
        column.push(value)?;
        self.discriminators.push(discriminant);
        self.offsets.push(offset);
        Ok(())
    }

    /// Appends a value to the first alternative whose native kind matches it.
    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        if value.is_null() {
            self.push_null();
            return Ok(());
        }
        match self.types.iter().position(|ty| ty.accepts(&value)) {
            Some(d) => self.push_to(d as u8, value),
            None => Err(ColumnError::mismatch(
                &ColumnType::Variant(self.types.clone()),
                &value,
            )),
        }
    }

    pub fn push_default(&mut self) {
        self.push_null()
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        let mut out = VariantColumn::new(&self.types);
        for row in lo..hi {
            match self.discriminators[row] {
                NULL_DISCRIMINANT => out.push_null(),
                d => {
                    let value = self.columns[d as usize].value(self.offsets[row]);
                    // Same alternative on both sides, so the value always fits.
                    let _ = out.push_to(d, value);
                }
            }
        }
        out
    }

    pub async fn read_prefix(&mut self, r: &mut PacketReader) -> Result<(), ColumnError> {
        let mode = r.read_u64().await?;
        if mode != BASIC_MODE {
            return Err(ColumnError::BadVersion {
                what: "Variant discriminators",
                version: mode,
            });
        }
        for column in &mut self.columns {
            column.read_prefix(r).await?;
        }
        Ok(())
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        let discriminators = r.read_fixed(rows, 1).await?;

        let mut counts = vec![0usize; self.columns.len()];
        let mut offsets = Vec::with_capacity(rows);
        for &d in &discriminators {
            if d == NULL_DISCRIMINANT {
                offsets.push(0);
                continue;
            }
            let i = d as usize;
            if i >= self.columns.len() {
                return Err(ColumnError::UnknownDiscriminant(d));
            }
            offsets.push(self.columns[i].len() + counts[i]);
            counts[i] += 1;
        }
        for (column, count) in self.columns.iter_mut().zip(counts) {
            if count > 0 {
                column.read_data(r, count).await?;
            }
        }
        self.discriminators.extend_from_slice(&discriminators);
        self.offsets.extend(offsets);
        Ok(())
    }

    pub fn write_prefix(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        w.write_u64(BASIC_MODE)?;
        for column in &self.columns {
            column.write_prefix(w)?;
        }
        Ok(())
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        w.write_raw(&self.discriminators)?;
        for column in &self.columns {
            if !column.is_empty() {
                column.write_data(w)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{column_of, reencode};
    use super::*;
    use crate::frame::Compression;
    use assert_matches::assert_matches;

    fn sample() -> Vec<Value> {
        vec![
            Value::from("a"),
            Value::UInt64(7),
            Value::Null,
            Value::Array(vec![Value::UInt64(1), Value::UInt64(2)]),
            Value::from("b"),
            Value::Null,
            Value::UInt64(8),
        ]
    }

    #[tokio::test]
    async fn discriminants_follow_sorted_names() {
        let ty = ColumnType::parse("Variant(String, UInt64, Array(UInt64))").unwrap();
        let col = column_of(&ty, sample());
        let Columnar::Variant(v) = &col else {
            panic!("wrong column variant");
        };
        // Array(UInt64) = 0, String = 1, UInt64 = 2
        assert_eq!(v.discriminators(), &[1, 2, 255, 0, 1, 255, 2]);

        let decoded = reencode(&ty, &col).await;
        for (row, expected) in sample().into_iter().enumerate() {
            assert_eq!(decoded.value(row), expected);
        }
    }

    #[tokio::test]
    async fn declaration_order_does_not_matter() {
        let written = ColumnType::parse("Variant(UInt64, String, Array(UInt64))").unwrap();
        let read = ColumnType::parse("Variant(Array(UInt64), UInt64, String)").unwrap();
        let col = column_of(&written, sample());

        let mut w = PacketWriter::new(Compression::None);
        col.write_prefix(&mut w).unwrap();
        col.write_data(&mut w).unwrap();
        let mut decoded = Columnar::new(&read);
        let mut r = PacketReader::new(std::io::Cursor::new(w.take()));
        decoded.read_prefix(&mut r).await.unwrap();
        decoded.read_data(&mut r, col.len()).await.unwrap();
        assert_eq!(decoded, col);
    }

    #[test]
    fn slice_keeps_alternatives() {
        let ty = ColumnType::parse("Variant(String, UInt64, Array(UInt64))").unwrap();
        let col = column_of(&ty, sample());
        let part = col.slice(3, 7);
        assert_eq!(part.len(), 4);
        assert_eq!(part.value(0), sample()[3]);
        assert_eq!(part.value(2), Value::Null);
        assert_eq!(part.value(3), Value::UInt64(8));
    }

    #[test]
    fn unmatched_value_is_rejected() {
        let mut col = VariantColumn::new(&[ColumnType::String]);
        assert_matches!(
            col.push(Value::Float64(1.0)),
            Err(ColumnError::TypeMismatch { .. })
        );
        assert_eq!(col.len(), 0);
    }

    #[tokio::test]
    async fn unknown_discriminant() {
        let mut col = VariantColumn::new(&[ColumnType::String]);
        let mut r = PacketReader::new(std::io::Cursor::new(vec![3u8]));
        assert_matches!(
            col.read_data(&mut r, 1).await,
            Err(ColumnError::UnknownDiscriminant(3))
        );
    }
}
