use std::collections::HashMap;

use super::column_type::ColumnType;
use super::value::Value;
use super::{ColumnError, Columnar};
use crate::frame::{Compression, PacketReader, PacketWriter};

const SERIALIZATION_VERSION: u64 = 1;
const KEY_TYPE_MASK: u64 = 0xff;
const HAS_ADDITIONAL_KEYS: u64 = 1 << 9;
const NEED_UPDATE_DICTIONARY: u64 = 1 << 10;

/// Key type code and byte width for a dictionary of `dict_len` entries.
fn key_type_for(dict_len: usize) -> (u64, usize) {
    if dict_len <= u8::MAX as usize {
        (0, 1)
    } else if dict_len <= u16::MAX as usize {
        (1, 2)
    } else if dict_len as u64 <= u32::MAX as u64 {
        (2, 4)
    } else {
        (3, 8)
    }
}

fn width_of_key_type(key_type: u64) -> Option<usize> {
    match key_type {
        0 => Some(1),
        1 => Some(2),
        2 => Some(4),
        3 => Some(8),
        _ => None,
    }
}

/// `LowCardinality(T)`.
///
/// Rows are kept materialized; the dictionary is rebuilt on every write. On the
/// wire each block carries its own dictionary followed by one key per row. For
/// `LowCardinality(Nullable(T))` the dictionary holds plain `T` and key 0 stands
/// for null.
#[derive(Debug, Clone, PartialEq)]
pub struct LowCardinalityColumn {
    ty: ColumnType,
    values: Box<Columnar>,
}

impl LowCardinalityColumn {
    pub fn new(inner: &ColumnType) -> Self {
        LowCardinalityColumn {
            ty: inner.clone(),
            values: Box::new(Columnar::new(inner)),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn clear(&mut self) {
        self.values.clear()
    }

    pub fn value(&self, row: usize) -> Value {
        self.values.value(row)
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        self.values.push(value)
    }

    pub fn push_default(&mut self) {
        self.values.push_default()
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        LowCardinalityColumn {
            ty: self.ty.clone(),
            values: Box::new(self.values.slice(lo, hi)),
        }
    }

    pub async fn read_prefix(&mut self, r: &mut PacketReader) -> Result<(), ColumnError> {
        let version = r.read_u64().await?;
        if version != SERIALIZATION_VERSION {
            return Err(ColumnError::BadVersion {
                what: "LowCardinality",
                version,
            });
        }
        Ok(())
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        if rows == 0 {
            return Ok(());
        }
        let flags = r.read_i64().await? as u64;
        let width = width_of_key_type(flags & KEY_TYPE_MASK)
            .ok_or(ColumnError::BadLowCardinalityFlags(flags))?;

        let dict_size = r.read_i64().await? as u64;
        let dict_size = usize::try_from(dict_size)
            .map_err(|_| ColumnError::BadLowCardinalityFlags(flags))?;
        let mut dict = Columnar::new(self.ty.strip_nullable());
        dict.read_data(r, dict_size).await?;

        let keys = r.read_i64().await? as u64;
        if keys != rows as u64 {
            return Err(ColumnError::KeyCountMismatch { keys, rows });
        }
        let raw = r.read_fixed(rows, width).await?;

        let nullable = self.ty.is_nullable();
        for chunk in raw.chunks_exact(width) {
            let mut bytes = [0u8; 8];
            bytes[..width].copy_from_slice(chunk);
            let key = u64::from_le_bytes(bytes);
            if nullable && key == 0 {
                self.values.push(Value::Null)?;
                continue;
            }
            if key >= dict_size as u64 {
                return Err(ColumnError::KeyOutOfRange {
                    key,
                    size: dict_size,
                });
            }
            self.values.push(dict.value(key as usize))?;
        }
        Ok(())
    }

    pub fn write_prefix(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        w.write_u64(SERIALIZATION_VERSION)?;
        Ok(())
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        let rows = self.values.len();
        if rows == 0 {
            return Ok(());
        }
        let dict_ty = self.ty.strip_nullable();
        let nullable = self.ty.is_nullable();

        let mut dict = Columnar::new(dict_ty);
        if nullable {
            dict.push_default();
        }
        // Values are deduplicated by their encoded bytes, so float keys compare bitwise.
        let mut index: HashMap<Vec<u8>, u64> = HashMap::new();
        let mut scratch = Columnar::new(dict_ty);
        let mut encoder = PacketWriter::new(Compression::None);
        let mut keys = Vec::with_capacity(rows);
        for row in 0..rows {
            let value = self.values.value(row);
            if nullable && value.is_null() {
                keys.push(0);
                continue;
            }
            scratch.clear();
            scratch.push(value.clone())?;
            scratch.write_data(&mut encoder)?;
            let encoded = encoder.take();
            let next = dict.len() as u64;
            let key = *index.entry(encoded).or_insert(next);
            if key == next {
                dict.push(value)?;
            }
            keys.push(key);
        }

        let (key_type, width) = key_type_for(dict.len());
        w.write_i64((key_type | HAS_ADDITIONAL_KEYS | NEED_UPDATE_DICTIONARY) as i64)?;
        w.write_i64(dict.len() as i64)?;
        dict.write_data(w)?;
        w.write_i64(rows as i64)?;
        let mut raw = Vec::with_capacity(rows * width);
        for key in keys {
            raw.extend_from_slice(&key.to_le_bytes()[..width]);
        }
        w.write_raw(&raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{column_of, reencode};
    use super::*;
    use assert_matches::assert_matches;

    fn strings<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<Value> {
        values.into_iter().map(Value::from).collect()
    }

    #[tokio::test]
    async fn duplicates_share_dictionary_entries() {
        let ty = ColumnType::parse("LowCardinality(String)").unwrap();
        let col = column_of(&ty, strings(["a", "", "b", "a", "", "a"]));

        let mut w = PacketWriter::new(Compression::None);
        col.write_data(&mut w).unwrap();
        let wire = w.take();
        // flags, dict size 3, dict "a" "" "b", key count 6, six u8 keys
        let expected_len = 8 + 8 + (2 + 1 + 2) + 8 + 6;
        assert_eq!(wire.len(), expected_len);
        assert_eq!(&wire[wire.len() - 6..], &[0, 1, 2, 0, 1, 0]);

        assert_eq!(reencode(&ty, &col).await, col);
    }

    #[tokio::test]
    async fn nullable_dictionary_reserves_key_zero() {
        let ty = ColumnType::parse("LowCardinality(Nullable(String))").unwrap();
        let col = column_of(
            &ty,
            [Value::from("x"), Value::Null, Value::from(""), Value::Null],
        );

        let mut w = PacketWriter::new(Compression::None);
        col.write_data(&mut w).unwrap();
        let wire = w.take();
        assert_eq!(&wire[wire.len() - 4..], &[1, 0, 2, 0]);

        let decoded = reencode(&ty, &col).await;
        assert_eq!(decoded.value(1), Value::Null);
        assert_eq!(decoded.value(2), Value::from(""));
        assert_eq!(decoded, col);
    }

    #[test]
    fn key_widths() {
        assert_eq!(key_type_for(1), (0, 1));
        assert_eq!(key_type_for(255), (0, 1));
        assert_eq!(key_type_for(256), (1, 2));
        assert_eq!(key_type_for(65_535), (1, 2));
        assert_eq!(key_type_for(65_536), (2, 4));
    }

    #[tokio::test]
    async fn wide_keys_roundtrip() {
        let ty = ColumnType::parse("LowCardinality(UInt32)").unwrap();
        for distinct in [300u32, 70_000] {
            let col = column_of(&ty, (0..distinct).map(|i| Value::UInt32(i % distinct)));
            let decoded = reencode(&ty, &col).await;
            assert_eq!(decoded.len(), distinct as usize);
            assert_eq!(decoded.value(distinct as usize - 1), Value::UInt32(distinct - 1));
        }
    }

    #[tokio::test]
    async fn empty_column_writes_nothing() {
        let ty = ColumnType::parse("LowCardinality(String)").unwrap();
        let col = Columnar::new(&ty);
        let mut w = PacketWriter::new(Compression::None);
        col.write_data(&mut w).unwrap();
        assert!(w.is_empty());
    }

    #[tokio::test]
    async fn malformed_streams() {
        let ty = ColumnType::parse("LowCardinality(String)").unwrap();

        let mut col = Columnar::new(&ty);
        let mut r = PacketReader::new(std::io::Cursor::new(2u64.to_le_bytes().to_vec()));
        assert_matches!(
            col.read_prefix(&mut r).await,
            Err(ColumnError::BadVersion { version: 2, .. })
        );

        // key count differs from row count
        let mut wire = Vec::new();
        wire.extend_from_slice(&(HAS_ADDITIONAL_KEYS as i64).to_le_bytes());
        wire.extend_from_slice(&1i64.to_le_bytes());
        wire.extend_from_slice(&[1, b'a']);
        wire.extend_from_slice(&3i64.to_le_bytes());
        let mut r = PacketReader::new(std::io::Cursor::new(wire.clone()));
        assert_matches!(
            col.read_data(&mut r, 2).await,
            Err(ColumnError::KeyCountMismatch { keys: 3, rows: 2 })
        );

        // key past the dictionary
        wire.truncate(wire.len() - 8);
        wire.extend_from_slice(&1i64.to_le_bytes());
        wire.push(1);
        let mut r = PacketReader::new(std::io::Cursor::new(wire));
        assert_matches!(
            col.read_data(&mut r, 1).await,
            Err(ColumnError::KeyOutOfRange { key: 1, size: 1 })
        );
    }
}
