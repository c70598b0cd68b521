use super::value::Value;
use super::ColumnError;
use crate::frame::{PacketReader, PacketWriter};

/// `String` column: every row is an independent length-prefixed string.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StringColumn {
    data: Vec<String>,
}

impl StringColumn {
    pub fn from_vec(data: Vec<String>) -> Self {
        StringColumn { data }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear()
    }

    pub fn value(&self, row: usize) -> Value {
        Value::String(self.data[row].clone())
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        let s = match value {
            Value::String(s) => s,
            Value::Bytes(b) => String::from_utf8(b).map_err(|_| ColumnError::InvalidUtf8)?,
            other => {
                return Err(ColumnError::TypeMismatch {
                    column_type: "String".to_owned(),
                    value: other.kind_name().to_owned(),
                })
            }
        };
        self.data.push(s);
        Ok(())
    }

    pub fn push_default(&mut self) {
        self.data.push(String::new())
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        StringColumn {
            data: self.data[lo..hi].to_vec(),
        }
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        for _ in 0..rows {
            let raw = r.read_bytes_view().await?;
            let s = std::str::from_utf8(raw).map_err(|_| ColumnError::InvalidUtf8)?;
            self.data.push(s.to_owned());
        }
        Ok(())
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        for s in &self.data {
            w.write_string(s)?;
        }
        Ok(())
    }
}

/// `FixedString(N)` column. Values shorter than N are zero padded on write.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedStringColumn {
    width: usize,
    data: Vec<u8>,
}

impl FixedStringColumn {
    pub fn new(width: usize) -> Self {
        FixedStringColumn {
            width,
            data: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    pub fn clear(&mut self) {
        self.data.clear()
    }

    pub fn row(&self, row: usize) -> &[u8] {
        &self.data[row * self.width..(row + 1) * self.width]
    }

    pub fn value(&self, row: usize) -> Value {
        Value::Bytes(self.row(row).to_vec())
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        let bytes = match value {
            Value::Bytes(b) => b,
            Value::String(s) => s.into_bytes(),
            other => {
                return Err(ColumnError::TypeMismatch {
                    column_type: format!("FixedString({})", self.width),
                    value: other.kind_name().to_owned(),
                })
            }
        };
        if bytes.len() > self.width {
            return Err(ColumnError::FixedStringOverflow {
                len: bytes.len(),
                width: self.width,
            });
        }
        self.data.extend_from_slice(&bytes);
        self.data
            .resize(self.data.len() + self.width - bytes.len(), 0);
        Ok(())
    }

    pub fn push_default(&mut self) {
        self.data.resize(self.data.len() + self.width, 0);
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        FixedStringColumn {
            width: self.width,
            data: self.data[lo * self.width..hi * self.width].to_vec(),
        }
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        let raw = r.read_fixed(rows, self.width).await?;
        self.data.extend_from_slice(&raw);
        Ok(())
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        w.write_raw(&self.data)?;
        Ok(())
    }
}
