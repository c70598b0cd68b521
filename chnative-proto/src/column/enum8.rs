use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use super::column_type::{split_args, unquote};
use super::value::Value;
use super::ColumnError;
use crate::frame::{PacketReader, PacketWriter};

/// Name to code table of an `Enum8` type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumTable {
    entries: Vec<(String, i8)>,
    by_name: HashMap<String, i8>,
    by_code: HashMap<i8, usize>,
}

impl EnumTable {
    pub fn new(entries: Vec<(String, i8)>) -> Self {
        let by_name = entries.iter().map(|(n, c)| (n.clone(), *c)).collect();
        let by_code = entries.iter().enumerate().map(|(i, (_, c))| (*c, i)).collect();
        EnumTable {
            entries,
            by_name,
            by_code,
        }
    }

    /// Table with codes assigned in order starting at 0.
    pub fn sequential<S: AsRef<str>>(names: &[S]) -> Result<Self, ColumnError> {
        let entries = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                i8::try_from(i)
                    .map(|code| (name.as_ref().to_owned(), code))
                    .map_err(|_| ColumnError::BadType {
                        type_name: "Enum8".to_owned(),
                        reason: "more than 128 values",
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EnumTable::new(entries))
    }

    /// Parses the argument list of `Enum8('a' = 1, 'b' = 2)`.
    pub fn parse(args: &str) -> Result<Self, ColumnError> {
        let bad = |reason| ColumnError::BadType {
            type_name: format!("Enum8({args})"),
            reason,
        };
        let mut entries = Vec::new();
        for arg in split_args(args)? {
            let (key, code) = arg.rsplit_once('=').ok_or_else(|| bad("expected 'name' = code"))?;
            let name = unquote(key).ok_or_else(|| bad("enum names must be quoted"))?;
            let code = code
                .trim()
                .parse::<i8>()
                .map_err(|_| bad("enum code must fit Int8"))?;
            entries.push((name, code));
        }
        if entries.is_empty() {
            return Err(bad("enum has no values"));
        }
        Ok(EnumTable::new(entries))
    }

    pub fn entries(&self) -> &[(String, i8)] {
        &self.entries
    }

    pub fn code(&self, name: &str) -> Option<i8> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, code: i8) -> Option<&str> {
        self.by_code.get(&code).map(|&i| self.entries[i].0.as_str())
    }

    /// Code for `name`; unknown names fall back to the entry for the empty string.
    pub fn encode(&self, name: &str) -> Result<i8, ColumnError> {
        self.code(name)
            .or_else(|| self.code(""))
            .ok_or_else(|| ColumnError::UnknownEnumValue(name.to_owned()))
    }
}

impl Display for EnumTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Enum8(")?;
        for (i, (name, code)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
            write!(f, "'{escaped}' = {code}")?;
        }
        f.write_str(")")
    }
}

/// `Enum8` column, stored as codes.
#[derive(Debug, Clone, PartialEq)]
pub struct Enum8Column {
    table: Arc<EnumTable>,
    codes: Vec<i8>,
}

impl Enum8Column {
    pub fn new(table: Arc<EnumTable>) -> Self {
        Enum8Column {
            table,
            codes: Vec::new(),
        }
    }

    pub fn codes(&self) -> &[i8] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn clear(&mut self) {
        self.codes.clear()
    }

    pub fn value(&self, row: usize) -> Value {
        let code = self.codes[row];
        Value::String(self.table.name(code).unwrap_or_default().to_owned())
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        let code = match &value {
            Value::String(s) => self.table.encode(s)?,
            Value::Int8(code) if self.table.name(*code).is_some() => *code,
            _ => {
                return Err(ColumnError::TypeMismatch {
                    column_type: self.table.to_string(),
                    value: value.kind_name().to_owned(),
                })
            }
        };
        self.codes.push(code);
        Ok(())
    }

    pub fn push_default(&mut self) {
        let code = self.table.entries.first().map_or(0, |(_, c)| *c);
        self.codes.push(code);
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        Enum8Column {
            table: self.table.clone(),
            codes: self.codes[lo..hi].to_vec(),
        }
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        let raw = r.read_fixed(rows, 1).await?;
        for b in raw {
            let code = b as i8;
            if self.table.name(code).is_none() {
                return Err(ColumnError::UnknownEnumCode(code));
            }
            self.codes.push(code);
        }
        Ok(())
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        let raw: Vec<u8> = self.codes.iter().map(|&c| c as u8).collect();
        w.write_raw(&raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{column_of, reencode};
    use super::super::ColumnType;
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_negative_codes_and_escapes() {
        let table = EnumTable::parse("'a' = 1, 'it\\'s' = -3, '' = 0").unwrap();
        assert_eq!(table.code("it's"), Some(-3));
        assert_eq!(table.name(1), Some("a"));
        assert_eq!(table.encode("missing").unwrap(), 0);
        assert_eq!(
            table.to_string(),
            "Enum8('a' = 1, 'it\\'s' = -3, '' = 0)"
        );
        assert!(EnumTable::parse("a = 1").is_err());
        assert!(EnumTable::parse("'a' = 300").is_err());
    }

    #[test]
    fn unknown_value_without_empty_entry() {
        let table = EnumTable::parse("'x' = 1").unwrap();
        assert_matches!(table.encode("y"), Err(ColumnError::UnknownEnumValue(_)));
    }

    #[tokio::test]
    async fn enum_column_roundtrip() {
        let ty = ColumnType::parse("Enum8('GET' = 1, 'POST' = 2, '' = 0)").unwrap();
        let col = column_of(
            &ty,
            ["POST", "GET", "PATCH"].map(|s| Value::String(s.to_owned())),
        );
        let decoded = reencode(&ty, &col).await;
        assert_eq!(decoded.value(0), Value::String("POST".into()));
        assert_eq!(decoded.value(2), Value::String("".into()));
    }

    #[tokio::test]
    async fn unknown_code_on_read() {
        let ty = ColumnType::parse("Enum8('a' = 1)").unwrap();
        let mut col = super::super::Columnar::new(&ty);
        let mut r = PacketReader::new(std::io::Cursor::new(vec![5u8]));
        assert_matches!(
            col.read_data(&mut r, 1).await,
            Err(ColumnError::UnknownEnumCode(5))
        );
    }
}
