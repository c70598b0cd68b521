//! Column codecs.
//!
//! Every wire column type maps onto one variant of [`Columnar`]. Fixed-width
//! families share one generic implementation ([`NumericColumn`]) and the
//! structural wrappers (Nullable, Array, LowCardinality) are written once and
//! compose over any inner column.

mod aggregate;
mod array;
mod column_type;
mod dynamic;
mod enum8;
mod low_cardinality;
mod nullable;
mod primitive;
mod registry;
mod string;
mod temporal;
mod value;
mod variant;

pub use aggregate::{BFloat16HistogramColumn, QuantileTimingColumn, TDigestColumn};
pub use array::ArrayColumn;
pub use column_type::{AggregateKind, ColumnType};
pub use dynamic::DynamicColumn;
pub use enum8::{Enum8Column, EnumTable};
pub use low_cardinality::LowCardinalityColumn;
pub use nullable::NullableColumn;
pub use primitive::{NumericColumn, Primitive};
pub use registry::TypeRegistry;
pub use string::{FixedStringColumn, StringColumn};
pub use temporal::{DateColumn, DateTime64Column, DateTimeColumn};
pub use value::{FromValue, NotByte, Value};
pub use variant::VariantColumn;

use std::net::{Ipv4Addr, Ipv6Addr};

use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

use crate::frame::frame_errors::FrameError;
use crate::frame::{PacketReader, PacketWriter};

/// Discriminant marking a null row in tagged-union columns.
pub const NULL_DISCRIMINANT: u8 = 255;

/// Error while parsing a column type or encoding/decoding column data.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ColumnError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Unsupported column type: {0}")]
    UnsupportedType(String),
    #[error("Malformed column type {type_name:?}: {reason}")]
    BadType {
        type_name: String,
        reason: &'static str,
    },
    #[error("Enum {0} is already registered")]
    EnumAlreadyRegistered(String),
    #[error("Value {0:?} is not part of the enum and the enum has no empty entry")]
    UnknownEnumValue(String),
    #[error("Enum code {0} is not part of the enum")]
    UnknownEnumCode(i8),
    #[error("Unsupported {what} serialization version: {version}")]
    BadVersion { what: &'static str, version: u64 },
    #[error("Invalid LowCardinality key type in flags 0x{0:x}")]
    BadLowCardinalityFlags(u64),
    #[error("LowCardinality key count {keys} does not match row count {rows}")]
    KeyCountMismatch { keys: u64, rows: usize },
    #[error("LowCardinality key {key} is out of the dictionary of {size} entries")]
    KeyOutOfRange { key: u64, size: usize },
    #[error("Array offsets are not monotonic at row {0}")]
    BadOffsets(usize),
    #[error("Unknown variant discriminant {0}")]
    UnknownDiscriminant(u8),
    #[error("Value {value} cannot be stored in a column of type {column_type}")]
    TypeMismatch { column_type: String, value: String },
    #[error("Column {column:?} has {got} rows, block has {expected}")]
    RowCountMismatch {
        column: String,
        expected: usize,
        got: usize,
    },
    #[error("Row {row} is out of range for a column of {len} rows")]
    RowOutOfRange { row: usize, len: usize },
    #[error("Invalid UTF-8 in String column")]
    InvalidUtf8,
    #[error("Value of {len} bytes does not fit FixedString({width})")]
    FixedStringOverflow { len: usize, width: usize },
    #[error("Invalid aggregate function state: {0}")]
    BadAggregateState(&'static str),
}

impl ColumnError {
    pub(crate) fn mismatch(column_type: &ColumnType, value: &Value) -> Self {
        ColumnError::TypeMismatch {
            column_type: column_type.to_string(),
            value: value.kind_name().to_owned(),
        }
    }
}

/// In-memory data of one column, one variant per wire family.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Columnar {
    Bool(NumericColumn<bool>),
    Int8(NumericColumn<i8>),
    Int16(NumericColumn<i16>),
    Int32(NumericColumn<i32>),
    Int64(NumericColumn<i64>),
    UInt8(NumericColumn<u8>),
    UInt16(NumericColumn<u16>),
    UInt32(NumericColumn<u32>),
    UInt64(NumericColumn<u64>),
    Float32(NumericColumn<f32>),
    Float64(NumericColumn<f64>),
    Uuid(NumericColumn<Uuid>),
    Ipv4(NumericColumn<Ipv4Addr>),
    Ipv6(NumericColumn<Ipv6Addr>),
    String(StringColumn),
    FixedString(FixedStringColumn),
    Date(DateColumn),
    DateTime(DateTimeColumn),
    DateTime64(DateTime64Column),
    Enum8(Enum8Column),
    Nullable(NullableColumn),
    Array(ArrayColumn),
    LowCardinality(LowCardinalityColumn),
    Variant(VariantColumn),
    Dynamic(DynamicColumn),
    TDigest(TDigestColumn),
    BFloat16Histogram(BFloat16HistogramColumn),
    QuantileTiming(QuantileTimingColumn),
    /// `Nothing`, only ever seen as `Nullable(Nothing)`: one placeholder byte per row.
    Nothing(usize),
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr, nothing($n:ident) => $nothing:expr) => {
        match $self {
            Columnar::Bool($c) => $body,
            Columnar::Int8($c) => $body,
            Columnar::Int16($c) => $body,
            Columnar::Int32($c) => $body,
            Columnar::Int64($c) => $body,
            Columnar::UInt8($c) => $body,
            Columnar::UInt16($c) => $body,
            Columnar::UInt32($c) => $body,
            Columnar::UInt64($c) => $body,
            Columnar::Float32($c) => $body,
            Columnar::Float64($c) => $body,
            Columnar::Uuid($c) => $body,
            Columnar::Ipv4($c) => $body,
            Columnar::Ipv6($c) => $body,
            Columnar::String($c) => $body,
            Columnar::FixedString($c) => $body,
            Columnar::Date($c) => $body,
            Columnar::DateTime($c) => $body,
            Columnar::DateTime64($c) => $body,
            Columnar::Enum8($c) => $body,
            Columnar::Nullable($c) => $body,
            Columnar::Array($c) => $body,
            Columnar::LowCardinality($c) => $body,
            Columnar::Variant($c) => $body,
            Columnar::Dynamic($c) => $body,
            Columnar::TDigest($c) => $body,
            Columnar::BFloat16Histogram($c) => $body,
            Columnar::QuantileTiming($c) => $body,
            Columnar::Nothing($n) => $nothing,
        }
    };
}

impl Columnar {
    /// Creates an empty column for `ty`.
    pub fn new(ty: &ColumnType) -> Columnar {
        match ty {
            ColumnType::Bool => Columnar::Bool(NumericColumn::default()),
            ColumnType::Int8 => Columnar::Int8(NumericColumn::default()),
            ColumnType::Int16 => Columnar::Int16(NumericColumn::default()),
            ColumnType::Int32 => Columnar::Int32(NumericColumn::default()),
            ColumnType::Int64 => Columnar::Int64(NumericColumn::default()),
            ColumnType::UInt8 => Columnar::UInt8(NumericColumn::default()),
            ColumnType::UInt16 => Columnar::UInt16(NumericColumn::default()),
            ColumnType::UInt32 => Columnar::UInt32(NumericColumn::default()),
            ColumnType::UInt64 => Columnar::UInt64(NumericColumn::default()),
            ColumnType::Float32 => Columnar::Float32(NumericColumn::default()),
            ColumnType::Float64 => Columnar::Float64(NumericColumn::default()),
            ColumnType::Uuid => Columnar::Uuid(NumericColumn::default()),
            ColumnType::Ipv4 => Columnar::Ipv4(NumericColumn::default()),
            ColumnType::Ipv6 => Columnar::Ipv6(NumericColumn::default()),
            ColumnType::String => Columnar::String(StringColumn::default()),
            ColumnType::FixedString(width) => {
                Columnar::FixedString(FixedStringColumn::new(*width))
            }
            ColumnType::Date => Columnar::Date(DateColumn::default()),
            ColumnType::DateTime(tz) => Columnar::DateTime(DateTimeColumn::new(tz.clone())),
            ColumnType::DateTime64(precision, tz) => {
                Columnar::DateTime64(DateTime64Column::new(*precision, tz.clone()))
            }
            ColumnType::Enum8(table) => Columnar::Enum8(Enum8Column::new(table.clone())),
            ColumnType::Nullable(inner) => Columnar::Nullable(NullableColumn::new(inner)),
            ColumnType::Array(inner) => Columnar::Array(ArrayColumn::new(inner)),
            ColumnType::LowCardinality(inner) => {
                Columnar::LowCardinality(LowCardinalityColumn::new(inner))
            }
            ColumnType::Variant(types) => Columnar::Variant(VariantColumn::new(types)),
            ColumnType::Dynamic => Columnar::Dynamic(DynamicColumn::default()),
            ColumnType::AggregateFunction { kind, .. } => match kind {
                AggregateKind::TDigest => Columnar::TDigest(TDigestColumn::default()),
                AggregateKind::BFloat16 => {
                    Columnar::BFloat16Histogram(BFloat16HistogramColumn::default())
                }
                AggregateKind::Timing => Columnar::QuantileTiming(QuantileTimingColumn::default()),
            },
            ColumnType::Nothing => Columnar::Nothing(0),
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, c => c.len(), nothing(n) => *n)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        dispatch!(self, c => c.clear(), nothing(n) => *n = 0)
    }

    /// Value of row `row`. Panics if the row is out of range.
    pub fn value(&self, row: usize) -> Value {
        dispatch!(self, c => c.value(row), nothing(_n) => Value::Null)
    }

    /// Appends one row.
    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        dispatch!(self, c => c.push(value), nothing(n) => match value {
            Value::Null => {
                *n += 1;
                Ok(())
            }
            other => Err(ColumnError::mismatch(&ColumnType::Nothing, &other)),
        })
    }

    /// Appends the zero value of the column type. Used for the data slot of null rows.
    pub fn push_default(&mut self) {
        dispatch!(self, c => c.push_default(), nothing(n) => *n += 1)
    }

    /// Copies rows `lo..hi` into a new column of the same type.
    pub fn slice(&self, lo: usize, hi: usize) -> Columnar {
        match self {
            Columnar::Bool(c) => Columnar::Bool(c.slice(lo, hi)),
            Columnar::Int8(c) => Columnar::Int8(c.slice(lo, hi)),
            Columnar::Int16(c) => Columnar::Int16(c.slice(lo, hi)),
            Columnar::Int32(c) => Columnar::Int32(c.slice(lo, hi)),
            Columnar::Int64(c) => Columnar::Int64(c.slice(lo, hi)),
            Columnar::UInt8(c) => Columnar::UInt8(c.slice(lo, hi)),
            Columnar::UInt16(c) => Columnar::UInt16(c.slice(lo, hi)),
            Columnar::UInt32(c) => Columnar::UInt32(c.slice(lo, hi)),
            Columnar::UInt64(c) => Columnar::UInt64(c.slice(lo, hi)),
            Columnar::Float32(c) => Columnar::Float32(c.slice(lo, hi)),
            Columnar::Float64(c) => Columnar::Float64(c.slice(lo, hi)),
            Columnar::Uuid(c) => Columnar::Uuid(c.slice(lo, hi)),
            Columnar::Ipv4(c) => Columnar::Ipv4(c.slice(lo, hi)),
            Columnar::Ipv6(c) => Columnar::Ipv6(c.slice(lo, hi)),
            Columnar::String(c) => Columnar::String(c.slice(lo, hi)),
            Columnar::FixedString(c) => Columnar::FixedString(c.slice(lo, hi)),
            Columnar::Date(c) => Columnar::Date(c.slice(lo, hi)),
            Columnar::DateTime(c) => Columnar::DateTime(c.slice(lo, hi)),
            Columnar::DateTime64(c) => Columnar::DateTime64(c.slice(lo, hi)),
            Columnar::Enum8(c) => Columnar::Enum8(c.slice(lo, hi)),
            Columnar::Nullable(c) => Columnar::Nullable(c.slice(lo, hi)),
            Columnar::Array(c) => Columnar::Array(c.slice(lo, hi)),
            Columnar::LowCardinality(c) => Columnar::LowCardinality(c.slice(lo, hi)),
            Columnar::Variant(c) => Columnar::Variant(c.slice(lo, hi)),
            Columnar::Dynamic(c) => Columnar::Dynamic(c.slice(lo, hi)),
            Columnar::TDigest(c) => Columnar::TDigest(c.slice(lo, hi)),
            Columnar::BFloat16Histogram(c) => Columnar::BFloat16Histogram(c.slice(lo, hi)),
            Columnar::QuantileTiming(c) => Columnar::QuantileTiming(c.slice(lo, hi)),
            Columnar::Nothing(_) => Columnar::Nothing(hi.saturating_sub(lo)),
        }
    }

    /// Reads the per-column state that precedes the data of every block.
    pub fn read_prefix<'a>(
        &'a mut self,
        r: &'a mut PacketReader,
    ) -> BoxFuture<'a, Result<(), ColumnError>> {
        Box::pin(async move {
            match self {
                Columnar::Nullable(c) => c.read_prefix(r).await,
                Columnar::Array(c) => c.read_prefix(r).await,
                Columnar::LowCardinality(c) => c.read_prefix(r).await,
                Columnar::Variant(c) => c.read_prefix(r).await,
                Columnar::Dynamic(c) => c.read_prefix(r).await,
                _ => Ok(()),
            }
        })
    }

    /// Reads `rows` rows and appends them to the column.
    pub fn read_data<'a>(
        &'a mut self,
        r: &'a mut PacketReader,
        rows: usize,
    ) -> BoxFuture<'a, Result<(), ColumnError>> {
        Box::pin(async move {
            dispatch!(self, c => c.read_data(r, rows).await, nothing(n) => {
                r.read_fixed(rows, 1).await?;
                *n += rows;
                Ok(())
            })
        })
    }

    pub fn write_prefix(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        match self {
            Columnar::Nullable(c) => c.write_prefix(w),
            Columnar::Array(c) => c.write_prefix(w),
            Columnar::LowCardinality(c) => c.write_prefix(w),
            Columnar::Variant(c) => c.write_prefix(w),
            Columnar::Dynamic(c) => c.write_prefix(w),
            _ => Ok(()),
        }
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        dispatch!(self, c => c.write_data(w), nothing(n) => {
            w.write_raw(&vec![0u8; *n])?;
            Ok(())
        })
    }
}

/// A named, typed column of a [`Block`](crate::block::Block).
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    type_name: String,
    ty: ColumnType,
    data: Columnar,
}

impl Column {
    /// Creates an empty column. `type_name` is resolved through the registry so named
    /// enums are available.
    pub fn new(
        name: impl Into<String>,
        type_name: &str,
        registry: &TypeRegistry,
    ) -> Result<Column, ColumnError> {
        let ty = registry.parse(type_name)?;
        Ok(Column::from_parts(name, type_name, ty))
    }

    pub(crate) fn from_parts(name: impl Into<String>, type_name: &str, ty: ColumnType) -> Column {
        let data = Columnar::new(&ty);
        Column {
            name: name.into(),
            type_name: type_name.to_owned(),
            ty,
            data,
        }
    }

    /// Creates a column and fills it with `values`.
    pub fn with_values(
        name: impl Into<String>,
        type_name: &str,
        registry: &TypeRegistry,
        values: impl IntoIterator<Item = Value>,
    ) -> Result<Column, ColumnError> {
        let mut column = Column::new(name, type_name, registry)?;
        for value in values {
            column.push(value)?;
        }
        Ok(column)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type string exactly as declared or as received from the server.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn column_type(&self) -> &ColumnType {
        &self.ty
    }

    pub fn data(&self) -> &Columnar {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Columnar {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear()
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        self.data.push(value)
    }

    pub fn value(&self, row: usize) -> Result<Value, ColumnError> {
        if row >= self.len() {
            return Err(ColumnError::RowOutOfRange {
                row,
                len: self.len(),
            });
        }
        Ok(self.data.value(row))
    }

    /// Typed access to one row.
    pub fn get<T: FromValue>(&self, row: usize) -> Result<T, ColumnError> {
        let value = self.value(row)?;
        T::from_value(value).ok_or_else(|| ColumnError::TypeMismatch {
            column_type: self.type_name.clone(),
            value: std::any::type_name::<T>().to_owned(),
        })
    }

    /// All rows converted to `T`.
    pub fn values<T: FromValue>(&self) -> Result<Vec<T>, ColumnError> {
        (0..self.len()).map(|row| self.get(row)).collect()
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Column {
        let hi = hi.min(self.len());
        let lo = lo.min(hi);
        Column {
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            ty: self.ty.clone(),
            data: self.data.slice(lo, hi),
        }
    }

    /// Appends all rows of `other`, which must have the same type.
    pub fn append(&mut self, other: &Column) -> Result<(), ColumnError> {
        if other.ty != self.ty {
            return Err(ColumnError::TypeMismatch {
                column_type: self.type_name.clone(),
                value: other.type_name.clone(),
            });
        }
        for row in 0..other.len() {
            self.data.push(other.data.value(row))?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::frame::Compression;

    /// Encodes `column` (prefix then data) and decodes it into a fresh column of
    /// the same type.
    pub(crate) async fn reencode(ty: &ColumnType, column: &Columnar) -> Columnar {
        let mut w = PacketWriter::new(Compression::None);
        column.write_prefix(&mut w).unwrap();
        column.write_data(&mut w).unwrap();
        let wire = w.take();

        let mut decoded = Columnar::new(ty);
        let mut r = PacketReader::new(std::io::Cursor::new(wire));
        decoded.read_prefix(&mut r).await.unwrap();
        decoded.read_data(&mut r, column.len()).await.unwrap();
        let mut rest = [0u8; 1];
        assert!(r.read_exact(&mut rest).await.is_err(), "trailing bytes");
        decoded
    }

    pub(crate) fn column_of(ty: &ColumnType, values: impl IntoIterator<Item = Value>) -> Columnar {
        let mut col = Columnar::new(ty);
        for v in values {
            col.push(v).unwrap();
        }
        col
    }
}
