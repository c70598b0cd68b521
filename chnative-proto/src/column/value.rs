use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::primitive::Primitive;

/// Type-erased value of one row.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    /// FixedString contents, or an opaque shared-variant row of a Dynamic column.
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Date(NaiveDate),
    /// DateTime and DateTime64. Sub-second precision is kept for DateTime64.
    DateTime(DateTime<Utc>),
    Array(Vec<Value>),
    /// t-digest centroids as `(mean, weight)`.
    TDigest(Vec<(f32, f32)>),
    /// bfloat16 histogram as `(bfloat16 bits, count)`.
    BFloat16Histogram(Vec<(u16, u64)>),
    /// Timing histogram as `(value in ms, count)`.
    QuantileTiming(Vec<(u64, u64)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int8(_) => "Int8",
            Value::Int16(_) => "Int16",
            Value::Int32(_) => "Int32",
            Value::Int64(_) => "Int64",
            Value::UInt8(_) => "UInt8",
            Value::UInt16(_) => "UInt16",
            Value::UInt32(_) => "UInt32",
            Value::UInt64(_) => "UInt64",
            Value::Float32(_) => "Float32",
            Value::Float64(_) => "Float64",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::Uuid(_) => "UUID",
            Value::Ipv4(_) => "IPv4",
            Value::Ipv6(_) => "IPv6",
            Value::Date(_) => "Date",
            Value::DateTime(_) => "DateTime",
            Value::Array(_) => "Array",
            Value::TDigest(_) => "TDigest",
            Value::BFloat16Histogram(_) => "BFloat16Histogram",
            Value::QuantileTiming(_) => "QuantileTiming",
        }
    }

    /// Integer payload widened to i128, for lossless range-checked conversions.
    pub(crate) fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Value::Bool(v) => v as i128,
            Value::Int8(v) => v as i128,
            Value::Int16(v) => v as i128,
            Value::Int32(v) => v as i128,
            Value::Int64(v) => v as i128,
            Value::UInt8(v) => v as i128,
            Value::UInt16(v) => v as i128,
            Value::UInt32(v) => v as i128,
            Value::UInt64(v) => v as i128,
            _ => return None,
        })
    }
}

macro_rules! impl_from_for_value {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_for_value! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    String => String,
    Vec<u8> => Bytes,
    Uuid => Uuid,
    Ipv4Addr => Ipv4,
    Ipv6Addr => Ipv6,
    NaiveDate => Date,
    DateTime<Utc> => DateTime,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value
where
    T: NotByte,
{
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Keeps `Vec<u8>` mapped to [`Value::Bytes`] instead of an array of `UInt8`.
pub trait NotByte {}

macro_rules! not_byte {
    ($($t:ty),*) => { $(impl NotByte for $t {})* };
}

not_byte!(bool, i8, i16, i32, i64, u16, u32, u64, f32, f64, String, Uuid, Value);

impl<T> NotByte for Option<T> {}
impl<T> NotByte for Vec<T> {}

/// Conversion out of a [`Value`], used for typed column access.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Option<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Option<Self> {
        Some(value)
    }
}

macro_rules! impl_from_value_primitive {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(value: Value) -> Option<Self> {
                    <$t as Primitive>::from_value(&value)
                }
            }
        )*
    };
}

impl_from_value_primitive!(
    bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, Uuid, Ipv4Addr, Ipv6Addr
);

impl FromValue for String {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s),
            Value::Bytes(b) => String::from_utf8(b).ok(),
            _ => None,
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bytes(b) => Some(b),
            Value::String(s) => Some(s.into_bytes()),
            _ => None,
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Date(d) => Some(d),
            Value::DateTime(t) => Some(t.date_naive()),
            _ => None,
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::DateTime(t) => Some(t),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue + NotByte> FromValue for Vec<T> {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Array(values) => values.into_iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}
