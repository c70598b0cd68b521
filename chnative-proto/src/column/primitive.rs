use std::fmt::Debug;
use std::net::{Ipv4Addr, Ipv6Addr};

use uuid::Uuid;

use super::value::Value;
use super::ColumnError;
use crate::frame::types::{uuid_from_wire, uuid_to_wire};
use crate::frame::{PacketReader, PacketWriter};

/// A fixed-width element stored little-endian on the wire.
pub trait Primitive: Copy + PartialEq + Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Placeholder written for null rows.
    fn zero() -> Self;

    fn encode(self, out: &mut Vec<u8>);

    /// Decodes from exactly `WIDTH` bytes.
    fn decode(raw: &[u8]) -> Self;

    fn into_value(self) -> Value;

    /// Lossless conversion from a value. Integers convert across widths when in range.
    fn from_value(value: &Value) -> Option<Self>;
}

fn array<const N: usize>(raw: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&raw[..N]);
    out
}

macro_rules! impl_primitive_int {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl Primitive for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn zero() -> Self {
                    0
                }

                fn encode(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn decode(raw: &[u8]) -> Self {
                    <$t>::from_le_bytes(array(raw))
                }

                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                fn from_value(value: &Value) -> Option<Self> {
                    value.as_i128().and_then(|v| <$t>::try_from(v).ok())
                }
            }
        )*
    };
}

impl_primitive_int! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
}

impl Primitive for f32 {
    const WIDTH: usize = 4;

    fn zero() -> Self {
        0.0
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        f32::from_le_bytes(array(raw))
    }

    fn into_value(self) -> Value {
        Value::Float32(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match *value {
            Value::Float32(v) => Some(v),
            _ => None,
        }
    }
}

impl Primitive for f64 {
    const WIDTH: usize = 8;

    fn zero() -> Self {
        0.0
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        f64::from_le_bytes(array(raw))
    }

    fn into_value(self) -> Value {
        Value::Float64(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match *value {
            Value::Float64(v) => Some(v),
            Value::Float32(v) => Some(v as f64),
            _ => None,
        }
    }
}

impl Primitive for bool {
    const WIDTH: usize = 1;

    fn zero() -> Self {
        false
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn decode(raw: &[u8]) -> Self {
        raw[0] != 0
    }

    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match *value {
            Value::Bool(v) => Some(v),
            Value::UInt8(v) if v <= 1 => Some(v == 1),
            _ => None,
        }
    }
}

impl Primitive for Uuid {
    const WIDTH: usize = 16;

    fn zero() -> Self {
        Uuid::nil()
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&uuid_to_wire(&self));
    }

    fn decode(raw: &[u8]) -> Self {
        uuid_from_wire(&array(raw))
    }

    fn into_value(self) -> Value {
        Value::Uuid(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Uuid(v) => Some(*v),
            Value::String(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }
}

// IPv4 travels as the UInt32 value of the address.
impl Primitive for Ipv4Addr {
    const WIDTH: usize = 4;

    fn zero() -> Self {
        Ipv4Addr::UNSPECIFIED
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&u32::from(self).to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        Ipv4Addr::from(u32::from_le_bytes(array(raw)))
    }

    fn into_value(self) -> Value {
        Value::Ipv4(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Ipv4(v) => Some(*v),
            Value::UInt32(v) => Some(Ipv4Addr::from(*v)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

// IPv6 travels in network byte order.
impl Primitive for Ipv6Addr {
    const WIDTH: usize = 16;

    fn zero() -> Self {
        Ipv6Addr::UNSPECIFIED
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.octets());
    }

    fn decode(raw: &[u8]) -> Self {
        Ipv6Addr::from(array::<16>(raw))
    }

    fn into_value(self) -> Value {
        Value::Ipv6(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Ipv6(v) => Some(*v),
            Value::Ipv4(v) => Some(v.to_ipv6_mapped()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Column of fixed-width values. Integers, floats, Bool, UUID and IP addresses all
/// share this implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericColumn<T: Primitive> {
    data: Vec<T>,
}

impl<T: Primitive> Default for NumericColumn<T> {
    fn default() -> Self {
        NumericColumn { data: Vec::new() }
    }
}

impl<T: Primitive> NumericColumn<T> {
    pub fn from_vec(data: Vec<T>) -> Self {
        NumericColumn { data }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
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

    pub(crate) fn get(&self, row: usize) -> T {
        self.data[row]
    }

    pub fn value(&self, row: usize) -> Value {
        self.data[row].into_value()
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        match T::from_value(&value) {
            Some(v) => {
                self.data.push(v);
                Ok(())
            }
            None => Err(ColumnError::TypeMismatch {
                column_type: std::any::type_name::<T>().to_owned(),
                value: value.kind_name().to_owned(),
            }),
        }
    }

    pub(crate) fn push_raw(&mut self, v: T) {
        self.data.push(v)
    }

    pub fn push_default(&mut self) {
        self.data.push(T::zero())
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        NumericColumn {
            data: self.data[lo..hi].to_vec(),
        }
    }

    /// Reads the whole column as one contiguous byte run, then splits it.
    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        let raw = r.read_fixed(rows, T::WIDTH).await?;
        self.data.reserve(rows);
        self.data
            .extend(raw.chunks_exact(T::WIDTH).map(T::decode));
        Ok(())
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        let mut raw = Vec::with_capacity(self.data.len() * T::WIDTH);
        for v in &self.data {
            v.encode(&mut raw);
        }
        w.write_raw(&raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::reencode;
    use super::super::{ColumnType, Columnar};
    use super::*;
    use rand::Rng;

    #[tokio::test]
    async fn numeric_boundaries_survive_encoding() {
        let cases: Vec<(ColumnType, Columnar)> = vec![
            (
                ColumnType::Int8,
                Columnar::Int8(NumericColumn::from_vec(vec![0, i8::MIN, i8::MAX, -1])),
            ),
            (
                ColumnType::UInt16,
                Columnar::UInt16(NumericColumn::from_vec(vec![0, u16::MAX, 1])),
            ),
            (
                ColumnType::Int64,
                Columnar::Int64(NumericColumn::from_vec(vec![i64::MIN, i64::MAX, 0, -7])),
            ),
            (
                ColumnType::UInt64,
                Columnar::UInt64(NumericColumn::from_vec(vec![u64::MAX, 0])),
            ),
            (
                ColumnType::Float64,
                Columnar::Float64(NumericColumn::from_vec(vec![
                    0.0,
                    -0.0,
                    f64::MAX,
                    f64::MIN_POSITIVE,
                    f64::INFINITY,
                    f64::NEG_INFINITY,
                ])),
            ),
            (
                ColumnType::Bool,
                Columnar::Bool(NumericColumn::from_vec(vec![true, false, true])),
            ),
        ];
        for (ty, col) in cases {
            assert_eq!(reencode(&ty, &col).await, col, "{ty}");
        }
    }

    #[tokio::test]
    async fn float_nan_is_preserved_bitwise() {
        let col = Columnar::Float32(NumericColumn::from_vec(vec![f32::NAN, 1.5]));
        let Columnar::Float32(decoded) = reencode(&ColumnType::Float32, &col).await else {
            panic!("wrong column variant");
        };
        assert!(decoded.get(0).is_nan());
        assert_eq!(decoded.get(1), 1.5);
    }

    #[tokio::test]
    async fn random_u32_sample() {
        let mut rng = rand::rng();
        let data: Vec<u32> = (0..1000).map(|_| rng.random()).collect();
        let col = Columnar::UInt32(NumericColumn::from_vec(data));
        assert_eq!(reencode(&ColumnType::UInt32, &col).await, col);
    }

    #[tokio::test]
    async fn huge_row_counts_are_rejected() {
        let mut r = PacketReader::new(std::io::Cursor::new(vec![0u8; 64]));
        let mut col = NumericColumn::<u64>::default();
        let err = col.read_data(&mut r, usize::MAX / 4).await.unwrap_err();
        assert!(
            matches!(err, ColumnError::Frame(crate::frame::frame_errors::FrameError::LengthTooLarge(_))),
            "{err:?}"
        );
        assert!(col.as_slice().is_empty());
    }

    #[test]
    fn wire_layouts() {
        let mut out = Vec::new();
        Ipv4Addr::new(1, 2, 3, 4).encode(&mut out);
        assert_eq!(out, [4, 3, 2, 1]);

        out.clear();
        (-2i16).encode(&mut out);
        assert_eq!(out, [0xfe, 0xff]);
        assert_eq!(i16::decode(&out), -2);
    }

    #[test]
    fn push_checks_range() {
        let mut col = NumericColumn::<u8>::default();
        col.push(Value::UInt64(255)).unwrap();
        assert!(col.push(Value::Int32(-1)).is_err());
        assert!(col.push(Value::String("1".into())).is_err());
        assert_eq!(col.as_slice(), &[255]);
    }
}
