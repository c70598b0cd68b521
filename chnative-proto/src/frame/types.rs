//! Native protocol in-wire primitive types.
//!
//! Integers are little-endian and fixed width; lengths and packet tags are LEB128
//! uvarints; strings are uvarint-length-prefixed raw bytes. UUIDs go over the wire
//! as two little-endian 64-bit halves, most significant half first.

use super::frame_errors::LowLevelDeserializationError;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::BufMut;
use uuid::Uuid;

/// Longest uvarint encoding of a u64.
pub const MAX_UVARINT_LEN: usize = 10;

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

fn too_few(expected: usize, buf: &[u8]) -> LowLevelDeserializationError {
    LowLevelDeserializationError::TooFewBytesReceived {
        expected,
        received: buf.len(),
    }
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8, LowLevelDeserializationError> {
    buf.read_u8().map_err(|_| too_few(1, buf))
}

pub fn write_u8(v: u8, buf: &mut impl BufMut) {
    buf.put_u8(v);
}

pub fn read_bool(buf: &mut &[u8]) -> Result<bool, LowLevelDeserializationError> {
    Ok(read_u8(buf)? != 0)
}

pub fn write_bool(v: bool, buf: &mut impl BufMut) {
    buf.put_u8(v as u8);
}

pub fn read_u16(buf: &mut &[u8]) -> Result<u16, LowLevelDeserializationError> {
    buf.read_u16::<LittleEndian>().map_err(|_| too_few(2, buf))
}

pub fn write_u16(v: u16, buf: &mut impl BufMut) {
    buf.put_u16_le(v);
}

pub fn read_u32(buf: &mut &[u8]) -> Result<u32, LowLevelDeserializationError> {
    buf.read_u32::<LittleEndian>().map_err(|_| too_few(4, buf))
}

pub fn write_u32(v: u32, buf: &mut impl BufMut) {
    buf.put_u32_le(v);
}

pub fn read_i32(buf: &mut &[u8]) -> Result<i32, LowLevelDeserializationError> {
    buf.read_i32::<LittleEndian>().map_err(|_| too_few(4, buf))
}

pub fn write_i32(v: i32, buf: &mut impl BufMut) {
    buf.put_i32_le(v);
}

pub fn read_u64(buf: &mut &[u8]) -> Result<u64, LowLevelDeserializationError> {
    buf.read_u64::<LittleEndian>().map_err(|_| too_few(8, buf))
}

pub fn write_u64(v: u64, buf: &mut impl BufMut) {
    buf.put_u64_le(v);
}

pub fn read_i64(buf: &mut &[u8]) -> Result<i64, LowLevelDeserializationError> {
    buf.read_i64::<LittleEndian>().map_err(|_| too_few(8, buf))
}

pub fn write_i64(v: i64, buf: &mut impl BufMut) {
    buf.put_i64_le(v);
}

pub fn read_uvarint(buf: &mut &[u8]) -> Result<u64, LowLevelDeserializationError> {
    let mut v: u64 = 0;
    for i in 0..MAX_UVARINT_LEN {
        let b = read_u8(buf)?;
        if i == MAX_UVARINT_LEN - 1 && b > 1 {
            return Err(LowLevelDeserializationError::VarintOverflow);
        }
        v |= ((b & 0x7f) as u64) << (7 * i);
        if b < 0x80 {
            return Ok(v);
        }
    }
    Err(LowLevelDeserializationError::VarintOverflow)
}

pub fn write_uvarint(mut v: u64, buf: &mut impl BufMut) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_uvarint(buf)?;
    let len: usize = len
        .try_into()
        .map_err(|_| LowLevelDeserializationError::LengthOverflow(len))?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) {
    write_uvarint(v.len() as u64, buf);
    buf.put_slice(v);
}

pub fn write_string(v: &str, buf: &mut impl BufMut) {
    write_bytes(v.as_bytes(), buf);
}

/// Splits the 128-bit value into the two wire halves.
pub fn uuid_to_wire(uuid: &Uuid) -> [u8; 16] {
    let (hi, lo) = uuid.as_u64_pair();
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&hi.to_le_bytes());
    out[8..].copy_from_slice(&lo.to_le_bytes());
    out
}

pub fn uuid_from_wire(raw: &[u8; 16]) -> Uuid {
    let mut hi = [0u8; 8];
    let mut lo = [0u8; 8];
    hi.copy_from_slice(&raw[..8]);
    lo.copy_from_slice(&raw[8..]);
    Uuid::from_u64_pair(u64::from_le_bytes(hi), u64::from_le_bytes(lo))
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    let raw = read_raw_bytes(16, buf)?;
    let mut arr = [0u8; 16];
    arr.copy_from_slice(raw);
    Ok(uuid_from_wire(&arr))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(&uuid_to_wire(uuid));
}

#[test]
fn type_uvarint() {
    let cases: [(u64, &[u8]); 7] = [
        (0, &[0]),
        (1, &[1]),
        (127, &[0x7f]),
        (128, &[0x80, 0x01]),
        (300, &[0xac, 0x02]),
        (16384, &[0x80, 0x80, 0x01]),
        (
            u64::MAX,
            &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01],
        ),
    ];
    for (val, encoded) in cases {
        let mut buf = Vec::new();
        write_uvarint(val, &mut buf);
        assert_eq!(buf, encoded);
        assert_eq!(read_uvarint(&mut &buf[..]).unwrap(), val);
    }
}

#[test]
fn type_uvarint_overflow() {
    let buf = [0xffu8; 11];
    assert_eq!(
        read_uvarint(&mut &buf[..]),
        Err(LowLevelDeserializationError::VarintOverflow)
    );
}

#[test]
fn type_uvarint_truncated() {
    let buf = [0x80u8, 0x80];
    assert_eq!(
        read_uvarint(&mut &buf[..]),
        Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: 1,
            received: 0
        })
    );
}

#[test]
fn type_fixed_width() {
    let mut buf = Vec::new();
    write_u16(0xbeef, &mut buf);
    write_i32(-2, &mut buf);
    write_u64(u64::MAX - 1, &mut buf);
    write_i64(i64::MIN, &mut buf);
    assert_eq!(&buf[..2], &[0xef, 0xbe]);

    let mut slice = &buf[..];
    assert_eq!(read_u16(&mut slice).unwrap(), 0xbeef);
    assert_eq!(read_i32(&mut slice).unwrap(), -2);
    assert_eq!(read_u64(&mut slice).unwrap(), u64::MAX - 1);
    assert_eq!(read_i64(&mut slice).unwrap(), i64::MIN);
    assert!(slice.is_empty());
    assert!(read_u32(&mut slice).is_err());
}

#[test]
fn type_string() {
    let vals = ["", "hello, world!", "żółć"];
    for val in vals {
        let mut buf = Vec::new();
        write_string(val, &mut buf);
        assert_eq!(read_bytes(&mut &buf[..]).unwrap(), val.as_bytes());
    }
}

#[test]
fn type_uuid_halves_are_swapped() {
    let u = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
    let wire = uuid_to_wire(&u);
    assert_eq!(
        wire,
        [
            0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa,
            0x99, 0x88
        ]
    );
    let mut buf = Vec::new();
    write_uuid(&u, &mut buf);
    assert_eq!(read_uuid(&mut &buf[..]).unwrap(), u);
}
