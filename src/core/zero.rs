//! # Zero Format
//!
//! Compact, type-tagged binary encoding for maps and arrays.
//!
//! Every element starts with a one-byte type tag. All numbers are big-endian.
//!
//! ```text
//! map    : [18] [i16 size] { [i16 key len] [key utf8] [element] }*
//! array  : [17] [i16 size] { [element] }*
//! string : [8]  [i16 len]  [utf8]
//! bytes  : [10] [i32 len]  [raw]
//! arrays : [tag] [i16 count] { value }*
//! ```
//!
//! A root collection must be a map or an array and hold at least three bytes
//! (tag plus size). Negative sizes, booleans other than 0/1, and unknown tags are
//! rejected rather than guessed at.

use crate::error::{constants, NetworkError, Result};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;

/// Deepest nesting of maps and arrays accepted on either side of the wire.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Type tags on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZeroType {
    Null = 0,
    Boolean = 1,
    Byte = 2,
    Short = 3,
    Integer = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    String = 8,
    BooleanArray = 9,
    ByteArray = 10,
    ShortArray = 11,
    IntegerArray = 12,
    LongArray = 13,
    FloatArray = 14,
    DoubleArray = 15,
    StringArray = 16,
    ZeroArray = 17,
    ZeroMap = 18,
}

impl ZeroType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use ZeroType::*;
        Some(match byte {
            0 => Null,
            1 => Boolean,
            2 => Byte,
            3 => Short,
            4 => Integer,
            5 => Long,
            6 => Float,
            7 => Double,
            8 => String,
            9 => BooleanArray,
            10 => ByteArray,
            11 => ShortArray,
            12 => IntegerArray,
            13 => LongArray,
            14 => FloatArray,
            15 => DoubleArray,
            16 => StringArray,
            17 => ZeroArray,
            18 => ZeroMap,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ZeroElement {
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    BooleanArray(Vec<bool>),
    ByteArray(Vec<u8>),
    ShortArray(Vec<i16>),
    IntegerArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    Array(ZeroArray),
    Map(ZeroMap),
}

impl ZeroElement {
    pub fn zero_type(&self) -> ZeroType {
        match self {
            ZeroElement::Null => ZeroType::Null,
            ZeroElement::Boolean(_) => ZeroType::Boolean,
            ZeroElement::Byte(_) => ZeroType::Byte,
            ZeroElement::Short(_) => ZeroType::Short,
            ZeroElement::Integer(_) => ZeroType::Integer,
            ZeroElement::Long(_) => ZeroType::Long,
            ZeroElement::Float(_) => ZeroType::Float,
            ZeroElement::Double(_) => ZeroType::Double,
            ZeroElement::String(_) => ZeroType::String,
            ZeroElement::BooleanArray(_) => ZeroType::BooleanArray,
            ZeroElement::ByteArray(_) => ZeroType::ByteArray,
            ZeroElement::ShortArray(_) => ZeroType::ShortArray,
            ZeroElement::IntegerArray(_) => ZeroType::IntegerArray,
            ZeroElement::LongArray(_) => ZeroType::LongArray,
            ZeroElement::FloatArray(_) => ZeroType::FloatArray,
            ZeroElement::DoubleArray(_) => ZeroType::DoubleArray,
            ZeroElement::StringArray(_) => ZeroType::StringArray,
            ZeroElement::Array(_) => ZeroType::ZeroArray,
            ZeroElement::Map(_) => ZeroType::ZeroMap,
        }
    }

    /// Any integral element widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ZeroElement::Byte(v) => Some(v as i64),
            ZeroElement::Short(v) => Some(v as i64),
            ZeroElement::Integer(v) => Some(v as i64),
            ZeroElement::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ZeroElement::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ZeroMap> {
        match self {
            ZeroElement::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ZeroArray> {
        match self {
            ZeroElement::Array(a) => Some(a),
            _ => None,
        }
    }
}

macro_rules! impl_from_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for ZeroElement {
            fn from(value: $ty) -> Self {
                ZeroElement::$variant(value)
            }
        })*
    };
}

impl_from_element! {
    bool => Boolean,
    i8 => Byte,
    i16 => Short,
    i32 => Integer,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => String,
    Vec<bool> => BooleanArray,
    Vec<u8> => ByteArray,
    Vec<i16> => ShortArray,
    Vec<i32> => IntegerArray,
    Vec<i64> => LongArray,
    Vec<f32> => FloatArray,
    Vec<f64> => DoubleArray,
    Vec<String> => StringArray,
    ZeroArray => Array,
    ZeroMap => Map,
}

impl From<&str> for ZeroElement {
    fn from(value: &str) -> Self {
        ZeroElement::String(value.to_owned())
    }
}

/// String-keyed collection. Keys are kept sorted so encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ZeroMap {
    entries: BTreeMap<String, ZeroElement>,
}

impl ZeroMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ZeroElement>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ZeroElement> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ZeroElement> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ZeroElement)> {
        self.entries.iter()
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ZeroElement::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ZeroElement::as_str)
    }

    pub fn to_binary(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        encode_map(&mut out, self, 0)?;
        Ok(out)
    }

    pub fn from_binary(binary: &[u8]) -> Result<Self> {
        check_root(binary, ZeroType::ZeroMap)?;
        let mut buf = binary;
        buf.advance(1);
        decode_map_body(&mut buf, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ZeroArray {
    elements: Vec<ZeroElement>,
}

impl ZeroArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: impl Into<ZeroElement>) -> &mut Self {
        self.elements.push(value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&ZeroElement> {
        self.elements.get(index)
    }

    pub fn pop(&mut self) -> Option<ZeroElement> {
        self.elements.pop()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ZeroElement> {
        self.elements.iter()
    }

    pub fn to_binary(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        encode_array(&mut out, self, 0)?;
        Ok(out)
    }

    pub fn from_binary(binary: &[u8]) -> Result<Self> {
        check_root(binary, ZeroType::ZeroArray)?;
        let mut buf = binary;
        buf.advance(1);
        decode_array_body(&mut buf, 0)
    }
}

impl FromIterator<ZeroElement> for ZeroArray {
    fn from_iter<T: IntoIterator<Item = ZeroElement>>(iter: T) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

fn check_root(binary: &[u8], expected: ZeroType) -> Result<()> {
    if binary.len() < 3 {
        return Err(NetworkError::DeserializeError(format!(
            "{} ({} bytes)",
            constants::ERR_ZERO_TOO_SHORT,
            binary.len()
        )));
    }
    if binary[0] != expected as u8 {
        return Err(NetworkError::DeserializeError(format!(
            "expected {expected:?} tag, found {}",
            binary[0]
        )));
    }
    Ok(())
}

// ---- encoding ----

fn short_len(len: usize) -> Result<i16> {
    i16::try_from(len)
        .map_err(|_| NetworkError::SerializeError(format!("length {len} exceeds i16 range")))
}

fn put_str(out: &mut Vec<u8>, value: &str) -> Result<()> {
    out.put_i16(short_len(value.len())?);
    out.put_slice(value.as_bytes());
    Ok(())
}

fn check_depth(depth: usize, to_error: fn(String) -> NetworkError) -> Result<()> {
    if depth > MAX_NESTING_DEPTH {
        return Err(to_error(format!(
            "{} ({MAX_NESTING_DEPTH})",
            constants::ERR_ZERO_TOO_DEEP
        )));
    }
    Ok(())
}

fn encode_map(out: &mut Vec<u8>, map: &ZeroMap, depth: usize) -> Result<()> {
    check_depth(depth, NetworkError::SerializeError)?;
    out.put_u8(ZeroType::ZeroMap as u8);
    out.put_i16(short_len(map.len())?);
    for (key, value) in map.iter() {
        put_str(out, key)?;
        encode_element(out, value, depth + 1)?;
    }
    Ok(())
}

fn encode_array(out: &mut Vec<u8>, array: &ZeroArray, depth: usize) -> Result<()> {
    check_depth(depth, NetworkError::SerializeError)?;
    out.put_u8(ZeroType::ZeroArray as u8);
    out.put_i16(short_len(array.len())?);
    for element in array.iter() {
        encode_element(out, element, depth + 1)?;
    }
    Ok(())
}

fn encode_element(out: &mut Vec<u8>, element: &ZeroElement, depth: usize) -> Result<()> {
    match element {
        ZeroElement::Array(a) => return encode_array(out, a, depth),
        ZeroElement::Map(m) => return encode_map(out, m, depth),
        _ => out.put_u8(element.zero_type() as u8),
    }

    match element {
        ZeroElement::Null => {}
        ZeroElement::Boolean(v) => out.put_u8(u8::from(*v)),
        ZeroElement::Byte(v) => out.put_i8(*v),
        ZeroElement::Short(v) => out.put_i16(*v),
        ZeroElement::Integer(v) => out.put_i32(*v),
        ZeroElement::Long(v) => out.put_i64(*v),
        ZeroElement::Float(v) => out.put_f32(*v),
        ZeroElement::Double(v) => out.put_f64(*v),
        ZeroElement::String(v) => put_str(out, v)?,
        ZeroElement::BooleanArray(v) => {
            out.put_i16(short_len(v.len())?);
            v.iter().for_each(|b| out.put_u8(u8::from(*b)));
        }
        ZeroElement::ByteArray(v) => {
            let len = i32::try_from(v.len())
                .map_err(|_| NetworkError::SerializeError("byte array too large".into()))?;
            out.put_i32(len);
            out.put_slice(v);
        }
        ZeroElement::ShortArray(v) => {
            out.put_i16(short_len(v.len())?);
            v.iter().for_each(|x| out.put_i16(*x));
        }
        ZeroElement::IntegerArray(v) => {
            out.put_i16(short_len(v.len())?);
            v.iter().for_each(|x| out.put_i32(*x));
        }
        ZeroElement::LongArray(v) => {
            out.put_i16(short_len(v.len())?);
            v.iter().for_each(|x| out.put_i64(*x));
        }
        ZeroElement::FloatArray(v) => {
            out.put_i16(short_len(v.len())?);
            v.iter().for_each(|x| out.put_f32(*x));
        }
        ZeroElement::DoubleArray(v) => {
            out.put_i16(short_len(v.len())?);
            v.iter().for_each(|x| out.put_f64(*x));
        }
        ZeroElement::StringArray(v) => {
            out.put_i16(short_len(v.len())?);
            for s in v {
                put_str(out, s)?;
            }
        }
        ZeroElement::Array(_) | ZeroElement::Map(_) => {}
    }
    Ok(())
}

// ---- decoding ----

fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(NetworkError::DeserializeError(
            constants::ERR_ZERO_UNEXPECTED_EOF.to_string(),
        ));
    }
    Ok(())
}

fn read_count(buf: &mut &[u8]) -> Result<usize> {
    ensure(buf, 2)?;
    let size = buf.get_i16();
    usize::try_from(size).map_err(|_| {
        NetworkError::DeserializeError(format!("{}: {size}", constants::ERR_ZERO_NEGATIVE_SIZE))
    })
}

fn read_string(buf: &mut &[u8]) -> Result<String> {
    let len = read_count(buf)?;
    ensure(buf, len)?;
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|e| NetworkError::DeserializeError(format!("invalid utf-8 string: {e}")))?
        .to_owned();
    buf.advance(len);
    Ok(value)
}

fn read_bool(buf: &mut &[u8]) -> Result<bool> {
    ensure(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(NetworkError::DeserializeError(format!(
            "expected boolean 0 or 1, found {other}"
        ))),
    }
}

fn read_vec<T>(
    buf: &mut &[u8],
    width: usize,
    read: impl Fn(&mut &[u8]) -> T,
) -> Result<Vec<T>> {
    let count = read_count(buf)?;
    ensure(buf, count * width)?;
    Ok((0..count).map(|_| read(buf)).collect())
}

fn decode_map_body(buf: &mut &[u8], depth: usize) -> Result<ZeroMap> {
    check_depth(depth, NetworkError::DeserializeError)?;
    let size = read_count(buf)?;
    let mut map = ZeroMap::new();
    for _ in 0..size {
        let key = read_string(buf)?;
        let value = decode_element(buf, depth + 1)?;
        map.entries.insert(key, value);
    }
    Ok(map)
}

fn decode_array_body(buf: &mut &[u8], depth: usize) -> Result<ZeroArray> {
    check_depth(depth, NetworkError::DeserializeError)?;
    let size = read_count(buf)?;
    let mut elements = Vec::with_capacity(size.min(1024));
    for _ in 0..size {
        elements.push(decode_element(buf, depth + 1)?);
    }
    Ok(ZeroArray { elements })
}

fn decode_element(buf: &mut &[u8], depth: usize) -> Result<ZeroElement> {
    ensure(buf, 1)?;
    let tag = buf.get_u8();
    let zero_type = ZeroType::from_byte(tag)
        .ok_or_else(|| NetworkError::DeserializeError(format!("unknown zero type {tag}")))?;

    Ok(match zero_type {
        ZeroType::Null => ZeroElement::Null,
        ZeroType::Boolean => ZeroElement::Boolean(read_bool(buf)?),
        ZeroType::Byte => {
            ensure(buf, 1)?;
            ZeroElement::Byte(buf.get_i8())
        }
        ZeroType::Short => {
            ensure(buf, 2)?;
            ZeroElement::Short(buf.get_i16())
        }
        ZeroType::Integer => {
            ensure(buf, 4)?;
            ZeroElement::Integer(buf.get_i32())
        }
        ZeroType::Long => {
            ensure(buf, 8)?;
            ZeroElement::Long(buf.get_i64())
        }
        ZeroType::Float => {
            ensure(buf, 4)?;
            ZeroElement::Float(buf.get_f32())
        }
        ZeroType::Double => {
            ensure(buf, 8)?;
            ZeroElement::Double(buf.get_f64())
        }
        ZeroType::String => ZeroElement::String(read_string(buf)?),
        ZeroType::BooleanArray => {
            let count = read_count(buf)?;
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                values.push(read_bool(buf)?);
            }
            ZeroElement::BooleanArray(values)
        }
        ZeroType::ByteArray => {
            ensure(buf, 4)?;
            let len = buf.get_i32();
            let len = usize::try_from(len).map_err(|_| {
                NetworkError::DeserializeError(format!(
                    "{}: {len}",
                    constants::ERR_ZERO_NEGATIVE_SIZE
                ))
            })?;
            ensure(buf, len)?;
            let bytes = buf[..len].to_vec();
            buf.advance(len);
            ZeroElement::ByteArray(bytes)
        }
        ZeroType::ShortArray => ZeroElement::ShortArray(read_vec(buf, 2, |b| b.get_i16())?),
        ZeroType::IntegerArray => ZeroElement::IntegerArray(read_vec(buf, 4, |b| b.get_i32())?),
        ZeroType::LongArray => ZeroElement::LongArray(read_vec(buf, 8, |b| b.get_i64())?),
        ZeroType::FloatArray => ZeroElement::FloatArray(read_vec(buf, 4, |b| b.get_f32())?),
        ZeroType::DoubleArray => ZeroElement::DoubleArray(read_vec(buf, 8, |b| b.get_f64())?),
        ZeroType::StringArray => {
            let count = read_count(buf)?;
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                values.push(read_string(buf)?);
            }
            ZeroElement::StringArray(values)
        }
        ZeroType::ZeroArray => ZeroElement::Array(decode_array_body(buf, depth)?),
        ZeroType::ZeroMap => ZeroElement::Map(decode_map_body(buf, depth)?),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_map() -> ZeroMap {
        let mut nested = ZeroArray::new();
        nested.push(1i32).push("two").push(ZeroElement::Null);

        let mut map = ZeroMap::new();
        map.insert("b", true)
            .insert("i8", -3i8)
            .insert("s", 300i16)
            .insert("i", 70_000i32)
            .insert("l", i64::MAX)
            .insert("f", 1.5f32)
            .insert("d", -2.25f64)
            .insert("name", "knight")
            .insert("flags", vec![true, false])
            .insert("raw", vec![0u8, 255])
            .insert("shorts", vec![1i16, -1])
            .insert("ints", vec![1i32, 2, 3])
            .insert("longs", vec![5i64])
            .insert("floats", vec![0.5f32])
            .insert("doubles", vec![0.25f64])
            .insert("names", vec!["a".to_string(), "bc".to_string()])
            .insert("nested", nested);
        map
    }

    #[test]
    fn map_with_every_type_roundtrips() {
        let map = sample_map();
        let binary = map.to_binary().unwrap();
        assert_eq!(binary[0], ZeroType::ZeroMap as u8);
        assert_eq!(ZeroMap::from_binary(&binary).unwrap(), map);
    }

    #[test]
    fn array_layout_is_tag_then_size() {
        let mut array = ZeroArray::new();
        array.push(7i32);
        let binary = array.to_binary().unwrap();
        assert_eq!(binary, vec![17, 0, 1, 4, 0, 0, 0, 7]);
    }

    #[test]
    fn string_entry_layout() {
        let mut map = ZeroMap::new();
        map.insert("k", "v");
        let binary = map.to_binary().unwrap();
        assert_eq!(binary, vec![18, 0, 1, 0, 1, b'k', 8, 0, 1, b'v']);
    }

    #[test]
    fn too_short_input_is_rejected() {
        assert!(ZeroMap::from_binary(&[18, 0]).is_err());
        assert!(ZeroArray::from_binary(&[]).is_err());
    }

    #[test]
    fn negative_size_is_rejected() {
        assert!(ZeroMap::from_binary(&[18, 0xFF, 0xFF]).is_err());
        assert!(ZeroArray::from_binary(&[17, 0x80, 0x00]).is_err());
    }

    #[test]
    fn invalid_boolean_is_rejected() {
        let binary = [17, 0, 1, 1, 2];
        assert!(ZeroArray::from_binary(&binary).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let binary = [17, 0, 1, 99];
        assert!(ZeroArray::from_binary(&binary).is_err());
    }

    #[test]
    fn truncated_element_is_rejected() {
        let binary = [17, 0, 1, 4, 0, 0];
        assert!(ZeroArray::from_binary(&binary).is_err());
    }

    #[test]
    fn wrong_root_tag_is_rejected() {
        let array = ZeroArray::new().to_binary().unwrap();
        assert!(ZeroMap::from_binary(&array).is_err());
    }

    fn nested_arrays(levels: usize) -> ZeroArray {
        let mut array = ZeroArray::new();
        array.push(1i32);
        for _ in 0..levels {
            let mut outer = ZeroArray::new();
            outer.push(ZeroElement::Array(array));
            array = outer;
        }
        array
    }

    #[test]
    fn moderate_nesting_roundtrips() {
        let array = nested_arrays(32);
        let binary = array.to_binary().unwrap();
        assert_eq!(ZeroArray::from_binary(&binary).unwrap(), array);
    }

    #[test]
    fn hostile_nesting_is_rejected_without_overflow() {
        let binary = [17u8, 0, 1].repeat(300_000);
        let err = ZeroArray::from_binary(&binary).unwrap_err();
        assert!(err.to_string().contains(constants::ERR_ZERO_TOO_DEEP));

        let mut map_chain = Vec::new();
        for _ in 0..10_000 {
            map_chain.extend_from_slice(&[18, 0, 1, 0, 1, b'k']);
        }
        assert!(ZeroMap::from_binary(&map_chain).is_err());
    }

    #[test]
    fn nesting_limit_applies_to_encode() {
        assert!(nested_arrays(MAX_NESTING_DEPTH).to_binary().is_ok());
        assert!(nested_arrays(MAX_NESTING_DEPTH + 1).to_binary().is_err());
    }
}
