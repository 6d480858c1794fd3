//! Variant value model
//!
//! All argument dictionaries, result records, and the surfacing cache are
//! expressed as `Variant` values. On the wire a variant is encoded as a
//! one-byte tag followed by the payload; strings, arrays, and dictionaries
//! are length-prefixed. The same model derives serde traits so a variant
//! tree can also be written as a JSON document.

use crate::error::{Result, WireError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A string-keyed dictionary of variants.
///
/// `BTreeMap` keeps the key order deterministic, so encoding the same
/// dictionary twice yields identical bytes.
pub type VariantMap = BTreeMap<String, Variant>;

/// An ordered list of variants
pub type VariantArray = Vec<Variant>;

/// Maximum nesting depth accepted by the decoder
pub const MAX_NESTING_DEPTH: usize = 32;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_ARRAY: u8 = 5;
const TAG_DICT: u8 = 6;

/// A dynamically typed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Array(VariantArray),
    Dict(VariantMap),
}

impl Variant {
    /// Encode this variant into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Variant::Null => buf.put_u8(TAG_NULL),
            Variant::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*b));
            }
            Variant::Int(i) => {
                buf.put_u8(TAG_INT);
                buf.put_i64_le(*i);
            }
            Variant::Double(d) => {
                buf.put_u8(TAG_DOUBLE);
                buf.put_f64_le(*d);
            }
            Variant::Str(s) => {
                buf.put_u8(TAG_STRING);
                encode_string(s, buf);
            }
            Variant::Array(items) => {
                buf.put_u8(TAG_ARRAY);
                buf.put_u32_le(items.len() as u32);
                for item in items {
                    item.encode(buf);
                }
            }
            Variant::Dict(map) => {
                buf.put_u8(TAG_DICT);
                buf.put_u32_le(map.len() as u32);
                for (key, value) in map {
                    encode_string(key, buf);
                    value.encode(buf);
                }
            }
        }
    }

    /// Decode a variant from `buf`, consuming its bytes
    pub fn decode(buf: &mut impl Buf) -> Result<Variant> {
        Self::decode_at_depth(buf, 0)
    }

    fn decode_at_depth(buf: &mut impl Buf, depth: usize) -> Result<Variant> {
        if depth > MAX_NESTING_DEPTH {
            return Err(WireError::NestingTooDeep(MAX_NESTING_DEPTH));
        }
        if buf.remaining() < 1 {
            return Err(WireError::UnexpectedEof);
        }
        match buf.get_u8() {
            TAG_NULL => Ok(Variant::Null),
            TAG_BOOL => {
                if buf.remaining() < 1 {
                    return Err(WireError::UnexpectedEof);
                }
                Ok(Variant::Bool(buf.get_u8() != 0))
            }
            TAG_INT => {
                if buf.remaining() < 8 {
                    return Err(WireError::UnexpectedEof);
                }
                Ok(Variant::Int(buf.get_i64_le()))
            }
            TAG_DOUBLE => {
                if buf.remaining() < 8 {
                    return Err(WireError::UnexpectedEof);
                }
                Ok(Variant::Double(buf.get_f64_le()))
            }
            TAG_STRING => Ok(Variant::Str(decode_string(buf)?)),
            TAG_ARRAY => {
                let count = decode_count(buf)?;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(Self::decode_at_depth(buf, depth + 1)?);
                }
                Ok(Variant::Array(items))
            }
            TAG_DICT => {
                let count = decode_count(buf)?;
                let mut map = VariantMap::new();
                for _ in 0..count {
                    let key = decode_string(buf)?;
                    let value = Self::decode_at_depth(buf, depth + 1)?;
                    map.insert(key, value);
                }
                Ok(Variant::Dict(map))
            }
            tag => Err(WireError::UnknownTag(tag)),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Variant::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Double(d) => Some(*d),
            Variant::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&VariantArray> {
        match self {
            Variant::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&VariantMap> {
        match self {
            Variant::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<VariantMap> {
        match self {
            Variant::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::Bool(value)
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Variant::Int(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::Double(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::Str(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Variant::Str(value)
    }
}

impl From<VariantArray> for Variant {
    fn from(value: VariantArray) -> Self {
        Variant::Array(value)
    }
}

impl From<VariantMap> for Variant {
    fn from(value: VariantMap) -> Self {
        Variant::Dict(value)
    }
}

pub(crate) fn encode_string(s: &str, buf: &mut BytesMut) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn decode_string(buf: &mut impl Buf) -> Result<String> {
    let len = decode_count(buf)?;
    if buf.remaining() < len {
        return Err(WireError::UnexpectedEof);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
}

pub(crate) fn decode_count(buf: &mut impl Buf) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(WireError::UnexpectedEof);
    }
    Ok(buf.get_u32_le() as usize)
}
