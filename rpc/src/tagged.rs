// Cash Hub: wire protocol primitives.
//
// SPDX-License-Identifier: MIT

//! The tagged-record micro-format shared by the wire protocol and
//! the UTXO engine's on-disk info/data files: a field is
//! `tag (varint) | type (3 bits inlined) | value`, terminated by a reserved
//! `Separator` tag (0).
//!
//! Both storage and wire framing read and write the same primitive: the two
//! subsystems share one transaction-iterator-style codec, down to this
//! lower-level record format underneath it.

use std::fmt;

use amplify::{Display, Error};

/// The 3-bit inlined value type of a tagged field.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum ValueType {
    /// A non-negative integer, LEB128-varint encoded.
    PositiveNumber = 0,
    /// A negative integer; the varint carries the absolute value.
    NegativeNumber = 1,
    /// A length-prefixed byte array.
    ByteArray = 2,
    /// A length-prefixed UTF-8 string.
    String = 3,
    /// A single boolean, stored in the one byte following the tag.
    Bool = 4,
    /// A fixed 32-byte value (block/tx hash).
    U256 = 5,
}

impl ValueType {
    fn from_bits(bits: u8) -> Result<Self, TaggedError> {
        Ok(match bits {
            0 => ValueType::PositiveNumber,
            1 => ValueType::NegativeNumber,
            2 => ValueType::ByteArray,
            3 => ValueType::String,
            4 => ValueType::Bool,
            5 => ValueType::U256,
            other => return Err(TaggedError::UnknownType(other)),
        })
    }
}

/// Tag `0` is reserved in every tagged stream: it carries no type/value and
/// marks the end of the record (`Separator` for on-disk records, `HeaderEnd`
/// in the wire header).
pub const SEPARATOR_TAG: u32 = 0;

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Field<'a> {
    Separator,
    Positive(u32, u64),
    Negative(u32, u64),
    Bytes(u32, &'a [u8]),
    Str(u32, &'a str),
    Bool(u32, bool),
    U256(u32, [u8; 32]),
}

impl Field<'_> {
    pub fn tag(&self) -> u32 {
        match self {
            Field::Separator => SEPARATOR_TAG,
            Field::Positive(t, _)
            | Field::Negative(t, _)
            | Field::Bytes(t, _)
            | Field::Str(t, _)
            | Field::Bool(t, _)
            | Field::U256(t, _) => *t,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum TaggedError {
    /// tagged stream ended before a complete field could be read.
    UnexpectedEnd,
    /// tagged field carried unknown value type {0}.
    UnknownType(u8),
    /// byte array or string field length {0} exceeds the sanity limit.
    LengthTooLarge(u64),
    /// string field was not valid UTF-8.
    InvalidUtf8,
    /// varint did not terminate within 10 bytes.
    VarintTooLong,
}

impl fmt::Display for Field<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "tag={}", self.tag()) }
}

/// Maximum length accepted for a `ByteArray`/`String` field, guarding against
/// a corrupt or hostile length prefix forcing a huge allocation.
const MAX_FIELD_LEN: u64 = 32 * 1024 * 1024;

fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, TaggedError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    for _ in 0..10 {
        let byte = *data.get(*pos).ok_or(TaggedError::UnexpectedEnd)?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
    Err(TaggedError::VarintTooLong)
}

/// Appends tagged fields to an in-memory buffer. Used both to build a wire
/// message body and to serialize UTXO leaves/buckets/info headers.
#[derive(Default)]
pub struct TagWriter {
    buf: Vec<u8>,
}

impl TagWriter {
    pub fn new() -> Self { Self { buf: Vec::new() } }

    pub fn with_capacity(cap: usize) -> Self { Self { buf: Vec::with_capacity(cap) } }

    fn push_tag(&mut self, tag: u32, ty: ValueType) {
        write_varint(&mut self.buf, ((tag as u64) << 3) | ty as u64);
    }

    pub fn positive(&mut self, tag: u32, value: u64) -> &mut Self {
        self.push_tag(tag, ValueType::PositiveNumber);
        write_varint(&mut self.buf, value);
        self
    }

    pub fn negative(&mut self, tag: u32, magnitude: u64) -> &mut Self {
        self.push_tag(tag, ValueType::NegativeNumber);
        write_varint(&mut self.buf, magnitude);
        self
    }

    pub fn bytes(&mut self, tag: u32, value: &[u8]) -> &mut Self {
        self.push_tag(tag, ValueType::ByteArray);
        write_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn string(&mut self, tag: u32, value: &str) -> &mut Self {
        self.push_tag(tag, ValueType::String);
        write_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn boolean(&mut self, tag: u32, value: bool) -> &mut Self {
        self.push_tag(tag, ValueType::Bool);
        self.buf.push(value as u8);
        self
    }

    pub fn u256(&mut self, tag: u32, value: [u8; 32]) -> &mut Self {
        self.push_tag(tag, ValueType::U256);
        self.buf.extend_from_slice(&value);
        self
    }

    pub fn separator(&mut self) -> &mut Self {
        write_varint(&mut self.buf, SEPARATOR_TAG as u64);
        self
    }

    pub fn len(&self) -> usize { self.buf.len() }

    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    pub fn into_bytes(self) -> Vec<u8> { self.buf }

    pub fn as_bytes(&self) -> &[u8] { &self.buf }
}

/// Reads tagged fields back out of a byte slice, one at a time, stopping at
/// `Separator`.
pub struct TagReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TagReader<'a> {
    pub fn new(data: &'a [u8]) -> Self { Self { data, pos: 0 } }

    pub fn position(&self) -> usize { self.pos }

    pub fn remaining(&self) -> &'a [u8] { &self.data[self.pos..] }

    /// Reads the next field. Returns `Ok(Field::Separator)` at a record
    /// terminator and leaves the cursor positioned just past it.
    pub fn next(&mut self) -> Result<Field<'a>, TaggedError> {
        let tag_and_type = read_varint(self.data, &mut self.pos)?;
        let tag = (tag_and_type >> 3) as u32;
        if tag == SEPARATOR_TAG {
            return Ok(Field::Separator);
        }
        let ty = ValueType::from_bits((tag_and_type & 0x7) as u8)?;
        Ok(match ty {
            ValueType::PositiveNumber => Field::Positive(tag, read_varint(self.data, &mut self.pos)?),
            ValueType::NegativeNumber => Field::Negative(tag, read_varint(self.data, &mut self.pos)?),
            ValueType::ByteArray => Field::Bytes(tag, self.read_bytes()?),
            ValueType::String => {
                let bytes = self.read_bytes()?;
                Field::Str(tag, std::str::from_utf8(bytes).map_err(|_| TaggedError::InvalidUtf8)?)
            }
            ValueType::Bool => {
                let byte = *self.data.get(self.pos).ok_or(TaggedError::UnexpectedEnd)?;
                self.pos += 1;
                Field::Bool(tag, byte != 0)
            }
            ValueType::U256 => {
                let slice = self
                    .data
                    .get(self.pos..self.pos + 32)
                    .ok_or(TaggedError::UnexpectedEnd)?;
                self.pos += 32;
                let mut out = [0u8; 32];
                out.copy_from_slice(slice);
                Field::U256(tag, out)
            }
        })
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], TaggedError> {
        let len = read_varint(self.data, &mut self.pos)?;
        if len > MAX_FIELD_LEN {
            return Err(TaggedError::LengthTooLarge(len));
        }
        let len = len as usize;
        let slice = self.data.get(self.pos..self.pos + len).ok_or(TaggedError::UnexpectedEnd)?;
        self.pos += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_value_type() {
        let mut w = TagWriter::new();
        w.positive(1, 42)
            .negative(2, 7)
            .bytes(3, b"hello")
            .string(4, "world")
            .boolean(5, true)
            .u256(6, [9u8; 32])
            .separator();
        let bytes = w.into_bytes();

        let mut r = TagReader::new(&bytes);
        assert_eq!(r.next().unwrap(), Field::Positive(1, 42));
        assert_eq!(r.next().unwrap(), Field::Negative(2, 7));
        assert_eq!(r.next().unwrap(), Field::Bytes(3, b"hello"));
        assert_eq!(r.next().unwrap(), Field::Str(4, "world"));
        assert_eq!(r.next().unwrap(), Field::Bool(5, true));
        assert_eq!(r.next().unwrap(), Field::U256(6, [9u8; 32]));
        assert_eq!(r.next().unwrap(), Field::Separator);
    }

    #[test]
    fn truncated_stream_errors_instead_of_panicking() {
        let mut w = TagWriter::new();
        w.bytes(3, b"hello");
        let mut bytes = w.into_bytes();
        bytes.truncate(bytes.len() - 2);
        let mut r = TagReader::new(&bytes);
        assert!(matches!(r.next(), Err(TaggedError::UnexpectedEnd)));
    }
}
