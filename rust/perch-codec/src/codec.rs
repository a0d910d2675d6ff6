//! The standard message codec.
//!
//! Wire layout (all multi-byte numbers little-endian):
//!
//! ```text
//! value   = type:u8 payload
//! size    = u8 (< 254) | 254 u16 | 255 u32
//! int32   = 3 i32            int64 = 4 i64
//! float64 = 6 <align 8> f64
//! string  = 7 size utf8      bytes = 8 size u8*
//! i32list = 9 size <align 4> i32*     i64list = 10 size <align 8> i64*
//! f64list = 11 size <align 8> f64*    f32list = 14 size <align 4> f32*
//! list    = 12 size value*   map   = 13 size (value value)*
//! proxy   = 128 value(int)
//! custom  = 129.. value      (enum: int ordinal, class: list of fields)
//! ```
//!
//! Alignment is relative to the start of the message buffer, so envelopes that
//! prefix a value with a status byte must encode into the same buffer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{FormatError, Value, ValueMap};

/// Standard type discriminants.
pub mod type_tag {
    pub const NULL: u8 = 0;
    pub const TRUE: u8 = 1;
    pub const FALSE: u8 = 2;
    pub const INT32: u8 = 3;
    pub const INT64: u8 = 4;
    pub const FLOAT64: u8 = 6;
    pub const STRING: u8 = 7;
    pub const UINT8_LIST: u8 = 8;
    pub const INT32_LIST: u8 = 9;
    pub const INT64_LIST: u8 = 10;
    pub const FLOAT64_LIST: u8 = 11;
    pub const LIST: u8 = 12;
    pub const MAP: u8 = 13;
    pub const FLOAT32_LIST: u8 = 14;
    /// Reference to a proxy object held by an instance manager.
    pub const PROXY_INSTANCE: u8 = 128;
    /// First discriminant handed out to registered custom types.
    pub const FIRST_CUSTOM: u8 = 129;
}

/// Maximum nesting depth accepted by the decoder.
pub const MAX_DEPTH: usize = 128;

/// What a registered custom type looks like on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomKind {
    /// A class encoded as a list of exactly `field_count` values.
    Class { field_count: usize },
    /// An enum encoded as an ordinal in `0..variant_count`.
    Enum { variant_count: usize },
}

/// A custom class or enum known to a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomType {
    pub type_id: u8,
    pub name: String,
    pub kind: CustomKind,
}

/// Builds the schema of a [`StandardCodec`].
///
/// Discriminants are assigned in registration order starting at
/// [`type_tag::FIRST_CUSTOM`]. Both peers must register the same types in the
/// same order.
///
/// ```ignore
/// let codec = CodecBuilder::new()
///     .enumeration("AnEnum", 5)
///     .class("AllNullableTypes", 3)
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct CodecBuilder {
    types: Vec<(String, CustomKind)>,
}

impl CodecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class with a fixed number of fields.
    pub fn class(mut self, name: impl Into<String>, field_count: usize) -> Self {
        self.types
            .push((name.into(), CustomKind::Class { field_count }));
        self
    }

    /// Register an enum with `variant_count` variants.
    pub fn enumeration(mut self, name: impl Into<String>, variant_count: usize) -> Self {
        self.types
            .push((name.into(), CustomKind::Enum { variant_count }));
        self
    }

    pub fn build(self) -> Result<StandardCodec, FormatError> {
        let capacity = usize::from(u8::MAX - type_tag::FIRST_CUSTOM) + 1;
        if self.types.len() > capacity {
            return Err(FormatError::TooManyTypes);
        }

        let mut types: Vec<CustomType> = Vec::with_capacity(self.types.len());
        for (offset, (name, kind)) in self.types.into_iter().enumerate() {
            if types.iter().any(|t| t.name == name) {
                return Err(FormatError::DuplicateType(name));
            }
            // offset < capacity, checked above
            let type_id = type_tag::FIRST_CUSTOM + offset as u8;
            debug!(type_id, name = %name, ?kind, "registered custom type");
            types.push(CustomType {
                type_id,
                name,
                kind,
            });
        }

        Ok(StandardCodec { types })
    }
}

/// Encoder/decoder for [`Value`]s.
///
/// A codec without registered types handles every standard shape plus proxy
/// instance references; custom classes and enums must be registered through a
/// [`CodecBuilder`].
#[derive(Debug, Clone, Default)]
pub struct StandardCodec {
    types: Vec<CustomType>,
}

impl StandardCodec {
    /// A codec with no custom types.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> CodecBuilder {
        CodecBuilder::new()
    }

    /// Discriminant assigned to the custom type `name`.
    pub fn type_id(&self, name: &str) -> Option<u8> {
        self.types.iter().find(|t| t.name == name).map(|t| t.type_id)
    }

    pub fn custom_type(&self, type_id: u8) -> Option<&CustomType> {
        let index = type_id.checked_sub(type_tag::FIRST_CUSTOM)?;
        self.types.get(usize::from(index))
    }

    pub fn custom_types(&self) -> &[CustomType] {
        &self.types
    }

    /// Build an enum value by type name, validating the ordinal.
    pub fn enum_value(&self, name: &str, ordinal: i64) -> Result<Value, FormatError> {
        let ty = self.named(name)?;
        let value = Value::Enum {
            type_id: ty.type_id,
            ordinal,
        };
        self.check_custom(&value)?;
        Ok(value)
    }

    /// Build a class value by type name, validating the field count.
    pub fn class_value(&self, name: &str, fields: Vec<Value>) -> Result<Value, FormatError> {
        let ty = self.named(name)?;
        let value = Value::Custom {
            type_id: ty.type_id,
            fields,
        };
        self.check_custom(&value)?;
        Ok(value)
    }

    fn named(&self, name: &str) -> Result<&CustomType, FormatError> {
        self.types
            .iter()
            .find(|t| t.name == name)
            .ok_or(FormatError::InvalidEnvelope("unregistered custom type name"))
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode a single value into a fresh buffer.
    pub fn encode(&self, value: &Value) -> Result<Bytes, FormatError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf, value)?;
        Ok(buf.freeze())
    }

    /// Append `value` to `buf`. Alignment padding is computed against the
    /// start of `buf`.
    ///
    /// Values nested deeper than [`MAX_DEPTH`] are refused, the same as the
    /// decoder refuses them.
    pub fn encode_into(&self, buf: &mut BytesMut, value: &Value) -> Result<(), FormatError> {
        self.encode_at(buf, value, 0)
    }

    fn encode_at(
        &self,
        buf: &mut BytesMut,
        value: &Value,
        depth: usize,
    ) -> Result<(), FormatError> {
        if depth > MAX_DEPTH {
            return Err(FormatError::TooDeep);
        }

        match value {
            Value::Null => buf.put_u8(type_tag::NULL),
            Value::Bool(true) => buf.put_u8(type_tag::TRUE),
            Value::Bool(false) => buf.put_u8(type_tag::FALSE),
            Value::Int(i) => match i32::try_from(*i) {
                Ok(small) => {
                    buf.put_u8(type_tag::INT32);
                    buf.put_i32_le(small);
                }
                Err(_) => {
                    buf.put_u8(type_tag::INT64);
                    buf.put_i64_le(*i);
                }
            },
            Value::Float(f) => {
                buf.put_u8(type_tag::FLOAT64);
                align_to(buf, 8);
                buf.put_f64_le(*f);
            }
            Value::String(s) => {
                buf.put_u8(type_tag::STRING);
                write_size(buf, s.len())?;
                buf.put_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.put_u8(type_tag::UINT8_LIST);
                write_size(buf, b.len())?;
                buf.put_slice(b);
            }
            Value::Int32List(l) => {
                buf.put_u8(type_tag::INT32_LIST);
                write_size(buf, l.len())?;
                align_to(buf, 4);
                l.iter().for_each(|x| buf.put_i32_le(*x));
            }
            Value::Int64List(l) => {
                buf.put_u8(type_tag::INT64_LIST);
                write_size(buf, l.len())?;
                align_to(buf, 8);
                l.iter().for_each(|x| buf.put_i64_le(*x));
            }
            Value::Float32List(l) => {
                buf.put_u8(type_tag::FLOAT32_LIST);
                write_size(buf, l.len())?;
                align_to(buf, 4);
                l.iter().for_each(|x| buf.put_f32_le(*x));
            }
            Value::Float64List(l) => {
                buf.put_u8(type_tag::FLOAT64_LIST);
                write_size(buf, l.len())?;
                align_to(buf, 8);
                l.iter().for_each(|x| buf.put_f64_le(*x));
            }
            Value::List(items) => self.encode_list_at(buf, items, depth)?,
            Value::Map(map) => {
                buf.put_u8(type_tag::MAP);
                write_size(buf, map.len())?;
                for (k, v) in map.iter() {
                    self.encode_at(buf, k, depth + 1)?;
                    self.encode_at(buf, v, depth + 1)?;
                }
            }
            Value::Enum { type_id, ordinal } => {
                self.check_custom(value)?;
                buf.put_u8(*type_id);
                self.encode_at(buf, &Value::Int(*ordinal), depth + 1)?;
            }
            Value::Custom { type_id, fields } => {
                self.check_custom(value)?;
                buf.put_u8(*type_id);
                if depth + 1 > MAX_DEPTH {
                    return Err(FormatError::TooDeep);
                }
                self.encode_list_at(buf, fields, depth + 1)?;
            }
            Value::Instance(id) => {
                if *id < 0 {
                    return Err(FormatError::InvalidIdentifier(*id));
                }
                buf.put_u8(type_tag::PROXY_INSTANCE);
                self.encode_at(buf, &Value::Int(*id), depth + 1)?;
            }
        }
        Ok(())
    }

    /// Append a list value built from a slice, without cloning it into a
    /// [`Value::List`] first.
    pub fn encode_list_into(&self, buf: &mut BytesMut, items: &[Value]) -> Result<(), FormatError> {
        self.encode_list_at(buf, items, 0)
    }

    fn encode_list_at(
        &self,
        buf: &mut BytesMut,
        items: &[Value],
        depth: usize,
    ) -> Result<(), FormatError> {
        buf.put_u8(type_tag::LIST);
        write_size(buf, items.len())?;
        for item in items {
            self.encode_at(buf, item, depth + 1)?;
        }
        Ok(())
    }

    fn check_custom(&self, value: &Value) -> Result<(), FormatError> {
        match value {
            Value::Enum { type_id, ordinal } => match self.custom_type(*type_id) {
                Some(CustomType {
                    kind: CustomKind::Enum { variant_count },
                    ..
                }) => {
                    let in_range = usize::try_from(*ordinal).is_ok_and(|o| o < *variant_count);
                    if in_range {
                        Ok(())
                    } else {
                        Err(FormatError::EnumOutOfRange {
                            type_id: *type_id,
                            ordinal: *ordinal,
                        })
                    }
                }
                Some(_) => Err(FormatError::InvalidCustom {
                    type_id: *type_id,
                    reason: "registered as a class, used as an enum",
                }),
                None => Err(FormatError::UnknownType(*type_id)),
            },
            Value::Custom { type_id, fields } => match self.custom_type(*type_id) {
                Some(CustomType {
                    kind: CustomKind::Class { field_count },
                    ..
                }) => {
                    if fields.len() == *field_count {
                        Ok(())
                    } else {
                        Err(FormatError::FieldCount {
                            type_id: *type_id,
                            expected: *field_count,
                            found: fields.len(),
                        })
                    }
                }
                Some(_) => Err(FormatError::InvalidCustom {
                    type_id: *type_id,
                    reason: "registered as an enum, used as a class",
                }),
                None => Err(FormatError::UnknownType(*type_id)),
            },
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Decode exactly one value from `bytes`. Trailing bytes are an error.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, FormatError> {
        let mut reader = Reader::new(bytes);
        let value = self.read_value(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }

    /// Read the next value from `reader`.
    pub fn read_value(&self, reader: &mut Reader<'_>) -> Result<Value, FormatError> {
        self.read_value_at(reader, 0)
    }

    fn read_value_at(&self, r: &mut Reader<'_>, depth: usize) -> Result<Value, FormatError> {
        if depth > MAX_DEPTH {
            return Err(FormatError::TooDeep);
        }

        let tag = r.u8()?;
        let value = match tag {
            type_tag::NULL => Value::Null,
            type_tag::TRUE => Value::Bool(true),
            type_tag::FALSE => Value::Bool(false),
            type_tag::INT32 => Value::Int(i32::from_le_bytes(r.array()?).into()),
            type_tag::INT64 => Value::Int(i64::from_le_bytes(r.array()?)),
            type_tag::FLOAT64 => {
                r.align(8)?;
                Value::Float(f64::from_le_bytes(r.array()?))
            }
            type_tag::STRING => {
                let len = r.size()?;
                let raw = r.take(len)?;
                let s = std::str::from_utf8(raw).map_err(|_| FormatError::InvalidUtf8)?;
                Value::String(s.to_owned())
            }
            type_tag::UINT8_LIST => {
                let len = r.size()?;
                Value::Bytes(r.take(len)?.to_vec())
            }
            type_tag::INT32_LIST => {
                let raw = r.typed_list(4)?;
                Value::Int32List(
                    raw.chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            }
            type_tag::INT64_LIST => {
                let raw = r.typed_list(8)?;
                Value::Int64List(
                    raw.chunks_exact(8)
                        .map(|c| i64::from_le_bytes(eight(c)))
                        .collect(),
                )
            }
            type_tag::FLOAT32_LIST => {
                let raw = r.typed_list(4)?;
                Value::Float32List(
                    raw.chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            }
            type_tag::FLOAT64_LIST => {
                let raw = r.typed_list(8)?;
                Value::Float64List(
                    raw.chunks_exact(8)
                        .map(|c| f64::from_le_bytes(eight(c)))
                        .collect(),
                )
            }
            type_tag::LIST => {
                let len = r.size()?;
                // every element takes at least one byte
                r.ensure(len)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value_at(r, depth + 1)?);
                }
                Value::List(items)
            }
            type_tag::MAP => {
                let len = r.size()?;
                r.ensure(len.saturating_mul(2))?;
                let mut map = ValueMap::with_capacity(len);
                for _ in 0..len {
                    let k = self.read_value_at(r, depth + 1)?;
                    let v = self.read_value_at(r, depth + 1)?;
                    map.insert(k, v);
                }
                Value::Map(map)
            }
            type_tag::PROXY_INSTANCE => match self.read_value_at(r, depth + 1)? {
                Value::Int(id) if id >= 0 => Value::Instance(id),
                Value::Int(id) => return Err(FormatError::InvalidIdentifier(id)),
                _ => {
                    return Err(FormatError::InvalidCustom {
                        type_id: tag,
                        reason: "instance identifier is not an integer",
                    });
                }
            },
            _ => {
                let Some(ty) = self.custom_type(tag) else {
                    debug!(tag, "rejecting unknown type discriminant");
                    return Err(FormatError::UnknownType(tag));
                };
                let inner = self.read_value_at(r, depth + 1)?;
                let value = match (ty.kind, inner) {
                    (CustomKind::Enum { .. }, Value::Int(ordinal)) => Value::Enum {
                        type_id: tag,
                        ordinal,
                    },
                    (CustomKind::Class { .. }, Value::List(fields)) => Value::Custom {
                        type_id: tag,
                        fields,
                    },
                    (CustomKind::Enum { .. }, _) => {
                        return Err(FormatError::InvalidCustom {
                            type_id: tag,
                            reason: "enum ordinal is not an integer",
                        });
                    }
                    (CustomKind::Class { .. }, _) => {
                        return Err(FormatError::InvalidCustom {
                            type_id: tag,
                            reason: "class fields are not a list",
                        });
                    }
                };
                self.check_custom(&value)?;
                value
            }
        };

        trace!(tag, depth, "decoded value");
        Ok(value)
    }
}

fn eight(c: &[u8]) -> [u8; 8] {
    [c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]
}

fn write_size(buf: &mut BytesMut, size: usize) -> Result<(), FormatError> {
    if size < 254 {
        buf.put_u8(size as u8);
    } else if let Ok(size) = u16::try_from(size) {
        buf.put_u8(254);
        buf.put_u16_le(size);
    } else if let Ok(size) = u32::try_from(size) {
        buf.put_u8(255);
        buf.put_u32_le(size);
    } else {
        return Err(FormatError::InvalidSize);
    }
    Ok(())
}

fn align_to(buf: &mut BytesMut, alignment: usize) {
    let rem = buf.len() % alignment;
    if rem != 0 {
        buf.put_bytes(0, alignment - rem);
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Cursor over an encoded message.
///
/// Positions (and therefore alignment) are relative to the slice the reader
/// was created with.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self) -> Result<(), FormatError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(FormatError::TrailingBytes(n)),
        }
    }

    pub fn u8(&mut self) -> Result<u8, FormatError> {
        let b = *self.buf.get(self.pos).ok_or(FormatError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn ensure(&self, n: usize) -> Result<(), FormatError> {
        if n > self.remaining() {
            Err(FormatError::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        self.ensure(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let raw = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    fn align(&mut self, alignment: usize) -> Result<(), FormatError> {
        let rem = self.pos % alignment;
        if rem != 0 {
            self.take(alignment - rem)?;
        }
        Ok(())
    }

    fn size(&mut self) -> Result<usize, FormatError> {
        match self.u8()? {
            254 => Ok(u16::from_le_bytes(self.array()?).into()),
            255 => usize::try_from(u32::from_le_bytes(self.array()?))
                .map_err(|_| FormatError::InvalidSize),
            small => Ok(small.into()),
        }
    }

    fn typed_list(&mut self, width: usize) -> Result<&'a [u8], FormatError> {
        let len = self.size()?;
        self.align(width)?;
        let bytes = len.checked_mul(width).ok_or(FormatError::InvalidSize)?;
        self.take(bytes)
    }
}
