// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TLV entry framing and primitive value encodings.
//!
//! Each entry starts with a type byte:
//!
//! | Bits | Meaning |
//! |------|---------|
//! | 7-6  | identifier kind ([`TlvKind`]) |
//! | 5    | identifier width: 0 = 8 bit, 1 = 16 bit |
//! | 4-3  | length field width: 0 (inline), 8, 16 or 24 bit |
//! | 2-0  | inline length when bits 4-3 are zero |
//!
//! followed by the identifier, the optional length field and the value.

use chrono::{DateTime, Utc};

use crate::error::CodecError;

/// Largest value length the 24-bit length field can carry.
pub const MAX_VALUE_LENGTH: usize = 0x00FF_FFFF;

/// Identifier kind of a TLV entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlvKind {
    /// Object instance holding resources.
    ObjectInstance,
    /// One instance of a multiple resource.
    ResourceInstance,
    /// Multiple resource holding resource instances.
    MultipleResource,
    /// Single resource with a value.
    ResourceWithValue,
}

impl TlvKind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::ObjectInstance,
            0b01 => Self::ResourceInstance,
            0b10 => Self::MultipleResource,
            _ => Self::ResourceWithValue,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::ObjectInstance => 0b00,
            Self::ResourceInstance => 0b01,
            Self::MultipleResource => 0b10,
            Self::ResourceWithValue => 0b11,
        }
    }

    /// Returns `true` if the value holds nested entries.
    #[must_use]
    pub fn is_container(self) -> bool {
        matches!(self, Self::ObjectInstance | Self::MultipleResource)
    }
}

/// A borrowed TLV entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvEntry<'a> {
    /// Identifier kind.
    pub kind: TlvKind,
    /// Identifier.
    pub id: u16,
    /// Raw value bytes.
    pub value: &'a [u8],
}

impl<'a> TlvEntry<'a> {
    /// Iterates the nested entries of a container entry.
    #[must_use]
    pub fn children(&self) -> TlvReader<'a> {
        TlvReader::new(self.value)
    }
}

/// Iterator over the TLV entries of a buffer.
///
/// Yields an error once when a header or value runs past the end of the
/// buffer, then stops.
///
/// # Examples
///
/// ```
/// use lwm2m_notify::tlv::{TlvKind, TlvReader};
///
/// // Resource 1 with the one-byte value 0x2A
/// let bytes = [0xC1, 0x01, 0x2A];
/// let entries: Vec<_> = TlvReader::new(&bytes).collect::<Result<_, _>>().unwrap();
///
/// assert_eq!(entries[0].kind, TlvKind::ResourceWithValue);
/// assert_eq!(entries[0].id, 1);
/// assert_eq!(entries[0].value, &[0x2A]);
/// ```
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> TlvReader<'a> {
    /// Creates a reader over `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }

    fn read_entry(&mut self) -> Result<TlvEntry<'a>, CodecError> {
        let offset = self.pos;
        let rest = &self.buf[offset..];
        let type_byte = rest[0];

        let id_width = if type_byte & 0b0010_0000 == 0 { 1 } else { 2 };
        let length_width = usize::from((type_byte >> 3) & 0b11);
        let header_len = 1 + id_width + length_width;

        if rest.len() < header_len {
            return Err(CodecError::Truncated {
                offset,
                needed: header_len,
                available: rest.len(),
            });
        }

        let id = if id_width == 1 {
            u16::from(rest[1])
        } else {
            u16::from_be_bytes([rest[1], rest[2]])
        };

        let length = if length_width == 0 {
            usize::from(type_byte & 0b0111)
        } else {
            rest[1 + id_width..header_len]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
        };

        let needed = header_len + length;
        if rest.len() < needed {
            return Err(CodecError::Truncated {
                offset,
                needed,
                available: rest.len(),
            });
        }

        self.pos += needed;
        Ok(TlvEntry {
            kind: TlvKind::from_bits(type_byte >> 6),
            id,
            value: &rest[header_len..needed],
        })
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<TlvEntry<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let entry = self.read_entry();
        if entry.is_err() {
            self.failed = true;
        }
        Some(entry)
    }
}

/// Builds a TLV buffer.
#[derive(Debug, Clone, Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one entry, using the narrowest identifier and length fields.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidLength`] if the value exceeds
    /// [`MAX_VALUE_LENGTH`].
    pub fn write(&mut self, kind: TlvKind, id: u16, value: &[u8]) -> Result<(), CodecError> {
        let length = value.len();
        if length > MAX_VALUE_LENGTH {
            return Err(CodecError::InvalidLength {
                resource_id: id,
                kind: "tlv",
                length,
            });
        }

        let mut type_byte = kind.bits() << 6;
        if id > 0xFF {
            type_byte |= 0b0010_0000;
        }
        let length_width: u8 = match length {
            0..=7 => 0,
            8..=0xFF => 1,
            0x100..=0xFFFF => 2,
            _ => 3,
        };
        type_byte |= length_width << 3;
        if length_width == 0 {
            // fits in three bits
            #[allow(clippy::cast_possible_truncation)]
            {
                type_byte |= length as u8;
            }
        }

        self.buf.push(type_byte);
        if id > 0xFF {
            self.buf.extend_from_slice(&id.to_be_bytes());
        } else {
            self.buf.push(id.to_be_bytes()[1]);
        }
        let length_bytes = (length as u64).to_be_bytes();
        self.buf
            .extend_from_slice(&length_bytes[8 - usize::from(length_width)..]);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    /// Appends a container entry whose value is built by `build`.
    ///
    /// # Errors
    ///
    /// Propagates errors from `build` and from [`TlvWriter::write`].
    pub fn write_nested<F>(&mut self, kind: TlvKind, id: u16, build: F) -> Result<(), CodecError>
    where
        F: FnOnce(&mut TlvWriter) -> Result<(), CodecError>,
    {
        let mut inner = TlvWriter::new();
        build(&mut inner)?;
        self.write(kind, id, &inner.buf)
    }

    /// Returns `true` if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the writer and returns the buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ============================================================================
// Value encodings
// ============================================================================

/// Encodes a signed integer in the narrowest of 1, 2, 4 or 8 bytes.
#[must_use]
pub fn encode_integer(value: i64) -> Vec<u8> {
    if let Ok(v) = i8::try_from(value) {
        v.to_be_bytes().to_vec()
    } else if let Ok(v) = i16::try_from(value) {
        v.to_be_bytes().to_vec()
    } else if let Ok(v) = i32::try_from(value) {
        v.to_be_bytes().to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

/// Decodes a big-endian signed integer of 1, 2, 4 or 8 bytes.
///
/// # Errors
///
/// Returns [`CodecError::InvalidLength`] for any other width.
pub fn decode_integer(bytes: &[u8], resource_id: u16) -> Result<i64, CodecError> {
    match *bytes {
        [a] => Ok(i64::from(i8::from_be_bytes([a]))),
        [a, b] => Ok(i64::from(i16::from_be_bytes([a, b]))),
        [a, b, c, d] => Ok(i64::from(i32::from_be_bytes([a, b, c, d]))),
        [a, b, c, d, e, f, g, h] => Ok(i64::from_be_bytes([a, b, c, d, e, f, g, h])),
        _ => Err(CodecError::InvalidLength {
            resource_id,
            kind: "integer",
            length: bytes.len(),
        }),
    }
}

/// Encodes an unsigned 64-bit value in 8 bytes.
#[must_use]
pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decodes a big-endian unsigned value of 1, 2, 4 or 8 bytes.
///
/// # Errors
///
/// Returns [`CodecError::InvalidLength`] for any other width.
pub fn decode_u64(bytes: &[u8], resource_id: u16) -> Result<u64, CodecError> {
    match bytes.len() {
        1 | 2 | 4 | 8 => Ok(bytes
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))),
        length => Err(CodecError::InvalidLength {
            resource_id,
            kind: "unsigned",
            length,
        }),
    }
}

/// Encodes a float in 4 bytes when lossless, otherwise 8.
#[must_use]
pub fn encode_float(value: f64) -> Vec<u8> {
    #[allow(clippy::cast_possible_truncation)]
    let narrow = value as f32;
    if f64::from(narrow) == value || value.is_nan() {
        narrow.to_be_bytes().to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

/// Decodes a 4 or 8 byte IEEE-754 float.
///
/// # Errors
///
/// Returns [`CodecError::InvalidLength`] for any other width.
pub fn decode_float(bytes: &[u8], resource_id: u16) -> Result<f64, CodecError> {
    match *bytes {
        [a, b, c, d] => Ok(f64::from(f32::from_be_bytes([a, b, c, d]))),
        [a, b, c, d, e, f, g, h] => Ok(f64::from_be_bytes([a, b, c, d, e, f, g, h])),
        _ => Err(CodecError::InvalidLength {
            resource_id,
            kind: "float",
            length: bytes.len(),
        }),
    }
}

/// Encodes a boolean as one byte.
#[must_use]
pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

/// Decodes a one-byte boolean.
///
/// # Errors
///
/// Returns an error unless the value is exactly one byte of 0 or 1.
pub fn decode_bool(bytes: &[u8], resource_id: u16) -> Result<bool, CodecError> {
    match *bytes {
        [0] => Ok(false),
        [1] => Ok(true),
        [other] => Err(CodecError::InvalidValue {
            resource_id,
            message: format!("boolean byte {other:#04x}"),
        }),
        _ => Err(CodecError::InvalidLength {
            resource_id,
            kind: "boolean",
            length: bytes.len(),
        }),
    }
}

/// Decodes a UTF-8 string.
///
/// # Errors
///
/// Returns [`CodecError::InvalidValue`] if the bytes are not UTF-8.
pub fn decode_string(bytes: &[u8], resource_id: u16) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::InvalidValue {
        resource_id,
        message: e.to_string(),
    })
}

/// Encodes a time as integer seconds since the epoch.
#[must_use]
pub fn encode_datetime(value: DateTime<Utc>) -> Vec<u8> {
    encode_integer(value.timestamp())
}

/// Decodes integer seconds since the epoch.
///
/// # Errors
///
/// Returns an error for bad widths or out-of-range timestamps.
pub fn decode_datetime(bytes: &[u8], resource_id: u16) -> Result<DateTime<Utc>, CodecError> {
    let secs = decode_integer(bytes, resource_id)?;
    DateTime::from_timestamp(secs, 0).ok_or_else(|| CodecError::InvalidValue {
        resource_id,
        message: format!("timestamp {secs} out of range"),
    })
}

/// Encodes an object link as two 16-bit identifiers.
#[must_use]
pub fn encode_object_link(object_id: u16, instance_id: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.extend_from_slice(&object_id.to_be_bytes());
    out.extend_from_slice(&instance_id.to_be_bytes());
    out
}

/// Decodes an object link.
///
/// # Errors
///
/// Returns [`CodecError::InvalidLength`] unless the value is 4 bytes.
pub fn decode_object_link(bytes: &[u8], resource_id: u16) -> Result<(u16, u16), CodecError> {
    match *bytes {
        [a, b, c, d] => Ok((u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d]))),
        _ => Err(CodecError::InvalidLength {
            resource_id,
            kind: "objlnk",
            length: bytes.len(),
        }),
    }
}
