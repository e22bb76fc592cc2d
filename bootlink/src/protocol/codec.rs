//! Generic table-driven codec.
//!
//! [`encode`] and [`decode`] work for any [`Schema`] by walking its static
//! field table. The wire format is protobuf: every field is a varint key
//! `(tag << 3) | wire_type` followed by a varint or a length-delimited value.

use crate::error::DecodeError;
use crate::protocol::message::{
    ButtonAck, ButtonRequest, Failure, Features, FirmwareErase, FirmwareRequest, FirmwareUpload,
    GetFeatures, Initialize, Message, MessageType, Ping, Success,
};
use crate::protocol::schema::{
    FieldKind, FieldValue, Schema, WIRE_FIXED32, WIRE_FIXED64, WIRE_LENGTH_DELIMITED, WIRE_VARINT,
};

/// Longest valid varint encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` as a varint.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Number of bytes `value` occupies as a varint.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Read a varint at `*pos`, advancing it.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = *buf
            .get(*pos)
            .ok_or(DecodeError::MalformedFrame("truncated varint"))?;
        *pos += 1;
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::MalformedFrame("varint too long"))
}

/// Append a field key.
pub fn write_key(out: &mut Vec<u8>, tag: u32, wire_type: u8) {
    write_varint(out, (u64::from(tag) << 3) | u64::from(wire_type));
}

/// Split a raw key into `(tag, wire_type)`.
pub fn split_key(key: u64) -> Result<(u32, u8), DecodeError> {
    let tag = u32::try_from(key >> 3).map_err(|_| DecodeError::MalformedFrame("tag out of range"))?;
    if tag == 0 {
        return Err(DecodeError::MalformedFrame("field tag 0"));
    }
    Ok((tag, (key & 0x07) as u8))
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], DecodeError> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or(DecodeError::MalformedFrame("field runs past end of body"))?;
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Encode a message body.
///
/// Fails with [`DecodeError::FieldTooLarge`] only when a field is longer than
/// its schema maximum.
pub fn encode<T: Schema>(msg: &T) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    for desc in T::FIELDS {
        let Some(value) = msg.field(desc.tag) else {
            continue;
        };
        write_key(&mut out, desc.tag, desc.kind.wire_type());
        match value {
            FieldValue::UInt32(v) | FieldValue::Enum(v) => write_varint(&mut out, u64::from(v)),
            FieldValue::Bool(v) => write_varint(&mut out, u64::from(v)),
            FieldValue::Str(s) => write_delimited(&mut out, desc.name, desc.kind, s.as_bytes())?,
            FieldValue::Bytes(b) => write_delimited(&mut out, desc.name, desc.kind, b)?,
        }
    }
    Ok(out)
}

fn write_delimited(
    out: &mut Vec<u8>,
    field: &'static str,
    kind: FieldKind,
    bytes: &[u8],
) -> Result<(), DecodeError> {
    if let Some(max) = kind.max_len() {
        if bytes.len() > max {
            return Err(DecodeError::FieldTooLarge {
                field,
                length: bytes.len(),
                max,
            });
        }
    }
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
    Ok(())
}

/// Decode a message body.
///
/// Unknown tags are skipped. On error nothing is returned, so a caller never
/// sees a partially populated message.
pub fn decode<T: Schema>(body: &[u8]) -> Result<T, DecodeError> {
    let mut msg = T::default();
    let mut pos = 0;

    while pos < body.len() {
        let (tag, wire_type) = split_key(read_varint(body, &mut pos)?)?;

        let value = match wire_type {
            WIRE_VARINT => RawValue::Varint(read_varint(body, &mut pos)?),
            WIRE_LENGTH_DELIMITED => {
                let len = read_varint(body, &mut pos)?;
                let len = usize::try_from(len)
                    .map_err(|_| DecodeError::MalformedFrame("length out of range"))?;
                RawValue::Delimited(take(body, &mut pos, len)?)
            },
            WIRE_FIXED64 => RawValue::Fixed(take(body, &mut pos, 8)?),
            WIRE_FIXED32 => RawValue::Fixed(take(body, &mut pos, 4)?),
            _ => return Err(DecodeError::MalformedFrame("unsupported wire type")),
        };

        let Some(desc) = T::descriptor(tag) else {
            continue;
        };
        if desc.kind.wire_type() != wire_type {
            return Err(DecodeError::TypeMismatch {
                field: desc.name,
                reason: "wrong wire type",
            });
        }

        let value = match (desc.kind, value) {
            (FieldKind::UInt32, RawValue::Varint(v)) => FieldValue::UInt32(narrow(desc.name, v)?),
            (FieldKind::Enum, RawValue::Varint(v)) => FieldValue::Enum(narrow(desc.name, v)?),
            (FieldKind::Bool, RawValue::Varint(v)) => FieldValue::Bool(v != 0),
            (FieldKind::String { max }, RawValue::Delimited(b)) => {
                check_len(desc.name, b.len(), max)?;
                let s = std::str::from_utf8(b).map_err(|_| DecodeError::TypeMismatch {
                    field: desc.name,
                    reason: "invalid UTF-8",
                })?;
                FieldValue::Str(s)
            },
            (FieldKind::Bytes { max }, RawValue::Delimited(b)) => {
                check_len(desc.name, b.len(), max)?;
                FieldValue::Bytes(b)
            },
            (FieldKind::Stream, RawValue::Delimited(b)) => FieldValue::Bytes(b),
            _ => {
                return Err(DecodeError::TypeMismatch {
                    field: desc.name,
                    reason: "wrong wire type",
                });
            },
        };
        msg.set_field(desc, value)?;
    }

    Ok(msg)
}

enum RawValue<'a> {
    Varint(u64),
    Delimited(&'a [u8]),
    Fixed(&'a [u8]),
}

fn narrow(field: &'static str, value: u64) -> Result<u32, DecodeError> {
    u32::try_from(value).map_err(|_| DecodeError::TypeMismatch {
        field,
        reason: "value exceeds 32 bits",
    })
}

fn check_len(field: &'static str, length: usize, max: usize) -> Result<(), DecodeError> {
    if length > max {
        return Err(DecodeError::FieldTooLarge { field, length, max });
    }
    Ok(())
}

/// Decode a body of type `T`, checking the frame's type id first.
pub fn decode_as<T: Schema>(msg_type: MessageType, body: &[u8]) -> Result<T, DecodeError> {
    if msg_type != T::MESSAGE_TYPE {
        return Err(DecodeError::UnexpectedType {
            expected: T::MESSAGE_TYPE,
            actual: msg_type,
        });
    }
    decode(body)
}

impl Message {
    /// Decode a body whose type id came from the frame header.
    pub fn decode(msg_type: MessageType, body: &[u8]) -> Result<Self, DecodeError> {
        Ok(match msg_type {
            MessageType::Initialize => Self::Initialize(decode::<Initialize>(body)?),
            MessageType::Ping => Self::Ping(decode::<Ping>(body)?),
            MessageType::Success => Self::Success(decode::<Success>(body)?),
            MessageType::Failure => Self::Failure(decode::<Failure>(body)?),
            MessageType::FirmwareErase => Self::FirmwareErase(decode::<FirmwareErase>(body)?),
            MessageType::FirmwareUpload => Self::FirmwareUpload(decode::<FirmwareUpload>(body)?),
            MessageType::FirmwareRequest => {
                Self::FirmwareRequest(decode::<FirmwareRequest>(body)?)
            },
            MessageType::Features => Self::Features(Box::new(decode::<Features>(body)?)),
            MessageType::ButtonRequest => Self::ButtonRequest(decode::<ButtonRequest>(body)?),
            MessageType::ButtonAck => Self::ButtonAck(decode::<ButtonAck>(body)?),
            MessageType::GetFeatures => Self::GetFeatures(decode::<GetFeatures>(body)?),
        })
    }

    /// Encode the message body (without transport framing).
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        match self {
            Self::Initialize(m) => encode(m),
            Self::Ping(m) => encode(m),
            Self::Success(m) => encode(m),
            Self::Failure(m) => encode(m),
            Self::FirmwareErase(m) => encode(m),
            Self::FirmwareUpload(m) => encode(m),
            Self::FirmwareRequest(m) => encode(m),
            Self::Features(m) => encode(m.as_ref()),
            Self::ButtonRequest(m) => encode(m),
            Self::ButtonAck(m) => encode(m),
            Self::GetFeatures(m) => encode(m),
        }
    }
}
