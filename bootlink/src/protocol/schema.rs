//! Declarative field tables.
//!
//! Each message type publishes a static table of `(tag, name, kind)`
//! descriptors. The generic routines in [`crate::protocol::codec`] walk these
//! tables to encode and decode every message, so no message carries its own
//! serializer. A message type only has to say how to read and store one field
//! value at a time.

use crate::error::DecodeError;
use crate::protocol::bounded::{BoundedBytes, BoundedString};
use crate::protocol::message::MessageType;

/// Protobuf wire type for varint fields.
pub const WIRE_VARINT: u8 = 0;
/// Protobuf wire type for 64-bit fixed fields.
pub const WIRE_FIXED64: u8 = 1;
/// Protobuf wire type for length-delimited fields.
pub const WIRE_LENGTH_DELIMITED: u8 = 2;
/// Protobuf wire type for 32-bit fixed fields.
pub const WIRE_FIXED32: u8 = 5;

/// Kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Unsigned 32-bit varint.
    UInt32,
    /// Boolean varint (0 or 1).
    Bool,
    /// Enumeration varint.
    Enum,
    /// UTF-8 string of at most `max` bytes.
    String {
        /// Maximum length in bytes.
        max: usize,
    },
    /// Byte string of at most `max` bytes.
    Bytes {
        /// Maximum length in bytes.
        max: usize,
    },
    /// Streamed byte payload, bounded by the session rather than the schema.
    Stream,
}

impl FieldKind {
    /// Protobuf wire type used for this kind.
    pub fn wire_type(self) -> u8 {
        match self {
            Self::UInt32 | Self::Bool | Self::Enum => WIRE_VARINT,
            Self::String { .. } | Self::Bytes { .. } | Self::Stream => WIRE_LENGTH_DELIMITED,
        }
    }

    /// Maximum byte length for length-delimited kinds.
    pub fn max_len(self) -> Option<usize> {
        match self {
            Self::String { max } | Self::Bytes { max } => Some(max),
            _ => None,
        }
    }
}

/// One entry of a message's field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field tag.
    pub tag: u32,
    /// Field name (used in error reports).
    pub name: &'static str,
    /// Field kind.
    pub kind: FieldKind,
}

impl FieldDescriptor {
    /// Create a descriptor.
    pub const fn new(tag: u32, name: &'static str, kind: FieldKind) -> Self {
        Self { tag, name, kind }
    }
}

/// A single decoded or to-be-encoded field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    /// Unsigned integer.
    UInt32(u32),
    /// Boolean.
    Bool(bool),
    /// Raw enumeration value.
    Enum(u32),
    /// Validated UTF-8 text.
    Str(&'a str),
    /// Raw bytes.
    Bytes(&'a [u8]),
}

/// Field-level access used by the generic codec.
pub trait Schema: Default {
    /// Wire type id of this message.
    const MESSAGE_TYPE: MessageType;

    /// Field table, in tag order.
    const FIELDS: &'static [FieldDescriptor];

    /// Current value of the field with `tag`, or `None` when absent.
    fn field(&self, tag: u32) -> Option<FieldValue<'_>>;

    /// Store a value that already matched `desc`'s kind and length limit.
    fn set_field(&mut self, desc: &FieldDescriptor, value: FieldValue<'_>)
    -> Result<(), DecodeError>;

    /// Look up a descriptor by tag.
    fn descriptor(tag: u32) -> Option<&'static FieldDescriptor> {
        Self::FIELDS.iter().find(|d| d.tag == tag)
    }
}

fn mismatch(desc: &FieldDescriptor) -> DecodeError {
    DecodeError::TypeMismatch {
        field: desc.name,
        reason: "value kind does not match field",
    }
}

/// Extract a `u32` for `desc`.
pub(crate) fn take_u32(desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<u32, DecodeError> {
    match value {
        FieldValue::UInt32(v) | FieldValue::Enum(v) => Ok(v),
        _ => Err(mismatch(desc)),
    }
}

/// Extract a `bool` for `desc`.
pub(crate) fn take_bool(desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<bool, DecodeError> {
    match value {
        FieldValue::Bool(v) => Ok(v),
        _ => Err(mismatch(desc)),
    }
}

/// Extract a bounded string for `desc`.
pub(crate) fn take_str<const N: usize>(
    desc: &FieldDescriptor,
    value: FieldValue<'_>,
) -> Result<BoundedString<N>, DecodeError> {
    match value {
        FieldValue::Str(s) => BoundedString::try_from(s).map_err(|e| DecodeError::FieldTooLarge {
            field: desc.name,
            length: e.length,
            max: e.capacity,
        }),
        _ => Err(mismatch(desc)),
    }
}

/// Extract bounded bytes for `desc`.
pub(crate) fn take_bytes<const N: usize>(
    desc: &FieldDescriptor,
    value: FieldValue<'_>,
) -> Result<BoundedBytes<N>, DecodeError> {
    match value {
        FieldValue::Bytes(b) => BoundedBytes::try_from(b).map_err(|e| DecodeError::FieldTooLarge {
            field: desc.name,
            length: e.length,
            max: e.capacity,
        }),
        _ => Err(mismatch(desc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_types() {
        assert_eq!(FieldKind::UInt32.wire_type(), WIRE_VARINT);
        assert_eq!(FieldKind::Bool.wire_type(), WIRE_VARINT);
        assert_eq!(FieldKind::Enum.wire_type(), WIRE_VARINT);
        assert_eq!(
            FieldKind::String { max: 4 }.wire_type(),
            WIRE_LENGTH_DELIMITED
        );
        assert_eq!(FieldKind::Stream.wire_type(), WIRE_LENGTH_DELIMITED);
    }

    #[test]
    fn test_take_str_over_capacity() {
        let desc = FieldDescriptor::new(1, "label", FieldKind::String { max: 3 });
        let err = take_str::<3>(&desc, FieldValue::Str("abcd")).unwrap_err();
        assert_eq!(
            err,
            DecodeError::FieldTooLarge {
                field: "label",
                length: 4,
                max: 3
            }
        );
    }

    #[test]
    fn test_take_bool_rejects_bytes() {
        let desc = FieldDescriptor::new(2, "flag", FieldKind::Bool);
        assert!(matches!(
            take_bool(&desc, FieldValue::Bytes(&[1])),
            Err(DecodeError::TypeMismatch { field: "flag", .. })
        ));
    }
}
