//! Bootloader message catalog.
//!
//! Every field is optional on the wire and is modelled as an `Option`, so a
//! field that was not sent is never confused with a zero or empty value.
//!
//! | Type            | Id | Fields                                              |
//! |-----------------|----|-----------------------------------------------------|
//! | Initialize      |  0 | -                                                   |
//! | Ping            |  1 | message, button/pin/passphrase_protection           |
//! | Success         |  2 | message                                             |
//! | Failure         |  3 | code, message                                       |
//! | FirmwareErase   |  6 | length                                              |
//! | FirmwareUpload  |  7 | payload (streamed), hash                            |
//! | FirmwareRequest |  8 | offset, length                                      |
//! | Features        | 17 | device identity and state                           |
//! | ButtonRequest   | 26 | code, data                                          |
//! | ButtonAck       | 27 | -                                                   |
//! | GetFeatures     | 55 | -                                                   |

use crate::error::DecodeError;
use crate::protocol::bounded::{BoundedBytes, BoundedString};
use crate::protocol::schema::{
    FieldDescriptor, FieldKind, FieldValue, Schema, take_bool, take_bytes, take_str, take_u32,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Maximum length of free-text message fields.
pub const TEXT_MAX: usize = 256;
/// Maximum length of the vendor and label fields.
pub const VENDOR_MAX: usize = 33;
/// Maximum length of the device id field.
pub const DEVICE_ID_MAX: usize = 25;
/// Maximum length of the language field.
pub const LANGUAGE_MAX: usize = 17;
/// Maximum length of the revision field.
pub const REVISION_MAX: usize = 20;
/// Length of a firmware / bootloader digest.
pub const HASH_LEN: usize = 32;

/// Largest encoded body of any non-streamed message (Failure / ButtonRequest).
pub const MAX_BUFFERED_BODY: usize = 270;

/// Free-text field.
pub type Text = BoundedString<TEXT_MAX>;
/// Digest field.
pub type Digest = BoundedBytes<HASH_LEN>;

/// Message type ids carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u16)]
pub enum MessageType {
    /// Start a session.
    Initialize = 0,
    /// Liveness check, optionally protected.
    Ping = 1,
    /// Generic success response.
    Success = 2,
    /// Generic failure response.
    Failure = 3,
    /// Erase the firmware region.
    FirmwareErase = 6,
    /// Firmware payload (streamed).
    FirmwareUpload = 7,
    /// Read back a written region.
    FirmwareRequest = 8,
    /// Device identity and state.
    Features = 17,
    /// Device asks for user confirmation.
    ButtonRequest = 26,
    /// Host acknowledges a button request.
    ButtonAck = 27,
    /// Ask for Features.
    GetFeatures = 55,
}

impl MessageType {
    /// All catalog entries.
    pub const ALL: [Self; 11] = [
        Self::Initialize,
        Self::Ping,
        Self::Success,
        Self::Failure,
        Self::FirmwareErase,
        Self::FirmwareUpload,
        Self::FirmwareRequest,
        Self::Features,
        Self::ButtonRequest,
        Self::ButtonAck,
        Self::GetFeatures,
    ];

    /// Numeric id on the wire.
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Whether frames of this type are streamed instead of buffered whole.
    pub fn is_streamed(self) -> bool {
        matches!(self, Self::FirmwareUpload)
    }
}

impl TryFrom<u16> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| t.id() == value)
            .ok_or(DecodeError::UnknownMessageType(value))
    }
}

/// Failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum FailureType {
    /// Message not valid in the current state.
    UnexpectedMessage = 1,
    /// ButtonAck expected.
    ButtonExpected = 2,
    /// Invalid or missing request data.
    DataError = 3,
    /// User cancelled or confirmation timed out.
    ActionCancelled = 4,
    /// PIN expected.
    PinExpected = 5,
    /// PIN entry cancelled.
    PinCancelled = 6,
    /// Wrong PIN.
    PinInvalid = 7,
    /// Bad signature.
    InvalidSignature = 8,
    /// Generic processing failure.
    ProcessError = 9,
    /// Not enough funds.
    NotEnoughFunds = 10,
    /// Device not initialized.
    NotInitialized = 11,
    /// PIN mismatch.
    PinMismatch = 12,
    /// Uploaded firmware does not match its declared hash.
    FirmwareMismatch = 98,
    /// Flash hardware failure.
    HardwareError = 99,
}

impl FailureType {
    /// Map a raw wire value; unknown values yield `None`.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::UnexpectedMessage,
            2 => Self::ButtonExpected,
            3 => Self::DataError,
            4 => Self::ActionCancelled,
            5 => Self::PinExpected,
            6 => Self::PinCancelled,
            7 => Self::PinInvalid,
            8 => Self::InvalidSignature,
            9 => Self::ProcessError,
            10 => Self::NotEnoughFunds,
            11 => Self::NotInitialized,
            12 => Self::PinMismatch,
            98 => Self::FirmwareMismatch,
            99 => Self::HardwareError,
            _ => return None,
        })
    }
}

/// Reasons the device asks for a button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum ButtonRequestType {
    /// Unspecified.
    Other = 1,
    /// Confirm wiping the device.
    WipeDevice = 6,
    /// Confirm a protected call.
    Confirm = 7,
    /// Confirm installing new firmware.
    FirmwareCheck = 9,
    /// PIN entry on the device.
    PinEntry = 18,
    /// Passphrase entry on the device.
    PassphraseEntry = 19,
}

impl ButtonRequestType {
    /// Map a raw wire value; unknown values yield `None`.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Other,
            6 => Self::WipeDevice,
            7 => Self::Confirm,
            9 => Self::FirmwareCheck,
            18 => Self::PinEntry,
            19 => Self::PassphraseEntry,
            _ => return None,
        })
    }
}

/// Start a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Initialize;

/// Ask for device features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetFeatures;

/// Acknowledge a button request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ButtonAck;

/// Liveness check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ping {
    /// Text echoed back in `Success`.
    pub message: Option<Text>,
    /// Require a button confirmation.
    pub button_protection: Option<bool>,
    /// Require PIN confirmation.
    pub pin_protection: Option<bool>,
    /// Require passphrase confirmation.
    pub passphrase_protection: Option<bool>,
}

/// Success response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Success {
    /// Optional text.
    pub message: Option<Text>,
}

/// Failure response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failure {
    /// Failure code.
    pub code: Option<FailureType>,
    /// Human readable reason.
    pub message: Option<Text>,
}

/// Request for user confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ButtonRequest {
    /// Why confirmation is needed.
    pub code: Option<ButtonRequestType>,
    /// Extra context for the host.
    pub data: Option<Text>,
}

/// Device identity and state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[allow(clippy::struct_excessive_bools)]
pub struct Features {
    /// Vendor name.
    pub vendor: Option<BoundedString<VENDOR_MAX>>,
    /// Major version.
    pub major_version: Option<u32>,
    /// Minor version.
    pub minor_version: Option<u32>,
    /// Patch version.
    pub patch_version: Option<u32>,
    /// Whether the device runs its bootloader.
    pub bootloader_mode: Option<bool>,
    /// Device id.
    pub device_id: Option<BoundedString<DEVICE_ID_MAX>>,
    /// PIN protection enabled.
    pub pin_protection: Option<bool>,
    /// Passphrase protection enabled.
    pub passphrase_protection: Option<bool>,
    /// UI language.
    pub language: Option<BoundedString<LANGUAGE_MAX>>,
    /// Device label.
    pub label: Option<BoundedString<VENDOR_MAX>>,
    /// Device has been set up.
    pub initialized: Option<bool>,
    /// Source revision.
    pub revision: Option<BoundedBytes<REVISION_MAX>>,
    /// Bootloader digest.
    pub bootloader_hash: Option<Digest>,
    /// Seed was imported.
    pub imported: Option<bool>,
    /// PIN cached.
    pub pin_cached: Option<bool>,
    /// Passphrase cached.
    pub passphrase_cached: Option<bool>,
    /// A valid firmware image is installed.
    pub firmware_present: Option<bool>,
}

/// Erase the firmware region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareErase {
    /// Bytes to erase; absent means the whole firmware area.
    pub length: Option<u32>,
}

/// Read back a region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareRequest {
    /// Start offset.
    pub offset: Option<u32>,
    /// Byte count.
    pub length: Option<u32>,
}

/// Firmware payload.
///
/// Incoming uploads are normally consumed through
/// [`crate::protocol::stream::UploadStream`] and never materialise `payload`;
/// the buffered form exists for read-back responses and small frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareUpload {
    /// Payload bytes.
    pub payload: Option<Vec<u8>>,
    /// SHA-256 of the complete image.
    pub hash: Option<Digest>,
}

/// Any catalog message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// See [`Initialize`].
    Initialize(Initialize),
    /// See [`Ping`].
    Ping(Ping),
    /// See [`Success`].
    Success(Success),
    /// See [`Failure`].
    Failure(Failure),
    /// See [`FirmwareErase`].
    FirmwareErase(FirmwareErase),
    /// See [`FirmwareUpload`].
    FirmwareUpload(FirmwareUpload),
    /// See [`FirmwareRequest`].
    FirmwareRequest(FirmwareRequest),
    /// See [`Features`].
    Features(Box<Features>),
    /// See [`ButtonRequest`].
    ButtonRequest(ButtonRequest),
    /// See [`ButtonAck`].
    ButtonAck(ButtonAck),
    /// See [`GetFeatures`].
    GetFeatures(GetFeatures),
}

impl Message {
    /// Wire type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Initialize(_) => MessageType::Initialize,
            Self::Ping(_) => MessageType::Ping,
            Self::Success(_) => MessageType::Success,
            Self::Failure(_) => MessageType::Failure,
            Self::FirmwareErase(_) => MessageType::FirmwareErase,
            Self::FirmwareUpload(_) => MessageType::FirmwareUpload,
            Self::FirmwareRequest(_) => MessageType::FirmwareRequest,
            Self::Features(_) => MessageType::Features,
            Self::ButtonRequest(_) => MessageType::ButtonRequest,
            Self::ButtonAck(_) => MessageType::ButtonAck,
            Self::GetFeatures(_) => MessageType::GetFeatures,
        }
    }
}

impl From<Features> for Message {
    fn from(value: Features) -> Self {
        Self::Features(Box::new(value))
    }
}

macro_rules! impl_into_message {
    ($($ty:ident),* $(,)?) => {
        $(
            impl From<$ty> for Message {
                fn from(value: $ty) -> Self {
                    Self::$ty(value)
                }
            }
        )*
    };
}

impl_into_message!(
    Initialize,
    Ping,
    Success,
    Failure,
    FirmwareErase,
    FirmwareUpload,
    FirmwareRequest,
    ButtonRequest,
    ButtonAck,
    GetFeatures,
);

// ---------------------------------------------------------------------------
// Field tables
// ---------------------------------------------------------------------------

const TEXT: FieldKind = FieldKind::String { max: TEXT_MAX };

impl Schema for Initialize {
    const MESSAGE_TYPE: MessageType = MessageType::Initialize;
    const FIELDS: &'static [FieldDescriptor] = &[];

    fn field(&self, _tag: u32) -> Option<FieldValue<'_>> {
        None
    }

    fn set_field(&mut self, _: &FieldDescriptor, _: FieldValue<'_>) -> Result<(), DecodeError> {
        Ok(())
    }
}

impl Schema for GetFeatures {
    const MESSAGE_TYPE: MessageType = MessageType::GetFeatures;
    const FIELDS: &'static [FieldDescriptor] = &[];

    fn field(&self, _tag: u32) -> Option<FieldValue<'_>> {
        None
    }

    fn set_field(&mut self, _: &FieldDescriptor, _: FieldValue<'_>) -> Result<(), DecodeError> {
        Ok(())
    }
}

impl Schema for ButtonAck {
    const MESSAGE_TYPE: MessageType = MessageType::ButtonAck;
    const FIELDS: &'static [FieldDescriptor] = &[];

    fn field(&self, _tag: u32) -> Option<FieldValue<'_>> {
        None
    }

    fn set_field(&mut self, _: &FieldDescriptor, _: FieldValue<'_>) -> Result<(), DecodeError> {
        Ok(())
    }
}

impl Schema for Ping {
    const MESSAGE_TYPE: MessageType = MessageType::Ping;
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::new(1, "message", TEXT),
        FieldDescriptor::new(2, "button_protection", FieldKind::Bool),
        FieldDescriptor::new(3, "pin_protection", FieldKind::Bool),
        FieldDescriptor::new(4, "passphrase_protection", FieldKind::Bool),
    ];

    fn field(&self, tag: u32) -> Option<FieldValue<'_>> {
        match tag {
            1 => self.message.as_ref().map(|m| FieldValue::Str(m)),
            2 => self.button_protection.map(FieldValue::Bool),
            3 => self.pin_protection.map(FieldValue::Bool),
            4 => self.passphrase_protection.map(FieldValue::Bool),
            _ => None,
        }
    }

    fn set_field(&mut self, desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<(), DecodeError> {
        match desc.tag {
            1 => self.message = Some(take_str(desc, value)?),
            2 => self.button_protection = Some(take_bool(desc, value)?),
            3 => self.pin_protection = Some(take_bool(desc, value)?),
            4 => self.passphrase_protection = Some(take_bool(desc, value)?),
            _ => {},
        }
        Ok(())
    }
}

impl Schema for Success {
    const MESSAGE_TYPE: MessageType = MessageType::Success;
    const FIELDS: &'static [FieldDescriptor] = &[FieldDescriptor::new(1, "message", TEXT)];

    fn field(&self, tag: u32) -> Option<FieldValue<'_>> {
        match tag {
            1 => self.message.as_ref().map(|m| FieldValue::Str(m)),
            _ => None,
        }
    }

    fn set_field(&mut self, desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<(), DecodeError> {
        if desc.tag == 1 {
            self.message = Some(take_str(desc, value)?);
        }
        Ok(())
    }
}

impl Schema for Failure {
    const MESSAGE_TYPE: MessageType = MessageType::Failure;
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::new(1, "code", FieldKind::Enum),
        FieldDescriptor::new(2, "message", TEXT),
    ];

    fn field(&self, tag: u32) -> Option<FieldValue<'_>> {
        match tag {
            1 => self.code.map(|c| FieldValue::Enum(c as u32)),
            2 => self.message.as_ref().map(|m| FieldValue::Str(m)),
            _ => None,
        }
    }

    fn set_field(&mut self, desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<(), DecodeError> {
        match desc.tag {
            1 => self.code = FailureType::from_u32(take_u32(desc, value)?),
            2 => self.message = Some(take_str(desc, value)?),
            _ => {},
        }
        Ok(())
    }
}

impl Schema for ButtonRequest {
    const MESSAGE_TYPE: MessageType = MessageType::ButtonRequest;
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::new(1, "code", FieldKind::Enum),
        FieldDescriptor::new(2, "data", TEXT),
    ];

    fn field(&self, tag: u32) -> Option<FieldValue<'_>> {
        match tag {
            1 => self.code.map(|c| FieldValue::Enum(c as u32)),
            2 => self.data.as_ref().map(|d| FieldValue::Str(d)),
            _ => None,
        }
    }

    fn set_field(&mut self, desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<(), DecodeError> {
        match desc.tag {
            1 => self.code = ButtonRequestType::from_u32(take_u32(desc, value)?),
            2 => self.data = Some(take_str(desc, value)?),
            _ => {},
        }
        Ok(())
    }
}

impl Schema for Features {
    const MESSAGE_TYPE: MessageType = MessageType::Features;
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::new(1, "vendor", FieldKind::String { max: VENDOR_MAX }),
        FieldDescriptor::new(2, "major_version", FieldKind::UInt32),
        FieldDescriptor::new(3, "minor_version", FieldKind::UInt32),
        FieldDescriptor::new(4, "patch_version", FieldKind::UInt32),
        FieldDescriptor::new(5, "bootloader_mode", FieldKind::Bool),
        FieldDescriptor::new(6, "device_id", FieldKind::String { max: DEVICE_ID_MAX }),
        FieldDescriptor::new(7, "pin_protection", FieldKind::Bool),
        FieldDescriptor::new(8, "passphrase_protection", FieldKind::Bool),
        FieldDescriptor::new(9, "language", FieldKind::String { max: LANGUAGE_MAX }),
        FieldDescriptor::new(10, "label", FieldKind::String { max: VENDOR_MAX }),
        FieldDescriptor::new(12, "initialized", FieldKind::Bool),
        FieldDescriptor::new(13, "revision", FieldKind::Bytes { max: REVISION_MAX }),
        FieldDescriptor::new(14, "bootloader_hash", FieldKind::Bytes { max: HASH_LEN }),
        FieldDescriptor::new(15, "imported", FieldKind::Bool),
        FieldDescriptor::new(16, "pin_cached", FieldKind::Bool),
        FieldDescriptor::new(17, "passphrase_cached", FieldKind::Bool),
        FieldDescriptor::new(18, "firmware_present", FieldKind::Bool),
    ];

    fn field(&self, tag: u32) -> Option<FieldValue<'_>> {
        match tag {
            1 => self.vendor.as_ref().map(|v| FieldValue::Str(v)),
            2 => self.major_version.map(FieldValue::UInt32),
            3 => self.minor_version.map(FieldValue::UInt32),
            4 => self.patch_version.map(FieldValue::UInt32),
            5 => self.bootloader_mode.map(FieldValue::Bool),
            6 => self.device_id.as_ref().map(|v| FieldValue::Str(v)),
            7 => self.pin_protection.map(FieldValue::Bool),
            8 => self.passphrase_protection.map(FieldValue::Bool),
            9 => self.language.as_ref().map(|v| FieldValue::Str(v)),
            10 => self.label.as_ref().map(|v| FieldValue::Str(v)),
            12 => self.initialized.map(FieldValue::Bool),
            13 => self.revision.as_ref().map(|v| FieldValue::Bytes(v)),
            14 => self.bootloader_hash.as_ref().map(|v| FieldValue::Bytes(v)),
            15 => self.imported.map(FieldValue::Bool),
            16 => self.pin_cached.map(FieldValue::Bool),
            17 => self.passphrase_cached.map(FieldValue::Bool),
            18 => self.firmware_present.map(FieldValue::Bool),
            _ => None,
        }
    }

    fn set_field(&mut self, desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<(), DecodeError> {
        match desc.tag {
            1 => self.vendor = Some(take_str(desc, value)?),
            2 => self.major_version = Some(take_u32(desc, value)?),
            3 => self.minor_version = Some(take_u32(desc, value)?),
            4 => self.patch_version = Some(take_u32(desc, value)?),
            5 => self.bootloader_mode = Some(take_bool(desc, value)?),
            6 => self.device_id = Some(take_str(desc, value)?),
            7 => self.pin_protection = Some(take_bool(desc, value)?),
            8 => self.passphrase_protection = Some(take_bool(desc, value)?),
            9 => self.language = Some(take_str(desc, value)?),
            10 => self.label = Some(take_str(desc, value)?),
            12 => self.initialized = Some(take_bool(desc, value)?),
            13 => self.revision = Some(take_bytes(desc, value)?),
            14 => self.bootloader_hash = Some(take_bytes(desc, value)?),
            15 => self.imported = Some(take_bool(desc, value)?),
            16 => self.pin_cached = Some(take_bool(desc, value)?),
            17 => self.passphrase_cached = Some(take_bool(desc, value)?),
            18 => self.firmware_present = Some(take_bool(desc, value)?),
            _ => {},
        }
        Ok(())
    }
}

impl Schema for FirmwareErase {
    const MESSAGE_TYPE: MessageType = MessageType::FirmwareErase;
    const FIELDS: &'static [FieldDescriptor] =
        &[FieldDescriptor::new(1, "length", FieldKind::UInt32)];

    fn field(&self, tag: u32) -> Option<FieldValue<'_>> {
        match tag {
            1 => self.length.map(FieldValue::UInt32),
            _ => None,
        }
    }

    fn set_field(&mut self, desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<(), DecodeError> {
        if desc.tag == 1 {
            self.length = Some(take_u32(desc, value)?);
        }
        Ok(())
    }
}

impl Schema for FirmwareRequest {
    const MESSAGE_TYPE: MessageType = MessageType::FirmwareRequest;
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::new(1, "offset", FieldKind::UInt32),
        FieldDescriptor::new(2, "length", FieldKind::UInt32),
    ];

    fn field(&self, tag: u32) -> Option<FieldValue<'_>> {
        match tag {
            1 => self.offset.map(FieldValue::UInt32),
            2 => self.length.map(FieldValue::UInt32),
            _ => None,
        }
    }

    fn set_field(&mut self, desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<(), DecodeError> {
        match desc.tag {
            1 => self.offset = Some(take_u32(desc, value)?),
            2 => self.length = Some(take_u32(desc, value)?),
            _ => {},
        }
        Ok(())
    }
}

impl Schema for FirmwareUpload {
    const MESSAGE_TYPE: MessageType = MessageType::FirmwareUpload;
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::new(1, "payload", FieldKind::Stream),
        FieldDescriptor::new(2, "hash", FieldKind::Bytes { max: HASH_LEN }),
    ];

    fn field(&self, tag: u32) -> Option<FieldValue<'_>> {
        match tag {
            1 => self.payload.as_deref().map(FieldValue::Bytes),
            2 => self.hash.as_ref().map(|h| FieldValue::Bytes(h)),
            _ => None,
        }
    }

    fn set_field(&mut self, desc: &FieldDescriptor, value: FieldValue<'_>) -> Result<(), DecodeError> {
        match (desc.tag, value) {
            (1, FieldValue::Bytes(b)) => self.payload = Some(b.to_vec()),
            (2, _) => self.hash = Some(take_bytes(desc, value)?),
            (1, _) => {
                return Err(DecodeError::TypeMismatch {
                    field: desc.name,
                    reason: "payload must be bytes",
                });
            },
            _ => {},
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_ids() {
        assert_eq!(MessageType::Initialize.id(), 0);
        assert_eq!(MessageType::FirmwareErase.id(), 6);
        assert_eq!(MessageType::Features.id(), 17);
        assert_eq!(MessageType::GetFeatures.id(), 55);
    }

    #[test]
    fn test_message_type_from_id() {
        assert_eq!(MessageType::try_from(26).unwrap(), MessageType::ButtonRequest);
        assert_eq!(
            MessageType::try_from(4),
            Err(DecodeError::UnknownMessageType(4))
        );
    }

    #[test]
    fn test_only_upload_is_streamed() {
        for ty in MessageType::ALL {
            assert_eq!(ty.is_streamed(), ty == MessageType::FirmwareUpload);
        }
    }

    #[test]
    fn test_field_tables_sorted_and_unique() {
        fn check<T: Schema>() {
            let tags: Vec<u32> = T::FIELDS.iter().map(|d| d.tag).collect();
            let mut sorted = tags.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(tags, sorted, "{:?}", T::MESSAGE_TYPE);
        }
        check::<Ping>();
        check::<Success>();
        check::<Failure>();
        check::<ButtonRequest>();
        check::<Features>();
        check::<FirmwareErase>();
        check::<FirmwareRequest>();
        check::<FirmwareUpload>();
    }

    #[test]
    fn test_features_skips_tag_11() {
        assert!(Features::descriptor(11).is_none());
        assert_eq!(Features::descriptor(12).unwrap().name, "initialized");
    }

    #[test]
    fn test_failure_type_unknown_value() {
        assert_eq!(FailureType::from_u32(99), Some(FailureType::HardwareError));
        assert_eq!(FailureType::from_u32(0), None);
        assert_eq!(ButtonRequestType::from_u32(7), Some(ButtonRequestType::Confirm));
        assert_eq!(ButtonRequestType::from_u32(2), None);
    }
}
