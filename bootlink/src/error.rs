//! Error types for bootlink.
//!
//! Errors are layered the same way the data flows through the stack:
//!
//! - [`FramingError`]: packet/frame reassembly problems. Never answered on
//!   the wire, the request was not meaningfully received.
//! - [`DecodeError`]: a complete frame whose body does not match its schema.
//!   Also answered with silence.
//! - [`SessionError`]: protocol-level failures inside an accepted request.
//!   Always surfaced to the peer as a `Failure` message.
//! - [`FlashError`]: flash driver failures, wrapped into
//!   [`SessionError::HardwareError`] by the engine.
//! - [`Error`]: the top-level error for I/O facing code (server loop, client).

use crate::protocol::message::{FailureType, MessageType};
use std::io;
use thiserror::Error;

/// Result type for bootlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bootlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Transport framing error.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Message decoding error.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Flash driver error.
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The peer answered with something the caller did not expect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered a request with a `Failure` message.
    #[error("Device reported {code:?}: {message}")]
    DeviceFailure {
        /// Failure code reported by the device (if known).
        code: Option<FailureType>,
        /// Failure text reported by the device.
        message: String,
    },

    /// The transport was closed by the peer.
    #[error("Transport disconnected")]
    Disconnected,

    /// The embedding application requested interruption.
    #[error("Operation interrupted")]
    Interrupted,
}

/// Transport-level framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// A packet arrived that does not extend the frame being reassembled.
    #[error("unexpected chunk: {0}")]
    UnexpectedChunk(&'static str),

    /// A packet did not start with the report marker.
    #[error("bad packet marker 0x{0:02X}")]
    BadMagic(u8),

    /// A buffered frame announced a body larger than the reassembly buffer.
    #[error("frame of type {msg_type} declares {length} bytes, maximum is {max}")]
    Oversized {
        /// Raw message type id from the frame header.
        msg_type: u16,
        /// Declared body length.
        length: u32,
        /// Reassembly buffer capacity.
        max: usize,
    },

    /// The stream ended in the middle of a frame.
    #[error("frame truncated: {remaining} bytes still expected")]
    Truncated {
        /// Bytes that were still expected.
        remaining: u32,
    },
}

/// Message body decoding errors.
///
/// A failed decode never yields a partially populated message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The body is not a well-formed sequence of tagged fields.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The frame header names a type outside the message catalog.
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    /// A field exceeds its schema maximum.
    #[error("field {field} is {length} bytes, maximum is {max}")]
    FieldTooLarge {
        /// Field name.
        field: &'static str,
        /// Actual length.
        length: usize,
        /// Schema maximum.
        max: usize,
    },

    /// A known field arrived with the wrong wire kind or invalid content.
    #[error("field {field} does not match its schema: {reason}")]
    TypeMismatch {
        /// Field name.
        field: &'static str,
        /// What was wrong.
        reason: &'static str,
    },

    /// The caller expected a different message type.
    #[error("expected {expected:?}, got {actual:?}")]
    UnexpectedType {
        /// Type the caller asked for.
        expected: MessageType,
        /// Type found in the frame.
        actual: MessageType,
    },
}

/// Flash driver errors.
#[derive(Debug, Error)]
pub enum FlashError {
    /// Access outside the flash capacity.
    #[error("access at 0x{offset:08X}+{length} is outside flash capacity {capacity}")]
    OutOfBounds {
        /// Start offset.
        offset: u32,
        /// Access length.
        length: u32,
        /// Flash capacity.
        capacity: u32,
    },

    /// Write to a location that was not erased first.
    #[error("write at 0x{0:08X} targets a non-erased location")]
    NotErased(u32),

    /// Backing storage I/O failure.
    #[error("flash storage I/O: {0}")]
    Io(#[from] io::Error),

    /// Driver-specific failure.
    #[error("flash driver failure: {0}")]
    Driver(String),
}

/// Protocol-level failures of an accepted request.
///
/// Each variant maps to exactly one [`FailureType`] through
/// [`SessionError::failure_type`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Message not valid in the current state.
    #[error("Unexpected message")]
    UnexpectedMessage,

    /// Request fields are missing or out of range.
    #[error("{0}")]
    DataError(String),

    /// Uploaded image does not match the declared hash.
    #[error("Firmware hash mismatch")]
    FirmwareMismatch,

    /// Flash driver failed.
    #[error("Flash operation failed: {0}")]
    HardwareError(String),

    /// Confirmation timed out or was declined.
    #[error("Action cancelled")]
    ActionCancelled,

    /// Another session holds the flash erase/write lock.
    #[error("Flash is busy")]
    FlashBusy,
}

impl SessionError {
    /// Wire failure code for this error.
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::UnexpectedMessage => FailureType::UnexpectedMessage,
            Self::DataError(_) => FailureType::DataError,
            Self::FirmwareMismatch => FailureType::FirmwareMismatch,
            Self::HardwareError(_) => FailureType::HardwareError,
            Self::ActionCancelled => FailureType::ActionCancelled,
            Self::FlashBusy => FailureType::ProcessError,
        }
    }
}

impl From<FlashError> for SessionError {
    fn from(err: FlashError) -> Self {
        Self::HardwareError(err.to_string())
    }
}
