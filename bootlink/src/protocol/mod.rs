//! Message catalog and wire codec.
//!
//! - [`message`]: typed records for every message in the catalog.
//! - [`schema`]: per-type field tables consulted by the codec.
//! - [`codec`]: protobuf-style encode/decode driven by those tables.
//! - [`stream`]: incremental decoding of FirmwareUpload payloads.
//! - [`bounded`]: fixed-capacity string and bytes fields.

pub mod bounded;
pub mod codec;
pub mod message;
pub mod schema;
pub mod stream;

pub use bounded::{BoundedBytes, BoundedString, CapacityError};
pub use codec::{decode, decode_as, encode};
pub use message::{
    ButtonRequestType, Digest, FailureType, MAX_BUFFERED_BODY, Message, MessageType, Text,
};
pub use schema::{FieldDescriptor, FieldKind, Schema};
pub use stream::{BufferedUpload, PayloadSource, UploadStream};
