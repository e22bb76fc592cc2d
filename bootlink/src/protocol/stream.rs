//! Pull-based FirmwareUpload decoding.
//!
//! A FirmwareUpload body can be far larger than any buffer the device keeps,
//! so it is never decoded whole. [`UploadStream`] walks the protobuf fields as
//! the body arrives and hands the `payload` bytes out one chunk at a time
//! through [`PayloadSource::next_payload`]. The `hash` field is collected on
//! the way and is final once the payload is exhausted.

use crate::error::{DecodeError, Result};
use crate::protocol::codec::split_key;
use crate::protocol::message::{Digest, FirmwareUpload, HASH_LEN};
use crate::protocol::schema::{WIRE_FIXED32, WIRE_FIXED64, WIRE_LENGTH_DELIMITED, WIRE_VARINT};

/// Working buffer for streamed payload chunks.
pub const STREAM_CHUNK: usize = 512;

const TAG_PAYLOAD: u32 = 1;
const TAG_HASH: u32 = 2;

/// Raw body bytes of one frame, delivered in pieces.
pub trait BodySource {
    /// Copy the next body bytes into `buf`. `Ok(0)` means the body ended.
    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize>;
}

impl BodySource for &[u8] {
    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.len());
        buf[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];
        Ok(n)
    }
}

/// Producer of firmware payload chunks, consumed by the engine.
pub trait PayloadSource {
    /// Next chunk of payload bytes, or `None` once the message is exhausted.
    fn next_payload(&mut self) -> Result<Option<&[u8]>>;

    /// Hash declared by the message. Only final after `next_payload` returned
    /// `None`.
    fn declared_hash(&self) -> Option<&Digest>;
}

/// Incremental FirmwareUpload decoder over a [`BodySource`].
pub struct UploadStream<S> {
    source: S,
    buf: [u8; STREAM_CHUNK],
    pos: usize,
    filled: usize,
    payload_remaining: u64,
    hash: Option<Digest>,
    done: bool,
}

impl<S: BodySource> UploadStream<S> {
    /// Wrap a body source.
    pub fn new(source: S) -> Self {
        Self {
            source,
            buf: [0; STREAM_CHUNK],
            pos: 0,
            filled: 0,
            payload_remaining: 0,
            hash: None,
            done: false,
        }
    }

    /// Give the body source back.
    pub fn into_source(self) -> S {
        self.source
    }

    fn refill(&mut self) -> Result<bool> {
        if self.pos < self.filled {
            return Ok(true);
        }
        self.pos = 0;
        self.filled = self.source.read_body(&mut self.buf)?;
        Ok(self.filled > 0)
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        if !self.refill()? {
            return Ok(None);
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }

    fn require_byte(&mut self) -> Result<u8> {
        Ok(self
            .read_byte()?
            .ok_or(DecodeError::MalformedFrame("body ended inside a field"))?)
    }

    /// Read a varint; `None` only when the body ends cleanly before it.
    fn read_varint(&mut self) -> Result<Option<u64>> {
        let Some(first) = self.read_byte()? else {
            return Ok(None);
        };
        let mut value = u64::from(first & 0x7F);
        let mut byte = first;
        let mut shift = 7;
        while byte & 0x80 != 0 {
            if shift >= 70 {
                return Err(DecodeError::MalformedFrame("varint too long").into());
            }
            byte = self.require_byte()?;
            value |= u64::from(byte & 0x7F) << shift;
            shift += 7;
        }
        Ok(Some(value))
    }

    fn require_varint(&mut self) -> Result<u64> {
        Ok(self
            .read_varint()?
            .ok_or(DecodeError::MalformedFrame("body ended inside a field"))?)
    }

    fn skip(&mut self, mut len: u64) -> Result<()> {
        while len > 0 {
            if !self.refill()? {
                return Err(DecodeError::MalformedFrame("field runs past end of body").into());
            }
            let n = ((self.filled - self.pos) as u64).min(len);
            self.pos += n as usize;
            len -= n;
        }
        Ok(())
    }

    fn read_hash(&mut self, len: u64) -> Result<()> {
        if len > HASH_LEN as u64 {
            return Err(DecodeError::FieldTooLarge {
                field: "hash",
                length: len as usize,
                max: HASH_LEN,
            }
            .into());
        }
        let mut raw = [0u8; HASH_LEN];
        for slot in raw.iter_mut().take(len as usize) {
            *slot = self.require_byte()?;
        }
        self.hash = Digest::try_from(&raw[..len as usize]).ok();
        Ok(())
    }

    /// Parse fields until payload bytes are available or the body ends.
    fn advance(&mut self) -> Result<()> {
        while self.payload_remaining == 0 && !self.done {
            let Some(key) = self.read_varint()? else {
                self.done = true;
                break;
            };
            let (tag, wire_type) = split_key(key)?;
            match (tag, wire_type) {
                (TAG_PAYLOAD, WIRE_LENGTH_DELIMITED) => {
                    self.payload_remaining = self.require_varint()?;
                },
                (TAG_HASH, WIRE_LENGTH_DELIMITED) => {
                    let len = self.require_varint()?;
                    self.read_hash(len)?;
                },
                (TAG_PAYLOAD, _) => {
                    return Err(DecodeError::TypeMismatch {
                        field: "payload",
                        reason: "wrong wire type",
                    }
                    .into());
                },
                (TAG_HASH, _) => {
                    return Err(DecodeError::TypeMismatch {
                        field: "hash",
                        reason: "wrong wire type",
                    }
                    .into());
                },
                (_, WIRE_VARINT) => {
                    self.require_varint()?;
                },
                (_, WIRE_LENGTH_DELIMITED) => {
                    let len = self.require_varint()?;
                    self.skip(len)?;
                },
                (_, WIRE_FIXED64) => self.skip(8)?,
                (_, WIRE_FIXED32) => self.skip(4)?,
                _ => return Err(DecodeError::MalformedFrame("unsupported wire type").into()),
            }
        }
        Ok(())
    }
}

impl<S: BodySource> PayloadSource for UploadStream<S> {
    fn next_payload(&mut self) -> Result<Option<&[u8]>> {
        self.advance()?;
        if self.payload_remaining == 0 {
            return Ok(None);
        }
        if !self.refill()? {
            return Err(DecodeError::MalformedFrame("payload runs past end of body").into());
        }
        let n = ((self.filled - self.pos) as u64).min(self.payload_remaining) as usize;
        let start = self.pos;
        self.pos += n;
        self.payload_remaining -= n as u64;
        Ok(Some(&self.buf[start..start + n]))
    }

    fn declared_hash(&self) -> Option<&Digest> {
        self.hash.as_ref()
    }
}

/// [`PayloadSource`] over an already decoded message.
#[derive(Debug)]
pub struct BufferedUpload<'a> {
    msg: &'a FirmwareUpload,
    offset: usize,
}

impl<'a> BufferedUpload<'a> {
    /// Stream `msg`'s payload.
    pub fn new(msg: &'a FirmwareUpload) -> Self {
        Self { msg, offset: 0 }
    }
}

impl PayloadSource for BufferedUpload<'_> {
    fn next_payload(&mut self) -> Result<Option<&[u8]>> {
        let payload = self.msg.payload.as_deref().unwrap_or_default();
        if self.offset >= payload.len() {
            return Ok(None);
        }
        let end = (self.offset + STREAM_CHUNK).min(payload.len());
        let chunk = &payload[self.offset..end];
        self.offset = end;
        Ok(Some(chunk))
    }

    fn declared_hash(&self) -> Option<&Digest> {
        self.msg.hash.as_ref()
    }
}
