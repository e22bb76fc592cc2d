//! Message link over a [`Port`].

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, FramingError, Result};
use crate::port::Port;
use crate::protocol::message::{FirmwareUpload, Message, MessageType};
use crate::protocol::stream::{BodySource, PayloadSource, UploadStream};
use crate::transport::framer::{FrameEvent, Framer, PACKET_SIZE, encode_frame};

/// Longest single blocking read while polling.
pub const POLL_SLICE: Duration = Duration::from_millis(50);

/// Default inactivity limit inside a streamed frame.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// One received request.
pub enum Incoming<'a, P: Port> {
    /// A buffered message.
    Message(Message),
    /// A streamed FirmwareUpload whose body is still arriving.
    Upload(UploadStream<StreamBody<'a, P>>),
}

impl<P: Port> std::fmt::Debug for Incoming<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(m) => f.debug_tuple("Message").field(m).finish(),
            Self::Upload(_) => f.write_str("Upload(..)"),
        }
    }
}

/// Framed message link.
pub struct Link<P: Port> {
    port: P,
    framer: Framer,
    read_buf: [u8; PACKET_SIZE * 4],
    stream_timeout: Duration,
}

impl<P: Port> Link<P> {
    /// Wrap a port.
    pub fn new(mut port: P) -> Result<Self> {
        if port.timeout() > POLL_SLICE {
            port.set_timeout(POLL_SLICE)?;
        }
        Ok(Self {
            port,
            framer: Framer::new(),
            read_buf: [0; PACKET_SIZE * 4],
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        })
    }

    /// Set the inactivity limit inside a streamed frame.
    #[must_use]
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Borrow the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Give the port back.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Drop buffered input, both in the framer and in the port.
    pub fn clear(&mut self) -> Result<()> {
        if let Some(e) = self.framer.reset() {
            debug!("Discarded partial frame: {e}");
        }
        self.port.clear_buffers()
    }

    /// Encode and send one message.
    pub fn send(&mut self, msg: &Message) -> Result<()> {
        let body = msg.encode()?;
        debug!("Sending {:?} ({} bytes)", msg.message_type(), body.len());
        self.send_raw(msg.message_type().id(), &body)
    }

    /// Send a pre-encoded body.
    pub fn send_raw(&mut self, msg_type: u16, body: &[u8]) -> Result<()> {
        let wire = encode_frame(msg_type, body);
        trace!("TX {} packets", wire.len() / PACKET_SIZE);
        match self.port.write_all_bytes(&wire) {
            Err(Error::Io(e)) if is_disconnect(e.kind()) => Err(Error::Disconnected),
            other => other,
        }
    }

    /// Read once from the port into the framer.
    ///
    /// Returns `Ok(false)` when the read timed out without data.
    fn fill(&mut self) -> Result<bool> {
        match self.port.read(&mut self.read_buf) {
            Ok(0) => Err(Error::Disconnected),
            Ok(n) => {
                trace!("RX {n} bytes");
                self.framer.push(&self.read_buf[..n]);
                Ok(true)
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(false),
            Err(e) if is_disconnect(e.kind()) => Err(Error::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the next request until `deadline`.
    ///
    /// Framing and decoding errors are logged and dropped; they never reach
    /// the caller. `Ok(None)` means the deadline passed.
    pub fn poll(&mut self, deadline: Instant) -> Result<Option<Incoming<'_, P>>> {
        loop {
            while let Some(event) = self.framer.next_event() {
                match event {
                    Ok(FrameEvent::Frame { msg_type, body }) => match decode_frame(msg_type, &body) {
                        Ok(msg) => {
                            debug!("Received {:?}", msg.message_type());
                            return Ok(Some(Incoming::Message(msg)));
                        },
                        Err(e) => warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(FrameEvent::StreamStart { msg_type, length }) => {
                        debug!("Receiving streamed {msg_type:?} ({length} bytes)");
                        let body = StreamBody::new(self);
                        return Ok(Some(Incoming::Upload(UploadStream::new(body))));
                    },
                    Ok(FrameEvent::StreamData(_) | FrameEvent::StreamEnd) => {
                        trace!("Ignoring stream data outside an upload");
                    },
                    Err(e) => warn!("Dropping frame: {e}"),
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.fill()?;
        }
    }

    /// Wait for the next buffered message, failing on timeout.
    pub fn recv(&mut self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        match self.poll(deadline)? {
            Some(Incoming::Message(msg)) => Ok(msg),
            Some(Incoming::Upload(mut upload)) => {
                let mut payload = Vec::new();
                while let Some(chunk) = upload.next_payload()? {
                    payload.extend_from_slice(chunk);
                }
                let hash = upload.declared_hash().cloned();
                Ok(Message::FirmwareUpload(FirmwareUpload {
                    payload: Some(payload),
                    hash,
                }))
            },
            None => Err(Error::Timeout(format!(
                "no response within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

fn decode_frame(msg_type: u16, body: &[u8]) -> std::result::Result<Message, crate::error::DecodeError> {
    let msg_type = MessageType::try_from(msg_type)?;
    Message::decode(msg_type, body)
}

/// Body of a streamed frame, read straight from the link.
///
/// Dropping it before the body ended discards the rest of the frame.
pub struct StreamBody<'a, P: Port> {
    link: &'a mut Link<P>,
    pending: Vec<u8>,
    pos: usize,
    finished: bool,
    deadline: Instant,
}

impl<'a, P: Port> StreamBody<'a, P> {
    fn new(link: &'a mut Link<P>) -> Self {
        let deadline = Instant::now() + link.stream_timeout;
        Self {
            link,
            pending: Vec::new(),
            pos: 0,
            finished: false,
            deadline,
        }
    }
}

impl<P: Port> BodySource for StreamBody<'_, P> {
    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pos);
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }

            match self.link.framer.next_event() {
                Some(Ok(FrameEvent::StreamData(data))) => {
                    self.pending = data;
                    self.pos = 0;
                    self.deadline = Instant::now() + self.link.stream_timeout;
                },
                Some(Ok(FrameEvent::StreamEnd)) => self.finished = true,
                Some(Ok(_)) => {
                    self.finished = true;
                    return Err(FramingError::UnexpectedChunk("frame inside streamed body").into());
                },
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(e.into());
                },
                None => {
                    if Instant::now() >= self.deadline {
                        let err = self.link.framer.reset();
                        self.finished = true;
                        return Err(match err {
                            Some(e) => e.into(),
                            None => Error::Timeout("streamed frame stalled".into()),
                        });
                    }
                    self.link.fill()?;
                },
            }
        }
    }
}

impl<P: Port> Drop for StreamBody<'_, P> {
    fn drop(&mut self) {
        if !self.finished {
            trace!("Discarding rest of streamed frame");
            self.link.framer.discard_stream();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::LoopbackPort;
    use crate::protocol::message::{GetFeatures, Success};
    use std::io::Write;

    fn pair() -> (Link<LoopbackPort>, Link<LoopbackPort>) {
        let (a, b) = LoopbackPort::pair();
        (Link::new(a).unwrap(), Link::new(b).unwrap())
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(500)
    }

    #[test]
    fn test_send_and_poll_message() {
        let (mut host, mut device) = pair();
        host.send(&Message::from(GetFeatures)).unwrap();

        match device.poll(soon()).unwrap() {
            Some(Incoming::Message(Message::GetFeatures(_))) => {},
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_poll_deadline_returns_none() {
        let (_host, mut device) = pair();
        let got = device
            .poll(Instant::now() + Duration::from_millis(20))
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_undecodable_frame_is_dropped() {
        let (mut host, mut device) = pair();
        // Unknown type id, then a valid message.
        host.send_raw(4, &[]).unwrap();
        host.send(&Message::from(Success::default())).unwrap();

        match device.poll(soon()).unwrap() {
            Some(Incoming::Message(Message::Success(_))) => {},
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_streamed_upload() {
        let (mut host, mut device) = pair();
        let msg = FirmwareUpload {
            payload: Some(vec![0x42; 1000]),
            hash: None,
        };
        host.send(&Message::from(msg)).unwrap();

        let Some(Incoming::Upload(mut upload)) = device.poll(soon()).unwrap() else {
            panic!("expected upload");
        };
        let mut total = 0;
        while let Some(chunk) = upload.next_payload().unwrap() {
            assert!(chunk.iter().all(|b| *b == 0x42));
            total += chunk.len();
        }
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_abandoned_upload_is_discarded() {
        let (mut host, mut device) = pair();
        host.send(&Message::from(FirmwareUpload {
            payload: Some(vec![1; 4000]),
            hash: None,
        }))
        .unwrap();
        host.send(&Message::from(GetFeatures)).unwrap();

        {
            let Some(Incoming::Upload(mut upload)) = device.poll(soon()).unwrap() else {
                panic!("expected upload");
            };
            assert!(upload.next_payload().unwrap().is_some());
        }

        match device.poll(soon()).unwrap() {
            Some(Incoming::Message(Message::GetFeatures(_))) => {},
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_recv_collects_upload() {
        let (mut host, mut device) = pair();
        device
            .send(&Message::from(FirmwareUpload {
                payload: Some(vec![3; 300]),
                hash: None,
            }))
            .unwrap();
        let Message::FirmwareUpload(msg) = host.recv(Duration::from_millis(500)).unwrap() else {
            panic!("expected FirmwareUpload");
        };
        assert_eq!(msg.payload.unwrap().len(), 300);
    }

    #[test]
    fn test_stalled_stream_times_out() {
        let (a, b) = LoopbackPort::pair();
        let mut raw = a;
        let mut device = Link::new(b)
            .unwrap()
            .with_stream_timeout(Duration::from_millis(30));

        let wire = encode_frame(MessageType::FirmwareUpload.id(), &[0x0A, 0x7F, 1, 2, 3]);
        // Header packet only claims 5 bytes; send a frame claiming more instead.
        let mut header = wire[..PACKET_SIZE].to_vec();
        header[8] = 200;
        raw.write_all(&header).unwrap();

        let Some(Incoming::Upload(mut upload)) = device.poll(soon()).unwrap() else {
            panic!("expected upload");
        };
        assert!(upload.next_payload().is_ok());
        let err = loop {
            match upload.next_payload() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("stream should not end"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::Framing(FramingError::Truncated { .. })));
    }

    #[test]
    fn test_peer_disconnect() {
        let (host, mut device) = pair();
        drop(host);
        assert!(matches!(device.poll(soon()), Err(Error::Disconnected)));
    }
}
