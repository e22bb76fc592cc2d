//! Packet reassembly and frame splitting.
//!
//! Messages travel in fixed 64-byte packets:
//!
//! ```text
//! first:        '?' '#' '#' | type: u16 BE | length: u32 BE | 55 body bytes
//! continuation: '?'                                         | 63 body bytes
//! ```
//!
//! Unused packet space is zero padded. The packets themselves ride on a byte
//! stream with arbitrary chunk boundaries, so [`Framer`] first collects whole
//! packets and then frames. It never blocks and never times out; callers push
//! bytes in with [`Framer::push`] and pull [`FrameEvent`]s out with
//! [`Framer::next_event`].

use std::collections::VecDeque;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::{trace, warn};

use crate::error::FramingError;
use crate::protocol::message::{MAX_BUFFERED_BODY, MessageType};

/// Packet size on the wire.
pub const PACKET_SIZE: usize = 64;
/// Report marker that starts every packet.
pub const REPORT_ID: u8 = b'?';
/// Bytes of frame header in the first packet (`?##`, type, length).
pub const HEADER_LEN: usize = 9;
/// Body bytes carried by the first packet.
pub const FIRST_BODY_LEN: usize = PACKET_SIZE - HEADER_LEN;
/// Body bytes carried by a continuation packet.
pub const CONT_BODY_LEN: usize = PACKET_SIZE - 1;

/// Something the framer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete buffered frame.
    Frame {
        /// Raw type id from the header.
        msg_type: u16,
        /// Body bytes.
        body: Vec<u8>,
    },
    /// A streamed frame started.
    StreamStart {
        /// Streamed message type.
        msg_type: MessageType,
        /// Declared body length.
        length: u32,
    },
    /// Next piece of a streamed body.
    StreamData(Vec<u8>),
    /// The streamed body is complete.
    StreamEnd,
}

#[derive(Debug)]
enum State {
    /// Waiting for a first packet.
    Idle,
    /// Buffering a frame body.
    Buffering { msg_type: u16, remaining: u32 },
    /// Passing a streamed body through.
    Streaming { remaining: u32 },
    /// Dropping the rest of a rejected frame.
    Discarding { remaining: u32 },
}

/// Incremental packet and frame reassembler.
#[derive(Debug)]
pub struct Framer {
    packet: [u8; PACKET_SIZE],
    filled: usize,
    state: State,
    body: Vec<u8>,
    events: VecDeque<Result<FrameEvent, FramingError>>,
    skipping: bool,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Create an idle framer.
    pub fn new() -> Self {
        Self {
            packet: [0; PACKET_SIZE],
            filled: 0,
            state: State::Idle,
            body: Vec::with_capacity(MAX_BUFFERED_BODY),
            events: VecDeque::new(),
            skipping: false,
        }
    }

    /// Feed raw bytes from the transport.
    pub fn push(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.filled == 0 {
                // Resynchronise on the report marker.
                let Some(start) = bytes.iter().position(|b| *b == REPORT_ID) else {
                    self.report_garbage(bytes[0]);
                    return;
                };
                if start > 0 {
                    self.report_garbage(bytes[0]);
                    bytes = &bytes[start..];
                }
                self.skipping = false;
            }

            let take = (PACKET_SIZE - self.filled).min(bytes.len());
            self.packet[self.filled..self.filled + take].copy_from_slice(&bytes[..take]);
            self.filled += take;
            bytes = &bytes[take..];

            if self.filled == PACKET_SIZE {
                self.filled = 0;
                let packet = self.packet;
                self.on_packet(&packet);
            }
        }
    }

    /// Pull the next event, if any.
    pub fn next_event(&mut self) -> Option<Result<FrameEvent, FramingError>> {
        self.events.pop_front()
    }

    /// Whether a frame is partly received.
    pub fn in_frame(&self) -> bool {
        self.filled > 0 || !matches!(self.state, State::Idle)
    }

    /// Drop all partial state, returning the error for an unfinished frame.
    pub fn reset(&mut self) -> Option<FramingError> {
        let remaining = match self.state {
            State::Idle => None,
            State::Buffering { remaining, .. }
            | State::Streaming { remaining }
            | State::Discarding { remaining } => Some(remaining),
        };
        self.state = State::Idle;
        self.filled = 0;
        self.body.clear();
        self.skipping = false;
        remaining.map(|remaining| FramingError::Truncated { remaining })
    }

    /// Stop delivering the open streamed frame; its remaining packets are
    /// dropped as they arrive.
    pub fn discard_stream(&mut self) {
        while matches!(self.events.front(), Some(Ok(FrameEvent::StreamData(_)))) {
            self.events.pop_front();
        }
        if matches!(self.events.front(), Some(Ok(FrameEvent::StreamEnd))) {
            self.events.pop_front();
            return;
        }
        if let State::Streaming { remaining } = self.state {
            self.state = State::Discarding { remaining };
        }
    }

    fn report_garbage(&mut self, byte: u8) {
        if !self.skipping {
            self.skipping = true;
            self.events.push_back(Err(FramingError::BadMagic(byte)));
        }
    }

    fn on_packet(&mut self, packet: &[u8; PACKET_SIZE]) {
        // Inside an open frame every packet is a continuation; its body may
        // start with `##` like any other firmware bytes.
        if !matches!(self.state, State::Idle) {
            self.continue_frame(&packet[1..]);
            return;
        }

        if packet[1] == b'#' && packet[2] == b'#' {
            self.start_frame(packet);
        } else {
            warn!("Continuation packet without a frame header, dropping");
            self.events.push_back(Err(FramingError::UnexpectedChunk(
                "continuation without frame header",
            )));
        }
    }

    fn start_frame(&mut self, packet: &[u8; PACKET_SIZE]) {
        let msg_type = BigEndian::read_u16(&packet[3..5]);
        let length = BigEndian::read_u32(&packet[5..9]);
        trace!("Frame header: type={msg_type} length={length}");

        let streamed = MessageType::try_from(msg_type)
            .ok()
            .filter(|t| t.is_streamed());

        self.state = if let Some(msg_type) = streamed {
            self.events
                .push_back(Ok(FrameEvent::StreamStart { msg_type, length }));
            State::Streaming { remaining: length }
        } else if length as usize > MAX_BUFFERED_BODY {
            self.events.push_back(Err(FramingError::Oversized {
                msg_type,
                length,
                max: MAX_BUFFERED_BODY,
            }));
            State::Discarding { remaining: length }
        } else {
            self.body.clear();
            State::Buffering {
                msg_type,
                remaining: length,
            }
        };

        self.continue_frame(&packet[HEADER_LEN..]);
    }

    fn continue_frame(&mut self, data: &[u8]) {
        match &mut self.state {
            State::Idle => {},
            State::Buffering {
                msg_type,
                remaining,
            } => {
                let take = (*remaining as usize).min(data.len());
                self.body.extend_from_slice(&data[..take]);
                *remaining -= take as u32;
                if *remaining == 0 {
                    let msg_type = *msg_type;
                    let body = std::mem::take(&mut self.body);
                    self.events
                        .push_back(Ok(FrameEvent::Frame { msg_type, body }));
                    self.state = State::Idle;
                }
            },
            State::Streaming { remaining } => {
                let take = (*remaining as usize).min(data.len());
                if take > 0 {
                    self.events
                        .push_back(Ok(FrameEvent::StreamData(data[..take].to_vec())));
                }
                *remaining -= take as u32;
                if *remaining == 0 {
                    self.events.push_back(Ok(FrameEvent::StreamEnd));
                    self.state = State::Idle;
                }
            },
            State::Discarding { remaining } => {
                let take = (*remaining as usize).min(data.len());
                *remaining -= take as u32;
                if *remaining == 0 {
                    self.state = State::Idle;
                }
            },
        }
    }
}

/// Split one message into wire packets.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn encode_frame(msg_type: u16, body: &[u8]) -> Vec<u8> {
    let first = body.len().min(FIRST_BODY_LEN);
    let rest = body.len() - first;
    let packets = 1 + rest.div_ceil(CONT_BODY_LEN);
    let mut out = Vec::with_capacity(packets * PACKET_SIZE);

    out.extend_from_slice(&[REPORT_ID, b'#', b'#']);
    out.write_u16::<BigEndian>(msg_type).unwrap();
    out.write_u32::<BigEndian>(body.len() as u32).unwrap();
    out.extend_from_slice(&body[..first]);
    out.resize(PACKET_SIZE, 0);

    for chunk in body[first..].chunks(CONT_BODY_LEN) {
        let start = out.len();
        out.push(REPORT_ID);
        out.extend_from_slice(chunk);
        out.resize(start + PACKET_SIZE, 0);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(framer: &mut Framer) -> Vec<Result<FrameEvent, FramingError>> {
        std::iter::from_fn(|| framer.next_event()).collect()
    }

    #[test]
    fn test_encode_frame_layout() {
        let wire = encode_frame(17, &[1, 2, 3]);
        assert_eq!(wire.len(), PACKET_SIZE);
        assert_eq!(&wire[..9], &[b'?', b'#', b'#', 0, 17, 0, 0, 0, 3]);
        assert_eq!(&wire[9..12], &[1, 2, 3]);
        assert!(wire[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_encode_frame_continuations() {
        let body = vec![0xAA; FIRST_BODY_LEN + CONT_BODY_LEN + 1];
        let wire = encode_frame(3, &body);
        assert_eq!(wire.len(), 3 * PACKET_SIZE);
        assert_eq!(wire[PACKET_SIZE], REPORT_ID);
        assert_eq!(wire[2 * PACKET_SIZE], REPORT_ID);
        assert_eq!(wire[2 * PACKET_SIZE + 1], 0xAA);
        assert_eq!(wire[2 * PACKET_SIZE + 2], 0);
    }

    #[test]
    fn test_reassembly_across_arbitrary_chunks() {
        let body: Vec<u8> = (0..200u8).collect();
        let wire = encode_frame(2, &body);

        let mut framer = Framer::new();
        for chunk in wire.chunks(7) {
            framer.push(chunk);
        }
        assert_eq!(
            drain(&mut framer),
            vec![Ok(FrameEvent::Frame { msg_type: 2, body })]
        );
        assert!(!framer.in_frame());
    }

    #[test]
    fn test_empty_body_frame() {
        let mut framer = Framer::new();
        framer.push(&encode_frame(0, &[]));
        assert_eq!(
            framer.next_event(),
            Some(Ok(FrameEvent::Frame {
                msg_type: 0,
                body: Vec::new()
            }))
        );
    }

    #[test]
    fn test_streamed_frame_events() {
        let body = vec![5u8; 100];
        let mut framer = Framer::new();
        framer.push(&encode_frame(MessageType::FirmwareUpload.id(), &body));

        let events = drain(&mut framer);
        assert_eq!(
            events[0],
            Ok(FrameEvent::StreamStart {
                msg_type: MessageType::FirmwareUpload,
                length: 100
            })
        );
        assert_eq!(events[1], Ok(FrameEvent::StreamData(vec![5; FIRST_BODY_LEN])));
        assert_eq!(
            events[2],
            Ok(FrameEvent::StreamData(vec![5; 100 - FIRST_BODY_LEN]))
        );
        assert_eq!(events[3], Ok(FrameEvent::StreamEnd));
    }

    #[test]
    fn test_oversized_buffered_frame_is_discarded() {
        let body = vec![0u8; MAX_BUFFERED_BODY + 1];
        let mut framer = Framer::new();
        framer.push(&encode_frame(MessageType::Success.id(), &body));
        framer.push(&encode_frame(MessageType::Initialize.id(), &[]));

        let events = drain(&mut framer);
        assert!(matches!(events[0], Err(FramingError::Oversized { .. })));
        assert_eq!(
            events[1],
            Ok(FrameEvent::Frame {
                msg_type: 0,
                body: Vec::new()
            })
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_continuation_without_header() {
        let mut framer = Framer::new();
        let mut packet = vec![REPORT_ID];
        packet.resize(PACKET_SIZE, 0x11);
        framer.push(&packet);
        assert_eq!(
            framer.next_event(),
            Some(Err(FramingError::UnexpectedChunk(
                "continuation without frame header"
            )))
        );
        assert!(!framer.in_frame());
    }

    #[test]
    fn test_hash_marks_in_continuation_are_body() {
        let mut body = vec![0x5Au8; 200];
        body[FIRST_BODY_LEN..FIRST_BODY_LEN + 2].copy_from_slice(b"##");
        body[FIRST_BODY_LEN + CONT_BODY_LEN..FIRST_BODY_LEN + CONT_BODY_LEN + 2]
            .copy_from_slice(b"##");
        let wire = encode_frame(2, &body);
        assert_eq!(&wire[PACKET_SIZE..PACKET_SIZE + 3], b"?##");

        let mut framer = Framer::new();
        framer.push(&wire);
        assert_eq!(
            drain(&mut framer),
            vec![Ok(FrameEvent::Frame { msg_type: 2, body })]
        );
    }

    #[test]
    fn test_hash_marks_in_streamed_continuation() {
        let mut body = vec![0u8; 100];
        body[FIRST_BODY_LEN..FIRST_BODY_LEN + 2].copy_from_slice(b"##");
        let mut framer = Framer::new();
        framer.push(&encode_frame(MessageType::FirmwareUpload.id(), &body));

        let events = drain(&mut framer);
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(Result::is_ok));
        assert_eq!(
            events[2],
            Ok(FrameEvent::StreamData(body[FIRST_BODY_LEN..].to_vec()))
        );
        assert_eq!(events[3], Ok(FrameEvent::StreamEnd));
    }

    #[test]
    fn test_open_frame_recovers_after_reset() {
        let long = encode_frame(2, &[9u8; 100]);
        let mut framer = Framer::new();
        framer.push(&long[..PACKET_SIZE]);
        assert!(framer.reset().is_some());
        framer.push(&encode_frame(27, &[]));

        assert_eq!(
            drain(&mut framer),
            vec![Ok(FrameEvent::Frame {
                msg_type: 27,
                body: Vec::new()
            })]
        );
    }

    #[test]
    fn test_garbage_is_skipped_once() {
        let mut framer = Framer::new();
        framer.push(&[0x00, 0x01, 0x02]);
        framer.push(&[0x03]);
        framer.push(&encode_frame(55, &[]));

        let events = drain(&mut framer);
        assert_eq!(events[0], Err(FramingError::BadMagic(0x00)));
        assert_eq!(
            events[1],
            Ok(FrameEvent::Frame {
                msg_type: 55,
                body: Vec::new()
            })
        );
    }

    #[test]
    fn test_discard_stream_skips_remaining_packets() {
        let upload = encode_frame(MessageType::FirmwareUpload.id(), &[0u8; 300]);
        let mut framer = Framer::new();
        framer.push(&upload[..2 * PACKET_SIZE]);
        assert!(matches!(
            framer.next_event(),
            Some(Ok(FrameEvent::StreamStart { .. }))
        ));
        framer.discard_stream();
        framer.push(&upload[2 * PACKET_SIZE..]);
        framer.push(&encode_frame(1, &[]));
        assert_eq!(
            drain(&mut framer),
            vec![Ok(FrameEvent::Frame {
                msg_type: 1,
                body: Vec::new()
            })]
        );
    }

    #[test]
    fn test_reset_reports_truncation() {
        let wire = encode_frame(2, &[1u8; 100]);
        let mut framer = Framer::new();
        framer.push(&wire[..PACKET_SIZE]);
        assert!(framer.in_frame());
        assert_eq!(
            framer.reset(),
            Some(FramingError::Truncated {
                remaining: (100 - FIRST_BODY_LEN) as u32
            })
        );
        assert!(!framer.in_frame());
    }
}
