//! Transport layer: 64-byte packet framing and the message link on top of a
//! [`crate::port::Port`].

pub mod framer;
pub mod link;

pub use framer::{FrameEvent, Framer, PACKET_SIZE, encode_frame};
pub use link::{Incoming, Link, StreamBody};
