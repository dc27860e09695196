//! Signal codec: framing plus the status/payload message body.
//!
//! [`SignalEncoder`] and [`SignalDecoder`] are what negotiation hands to an
//! output endpoint and a connection worker respectively.

pub mod frame;
pub mod message;
pub mod stream;

use std::io;

use thiserror::Error;

pub use frame::{FrameReader, FrameWriter, MAX_FRAME_LEN, ReadOutcome};
pub use message::{Payload, SignalMessage, decode_message, encode_message};
pub use stream::{Decoded, SignalDecoder, SignalEncoder};

/// Errors during signal encode/decode.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Length prefix larger than the frame limit.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    /// Peer closed the stream partway through a frame.
    #[error("stream ended mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },
    /// Message body too short to hold its header.
    #[error("message body too small")]
    BufferTooSmall,
    /// Unknown arity tag.
    #[error("invalid message arity {0}")]
    InvalidArity(u8),
    /// Status byte other than 0 or 1.
    #[error("invalid status byte {0}")]
    InvalidStatus(u8),
    /// An inactive message carried a value.
    #[error("inactive message carries a payload")]
    PayloadOnInactive,
    /// Bytes left over after a complete message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    /// Payload could not be (de)serialized.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] postcard::Error),
}

impl CodecError {
    /// True when the error means the peer went away rather than sent garbage.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Truncated { .. })
    }
}
