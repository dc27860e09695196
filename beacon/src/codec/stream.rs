//! Typed signal encoder/decoder over a connection.

use std::io::{Read, Write};
use std::marker::PhantomData;
use std::net::TcpStream;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::frame::{FrameReader, FrameWriter, ReadOutcome};
use super::message::{SignalMessage, decode_message, encode_message};
use super::CodecError;

/// Result of one decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A complete message.
    Message(SignalMessage<T>),
    /// The read wait elapsed; nothing to deliver yet.
    Idle,
    /// The peer closed the connection cleanly.
    Closed,
}

/// Writes signal messages to a connection.
pub struct SignalEncoder<W = TcpStream> {
    frames: FrameWriter<W>,
    body: Vec<u8>,
}

impl<W: Write> SignalEncoder<W> {
    pub fn new(inner: W) -> Self {
        Self::from_frames(FrameWriter::new(inner))
    }

    /// Wraps a frame writer that a handshake has already used.
    pub fn from_frames(frames: FrameWriter<W>) -> Self {
        Self {
            frames,
            body: Vec::with_capacity(64),
        }
    }

    /// Encodes and writes one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the write fails.
    pub fn write<T: Serialize>(&mut self, msg: &SignalMessage<T>) -> Result<(), CodecError> {
        encode_message(msg, &mut self.body)?;
        self.frames.write_frame(&self.body)
    }

    pub fn get_ref(&self) -> &W {
        self.frames.get_ref()
    }

    pub fn into_inner(self) -> W {
        self.frames.into_inner()
    }
}

/// Reads signal messages from a connection.
pub struct SignalDecoder<T, R = TcpStream> {
    frames: FrameReader<R>,
    _payload: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned, R: Read> SignalDecoder<T, R> {
    pub fn new(inner: R) -> Self {
        Self::from_frames(FrameReader::new(inner))
    }

    /// Wraps a frame reader that a handshake has already used, keeping any
    /// bytes it buffered past the handshake frame.
    pub fn from_frames(frames: FrameReader<R>) -> Self {
        Self {
            frames,
            _payload: PhantomData,
        }
    }

    /// Reads the next message, or reports that the wait elapsed or the peer
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns an error on a malformed frame or body, or a failed read.
    pub fn next_message(&mut self) -> Result<Decoded<T>, CodecError> {
        match self.frames.read_frame()? {
            ReadOutcome::Frame(body) => decode_message(&body).map(Decoded::Message),
            ReadOutcome::Idle => Ok(Decoded::Idle),
            ReadOutcome::Closed => Ok(Decoded::Closed),
        }
    }

    pub fn get_ref(&self) -> &R {
        self.frames.get_ref()
    }

    pub fn into_inner(self) -> R {
        self.frames.into_inner()
    }
}
