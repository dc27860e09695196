//! Length-prefixed framing over a byte stream.
//!
//! ## Wire Format
//!
//! | Field | Layout |
//! |-------|--------|
//! | Frame | `[len:4][body:len]` |
//!
//! `len` is little-endian and never exceeds [`MAX_FRAME_LEN`].

use std::io::{ErrorKind, Read, Write};

use minstant::Instant;

use super::CodecError;

/// Largest frame body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;
const READ_CHUNK: usize = 4096;

/// Result of one attempt to read a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete frame body.
    Frame(Vec<u8>),
    /// The stream's read timeout elapsed before a full frame arrived.
    ///
    /// Bytes received so far stay buffered for the next call.
    Idle,
    /// The peer closed the stream on a frame boundary.
    Closed,
}

/// Reads frames from a stream, keeping partial frames across read timeouts.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_LEN)
    }

    /// A reader that rejects frames longer than `max_len` as soon as their
    /// length prefix arrives.
    pub fn with_limit(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            max_len: max_len.min(MAX_FRAME_LEN),
        }
    }

    /// Changes the frame limit for frames not yet started.
    pub fn set_limit(&mut self, max_len: usize) {
        self.max_len = max_len.min(MAX_FRAME_LEN);
    }

    /// Reads the next frame.
    ///
    /// # Errors
    ///
    /// - [`CodecError::FrameTooLarge`] if the length prefix exceeds the limit
    /// - [`CodecError::Truncated`] if the stream ends inside a frame
    /// - [`CodecError::Io`] on any other read failure
    pub fn read_frame(&mut self) -> Result<ReadOutcome, CodecError> {
        self.read_until(None)
    }

    /// Like [`read_frame`](Self::read_frame), but reports `Idle` once
    /// `deadline` has passed even if the peer keeps trickling bytes. Each
    /// read may still block for the stream's own timeout.
    ///
    /// # Errors
    ///
    /// Same as [`read_frame`](Self::read_frame).
    pub fn read_frame_before(&mut self, deadline: Instant) -> Result<ReadOutcome, CodecError> {
        self.read_until(Some(deadline))
    }

    fn read_until(&mut self, deadline: Option<Instant>) -> Result<ReadOutcome, CodecError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(body) = self.take_buffered()? {
                return Ok(ReadOutcome::Frame(body));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(ReadOutcome::Idle);
            }

            match self.inner.read(&mut chunk) {
                Ok(0) if self.buf.is_empty() => return Ok(ReadOutcome::Closed),
                Ok(0) => {
                    return Err(CodecError::Truncated {
                        buffered: self.buf.len(),
                    });
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(ReadOutcome::Idle);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(CodecError::Io(e)),
            }
        }
    }

    /// Number of received bytes not yet returned as a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn take_buffered(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }

        let end = LEN_PREFIX + len;
        if self.buf.len() < end {
            return Ok(None);
        }
        let body = self.buf[LEN_PREFIX..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(body))
    }
}

/// Writes length-prefixed frames to a stream.
pub struct FrameWriter<W> {
    inner: W,
    /// Reused per frame so prefix and body go out in one write.
    scratch: Vec<u8>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: Vec::with_capacity(64),
        }
    }

    /// Writes one frame and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FrameTooLarge`] if `body` exceeds [`MAX_FRAME_LEN`],
    /// or [`CodecError::Io`] if the write fails.
    pub fn write_frame(&mut self, body: &[u8]) -> Result<(), CodecError> {
        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                len: body.len(),
                max: MAX_FRAME_LEN,
            });
        }
        // MAX_FRAME_LEN fits in u32.
        let len = body.len() as u32;

        self.scratch.clear();
        self.scratch.extend_from_slice(&len.to_le_bytes());
        self.scratch.extend_from_slice(body);
        self.inner.write_all(&self.scratch)?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// A reader that yields its chunks one `read` at a time, with an optional
/// timeout between them. Test-only stand-in for a socket with `SO_RCVTIMEO`.
#[cfg(test)]
pub(crate) struct ChunkedReader {
    pub chunks: std::collections::VecDeque<Option<Vec<u8>>>,
}

#[cfg(test)]
impl Read for ChunkedReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        match self.chunks.pop_front() {
            None => Ok(0),
            Some(None) => Err(std::io::Error::from(ErrorKind::WouldBlock)),
            Some(Some(mut chunk)) => {
                let n = chunk.len().min(out.len());
                out[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    chunk.drain(..n);
                    self.chunks.push_front(Some(chunk));
                }
                Ok(n)
            }
        }
    }
}
