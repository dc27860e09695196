//! Signal message bodies.
//!
//! ## Wire Format
//!
//! | Message | Body |
//! |---------|------|
//! | One-field | `[arity=1][active:1]` |
//! | Two-field | `[arity=2][active=1][payload]` |
//!
//! `payload` is the postcard encoding of the application type. A two-field
//! message is always active: deactivation never carries a value.

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::CodecError;

const ARITY_STATUS: u8 = 1;
const ARITY_STATUS_PAYLOAD: u8 = 2;

/// Marker trait for values that can ride along with an active signal.
///
/// Automatically implemented for all owned serde types that can cross threads.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}
impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// One status update for a signal.
///
/// Invariant: `payload` is `Some` only when `active` is true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage<T> {
    active: bool,
    payload: Option<T>,
}

impl<T> SignalMessage<T> {
    /// Active with a value.
    pub const fn active_with(value: T) -> Self {
        Self {
            active: true,
            payload: Some(value),
        }
    }

    /// Active with no value.
    pub const fn active() -> Self {
        Self {
            active: true,
            payload: None,
        }
    }

    /// Inactive.
    pub const fn inactive() -> Self {
        Self {
            active: false,
            payload: None,
        }
    }

    /// Builds a message from a status and optional value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PayloadOnInactive`] if a value accompanies an
    /// inactive status.
    pub fn from_parts(active: bool, payload: Option<T>) -> Result<Self, CodecError> {
        if !active && payload.is_some() {
            return Err(CodecError::PayloadOnInactive);
        }
        Ok(Self { active, payload })
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    pub const fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    /// Number of fields on the wire: 1 without a value, 2 with one.
    pub const fn arity(&self) -> u8 {
        if self.payload.is_some() {
            ARITY_STATUS_PAYLOAD
        } else {
            ARITY_STATUS
        }
    }

    pub fn into_parts(self) -> (bool, Option<T>) {
        (self.active, self.payload)
    }
}

/// Writer for encoding a message body into a byte buffer.
struct MessageWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> MessageWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_payload<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        let encoded = postcard::to_stdvec(value)?;
        self.buf.extend_from_slice(&encoded);
        Ok(())
    }
}

/// Reader for decoding a message body from a byte buffer.
struct MessageReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> MessageReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        let Some(&v) = self.buf.get(self.cursor) else {
            return Err(CodecError::BufferTooSmall);
        };
        self.cursor += 1;
        Ok(v)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.cursor..]
    }
}

/// Encode a message body into `buf`, replacing its contents.
///
/// # Errors
///
/// Returns [`CodecError::Payload`] if the value cannot be serialized.
pub fn encode_message<T: Serialize>(
    msg: &SignalMessage<T>,
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let mut w = MessageWriter::new(buf);
    w.put_u8(msg.arity());
    w.put_u8(u8::from(msg.active));
    if let Some(value) = &msg.payload {
        w.put_payload(value)?;
    }
    Ok(())
}

/// Decode a message body from `bytes`.
///
/// # Errors
///
/// - [`CodecError::BufferTooSmall`] if the arity or status byte is missing
/// - [`CodecError::InvalidArity`] / [`CodecError::InvalidStatus`] for unknown tags
/// - [`CodecError::PayloadOnInactive`] for a two-field inactive message
/// - [`CodecError::Payload`] if the value does not deserialize as `T`
/// - [`CodecError::TrailingBytes`] if bytes remain after the message
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<SignalMessage<T>, CodecError> {
    let mut r = MessageReader::new(bytes);

    let arity = r.take_u8()?;
    let active = match r.take_u8()? {
        0 => false,
        1 => true,
        other => return Err(CodecError::InvalidStatus(other)),
    };

    match arity {
        ARITY_STATUS => {
            let rest = r.rest();
            if !rest.is_empty() {
                return Err(CodecError::TrailingBytes(rest.len()));
            }
            Ok(SignalMessage {
                active,
                payload: None,
            })
        }
        ARITY_STATUS_PAYLOAD => {
            if !active {
                return Err(CodecError::PayloadOnInactive);
            }
            let (value, rest) = postcard::take_from_bytes::<T>(r.rest())?;
            if !rest.is_empty() {
                return Err(CodecError::TrailingBytes(rest.len()));
            }
            Ok(SignalMessage::active_with(value))
        }
        other => Err(CodecError::InvalidArity(other)),
    }
}
