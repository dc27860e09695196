//! Connection negotiation strategies.
//!
//! Negotiation runs once per connection, before any signal message. A server
//! strategy decides whether to keep an accepted connection and, if so, which
//! callback its messages go to. A client strategy turns a fresh connection
//! into an encoder or fails.
//!
//! Two flavors exist:
//!
//! ```text
//! Anonymous                             Named
//! client            server              client                server
//!   │  messages...    │                   │  NAME("CD1.X")       │
//!   │────────────────>│                   │─────────────────────>│ lookup
//!                                         │  ACK(0x00)           │
//!                                         │<─────────────────────│ (or close)
//!                                         │  messages...         │
//!                                         │─────────────────────>│
//! ```

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use minstant::Instant;

use crate::codec::{
    FrameReader, FrameWriter, MAX_FRAME_LEN, Payload, ReadOutcome, SignalDecoder, SignalEncoder,
};
use crate::control::registry::SignalRegistry;
use crate::control::types::{
    ACK_BYTE, ConnectionError, DEFAULT_ACK_TIMEOUT, Delivery, InboundSession, MAX_NAME_LEN,
    POLL_TIMEOUT,
};
use crate::trace::{debug, warn};

/// Server side of a negotiation.
///
/// Takes ownership of the accepted stream. Returning `None` drops it, which
/// closes the connection; returning a session moves it into the worker.
/// Called from the accept thread while the application may be mutating
/// shared routing state, hence `Sync`.
pub trait ServerHandshake: Send + Sync + 'static {
    type Payload: Payload;

    fn negotiate(&self, stream: TcpStream) -> Option<InboundSession<Self::Payload>>;
}

/// Client side of a negotiation.
pub trait ClientHandshake {
    /// Turns a connected stream into an encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not accept the connection.
    fn negotiate(&self, stream: TcpStream) -> Result<SignalEncoder, ConnectionError>;
}

/// No handshake: every connection feeds one replaceable callback.
///
/// Connections arriving while no callback is set are rejected.
pub struct AnonymousServer<T> {
    slot: Arc<RwLock<Option<Delivery<T>>>>,
}

impl<T> AnonymousServer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
        }
    }

    #[must_use]
    pub fn with_delivery(delivery: Delivery<T>) -> Self {
        let server = Self::new();
        server.set_delivery(delivery);
        server
    }

    /// Replaces the callback for connections negotiated from now on.
    pub fn set_delivery(&self, delivery: Delivery<T>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(delivery);
    }

    fn current(&self) -> Option<Delivery<T>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> Clone for AnonymousServer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for AnonymousServer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload> ServerHandshake for AnonymousServer<T> {
    type Payload = T;

    fn negotiate(&self, stream: TcpStream) -> Option<InboundSession<T>> {
        let Some(delivery) = self.current() else {
            warn!("rejecting connection: no delivery callback set");
            return None;
        };
        Some(InboundSession {
            decoder: SignalDecoder::new(stream),
            delivery,
            signal: None,
        })
    }
}

/// Named handshake: the client announces `domain.signal`, the server acks if
/// the name is registered and closes otherwise.
pub struct NamedServer<T> {
    registry: SignalRegistry<T>,
}

impl<T> NamedServer<T> {
    #[must_use]
    pub const fn new(registry: SignalRegistry<T>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub const fn registry(&self) -> &SignalRegistry<T> {
        &self.registry
    }
}

impl<T: Payload> ServerHandshake for NamedServer<T> {
    type Payload = T;

    fn negotiate(&self, stream: TcpStream) -> Option<InboundSession<T>> {
        let mut frames = FrameReader::with_limit(stream, MAX_NAME_LEN);

        // The whole name gets one read wait, however slowly it trickles in.
        let deadline = Instant::now() + POLL_TIMEOUT;
        let name = match frames.read_frame_before(deadline) {
            Ok(ReadOutcome::Frame(bytes)) => bytes,
            Ok(ReadOutcome::Idle) => {
                debug!("rejecting connection: no signal name before timeout");
                return None;
            }
            Ok(ReadOutcome::Closed) => {
                debug!("peer closed before announcing a signal name");
                return None;
            }
            Err(_e) => {
                debug!(error = %_e, "rejecting connection: unreadable signal name");
                return None;
            }
        };
        let Ok(name) = String::from_utf8(name) else {
            warn!("rejecting connection: signal name is not UTF-8");
            return None;
        };

        let Some(delivery) = self.registry.lookup(&name) else {
            warn!(signal = %name, "rejecting connection: unknown signal");
            return None;
        };

        if let Err(_e) = frames.get_ref().write_all(&[ACK_BYTE]) {
            debug!(signal = %name, error = %_e, "failed to acknowledge signal");
            return None;
        }

        debug!(signal = %name, "signal acknowledged");
        frames.set_limit(MAX_FRAME_LEN);
        Some(InboundSession {
            decoder: SignalDecoder::from_frames(frames),
            delivery,
            signal: Some(name),
        })
    }
}

/// No handshake: wrap the stream in an encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousClient;

impl ClientHandshake for AnonymousClient {
    fn negotiate(&self, stream: TcpStream) -> Result<SignalEncoder, ConnectionError> {
        Ok(SignalEncoder::new(stream))
    }
}

/// Announces a qualified signal name and waits for the server's ack.
#[derive(Debug, Clone)]
pub struct NamedClient {
    name: String,
    ack_timeout: Duration,
}

impl NamedClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

impl ClientHandshake for NamedClient {
    fn negotiate(&self, stream: TcpStream) -> Result<SignalEncoder, ConnectionError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(ConnectionError::NameTooLong {
                len: self.name.len(),
                max: MAX_NAME_LEN,
            });
        }

        let mut frames = FrameWriter::new(stream);
        frames.write_frame(self.name.as_bytes())?;

        let stream = frames.get_mut();
        stream.set_read_timeout(Some(self.ack_timeout))?;
        let mut ack = [0u8; 1];
        let read = loop {
            match stream.read(&mut ack) {
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                other => break other,
            }
        };
        match read {
            Ok(1) => {}
            Ok(_) => return Err(ConnectionError::Rejected(self.name.clone())),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ConnectionError::Timeout);
            }
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                return Err(ConnectionError::Rejected(self.name.clone()));
            }
            Err(e) => return Err(ConnectionError::Io(e)),
        }
        stream.set_read_timeout(None)?;

        Ok(SignalEncoder::from_frames(frames))
    }
}
