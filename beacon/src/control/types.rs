//! Shared types for connection negotiation and delivery.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::codec::{CodecError, SignalDecoder};

/// Bounded wait for accept and for each stream read. Long enough to avoid
/// spinning, short enough that close is observed promptly.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Byte a named server writes to acknowledge a known signal.
pub const ACK_BYTE: u8 = 0;

/// Longest qualified signal name accepted in a named handshake.
pub const MAX_NAME_LEN: usize = 1024;

/// Default wait for a named server's acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Application callback receiving `(active, payload)` for every message on a
/// connection. Invoked from worker threads, possibly concurrently.
pub type Delivery<T> = Arc<dyn Fn(bool, Option<T>) + Send + Sync>;

/// Wraps a closure as a [`Delivery`].
pub fn delivery<T, F>(f: F) -> Delivery<T>
where
    F: Fn(bool, Option<T>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Joins a clock-domain name and a signal name into the name a named client
/// announces, e.g. `CD1.X`.
#[must_use]
pub fn qualified_name(domain: &str, signal: &str) -> String {
    format!("{domain}.{signal}")
}

/// Identifier for one accepted connection, used to correlate log lines.
///
/// Invariant: Opaque. Generated via `ConnectionId::generate()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// What a successful server-side negotiation hands to a worker.
pub struct InboundSession<T> {
    /// Decoder owning the accepted connection.
    pub decoder: SignalDecoder<T>,
    /// Where decoded messages go.
    pub delivery: Delivery<T>,
    /// Signal name announced by the peer, if the handshake has one.
    pub signal: Option<String>,
}

/// Errors establishing or negotiating a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connect or socket setup failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Handshake frame could not be written.
    #[error("handshake codec error: {0}")]
    Codec(#[from] CodecError),
    /// The server closed without acknowledging the announced signal.
    #[error("server rejected signal {0:?}")]
    Rejected(String),
    /// No acknowledgment arrived in time.
    #[error("timed out waiting for handshake acknowledgment")]
    Timeout,
    /// Announced name exceeds [`MAX_NAME_LEN`].
    #[error("signal name of {len} bytes exceeds limit of {max}")]
    NameTooLong { len: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_joins_with_dot() {
        assert_eq!(qualified_name("CD1", "X"), "CD1.X");
    }

    #[test]
    fn connection_id_display_is_fixed_width() {
        assert_eq!(ConnectionId(0xab).to_string(), "000000ab");
    }

    #[test]
    fn delivery_is_shareable_across_threads() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: Delivery<u8> = delivery(move |active, value| {
            sink.lock().unwrap().push((active, value));
        });

        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let cb = Arc::clone(&cb);
                std::thread::spawn(move || cb(true, Some(i)))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 4);
    }
}
