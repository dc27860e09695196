//! Per-connection read loop.

use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::{Decoded, Payload};
use crate::control::{ConnectionId, InboundSession};
use crate::net::Endpoint;
use crate::trace::{debug, trace, warn};

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Peer closed the stream at a message boundary.
    Closed,
    /// The owning acceptor is shutting down.
    Interrupted,
    /// Stream failed or ended mid-frame.
    Disconnected,
    /// Peer sent something that does not decode.
    Malformed,
}

/// Owns one accepted connection and feeds its messages to a delivery callback.
pub struct Worker<T> {
    id: ConnectionId,
    peer: Endpoint,
    session: InboundSession<T>,
    interrupt: Arc<AtomicBool>,
}

impl<T: Payload> Worker<T> {
    #[must_use]
    pub const fn new(
        id: ConnectionId,
        peer: Endpoint,
        session: InboundSession<T>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            peer,
            session,
            interrupt,
        }
    }

    /// Decodes and delivers until the connection ends or the interrupt flag is
    /// raised, then closes the connection.
    pub fn run(self) -> WorkerExit {
        let Self {
            id: _id,
            peer: _peer,
            session,
            interrupt,
        } = self;
        let InboundSession {
            mut decoder,
            delivery,
            signal: _signal,
        } = session;

        debug!(connection = %_id, peer = %_peer, signal = ?_signal, "worker started");

        let exit = loop {
            if interrupt.load(Ordering::Acquire) {
                break WorkerExit::Interrupted;
            }
            match decoder.next_message() {
                Ok(Decoded::Message(msg)) => {
                    let (active, payload) = msg.into_parts();
                    trace!(connection = %_id, active, "delivering signal");
                    delivery(active, payload);
                }
                Ok(Decoded::Idle) => {}
                Ok(Decoded::Closed) => break WorkerExit::Closed,
                Err(e) if e.is_disconnect() => {
                    debug!(connection = %_id, error = %e, "connection lost");
                    break WorkerExit::Disconnected;
                }
                Err(_e) => {
                    warn!(connection = %_id, peer = %_peer, error = %_e, "malformed message, closing connection");
                    break WorkerExit::Malformed;
                }
            }
        };

        let stream = decoder.into_inner();
        if let Err(_e) = stream.shutdown(Shutdown::Both) {
            trace!(connection = %_id, error = %_e, "shutdown on closed connection");
        }
        drop(stream);

        debug!(connection = %_id, exit = ?exit, "worker exiting");
        exit
    }
}
