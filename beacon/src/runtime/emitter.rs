//! Output endpoint: writes status changes and reverts them on a deadline.
//!
//! Every operation takes the endpoint lock, supersedes the pending decay and
//! writes one message. A decay that was already dequeued when it was
//! superseded finds a newer generation under the lock and does nothing.

use std::marker::PhantomData;
use std::net::Shutdown;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

use super::ShutdownError;
use super::timer::RevertTimer;
use crate::codec::{CodecError, Payload, SignalEncoder, SignalMessage};
use crate::control::types::DEFAULT_ACK_TIMEOUT;
use crate::control::{AnonymousClient, ClientHandshake, ConnectionError, NamedClient, qualified_name};
use crate::net::Endpoint;
use crate::net::socket::{connect, set_send_buffer_size};
use crate::trace::{debug, info, trace, warn};

/// Configuration for an [`OutputSignal`].
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Wait for a named server's acknowledgment.
    pub ack_timeout: Duration,
    /// Bound on waiting for the decay thread during close. `None` waits.
    pub shutdown_timeout: Option<Duration>,
    /// `SO_SNDBUF` for the outbound socket.
    pub send_buffer_size: Option<usize>,
    /// Disable Nagle so each status change leaves immediately.
    pub nodelay: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            shutdown_timeout: None,
            send_buffer_size: None,
            nodelay: true,
        }
    }
}

/// Error from an operation on an open [`OutputSignal`].
#[derive(Debug, Error)]
pub enum SignalError {
    /// The message could not be encoded or written.
    #[error("failed to write signal: {0}")]
    Codec(#[from] CodecError),
    /// The endpoint has been closed.
    #[error("output signal is closed")]
    Closed,
}

struct EmitterState {
    /// `None` once closed.
    encoder: Option<SignalEncoder>,
    /// Bumped by every operation; a decay only writes if it still matches.
    generation: u64,
}

type SharedState = Arc<Mutex<EmitterState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, EmitterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connected output endpoint for one signal.
///
/// Safe to share across threads; calls are serialized and reach the peer in
/// call order.
pub struct OutputSignal<T> {
    state: SharedState,
    timer: RevertTimer,
    peer: Endpoint,
    config: EmitterConfig,
    _payload: PhantomData<fn(T)>,
}

impl<T: Payload> OutputSignal<T> {
    /// Connects to `endpoint` and negotiates with `handshake`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established, the server
    /// rejects the negotiation, or the decay thread cannot be started.
    pub fn open<H: ClientHandshake>(
        endpoint: Endpoint,
        handshake: &H,
        config: EmitterConfig,
    ) -> Result<Self, ConnectionError> {
        let stream = connect(endpoint).inspect_err(|_e| {
            debug!(%endpoint, error = %_e, "connect failed");
        })?;
        stream.set_nodelay(config.nodelay)?;
        if let Some(size) = config.send_buffer_size {
            set_send_buffer_size(&stream, size)?;
        }

        let encoder = handshake.negotiate(stream).inspect_err(|_e| {
            warn!(%endpoint, error = %_e, "negotiation failed");
        })?;
        let timer = RevertTimer::spawn()?;

        info!(peer = %endpoint, "output signal connected");
        Ok(Self {
            state: Arc::new(Mutex::new(EmitterState {
                encoder: Some(encoder),
                generation: 0,
            })),
            timer,
            peer: endpoint,
            config,
            _payload: PhantomData,
        })
    }

    /// Connects and announces `domain.signal` to a named server.
    ///
    /// # Errors
    ///
    /// Fails if the server does not acknowledge the name.
    pub fn connect(endpoint: Endpoint, domain: &str, signal: &str) -> Result<Self, ConnectionError> {
        Self::connect_with(endpoint, domain, signal, EmitterConfig::default())
    }

    /// [`connect`](Self::connect) with explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails if the server does not acknowledge the name.
    pub fn connect_with(
        endpoint: Endpoint,
        domain: &str,
        signal: &str,
        config: EmitterConfig,
    ) -> Result<Self, ConnectionError> {
        let handshake =
            NamedClient::new(qualified_name(domain, signal)).with_ack_timeout(config.ack_timeout);
        Self::open(endpoint, &handshake, config)
    }

    /// Connects without a handshake.
    ///
    /// # Errors
    ///
    /// Fails if the connection cannot be established.
    pub fn connect_anonymous(endpoint: Endpoint) -> Result<Self, ConnectionError> {
        Self::open(endpoint, &AnonymousClient, EmitterConfig::default())
    }

    /// Activates the signal with `value` and deactivates it after `duration`
    /// unless another operation comes first.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the endpoint is closed.
    pub fn emit(&self, value: T, duration: Duration) -> Result<(), SignalError> {
        let mut state = lock(&self.state);
        let generation = self.supersede(&mut state)?;
        write(&mut state, &SignalMessage::active_with(value))?;

        let shared = Arc::clone(&self.state);
        self.timer.replace(duration, move || decay::<T>(&shared, generation));
        trace!(peer = %self.peer, duration_ms = duration.as_millis() as u64, "emitted");
        Ok(())
    }

    /// [`emit`](Self::emit) with the duration in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the endpoint is closed.
    pub fn emit_ms(&self, value: T, duration_ms: u64) -> Result<(), SignalError> {
        self.emit(value, Duration::from_millis(duration_ms))
    }

    /// Activates the signal without a value until changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the endpoint is closed.
    pub fn sustain(&self) -> Result<(), SignalError> {
        self.set(&SignalMessage::active())
    }

    /// Activates the signal with `value` until changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the endpoint is closed.
    pub fn sustain_with(&self, value: T) -> Result<(), SignalError> {
        self.set(&SignalMessage::active_with(value))
    }

    /// Deactivates the signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the endpoint is closed.
    pub fn deactivate(&self) -> Result<(), SignalError> {
        self.set(&SignalMessage::inactive())
    }

    /// Address this endpoint connected to.
    #[must_use]
    pub const fn peer(&self) -> Endpoint {
        self.peer
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).encoder.is_none()
    }

    /// Cancels the pending decay, stops the decay thread and closes the
    /// connection. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the decay thread outlasts `shutdown_timeout` or
    /// panicked. The connection is closed regardless.
    pub fn close(&self) -> Result<(), ShutdownError> {
        {
            let mut state = lock(&self.state);
            if state.encoder.is_none() {
                return Ok(());
            }
            state.generation += 1;
            self.timer.cancel();
        }

        // Without the lock: a dequeued decay may be waiting for it.
        let result = self.timer.shutdown(self.config.shutdown_timeout);
        if let Err(_e) = &result {
            warn!(peer = %self.peer, error = %_e, "decay thread did not stop cleanly");
        }

        if let Some(encoder) = lock(&self.state).encoder.take() {
            let _ = encoder.get_ref().shutdown(Shutdown::Both);
        }
        info!(peer = %self.peer, "output signal closed");
        result
    }

    fn set(&self, msg: &SignalMessage<T>) -> Result<(), SignalError> {
        let mut state = lock(&self.state);
        self.supersede(&mut state)?;
        write(&mut state, msg)
    }

    /// Invalidates any pending or in-flight decay. Returns the new generation.
    fn supersede(&self, state: &mut EmitterState) -> Result<u64, SignalError> {
        if state.encoder.is_none() {
            return Err(SignalError::Closed);
        }
        state.generation += 1;
        self.timer.cancel();
        Ok(state.generation)
    }
}

impl<T> Drop for OutputSignal<T> {
    fn drop(&mut self) {
        // No join here; the timer's own drop stops its thread.
        let mut state = lock(&self.state);
        state.generation += 1;
        if let Some(encoder) = state.encoder.take() {
            let _ = encoder.get_ref().shutdown(Shutdown::Both);
        }
    }
}

fn write<T: Payload>(state: &mut EmitterState, msg: &SignalMessage<T>) -> Result<(), SignalError> {
    let encoder = state.encoder.as_mut().ok_or(SignalError::Closed)?;
    encoder.write(msg).map_err(SignalError::from)
}

fn decay<T: Payload>(shared: &SharedState, generation: u64) {
    let mut state = lock(shared);
    if state.generation != generation {
        trace!("stale decay skipped");
        return;
    }
    let Some(encoder) = state.encoder.as_mut() else {
        return;
    };
    if let Err(_e) = encoder.write(&SignalMessage::<T>::inactive()) {
        debug!(error = %_e, "decay write failed");
    }
}
