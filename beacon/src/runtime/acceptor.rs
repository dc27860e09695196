//! Input endpoint: accept loop, negotiation and connection workers.
//!
//! ```text
//!   beacon-accept                      beacon-worker-N
//!   ─────────────                      ───────────────
//!   accept (≤ 500 ms) ──timeout──┐     decode (≤ 500 ms) ──idle──┐
//!        │                 check flag       │               check flag
//!        ▼                                  ▼
//!   set read timeout                   delivery(active, payload)
//!   negotiate ──None──> close
//!        │ Some(session)
//!        ▼
//!   pool.submit(worker) ──full──> close
//! ```
//!
//! Closing runs in two phases. The interrupt flag is raised and the pool is
//! force-stopped, then the accept thread is joined and the pool is awaited
//! until every worker has closed its connection.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use super::pool::WorkerPool;
use super::worker::Worker;
use super::ShutdownError;
use crate::codec::Payload;
use crate::control::types::POLL_TIMEOUT;
use crate::control::{
    AnonymousServer, ConnectionId, Delivery, NamedServer, ServerHandshake, SignalRegistry,
};
use crate::net::socket::set_recv_buffer_size;
use crate::net::{Endpoint, Listener};
use crate::trace::{debug, error, info, warn};

/// Configuration for an [`InputSignal`].
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Connections served at once; further ones are closed after negotiation.
    pub max_workers: usize,
    /// Bound on waiting for workers during close. `None` waits until drained.
    pub shutdown_timeout: Option<Duration>,
    /// `SO_RCVBUF` for the listening socket, inherited by accepted sockets.
    pub recv_buffer_size: Option<usize>,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            max_workers: 64,
            shutdown_timeout: None,
            recv_buffer_size: None,
        }
    }
}

/// Error opening an [`InputSignal`].
#[derive(Debug, Error)]
pub enum AcceptorError {
    /// Failed to bind the listening socket.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        source: io::Error,
    },
    /// Failed to configure the bound socket.
    #[error("failed to configure listener: {0}")]
    Listener(io::Error),
    /// Failed to start the accept thread.
    #[error("failed to spawn accept thread: {0}")]
    Spawn(io::Error),
}

/// A listening endpoint that dispatches each negotiated connection to a
/// worker.
///
/// The accept loop starts as soon as [`open`](Self::open) returns. Dropping
/// without [`close`](Self::close) raises the interrupt flag but does not wait;
/// threads wind down on their own within one poll interval.
pub struct InputSignal<H> {
    local: Endpoint,
    handshake: Arc<H>,
    interrupt: Arc<AtomicBool>,
    pool: Arc<WorkerPool>,
    // Cleared by the accept thread as its last action.
    running: Arc<AtomicBool>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    // Held for the whole of close so concurrent callers return together.
    closing: Mutex<()>,
    config: AcceptorConfig,
}

/// Clears the liveness flag when the accept thread ends, panics included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Named input endpoint routing by `domain.signal`.
pub type SignalServer<T> = InputSignal<NamedServer<T>>;

/// Anonymous input endpoint feeding one replaceable callback.
pub type SignalReceiver<T> = InputSignal<AnonymousServer<T>>;

impl<H: ServerHandshake> InputSignal<H> {
    /// Binds `endpoint` and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or configured, or the
    /// accept thread cannot be started.
    pub fn open(
        endpoint: Endpoint,
        handshake: H,
        config: AcceptorConfig,
    ) -> Result<Self, AcceptorError> {
        let listener = Listener::bind(endpoint).map_err(|source| {
            error!(%endpoint, error = %source, "failed to bind listener");
            AcceptorError::Bind { endpoint, source }
        })?;
        if let Some(size) = config.recv_buffer_size {
            set_recv_buffer_size(&listener, size).map_err(AcceptorError::Listener)?;
        }
        let local = listener.local_addr().map_err(AcceptorError::Listener)?;

        let interrupt = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(WorkerPool::new(config.max_workers, Arc::clone(&interrupt)));
        let handshake = Arc::new(handshake);

        let accept = AcceptLoop {
            listener,
            handshake: Arc::clone(&handshake),
            pool: Arc::clone(&pool),
            interrupt: Arc::clone(&interrupt),
        };
        let running = Arc::new(AtomicBool::new(true));
        let guard = RunningGuard(Arc::clone(&running));
        let handle = thread::Builder::new()
            .name("beacon-accept".into())
            .spawn(move || {
                let _guard = guard;
                info!("accept thread started");
                accept.run();
                info!("accept thread exiting");
            })
            .map_err(AcceptorError::Spawn)?;

        info!(%local, max_workers = config.max_workers, "input signal listening");

        Ok(Self {
            local,
            handshake,
            interrupt,
            pool,
            running,
            accept_handle: Mutex::new(Some(handle)),
            closing: Mutex::new(()),
            config,
        })
    }

    /// True while the accept thread is running, including while a
    /// [`close`](Self::close) is still waiting for it.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, with the OS-chosen port if bound to
    /// port 0.
    #[must_use]
    pub const fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    /// Number of connection workers currently running.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.pool.active_count()
    }

    /// Stops accepting, interrupts every worker and waits for all of them to
    /// finish. Idempotent; a call made while another is in progress waits for
    /// it and then returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Timeout`] if workers outlast
    /// `shutdown_timeout`, or [`ShutdownError::Panicked`] if the accept
    /// thread panicked. Shutdown proceeds as far as it can either way.
    pub fn close(&self) -> Result<(), ShutdownError> {
        let _closing = self.closing.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = self
            .accept_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        info!(local = %self.local, "input signal closing");
        self.interrupt.store(true, Ordering::Release);
        self.pool.shutdown_now();

        debug!("waiting for accept thread to exit");
        let accept_result = handle.join().map_err(|_| {
            error!("accept thread panicked");
            ShutdownError::Panicked("beacon-accept")
        });

        debug!(active = self.pool.active_count(), "waiting for workers to exit");
        if let Err(e) = self.pool.await_termination(self.config.shutdown_timeout) {
            warn!(error = %e, "workers still running after close");
            return Err(e);
        }

        info!(local = %self.local, "input signal closed");
        accept_result
    }
}

impl<T: Payload> InputSignal<NamedServer<T>> {
    /// Opens a named endpoint routing through `registry`.
    ///
    /// # Errors
    ///
    /// See [`InputSignal::open`].
    pub fn bind(endpoint: Endpoint, registry: SignalRegistry<T>) -> Result<Self, AcceptorError> {
        Self::open(endpoint, NamedServer::new(registry), AcceptorConfig::default())
    }

    /// Routing table consulted by each new connection.
    #[must_use]
    pub fn registry(&self) -> &SignalRegistry<T> {
        self.handshake.registry()
    }
}

impl<T: Payload> InputSignal<AnonymousServer<T>> {
    /// Opens an anonymous endpoint. Connections are rejected until a callback
    /// is set.
    ///
    /// # Errors
    ///
    /// See [`InputSignal::open`].
    pub fn bind(endpoint: Endpoint) -> Result<Self, AcceptorError> {
        Self::open(endpoint, AnonymousServer::new(), AcceptorConfig::default())
    }

    /// Sets the callback for connections accepted from now on.
    pub fn set_delivery(&self, delivery: Delivery<T>) {
        self.handshake.set_delivery(delivery);
    }
}

impl<H> Drop for InputSignal<H> {
    fn drop(&mut self) {
        // Signal shutdown if not already done; joining is left to close().
        self.interrupt.store(true, Ordering::Release);
        self.pool.shutdown_now();
    }
}

struct AcceptLoop<H> {
    listener: Listener,
    handshake: Arc<H>,
    pool: Arc<WorkerPool>,
    interrupt: Arc<AtomicBool>,
}

impl<H: ServerHandshake> AcceptLoop<H> {
    fn run(mut self) {
        while !self.interrupt.load(Ordering::Acquire) {
            match self.listener.accept_timeout(POLL_TIMEOUT) {
                Ok(None) => {}
                Ok(Some((stream, peer))) => self.dispatch(stream, peer),
                Err(_e) => {
                    error!(error = %_e, "accept failed, stopping accept loop");
                    break;
                }
            }
        }
        // Dropping self closes the listener.
    }

    fn dispatch(&self, stream: std::net::TcpStream, peer: Endpoint) {
        let id = ConnectionId::generate();
        debug!(connection = %id, %peer, "accepted connection");

        if let Err(_e) = stream.set_read_timeout(Some(POLL_TIMEOUT)) {
            warn!(connection = %id, error = %_e, "failed to set read timeout, closing");
            return;
        }

        let Some(session) = self.handshake.negotiate(stream) else {
            debug!(connection = %id, %peer, "negotiation rejected connection");
            return;
        };

        let worker = Worker::new(id, peer, session, Arc::clone(&self.interrupt));
        if let Err(_e) = self.pool.submit(move || {
            worker.run();
        }) {
            // The rejected job owned the connection; it is closed on drop.
            warn!(connection = %id, %peer, error = %_e, "no worker for connection, closing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{SignalEncoder, SignalMessage};
    use crate::control::{InboundSession, delivery};
    use crate::net::socket::connect;
    use std::io::Read;
    use std::sync::mpsc;
    use std::time::Instant;

    fn receiver() -> (SignalReceiver<u32>, mpsc::Receiver<(bool, Option<u32>)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let input = SignalReceiver::<u32>::bind(Endpoint::localhost(0)).unwrap();
        input.set_delivery(delivery(move |active, value| {
            let _ = tx.lock().unwrap().send((active, value));
        }));
        (input, rx)
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn open_binds_ephemeral_port_and_runs() {
        let (input, _rx) = receiver();
        assert_ne!(input.local_endpoint().port(), 0);
        assert!(input.is_alive());
        input.close().unwrap();
        assert!(!input.is_alive());
    }

    #[test]
    fn bind_conflict_is_reported() {
        let (input, _rx) = receiver();
        let err = SignalReceiver::<u32>::bind(input.local_endpoint()).err().unwrap();
        assert!(matches!(err, AcceptorError::Bind { .. }));
        input.close().unwrap();
    }

    #[test]
    fn delivers_from_accepted_connection() {
        let (input, rx) = receiver();
        let mut enc = SignalEncoder::new(connect(input.local_endpoint()).unwrap());
        enc.write(&SignalMessage::active_with(42u32)).unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            (true, Some(42))
        );
        input.close().unwrap();
    }

    #[test]
    fn rejected_connection_is_closed() {
        let input = SignalReceiver::<u32>::bind(Endpoint::localhost(0)).unwrap();
        let mut stream = connect(input.local_endpoint()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
        assert_eq!(input.active_workers(), 0);
        input.close().unwrap();
    }

    #[test]
    fn overflow_beyond_max_workers_is_rejected() {
        let handshake = AnonymousServer::<u32>::with_delivery(delivery(|_, _| {}));
        let config = AcceptorConfig {
            max_workers: 1,
            ..AcceptorConfig::default()
        };
        let input = InputSignal::open(Endpoint::localhost(0), handshake, config).unwrap();

        let _first = connect(input.local_endpoint()).unwrap();
        assert!(wait_for(|| input.active_workers() == 1));

        let mut second = connect(input.local_endpoint()).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(second.read(&mut buf), Ok(0) | Err(_)));
        assert_eq!(input.active_workers(), 1);

        input.close().unwrap();
    }

    #[test]
    fn close_terminates_all_workers() {
        let (input, _rx) = receiver();
        let clients: Vec<_> = (0..4)
            .map(|_| connect(input.local_endpoint()).unwrap())
            .collect();
        assert!(wait_for(|| input.active_workers() == 4));

        let start = Instant::now();
        input.close().unwrap();
        assert!(start.elapsed() < POLL_TIMEOUT * 4);
        assert_eq!(input.active_workers(), 0);
        assert!(!input.is_alive());

        for mut client in clients {
            client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut buf = [0u8; 1];
            assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        }

        // Second close is a no-op.
        input.close().unwrap();
    }

    #[test]
    fn listener_is_released_after_close() {
        let (input, _rx) = receiver();
        let endpoint = input.local_endpoint();
        input.close().unwrap();
        drop(input);

        let again = SignalReceiver::<u32>::bind(endpoint).unwrap();
        again.close().unwrap();
    }

    /// Holds the accept thread inside negotiation until released.
    struct StallingHandshake {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl ServerHandshake for StallingHandshake {
        type Payload = u32;

        fn negotiate(&self, _stream: std::net::TcpStream) -> Option<InboundSession<u32>> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            None
        }
    }

    #[test]
    fn close_in_progress_keeps_alive_and_holds_second_close() {
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        let handshake = StallingHandshake {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let input =
            InputSignal::open(Endpoint::localhost(0), handshake, AcceptorConfig::default())
                .unwrap();

        let _client = connect(input.local_endpoint()).unwrap();
        entered.recv_timeout(Duration::from_secs(2)).unwrap();
        let input = &input;

        thread::scope(|s| {
            let first = s.spawn(|| input.close());
            thread::sleep(Duration::from_millis(100));
            assert!(input.is_alive(), "accept thread is still negotiating");

            let (done_tx, done) = mpsc::channel();
            let second = s.spawn(move || {
                let result = input.close();
                let _ = done_tx.send(());
                result
            });
            assert!(
                done.recv_timeout(Duration::from_millis(100)).is_err(),
                "second close returned before the first finished"
            );
            assert!(input.is_alive());

            release.send(()).unwrap();
            assert!(first.join().unwrap().is_ok());
            assert!(second.join().unwrap().is_ok());
        });
        assert!(!input.is_alive());
    }
}
