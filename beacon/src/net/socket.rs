//! TCP socket helpers for signal endpoints.
//!
//! [`Listener`] pairs a non-blocking [`std::net::TcpListener`] with a mio
//! [`Poll`] so the accept loop can wait for a connection with a deadline and
//! still notice shutdown. Accepted and connected streams are plain blocking
//! [`TcpStream`]s with read timeouts, which is what the frame codec expects.

use std::io::{self, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token};

use super::Endpoint;

const LISTENER: Token = Token(0);

/// A listening socket with a bounded-wait accept.
pub struct Listener {
    inner: TcpListener,
    /// Registration handle for `inner`; shares its file description.
    registered: MioTcpListener,
    poll: Poll,
    events: Events,
}

impl Listener {
    /// Binds a listening socket to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is in use or the poller cannot be
    /// created.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = TcpListener::bind(endpoint.as_socket_addr())?;
        inner.set_nonblocking(true)?;

        let mut registered = MioTcpListener::from_std(inner.try_clone()?);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut registered, LISTENER, Interest::READABLE)?;

        Ok(Self {
            inner,
            registered,
            poll,
            events: Events::with_capacity(8),
        })
    }

    /// Returns the local address this listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Waits up to `timeout` for an incoming connection.
    ///
    /// Returns `Ok(None)` when the wait elapses with nothing to accept. The
    /// returned stream is in blocking mode.
    ///
    /// # Errors
    ///
    /// Returns an error if polling or accepting fails for any reason other
    /// than the wait elapsing.
    pub fn accept_timeout(&mut self, timeout: Duration) -> io::Result<Option<(TcpStream, Endpoint)>> {
        // Accept before polling: mio is edge-triggered, and only a WouldBlock
        // from accept guarantees the next readiness edge will be reported.
        if let Some(accepted) = self.try_accept()? {
            return Ok(Some(accepted));
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }

        self.try_accept()
    }

    fn try_accept(&self) -> io::Result<Option<(TcpStream, Endpoint)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => {
                // Some platforms hand out sockets inheriting O_NONBLOCK.
                stream.set_nonblocking(false)?;
                Ok(Some((stream, Endpoint::from(addr))))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.poll.registry().deregister(&mut self.registered);
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

/// Opens a blocking connection to `endpoint`.
///
/// # Errors
///
/// Returns an error if the connection is refused or unreachable.
pub fn connect(endpoint: Endpoint) -> io::Result<TcpStream> {
    TcpStream::connect(endpoint.as_socket_addr())
}

/// Sets the socket's send buffer size.
///
/// # Errors
///
/// Returns an error if the option cannot be set.
pub fn set_send_buffer_size(fd: impl AsFd, size: usize) -> io::Result<()> {
    rustix::net::sockopt::set_socket_send_buffer_size(fd, size)?;
    Ok(())
}

/// Sets the socket's receive buffer size.
///
/// # Errors
///
/// Returns an error if the option cannot be set.
pub fn set_recv_buffer_size(fd: impl AsFd, size: usize) -> io::Result<()> {
    rustix::net::sockopt::set_socket_recv_buffer_size(fd, size)?;
    Ok(())
}
