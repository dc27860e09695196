//! Addresses of signal endpoints.
//!
//! An input signal binds an [`Endpoint`] and an output signal connects to one.
//! Binding port 0 lets the OS pick a free port; the chosen address is then
//! read back from `InputSignal::local_endpoint` and handed to the senders.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

/// Where an input signal listens, or where an output signal sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Listen on every interface. Used by receivers reachable from other
    /// hosts.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Loopback only. With port 0 this is the usual choice for tests and
    /// same-host wiring.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Looks up a peer host by IP literal or DNS name. The first address
    /// returned wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails or finds nothing.
    pub fn resolve(host: &str, port: u16) -> io::Result<Self> {
        let mut addrs = (host, port).to_socket_addrs()?;
        addrs.next().map(Self).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host} did not resolve to any address"),
            )
        })
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Zero only for an unbound request; a listening endpoint always reports
    /// its real port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

/// Parses `ip:port`. Host names go through [`Endpoint::resolve`].
impl std::str::FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
