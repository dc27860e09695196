//! Connection negotiation and signal routing.
//!
//! A connection is negotiated once, right after connect/accept. The server
//! side decides where the connection's messages are delivered; the client
//! side yields the encoder an output endpoint writes through.

pub mod handshake;
pub mod registry;
pub mod types;

pub use handshake::{
    AnonymousClient, AnonymousServer, ClientHandshake, NamedClient, NamedServer, ServerHandshake,
};
pub use registry::SignalRegistry;
pub use types::{
    ConnectionError, ConnectionId, Delivery, InboundSession, POLL_TIMEOUT, delivery,
    qualified_name,
};
