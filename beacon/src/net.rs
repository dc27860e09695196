//! Network transport primitives.
//!
//! TCP listeners and streams for signal endpoints. Blocking streams with read
//! timeouts carry the signal frames; only the accept path is poll-based.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::Listener;
