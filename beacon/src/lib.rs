//! Boolean signal transport between processes.
//!
//! An [`OutputSignal`] connects to an [`InputSignal`] and writes status
//! changes: `emit` activates with a value and reverts after a duration,
//! `sustain` activates until changed, `deactivate` clears. The input side
//! accepts connections, negotiates each one and hands it to a worker that
//! delivers `(active, payload)` to an application callback.
//!
//! ```no_run
//! use std::time::Duration;
//! use beacon::{Endpoint, OutputSignal, SignalRegistry, SignalServer, delivery};
//!
//! let registry = SignalRegistry::<String>::new();
//! registry.register("CD1", "X", delivery(|active, value| println!("{active} {value:?}")));
//! let server = SignalServer::bind(Endpoint::localhost(0), registry)?;
//!
//! let output = OutputSignal::<String>::connect(server.local_endpoint(), "CD1", "X")?;
//! output.emit("hello".into(), Duration::from_millis(200))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod codec;
pub mod control;
pub mod net;
pub mod runtime;
mod trace;

pub use codec::{CodecError, Payload, SignalMessage};
pub use control::{
    ConnectionError, Delivery, SignalRegistry, delivery, qualified_name,
};
pub use net::Endpoint;
pub use runtime::{
    AcceptorConfig, AcceptorError, EmitterConfig, InputSignal, OutputSignal, ShutdownError,
    SignalError, SignalReceiver, SignalServer,
};
pub use trace::init_tracing;

// Re-export serde traits for payload types.
pub use serde::{Deserialize, Serialize};
