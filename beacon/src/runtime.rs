//! Threads behind the endpoints.
//!
//! - `acceptor`: input endpoint with its accept thread and worker pool.
//! - `worker`: per-connection decode loop.
//! - `pool`: bounded worker pool with drain-on-close.
//! - `emitter`: output endpoint with its revert timer.
//! - `timer`: single-slot decay scheduler.

pub mod acceptor;
pub mod emitter;
pub mod pool;
pub mod timer;
pub mod worker;

use std::time::Duration;

pub use acceptor::{AcceptorConfig, AcceptorError, InputSignal, SignalReceiver, SignalServer};
pub use emitter::{EmitterConfig, OutputSignal, SignalError};
pub use pool::{PoolError, WorkerPool};
pub use timer::RevertTimer;
pub use worker::{Worker, WorkerExit};

/// Error waiting for endpoint threads during close.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// Threads were still running when the bound elapsed.
    #[error("{remaining} thread(s) still running after {waited:?}")]
    Timeout { waited: Duration, remaining: usize },
    /// A thread exited by panicking.
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}
