//! Bounded thread-per-job pool scoped to one acceptor.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use super::ShutdownError;
use crate::trace::{debug, warn};

/// Errors submitting work to a [`WorkerPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// All worker slots are taken; the job was not started.
    #[error("worker pool is full ({max} workers)")]
    Full { max: usize },
    /// The pool has been shut down.
    #[error("worker pool is shut down")]
    Shutdown,
    /// The OS refused to start a thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

struct Counts {
    live: usize,
    accepting: bool,
}

struct PoolState {
    counts: Mutex<Counts>,
    drained: Condvar,
}

impl PoolState {
    fn counts(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a worker slot when the worker's thread finishes, panics included.
struct SlotGuard(Arc<PoolState>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut counts = self.0.counts();
        counts.live -= 1;
        if counts.live == 0 {
            self.0.drained.notify_all();
        }
    }
}

/// Runs each job on its own named thread, up to `max_workers` at once.
///
/// Overflow is rejected rather than queued. Force-stopping sets the shared
/// interrupt flag; jobs are expected to poll it.
pub struct WorkerPool {
    max_workers: usize,
    state: Arc<PoolState>,
    interrupt: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    #[must_use]
    pub fn new(max_workers: usize, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            max_workers,
            state: Arc::new(PoolState {
                counts: Mutex::new(Counts {
                    live: 0,
                    accepting: true,
                }),
                drained: Condvar::new(),
            }),
            interrupt,
            handles: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Starts `job` on a new worker thread and returns the worker's id.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Full`] at capacity, [`PoolError::Shutdown`] after
    /// [`shutdown_now`](Self::shutdown_now), or [`PoolError::Spawn`] if the
    /// thread cannot be created.
    pub fn submit<F>(&self, job: F) -> Result<u64, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = {
            let mut counts = self.state.counts();
            if !counts.accepting {
                return Err(PoolError::Shutdown);
            }
            if counts.live >= self.max_workers {
                return Err(PoolError::Full {
                    max: self.max_workers,
                });
            }
            counts.live += 1;
            SlotGuard(Arc::clone(&self.state))
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // On spawn failure the closure, and with it the guard, is dropped.
        let handle = thread::Builder::new()
            .name(format!("beacon-worker-{id}"))
            .spawn(move || {
                let _slot = guard;
                job();
            })?;

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        reap(&mut handles);
        handles.push(handle);
        Ok(id)
    }

    /// Number of workers currently running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.counts().live
    }

    /// Stops accepting jobs and raises the interrupt flag for running ones.
    pub fn shutdown_now(&self) {
        self.state.counts().accepting = false;
        self.interrupt.store(true, Ordering::Release);
        debug!(active = self.active_count(), "worker pool force-stopped");
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        !self.state.counts().accepting
    }

    /// Blocks until every worker has finished, then joins their threads.
    /// `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Timeout`] if workers are still running when
    /// `timeout` elapses.
    pub fn await_termination(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
        let counts = self.state.counts();
        match timeout {
            None => {
                let _counts = self
                    .state
                    .drained
                    .wait_while(counts, |c| c.live > 0)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(timeout) => {
                let (counts, result) = self
                    .state
                    .drained
                    .wait_timeout_while(counts, timeout, |c| c.live > 0)
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() {
                    return Err(ShutdownError::Timeout {
                        waited: timeout,
                        remaining: counts.live,
                    });
                }
            }
        }

        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let _name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                warn!(thread = ?_name, "worker panicked");
            }
        }
        Ok(())
    }
}

fn reap(handles: &mut Vec<JoinHandle<()>>) {
    handles.retain(|h| !h.is_finished());
}
