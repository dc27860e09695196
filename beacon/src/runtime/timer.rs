//! Single-slot revert timer.
//!
//! Each output endpoint owns one [`RevertTimer`]: a dedicated thread holding at
//! most one pending task. Arming replaces whatever was pending; disarming
//! drops it unrun. Shutdown discards the slot, so nothing fires afterwards.

use std::io;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use minstant::Instant;

use super::ShutdownError;
use crate::trace::{debug, trace};

/// Work run when a pending deadline passes.
pub type RevertTask = Box<dyn FnOnce() + Send>;

enum TimerCommand {
    Arm { deadline: Instant, task: RevertTask },
    Disarm,
    Shutdown,
}

/// Owned handle to a single-task scheduler thread.
pub struct RevertTimer {
    // Unbounded: senders hold the endpoint lock that a running task waits on.
    commands: Sender<TimerCommand>,
    // Disconnects when the thread exits; lets shutdown wait with a bound.
    exited: Receiver<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RevertTimer {
    /// Starts the scheduler thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn() -> io::Result<Self> {
        let (commands, inbox) = unbounded();
        let (exit_guard, exited) = crossbeam_channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("beacon-decay".into())
            .spawn(move || {
                let _exit_guard = exit_guard;
                trace!("decay thread started");
                run(&inbox);
                trace!("decay thread exiting");
            })?;

        Ok(Self {
            commands,
            exited,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Cancels any pending task and schedules `task` after `delay`.
    ///
    /// A `delay` too large to represent as a deadline never fires.
    pub fn replace<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            // Beyond the clock's range: the pending task is dropped and
            // nothing will ever fire.
            trace!(delay_secs = delay.as_secs(), "decay delay out of range");
            self.cancel();
            return;
        };
        // Send fails only after shutdown, when nothing may fire anyway.
        let _ = self.commands.send(TimerCommand::Arm {
            deadline,
            task: Box::new(task),
        });
    }

    /// Drops the pending task, if any, without running it.
    pub fn cancel(&self) {
        let _ = self.commands.send(TimerCommand::Disarm);
    }

    /// True once the scheduler thread has exited.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Stops the scheduler, discarding any pending task, and waits for its
    /// thread to exit. `None` waits indefinitely. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Timeout`] if a running task outlasts
    /// `timeout`, or [`ShutdownError::Panicked`] if the thread panicked.
    pub fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
        let _ = self.commands.send(TimerCommand::Shutdown);

        let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        if let Some(timeout) = timeout
            && let Err(RecvTimeoutError::Timeout) = self.exited.recv_timeout(timeout)
        {
            debug!(timeout_ms = timeout.as_millis() as u64, "decay thread did not exit in time");
            return Err(ShutdownError::Timeout {
                waited: timeout,
                remaining: 1,
            });
        }

        handle
            .join()
            .map_err(|_| ShutdownError::Panicked("beacon-decay"))
    }
}

impl Drop for RevertTimer {
    fn drop(&mut self) {
        // Stop the thread; joining is left to an explicit shutdown.
        let _ = self.commands.send(TimerCommand::Shutdown);
    }
}

fn run(inbox: &Receiver<TimerCommand>) {
    let mut pending: Option<(Instant, RevertTask)> = None;

    loop {
        let command = match &pending {
            Some((deadline, _)) => {
                inbox.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(TimerCommand::Arm { deadline, task }) => pending = Some((deadline, task)),
            Ok(TimerCommand::Disarm) => pending = None,
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                if pending.is_some() {
                    trace!("discarding pending decay on shutdown");
                }
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some((_, task)) = pending.take() {
                    task();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn fires_once_after_delay() {
        let timer = RevertTimer::spawn().unwrap();
        let (tx, rx) = mpsc::channel();
        let start = std::time::Instant::now();

        timer.replace(Duration::from_millis(50), move || tx.send(()).unwrap());

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
        timer.shutdown(None).unwrap();
    }

    #[test]
    fn replace_supersedes_pending_task() {
        let timer = RevertTimer::spawn().unwrap();
        let (tx, rx) = mpsc::channel();

        let first = tx.clone();
        timer.replace(Duration::from_millis(50), move || first.send("first").unwrap());
        timer.replace(Duration::from_millis(100), move || tx.send("second").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "second");
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        timer.shutdown(None).unwrap();
    }

    #[test]
    fn cancel_drops_pending_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = RevertTimer::spawn().unwrap();

        let counter = Arc::clone(&fired);
        timer.replace(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.shutdown(None).unwrap();
    }

    #[test]
    fn shutdown_discards_pending_and_terminates() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = RevertTimer::spawn().unwrap();

        let counter = Arc::clone(&fired);
        timer.replace(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.shutdown(Some(Duration::from_secs(1))).unwrap();
        assert!(timer.is_terminated());

        // Arming after shutdown is a no-op.
        let counter = Arc::clone(&fired);
        timer.replace(Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.shutdown(None).unwrap();
    }

    #[test]
    fn shutdown_times_out_behind_a_stuck_task() {
        let timer = RevertTimer::spawn().unwrap();
        let (release, wait) = mpsc::channel::<()>();
        let (started_tx, started) = mpsc::channel();

        timer.replace(Duration::ZERO, move || {
            started_tx.send(()).unwrap();
            let _ = wait.recv();
        });
        started.recv_timeout(Duration::from_secs(2)).unwrap();

        let err = timer.shutdown(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, ShutdownError::Timeout { .. }));
        drop(release);
    }

    #[test]
    fn unrepresentable_delay_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = RevertTimer::spawn().unwrap();

        let counter = Arc::clone(&fired);
        timer.replace(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&fired);
        timer.replace(Duration::MAX, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.shutdown(None).unwrap();
    }
}
