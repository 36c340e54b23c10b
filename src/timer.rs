//! Deadline scheduling for transactions.
//!
//! The dispatcher never wakes up for time: it blocks on readiness only. Query
//! deadlines are enforced from a separate `dns-timer` thread that drives a
//! current-thread tokio runtime, so thousands of pending queries cost one
//! sleeping task each instead of one thread each.

use std::io;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

pub struct Timer {
    handle: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cancels a scheduled callback.
#[derive(Debug)]
pub struct TimerHandle(AbortHandle);

impl TimerHandle {
    /// Prevent the callback from running if it has not started yet.
    pub fn cancel(self) {
        self.0.abort();
    }
}

impl Timer {
    pub fn start() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_time().build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("dns-timer".into())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                debug!("timer thread stopped");
            })?;

        Ok(Self {
            handle,
            stop: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `f` on the timer thread once `deadline` has passed.
    ///
    /// Callbacks run no earlier than the deadline; a deadline in the past
    /// fires on the next turn of the timer thread.
    pub fn schedule<F>(&self, deadline: Instant, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = tokio::time::Instant::from_std(deadline);
        let task = self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            f();
        });
        TimerHandle(task.abort_handle())
    }

    /// Stop the timer thread; pending callbacks are dropped without running.
    pub fn shutdown(&self) {
        if let Some(stop) = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = stop.send(());
        }
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
