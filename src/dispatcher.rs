//! The readiness loop.
//!
//! One `dns-dispatch` thread owns the poller and every registered socket.
//! Other threads never touch a socket directly: they [`submit`] tasks, which
//! are queued and run on the dispatcher thread at the top of its next turn.
//! Submitting wakes the poller, so the loop can block on readiness with no
//! timeout at all.
//!
//! [`submit`]: Dispatcher::submit

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use mio::event::Event;
use mio::{Events, Poll, Token, Waker};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::stats::Stats;
use crate::timer::Timer;
use crate::transport::{Connection, ConnectionListener, RECV_BUFFER_SIZE, State};

const WAKE_TOKEN: Token = Token(0);

const EVENTS_CAPACITY: usize = 1024;

type Task = Box<dyn FnOnce(&mut Reactor) + Send>;

/// Handle to a running dispatcher. Cheap to clone.
///
/// Each dispatcher is an independent instance; nothing is process-global.
///
/// Dropping handles does not stop it. The `dns-dispatch` and `dns-timer`
/// threads, and every socket they own, live until [`shutdown`] is called
/// on any clone. Connections and timers hold clones of their own, so the
/// owner that created the dispatcher must shut it down when done:
///
/// ```no_run
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dispatcher = nioresolv::Dispatcher::new()?;
/// let resolver = nioresolv::Resolver::new(
///     nioresolv::ResolverConfig::from_host("127.0.0.1", 53)?,
///     dispatcher.clone(),
/// );
/// // ... use the resolver ...
/// drop(resolver);
/// dispatcher.shutdown();
/// # Ok(())
/// # }
/// ```
///
/// [`shutdown`]: Self::shutdown
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<TaskQueue>,
    waker: Waker,
    running: AtomicBool,
    next_token: AtomicUsize,
    thread_id: OnceLock<ThreadId>,
    thread: Mutex<Option<JoinHandle<()>>>,
    timer: Timer,
    stats: Arc<Stats>,
}

#[derive(Default)]
struct TaskQueue {
    tasks: VecDeque<Task>,
    closed: bool,
}

impl Dispatcher {
    /// Open the poller and start the dispatcher and timer threads.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let timer = Timer::start()?;

        let inner = Arc::new(Inner {
            queue: Mutex::new(TaskQueue::default()),
            waker,
            running: AtomicBool::new(true),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            thread_id: OnceLock::new(),
            thread: Mutex::new(None),
            timer,
            stats: Arc::new(Stats::new()),
        });

        let thread = thread::Builder::new().name("dns-dispatch".into()).spawn({
            let inner = inner.clone();
            move || inner.run(poll)
        })?;
        *lock(&inner.thread) = Some(thread);

        debug!("dispatcher started");
        Ok(Self { inner })
    }

    /// Queue `task` to run on the dispatcher thread and wake the poller.
    ///
    /// Tasks run in submission order, each to completion. Safe to call from
    /// any thread, the dispatcher thread included.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        {
            let mut queue = lock(&self.inner.queue);
            if queue.closed {
                return Err(Error::Shutdown);
            }
            queue.tasks.push_back(Box::new(task));
        }
        if let Err(e) = self.inner.waker.wake() {
            warn!(error = %e, "failed to wake dispatcher");
        }
        Ok(())
    }

    /// True when called from this dispatcher's own thread.
    pub fn is_dispatch_thread(&self) -> bool {
        self.inner.thread_id.get() == Some(&thread::current().id())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Allocate a token for a new connection.
    pub(crate) fn next_token(&self) -> Token {
        Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.inner.stats
    }

    /// Stop the loop, close every connection and stop the timer.
    ///
    /// Queries still in flight are completed with [`Error::Shutdown`].
    /// Idempotent; when called from the dispatcher thread the loop stops at
    /// the end of the current turn.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("dispatcher shutting down");
        if let Err(e) = self.inner.waker.wake() {
            warn!(error = %e, "failed to wake dispatcher");
        }
        if !self.is_dispatch_thread() {
            if let Some(thread) = lock(&self.inner.thread).take() {
                let _ = thread.join();
            }
        }
        self.inner.timer.shutdown();
    }
}

impl Inner {
    fn run(&self, poll: Poll) {
        let _ = self.thread_id.set(thread::current().id());
        let mut reactor = Reactor::new(poll, self.stats.clone());
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while self.running.load(Ordering::Acquire) {
            self.run_tasks(&mut reactor);
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = reactor.poll.poll(&mut events, None) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(error = %e, "poll failed");
                }
                continue;
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                isolate("event", || reactor.dispatch(event));
            }
        }

        // Refuse new work, finish what was already accepted, then fail
        // everything still connected.
        let remaining = {
            let mut queue = lock(&self.queue);
            queue.closed = true;
            std::mem::take(&mut queue.tasks)
        };
        for task in remaining {
            isolate("task", || task(&mut reactor));
        }
        reactor.close_all(Error::Shutdown);
        debug!("dispatcher stopped");
    }

    fn run_tasks(&self, reactor: &mut Reactor) {
        loop {
            let task = lock(&self.queue).tasks.pop_front();
            let Some(task) = task else {
                break;
            };
            isolate("task", || task(reactor));
        }
    }
}

/// Run one handler, logging and swallowing a panic so that a single bad
/// connection cannot take the loop down.
fn isolate(what: &str, f: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        error!(what, panic = message, "dispatcher handler panicked");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dispatcher-thread state: the poller and every open connection.
///
/// Only reachable from tasks, so only ever used on the dispatcher thread.
pub struct Reactor {
    poll: Poll,
    entries: FxHashMap<Token, Entry>,
    scratch: Vec<u8>,
    stats: Arc<Stats>,
}

struct Entry {
    conn: Connection,
    listener: Box<dyn ConnectionListener>,
}

impl Reactor {
    fn new(poll: Poll, stats: Arc<Stats>) -> Self {
        Self {
            poll,
            entries: FxHashMap::default(),
            scratch: vec![0u8; RECV_BUFFER_SIZE],
            stats,
        }
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    /// Open `conn` and attach `listener` to it.
    ///
    /// A connect failure is reported to the listener through `closed`.
    pub(crate) fn open(&mut self, mut conn: Connection, listener: Box<dyn ConnectionListener>) {
        let token = conn.token();
        match conn.connect(self.poll.registry()) {
            Ok(()) => {
                trace!(token = token.0, local = %conn.local_addr(), "connection registered");
                self.stats.record_connection(conn.bind_retries());
            }
            Err(e) => {
                warn!(token = token.0, transport = %conn.transport(), error = %e, "failed to open connection");
                conn.fail(e);
            }
        }
        self.entries.insert(token, Entry { conn, listener });
        self.reap(token);
    }

    /// Run `f` against an open connection; `None` if it no longer exists.
    pub(crate) fn with_connection<R>(
        &mut self,
        token: Token,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        let result = self.entries.get_mut(&token).map(|entry| f(&mut entry.conn));
        self.reap(token);
        result
    }

    pub(crate) fn close(&mut self, token: Token) {
        if let Some(entry) = self.entries.get_mut(&token) {
            entry.conn.close();
        }
        self.reap(token);
    }

    fn dispatch(&mut self, event: &Event) {
        let token = event.token();
        let Some(entry) = self.entries.get_mut(&token) else {
            trace!(token = token.0, "event for a connection that is already gone");
            return;
        };
        let Entry { conn, listener } = entry;

        if event.is_writable() || event.is_error() {
            conn.do_connect();
        }
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            for message in conn.do_read(&mut self.scratch) {
                listener.data_available(message, conn);
            }
        }
        if event.is_writable() {
            conn.do_write();
        }
        self.reap(token);
    }

    /// Finish closing `token` if its connection asked to be closed.
    fn reap(&mut self, token: Token) {
        let closing = self
            .entries
            .get(&token)
            .is_some_and(|entry| entry.conn.state() == State::Closing);
        if !closing {
            return;
        }
        if let Some(mut entry) = self.entries.remove(&token) {
            let cause = entry.conn.finish_close(self.poll.registry());
            entry.listener.closed(cause);
        }
    }

    fn close_all(&mut self, cause: Error) {
        for (_, mut entry) in self.entries.drain() {
            entry.conn.close();
            let own = entry.conn.finish_close(self.poll.registry());
            entry.listener.closed(Some(own.unwrap_or_else(|| cause.clone())));
        }
    }
}
