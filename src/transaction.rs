//! Bookkeeping for one outstanding query.
//!
//! A [`Completion`] is the part of a query that outlives any particular
//! connection: the caller's completion target, the deadline timer and what
//! to release when the deadline wins. It is shared between the connection
//! side (dispatcher thread) and the timer thread, and delivers at most once:
//! whichever of reply, error or timeout gets there first is the result.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use hickory_proto::op::Message;
use tracing::{debug, error, trace};

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::queue::ResponseQueue;
use crate::response::{QueryId, Response};
use crate::stats::Stats;
use crate::timer::{Timer, TimerHandle};
use crate::transport::{Connection, ConnectionListener, Transport, udp};
use crate::wire::{self, Signer};

/// Where a finished query's [`Response`] goes.
pub enum CompletionTarget {
    /// Inserted into a handoff queue.
    Queue(Arc<ResponseQueue>),
    /// Passed to a callback, which runs on a freshly spawned thread so the
    /// engine's own threads never execute caller code.
    Callback(Box<dyn FnOnce(Response) + Send>),
}

impl CompletionTarget {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Response) + Send + 'static,
    {
        CompletionTarget::Callback(Box::new(f))
    }

    fn deliver(self, response: Response) {
        match self {
            CompletionTarget::Queue(queue) => queue.insert(response),
            CompletionTarget::Callback(callback) => {
                let id = response.id();
                let spawned = thread::Builder::new()
                    .name("dns-callback".into())
                    .spawn(move || callback(response));
                if let Err(e) = spawned {
                    error!(%id, error = %e, "failed to spawn callback thread, response lost");
                }
            }
        }
    }
}

impl fmt::Debug for CompletionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionTarget::Queue(_) => f.write_str("Queue"),
            CompletionTarget::Callback(_) => f.write_str("Callback"),
        }
    }
}

type Release = Box<dyn FnOnce() + Send>;

pub(crate) struct Completion {
    id: QueryId,
    started: Instant,
    stats: Arc<Stats>,
    target: Mutex<Option<CompletionTarget>>,
    timer: Mutex<Option<TimerHandle>>,
    release: Mutex<Option<Release>>,
}

impl Completion {
    pub(crate) fn new(id: QueryId, target: CompletionTarget, stats: Arc<Stats>) -> Arc<Self> {
        Arc::new(Self {
            id,
            started: Instant::now(),
            stats,
            target: Mutex::new(Some(target)),
            timer: Mutex::new(None),
            release: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> QueryId {
        self.id
    }

    pub(crate) fn is_delivered(&self) -> bool {
        lock(&self.target).is_none()
    }

    /// Deliver `outcome` unless something already was. Returns whether this
    /// call was the one that delivered.
    pub(crate) fn deliver(&self, outcome: Result<Message>) -> bool {
        let Some(target) = lock(&self.target).take() else {
            return false;
        };
        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }

        let elapsed = self.started.elapsed();
        match &outcome {
            Ok(_) => self.stats.record_answered(elapsed),
            Err(Error::Timeout) => self.stats.record_timed_out(elapsed),
            Err(_) => self.stats.record_failed(elapsed),
        }
        trace!(id = %self.id, ok = outcome.is_ok(), elapsed_ms = elapsed.as_secs_f64() * 1000.0, "query complete");

        target.deliver(Response::new(self.id, outcome));
        true
    }

    /// The deadline passed: deliver a timeout and free whatever the query
    /// was holding.
    pub(crate) fn expire(&self) {
        if self.deliver(Err(Error::Timeout)) {
            debug!(id = %self.id, "query timed out");
            let release = lock(&self.release).take();
            if let Some(release) = release {
                release();
            }
        }
    }

    /// Set what [`expire`](Self::expire) releases. Replaces any previous
    /// action, e.g. when a query moves to a new connection.
    pub(crate) fn rebind(&self, release: impl FnOnce() + Send + 'static) {
        *lock(&self.release) = Some(Box::new(release));
    }

    /// Schedule the timeout for `deadline`.
    pub(crate) fn arm(self: &Arc<Self>, timer: &Timer, deadline: Instant) {
        let completion = self.clone();
        let handle = timer.schedule(deadline, move || completion.expire());

        let mut slot = lock(&self.timer);
        if self.is_delivered() {
            handle.cancel();
        } else {
            *slot = Some(handle);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A query after options were applied: signed, serialized and with its
/// transport chosen. The caller's own message is never touched.
#[derive(Clone)]
pub(crate) struct PreparedQuery {
    pub(crate) message: Message,
    pub(crate) wire: Vec<u8>,
    pub(crate) transport: Transport,
    pub(crate) ignore_truncation: bool,
    pub(crate) signer: Option<Arc<dyn Signer>>,
}

impl PreparedQuery {
    pub(crate) fn id(&self) -> u16 {
        self.message.id()
    }
}

/// What to do with a reply whose transaction id matched.
pub(crate) enum Verdict {
    Deliver(Result<Message>),
    RetryOverTcp,
}

pub(crate) fn check_reply(
    query: &PreparedQuery,
    reply: Message,
    raw: &[u8],
    transport: Transport,
) -> Verdict {
    if let Some(signer) = &query.signer {
        if let Err(e) = signer.verify(&query.message, &reply, raw) {
            debug!(id = query.id(), error = %e, "reply failed verification");
            return Verdict::Deliver(Err(Error::Signing(e.to_string())));
        }
    }
    if transport == Transport::Udp && reply.truncated() && !query.ignore_truncation {
        return Verdict::RetryOverTcp;
    }
    Verdict::Deliver(Ok(reply))
}

/// Run a query that came back truncated again over a new TCP connection,
/// keeping its completion and deadline.
pub(crate) fn retry_over_tcp(
    dispatcher: &Dispatcher,
    query: &PreparedQuery,
    remote: SocketAddr,
    local_ip: IpAddr,
    completion: Arc<Completion>,
) {
    debug!(id = query.id(), query_id = %completion.id(), "truncated reply, retrying over TCP");
    let mut query = query.clone();
    query.transport = Transport::Tcp;
    if let Err(e) = Transaction::start(dispatcher, query, remote, local_ip, completion.clone()) {
        completion.deliver(Err(e));
    }
}

/// One query on its own connection.
pub(crate) struct Transaction {
    query: PreparedQuery,
    completion: Arc<Completion>,
    dispatcher: Dispatcher,
    remote: SocketAddr,
    local_ip: IpAddr,
    /// The query moved to another connection; this one's closure means
    /// nothing to the caller.
    handed_off: bool,
}

impl Transaction {
    /// Open a dedicated connection for `query`.
    ///
    /// UDP binds a random local port, re-picked on collision. The query is
    /// queued on the connection and written as soon as it opens.
    pub(crate) fn start(
        dispatcher: &Dispatcher,
        query: PreparedQuery,
        remote: SocketAddr,
        local_ip: IpAddr,
        completion: Arc<Completion>,
    ) -> Result<()> {
        let token = dispatcher.next_token();
        let mut conn = match query.transport {
            Transport::Udp => Connection::new(
                token,
                Transport::Udp,
                remote,
                SocketAddr::new(local_ip, udp::random_port()),
            )
            .ephemeral(),
            Transport::Tcp => {
                Connection::new(token, Transport::Tcp, remote, SocketAddr::new(local_ip, 0))
            }
        };
        conn.send(&query.wire);

        let closer = dispatcher.clone();
        completion.rebind(move || {
            let _ = closer.submit(move |reactor| reactor.close(token));
        });

        trace!(id = query.id(), query_id = %completion.id(), transport = %query.transport, token = token.0, "starting transaction");
        let transaction = Transaction {
            query,
            completion,
            dispatcher: dispatcher.clone(),
            remote,
            local_ip,
            handed_off: false,
        };
        dispatcher.submit(move |reactor| reactor.open(conn, Box::new(transaction)))
    }
}

impl ConnectionListener for Transaction {
    fn data_available(&mut self, data: Vec<u8>, conn: &mut Connection) {
        if self.completion.is_delivered() || self.handed_off {
            return;
        }
        let reply = match wire::parse(&data) {
            Ok(reply) => reply,
            Err(e) => {
                // Stream framing cannot recover from garbage.
                if conn.transport() == Transport::Tcp {
                    self.completion.deliver(Err(e));
                    conn.close();
                } else {
                    debug!(id = self.query.id(), error = %e, "dropping undecodable reply");
                }
                return;
            }
        };
        if reply.id() != self.query.id() {
            debug!(expected = self.query.id(), got = reply.id(), "discarding reply for another transaction");
            return;
        }
        match check_reply(&self.query, reply, &data, conn.transport()) {
            Verdict::Deliver(outcome) => {
                self.completion.deliver(outcome);
            }
            Verdict::RetryOverTcp => {
                self.handed_off = true;
                retry_over_tcp(
                    &self.dispatcher,
                    &self.query,
                    self.remote,
                    self.local_ip,
                    self.completion.clone(),
                );
            }
        }
        conn.close();
    }

    fn closed(&mut self, cause: Option<Error>) {
        if self.handed_off {
            return;
        }
        if self.completion.deliver(Err(cause.unwrap_or(Error::ConnectionClosed))) {
            debug!(id = self.query.id(), query_id = %self.completion.id(), "connection closed before a reply");
        }
    }
}
