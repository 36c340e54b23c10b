//! Many queries over one socket.
//!
//! In single-port mode every query to a server shares one connection and
//! replies are matched to queries by their 16-bit transaction id alone. An id
//! that is already pending is refused, so two live queries can never be
//! confused. The shared connection is opened on first use and reopened after
//! it closes; when it closes, every query still riding on it fails with the
//! closure cause.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use mio::Token;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::dispatcher::{Dispatcher, Reactor};
use crate::error::{Error, Result};
use crate::response::QueryId;
use crate::transaction::{Completion, PreparedQuery, Verdict, check_reply, retry_over_tcp};
use crate::transport::{Connection, ConnectionListener, Transport};
use crate::wire;

/// Routes queries for one (remote, local, transport) triple over a single
/// shared connection.
pub(crate) struct SinglePortController {
    shared: Arc<Shared>,
}

struct Shared {
    dispatcher: Dispatcher,
    transport: Transport,
    remote: SocketAddr,
    local: SocketAddr,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    pending: FxHashMap<u16, Pending>,
    /// Token of the current shared connection, if one is open or opening.
    channel: Option<Token>,
}

struct Pending {
    query: PreparedQuery,
    completion: Arc<Completion>,
}

impl SinglePortController {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        transport: Transport,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Self {
        if transport == Transport::Udp {
            warn!(
                %remote,
                "single-port UDP enabled: every query uses the same source port, \
                 which makes replies much easier to spoof"
            );
        }
        Self {
            shared: Arc::new(Shared {
                dispatcher,
                transport,
                remote,
                local,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub(crate) fn id_not_in_use(&self, id: u16) -> bool {
        !lock(&self.shared.registry).pending.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        lock(&self.shared.registry).pending.len()
    }

    /// Register `query` under its transaction id and write it on the shared
    /// connection, opening the connection if needed.
    ///
    /// Fails with [`Error::IdCollision`] if the id is already pending; the
    /// query is then not sent and its completion is left untouched.
    pub(crate) fn send_query(
        &self,
        query: PreparedQuery,
        completion: Arc<Completion>,
        deadline: Instant,
    ) -> Result<()> {
        let shared = &self.shared;
        let id = query.id();
        let owner = completion.id();
        let wire = query.wire.clone();

        {
            let mut registry = lock(&shared.registry);
            if registry.pending.contains_key(&id) {
                shared.dispatcher.stats().record_collision();
                debug!(id, remote = %shared.remote, "transaction id already pending on shared connection");
                return Err(Error::IdCollision(id));
            }
            let (token, fresh) = match registry.channel {
                Some(token) => (token, false),
                None => (shared.dispatcher.next_token(), true),
            };

            // Submitted under the registry lock, so the task that opens a
            // channel is always queued ahead of every write to it.
            let task = {
                let shared = shared.clone();
                move |reactor: &mut Reactor| shared.transmit(reactor, token, fresh, id, owner, &wire)
            };
            shared.dispatcher.submit(task)?;

            registry.channel = Some(token);
            registry.pending.insert(
                id,
                Pending {
                    query,
                    completion: completion.clone(),
                },
            );
        }

        let release = shared.clone();
        completion.rebind(move || release.forget(id, owner));
        completion.arm(shared.dispatcher.timer(), deadline);
        Ok(())
    }
}

impl Shared {
    /// Runs on the dispatcher thread.
    fn transmit(
        self: &Arc<Self>,
        reactor: &mut Reactor,
        token: Token,
        fresh: bool,
        id: u16,
        owner: QueryId,
        wire: &[u8],
    ) {
        if fresh {
            let conn = Connection::new(token, self.transport, self.remote, self.local).reuse_address();
            debug!(token = token.0, transport = %self.transport, remote = %self.remote, "opening shared connection");
            reactor.open(
                conn,
                Box::new(SharedChannel {
                    shared: self.clone(),
                    token,
                }),
            );
        }
        if reactor.with_connection(token, |conn| conn.send(wire)).is_none() {
            // Normally the closure already failed the query; make sure it
            // does not sit in the registry unwritten.
            if let Some(pending) = self.take(id, owner) {
                debug!(id, token = token.0, "shared connection gone before the query was written");
                pending.completion.deliver(Err(Error::ConnectionClosed));
            }
        }
    }

    /// Remove `id` from the registry if it still belongs to `owner`.
    fn take(&self, id: u16, owner: QueryId) -> Option<Pending> {
        let mut registry = lock(&self.registry);
        if registry
            .pending
            .get(&id)
            .is_some_and(|pending| pending.completion.id() == owner)
        {
            registry.pending.remove(&id)
        } else {
            None
        }
    }

    /// Drop a timed-out query, unless the id has since been reused by
    /// another query.
    fn forget(&self, id: u16, owner: QueryId) {
        if self.take(id, owner).is_some() {
            trace!(id, query_id = %owner, "released id on shared connection");
        }
    }
}

/// Listener for the shared connection.
struct SharedChannel {
    shared: Arc<Shared>,
    token: Token,
}

impl ConnectionListener for SharedChannel {
    fn data_available(&mut self, data: Vec<u8>, conn: &mut Connection) {
        let reply = match wire::parse(&data) {
            Ok(reply) => reply,
            Err(e) => {
                if conn.transport() == Transport::Tcp {
                    conn.fail(e);
                } else {
                    debug!(error = %e, "dropping undecodable reply on shared connection");
                }
                return;
            }
        };
        let id = reply.id();
        let pending = lock(&self.shared.registry).pending.remove(&id);
        let Some(pending) = pending else {
            debug!(id, "discarding reply with no pending query");
            return;
        };

        match check_reply(&pending.query, reply, &data, conn.transport()) {
            Verdict::Deliver(outcome) => {
                pending.completion.deliver(outcome);
            }
            Verdict::RetryOverTcp => retry_over_tcp(
                &self.shared.dispatcher,
                &pending.query,
                self.shared.remote,
                self.shared.local.ip(),
                pending.completion,
            ),
        }
    }

    fn closed(&mut self, cause: Option<Error>) {
        let failed: Vec<Pending> = {
            let mut registry = lock(&self.shared.registry);
            if registry.channel == Some(self.token) {
                registry.channel = None;
            }
            registry.pending.drain().map(|(_, pending)| pending).collect()
        };
        let cause = cause.unwrap_or(Error::ConnectionClosed);
        debug!(token = self.token.0, pending = failed.len(), error = %cause, "shared connection closed");
        for pending in failed {
            pending.completion.deliver(Err(cause.clone()));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
