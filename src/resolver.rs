//! The public entry point for queries.
//!
//! A [`Resolver`] turns a message plus options into a running query:
//! 1. Copy the message, add EDNS and sign the copy
//! 2. Serialize it and pick UDP or TCP
//! 3. Hand it to the shared single-port connection, or open a dedicated one
//!
//! The result always arrives through the completion target: a handoff queue,
//! a callback, or (for [`Resolver::send`]) a queue the caller blocks on.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use tracing::{debug, trace};

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::queue::ResponseQueue;
use crate::response::{QueryId, Response};
use crate::single_port::SinglePortController;
use crate::transaction::{Completion, CompletionTarget, PreparedQuery, Transaction};
use crate::transport::Transport;
use crate::wire::{self, Signer};

/// Standard DNS port.
pub const DEFAULT_PORT: u16 = 53;

/// Used when neither the query nor the config says otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by every query a [`Resolver`] sends.
#[derive(Clone)]
pub struct ResolverConfig {
    /// Server to query.
    pub server: SocketAddr,
    /// Local address to send from. `None` binds the unspecified address of
    /// the server's family.
    pub local: Option<SocketAddr>,
    pub timeout: Duration,
    /// Always use TCP, not just for messages too large for UDP.
    pub tcp: bool,
    /// Accept truncated UDP replies instead of retrying over TCP.
    pub ignore_truncation: bool,
    /// Multiplex UDP queries over one socket. Weakens spoofing resistance.
    pub single_udp_port: bool,
    /// Multiplex TCP queries over one connection.
    pub single_tcp_port: bool,
    /// EDNS payload size to advertise; `Some(0)` means the default, `None`
    /// sends no EDNS record.
    pub edns_payload: Option<u16>,
    pub signer: Option<Arc<dyn Signer>>,
}

impl ResolverConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            ..Self::default()
        }
    }

    /// Resolve `host` now and use its first address.
    pub fn from_host(host: &str, port: u16) -> Result<Self> {
        let server = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Resolve(format!("{host}: {e}")))?
            .next()
            .ok_or_else(|| Error::Resolve(format!("{host}: no addresses")))?;
        Ok(Self::new(server))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local.unwrap_or_else(|| {
            let ip: IpAddr = match self.server {
                SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
                SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
            };
            SocketAddr::new(ip, 0)
        })
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), DEFAULT_PORT),
            local: None,
            timeout: DEFAULT_TIMEOUT,
            tcp: false,
            ignore_truncation: false,
            single_udp_port: false,
            single_tcp_port: false,
            edns_payload: None,
            signer: None,
        }
    }
}

impl fmt::Debug for ResolverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverConfig")
            .field("server", &self.server)
            .field("local", &self.local)
            .field("timeout", &self.timeout)
            .field("tcp", &self.tcp)
            .field("ignore_truncation", &self.ignore_truncation)
            .field("single_udp_port", &self.single_udp_port)
            .field("single_tcp_port", &self.single_tcp_port)
            .field("edns_payload", &self.edns_payload)
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

/// Per-query overrides of [`ResolverConfig`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub timeout: Option<Duration>,
    pub tcp: Option<bool>,
    pub ignore_truncation: Option<bool>,
}

/// Sends queries to one server through a [`Dispatcher`].
pub struct Resolver {
    config: ResolverConfig,
    local: SocketAddr,
    dispatcher: Dispatcher,
    next_id: AtomicU64,
    udp_port: Option<SinglePortController>,
    tcp_port: Option<SinglePortController>,
}

impl Resolver {
    pub fn new(config: ResolverConfig, dispatcher: Dispatcher) -> Self {
        let local = config.local_addr();
        let controller = |enabled: bool, transport: Transport| {
            enabled.then(|| {
                SinglePortController::new(dispatcher.clone(), transport, config.server, local)
            })
        };
        let udp_port = controller(config.single_udp_port, Transport::Udp);
        let tcp_port = controller(config.single_tcp_port, Transport::Tcp);

        debug!(server = %config.server, %local, "resolver created");
        Self {
            config,
            local,
            dispatcher,
            next_id: AtomicU64::new(0),
            udp_port,
            tcp_port,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Send `query` and wait for the outcome.
    pub fn send(&self, query: &Message) -> Result<Message> {
        self.send_with(query, &QueryOptions::default())
    }

    /// Send `query` with per-query options and wait for the outcome.
    ///
    /// Must not be called from the dispatcher thread, which would wait on
    /// itself forever.
    pub fn send_with(&self, query: &Message, options: &QueryOptions) -> Result<Message> {
        if self.dispatcher.is_dispatch_thread() {
            return Err(Error::Unsupported(
                "blocking send from the dispatcher thread".into(),
            ));
        }
        let queue = Arc::new(ResponseQueue::new());
        self.submit(query, options, CompletionTarget::Queue(queue.clone()))?;
        queue.get_item().into_result()
    }

    /// Start `query`; its [`Response`] is inserted into `queue`.
    pub fn send_async(&self, query: &Message, queue: &Arc<ResponseQueue>) -> Result<QueryId> {
        self.submit(
            query,
            &QueryOptions::default(),
            CompletionTarget::Queue(queue.clone()),
        )
    }

    /// Like [`send_async`](Self::send_async) with a caller-chosen correlation
    /// id.
    pub fn send_async_with_id(
        &self,
        query: &Message,
        id: QueryId,
        queue: &Arc<ResponseQueue>,
    ) -> Result<()> {
        self.start(
            query,
            &QueryOptions::default(),
            id,
            CompletionTarget::Queue(queue.clone()),
        )
    }

    /// Start `query`; `callback` runs on a new thread with the outcome.
    pub fn send_with_callback<F>(&self, query: &Message, callback: F) -> Result<QueryId>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        self.submit(
            query,
            &QueryOptions::default(),
            CompletionTarget::callback(callback),
        )
    }

    /// Start `query` with explicit options and completion target.
    ///
    /// Errors returned here mean the query never started and nothing will
    /// be delivered to `target`.
    pub fn submit(
        &self,
        query: &Message,
        options: &QueryOptions,
        target: CompletionTarget,
    ) -> Result<QueryId> {
        let id = QueryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.start(query, options, id, target)?;
        Ok(id)
    }

    fn start(
        &self,
        query: &Message,
        options: &QueryOptions,
        id: QueryId,
        target: CompletionTarget,
    ) -> Result<()> {
        let prepared = self.prepare(query, options)?;
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let deadline = Instant::now() + timeout;
        let stats = self.dispatcher.stats();
        let completion = Completion::new(id, target, stats.clone());

        trace!(
            query_id = %id,
            dns_id = prepared.id(),
            transport = %prepared.transport,
            bytes = prepared.wire.len(),
            "submitting query"
        );

        let shared = match prepared.transport {
            Transport::Udp => self.udp_port.as_ref(),
            Transport::Tcp => self.tcp_port.as_ref(),
        };
        if let Some(controller) = shared {
            // The controller rejects an id that became busy after this check.
            let sent = if controller.id_not_in_use(prepared.id()) {
                controller.send_query(prepared.clone(), completion.clone(), deadline)
            } else {
                stats.record_collision();
                Err(Error::IdCollision(prepared.id()))
            };
            match sent {
                Ok(()) => {
                    stats.record_query();
                    return Ok(());
                }
                Err(Error::IdCollision(dns_id)) => {
                    debug!(query_id = %id, dns_id, "id busy on shared connection, using a dedicated one");
                }
                Err(e) => return Err(e),
            }
        }

        Transaction::start(
            &self.dispatcher,
            prepared,
            self.config.server,
            self.local.ip(),
            completion.clone(),
        )?;
        completion.arm(self.dispatcher.timer(), deadline);
        stats.record_query();
        Ok(())
    }

    /// Apply options to a private copy of `query`.
    fn prepare(&self, query: &Message, options: &QueryOptions) -> Result<PreparedQuery> {
        if wire::is_zone_transfer(query) {
            return Err(Error::Unsupported(
                "zone transfers (AXFR/IXFR) need a streaming client".into(),
            ));
        }

        let mut message = query.clone();
        if let Some(payload) = self.config.edns_payload {
            wire::apply_edns(&mut message, payload);
        }
        if let Some(signer) = &self.config.signer {
            signer
                .sign(&mut message)
                .map_err(|e| Error::Signing(e.to_string()))?;
        }
        let wire = wire::serialize(&message)?;

        let tcp = options.tcp.unwrap_or(self.config.tcp) || wire.len() > wire::max_udp_size(&message);
        Ok(PreparedQuery {
            message,
            wire,
            transport: if tcp { Transport::Tcp } else { Transport::Udp },
            ignore_truncation: options
                .ignore_truncation
                .unwrap_or(self.config.ignore_truncation),
            signer: self.config.signer.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::tests::query;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};

    fn resolver(config: ResolverConfig) -> Resolver {
        Resolver::new(config, Dispatcher::new().unwrap())
    }

    fn oversized_query() -> Message {
        let label = "a".repeat(63);
        let mut message = query(5, "example.net.", RecordType::A);
        for n in 0..3 {
            let name = format!("{label}.{label}.{label}.x{n}.");
            message.add_query(Query::query(Name::from_ascii(&name).unwrap(), RecordType::TXT));
        }
        message
    }

    #[test]
    fn zone_transfer_rejected_synchronously() {
        let resolver = resolver(ResolverConfig::default());
        let queue = Arc::new(ResponseQueue::new());
        let err = resolver
            .send_async(&query(1, "example.net.", RecordType::AXFR), &queue)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(queue.is_empty());
        assert_eq!(resolver.dispatcher().stats().snapshot().queries, 0);
        resolver.dispatcher().shutdown();
    }

    #[test]
    fn prepare_leaves_caller_message_alone() {
        let resolver = resolver(ResolverConfig {
            edns_payload: Some(0),
            ..ResolverConfig::default()
        });
        let original = query(2, "example.net.", RecordType::A);
        let prepared = resolver.prepare(&original, &QueryOptions::default()).unwrap();

        assert!(original.extensions().is_none());
        assert!(prepared.message.extensions().is_some());
        assert_eq!(prepared.transport, Transport::Udp);
        resolver.dispatcher().shutdown();
    }

    #[test]
    fn large_query_switches_to_tcp() {
        let resolver = resolver(ResolverConfig::default());
        let prepared = resolver
            .prepare(&oversized_query(), &QueryOptions::default())
            .unwrap();
        assert!(prepared.wire.len() > wire::DEFAULT_UDP_SIZE);
        assert_eq!(prepared.transport, Transport::Tcp);
        resolver.dispatcher().shutdown();

        // A big enough EDNS payload keeps it on UDP.
        let resolver = self::resolver(ResolverConfig {
            edns_payload: Some(4096),
            ..ResolverConfig::default()
        });
        let prepared = resolver
            .prepare(&oversized_query(), &QueryOptions::default())
            .unwrap();
        assert_eq!(prepared.transport, Transport::Udp);
        resolver.dispatcher().shutdown();
    }

    #[test]
    fn options_override_config() {
        let resolver = resolver(ResolverConfig::default());
        let options = QueryOptions {
            tcp: Some(true),
            ignore_truncation: Some(true),
            ..QueryOptions::default()
        };
        let prepared = resolver
            .prepare(&query(3, "example.net.", RecordType::A), &options)
            .unwrap();
        assert_eq!(prepared.transport, Transport::Tcp);
        assert!(prepared.ignore_truncation);
        resolver.dispatcher().shutdown();
    }

    #[test]
    fn from_host() {
        let config = ResolverConfig::from_host("127.0.0.1", 5300).unwrap();
        assert_eq!(config.server, "127.0.0.1:5300".parse().unwrap());
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);

        let err = ResolverConfig::from_host("no such host.invalid", 53).unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));
    }

    #[test]
    fn local_address_follows_server_family() {
        let v6 = ResolverConfig::new("[::1]:53".parse().unwrap());
        assert!(v6.local_addr().is_ipv6());
        assert!(ResolverConfig::default().local_addr().is_ipv4());
    }
}
