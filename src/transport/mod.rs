//! Connection state machine for UDP and TCP.
//!
//! A [`Connection`] owns one nonblocking socket and is only ever touched by
//! the dispatcher thread. It knows how to open itself, how to flush queued
//! writes, and how to turn readable bytes into whole DNS messages; what the
//! messages mean is up to its [`ConnectionListener`].

pub mod tcp;
pub mod udp;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;

use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::error::Error;
use crate::wire;

/// Size of the dispatcher's shared read buffer; fits any datagram.
pub const RECV_BUFFER_SIZE: usize = 65535;

/// Transport protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a connection.
///
/// `Connecting` lasts until the socket is bound and connected (immediately
/// for UDP, until the connect-complete event for TCP). `Closing` means a close
/// was requested and the reactor has yet to deregister the socket. `Closed`
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Opened,
    Closing,
    Closed,
}

/// Receives whatever a connection produces.
///
/// Both callbacks run on the dispatcher thread.
pub(crate) trait ConnectionListener: Send {
    /// One complete message arrived.
    fn data_available(&mut self, data: Vec<u8>, conn: &mut Connection);

    /// The connection is gone and will produce nothing more. `cause` is the
    /// error that tore it down, if any.
    fn closed(&mut self, cause: Option<Error>);
}

enum Channel {
    Udp(mio::net::UdpSocket),
    Tcp(mio::net::TcpStream),
}

pub(crate) struct Connection {
    token: Token,
    transport: Transport,
    remote: SocketAddr,
    local: SocketAddr,
    /// The local port was picked at random and may be re-picked on collision.
    ephemeral: bool,
    reuse_address: bool,
    state: State,
    channel: Option<Channel>,
    recv: Vec<u8>,
    outbound: VecDeque<Vec<u8>>,
    /// Bytes of the front outbound buffer already written.
    written: usize,
    failure: Option<Error>,
    bind_retries: u32,
}

impl Connection {
    pub(crate) fn new(
        token: Token,
        transport: Transport,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Self {
        Self {
            token,
            transport,
            remote,
            local,
            ephemeral: false,
            reuse_address: false,
            state: State::Connecting,
            channel: None,
            recv: Vec::new(),
            outbound: VecDeque::new(),
            written: 0,
            failure: None,
            bind_retries: 0,
        }
    }

    /// Re-pick a random local port if the configured one is taken.
    pub(crate) fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Bind with `SO_REUSEADDR`, for sockets shared by many queries.
    pub(crate) fn reuse_address(mut self) -> Self {
        self.reuse_address = true;
        self
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn transport(&self) -> Transport {
        self.transport
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn bind_retries(&self) -> u32 {
        self.bind_retries
    }

    /// Open the socket and register it with the reactor.
    pub(crate) fn connect(&mut self, registry: &Registry) -> io::Result<()> {
        match self.transport {
            Transport::Udp => {
                let (mut socket, retries) =
                    udp::bind(self.local, self.ephemeral, self.reuse_address, udp::random_port)?;
                self.bind_retries = retries;
                self.local = socket.local_addr()?;
                socket.connect(self.remote)?;
                registry.register(&mut socket, self.token, Interest::READABLE | Interest::WRITABLE)?;
                self.channel = Some(Channel::Udp(socket));
                self.state = State::Opened;
                trace!(token = self.token.0, local = %self.local, remote = %self.remote, "UDP connection opened");
                self.flush();
            }
            Transport::Tcp => {
                let mut stream = tcp::connect(self.local, self.remote, self.reuse_address)?;
                registry.register(&mut stream, self.token, Interest::READABLE | Interest::WRITABLE)?;
                self.channel = Some(Channel::Tcp(stream));
                trace!(token = self.token.0, remote = %self.remote, "TCP connect in progress");
            }
        }
        Ok(())
    }

    /// Complete a pending TCP connect. Nothing to do for UDP.
    pub(crate) fn do_connect(&mut self) {
        if self.state != State::Connecting {
            return;
        }
        let Some(Channel::Tcp(stream)) = &self.channel else {
            return;
        };
        match tcp::finish_connect(stream) {
            Ok(true) => {
                if let Ok(local) = stream.local_addr() {
                    self.local = local;
                }
                self.state = State::Opened;
                trace!(token = self.token.0, local = %self.local, remote = %self.remote, "TCP connection opened");
                self.flush();
            }
            Ok(false) => {}
            Err(e) => self.fail(e),
        }
    }

    /// Read everything available and return the complete messages, in order.
    pub(crate) fn do_read(&mut self, scratch: &mut [u8]) -> Vec<Vec<u8>> {
        if self.state != State::Opened {
            return Vec::new();
        }
        // The socket may already be gone if the connection was closed
        // between readiness and this call; that is simply no data.
        let (messages, status) = match &mut self.channel {
            None => return Vec::new(),
            Some(Channel::Udp(socket)) => udp::read_datagrams(socket, scratch),
            Some(Channel::Tcp(stream)) => tcp::read_frames(stream, &mut self.recv, scratch),
        };
        match status {
            Ok(true) => {}
            Ok(false) => {
                debug!(token = self.token.0, remote = %self.remote, "peer closed the connection");
                self.close();
            }
            Err(e) => self.fail(e),
        }
        messages
    }

    pub(crate) fn do_write(&mut self) {
        if self.state == State::Opened {
            self.flush();
        }
    }

    /// Queue one message; it is written as soon as the socket allows.
    pub(crate) fn send(&mut self, message: &[u8]) {
        match self.transport {
            Transport::Tcp => self.outbound.push_back(wire::frame(message)),
            Transport::Udp => self.outbound.push_back(message.to_vec()),
        }
        if self.state == State::Opened {
            self.flush();
        }
    }

    fn flush(&mut self) {
        while let Some(front) = self.outbound.front() {
            let result = match &mut self.channel {
                Some(Channel::Udp(socket)) => socket.send(front).map(|_| front.len()),
                Some(Channel::Tcp(stream)) => stream.write(&front[self.written..]),
                None => return,
            };
            match result {
                Ok(0) if !front.is_empty() => {
                    self.fail(io::Error::from(io::ErrorKind::WriteZero));
                    return;
                }
                Ok(n) => {
                    self.written += n;
                    if self.written >= front.len() {
                        trace!(token = self.token.0, bytes = front.len(), "message written");
                        self.outbound.pop_front();
                        self.written = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    /// Ask for the connection to be torn down. Idempotent.
    pub(crate) fn close(&mut self) {
        if matches!(self.state, State::Connecting | State::Opened) {
            self.state = State::Closing;
        }
    }

    /// Tear the connection down because of `err`. The first error wins.
    pub(crate) fn fail(&mut self, err: impl Into<Error>) {
        if matches!(self.state, State::Connecting | State::Opened) {
            let err = err.into();
            debug!(token = self.token.0, remote = %self.remote, transport = %self.transport, error = %err, "connection failed");
            self.failure = Some(err);
            self.close();
        }
    }

    /// Deregister and release the socket. Returns the failure cause the
    /// first time it is called, nothing afterwards.
    pub(crate) fn finish_close(&mut self, registry: &Registry) -> Option<Error> {
        if self.state == State::Closed {
            return None;
        }
        match self.channel.take() {
            Some(Channel::Udp(mut socket)) => {
                let _ = registry.deregister(&mut socket);
            }
            Some(Channel::Tcp(mut stream)) => {
                let _ = registry.deregister(&mut stream);
            }
            None => {}
        }
        self.state = State::Closed;
        self.outbound.clear();
        self.recv.clear();
        trace!(token = self.token.0, "connection closed");
        self.failure.take()
    }
}
