//! UDP sockets for DNS queries.
//!
//! Each socket is connected to its server, so the kernel already filters out
//! datagrams from anyone else. A single datagram can still carry more than
//! one message if a server coalesced them; those are split by parsed length.

use std::io;
use std::net::SocketAddr;

use mio::net::UdpSocket;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::wire;

/// Random unprivileged port for a query socket.
pub fn random_port() -> u16 {
    rand::rng().random_range(1024..65535)
}

/// Bind a nonblocking UDP socket to `local`.
///
/// If `ephemeral` is set and the port is already taken, keep picking new
/// ports from `pick_port` until one binds; collisions are expected under load.
/// Returns the socket and how many times the bind was retried.
pub(crate) fn bind(
    local: SocketAddr,
    ephemeral: bool,
    reuse_address: bool,
    mut pick_port: impl FnMut() -> u16,
) -> io::Result<(UdpSocket, u32)> {
    let mut addr = local;
    let mut retries = 0;
    loop {
        match bind_once(addr, reuse_address) {
            Ok(socket) => return Ok((socket, retries)),
            Err(e) if ephemeral && e.kind() == io::ErrorKind::AddrInUse => {
                retries += 1;
                let port = pick_port();
                trace!(collided = addr.port(), next = port, "UDP port in use, rebinding");
                addr.set_port(port);
            }
            Err(e) => return Err(e),
        }
    }
}

fn bind_once(addr: SocketAddr, reuse_address: bool) -> io::Result<UdpSocket> {
    if !reuse_address {
        return UdpSocket::bind(addr);
    }
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

/// Drain the socket. Returns the messages read and `Ok(true)` while the
/// socket is still usable.
pub(crate) fn read_datagrams(
    socket: &UdpSocket,
    scratch: &mut [u8],
) -> (Vec<Vec<u8>>, io::Result<bool>) {
    let mut messages = Vec::new();
    loop {
        match socket.recv(scratch) {
            Ok(n) => split_datagram(&scratch[..n], &mut messages),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return (messages, Ok(true)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return (messages, Err(e)),
        }
    }
}

/// Split one datagram into the messages it carries.
///
/// Anything that does not parse is dropped along with the rest of the
/// datagram; on UDP that costs only this datagram, not the socket.
pub(crate) fn split_datagram(datagram: &[u8], out: &mut Vec<Vec<u8>>) {
    let mut rest = datagram;
    while !rest.is_empty() {
        match wire::message_len(rest) {
            Ok(len) if len > 0 => {
                out.push(rest[..len].to_vec());
                rest = &rest[len..];
            }
            Ok(_) => break,
            Err(e) => {
                debug!(error = %e, bytes = rest.len(), "dropping undecodable datagram");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::tests::query;
    use hickory_proto::rr::RecordType;

    #[test]
    fn bind_retries_on_collision() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken_addr = taken.local_addr().unwrap();

        // First retry collides again, second lets the OS choose.
        let mut picks = vec![0, taken_addr.port()];
        let (socket, retries) = bind(taken_addr, true, false, || picks.pop().unwrap()).unwrap();

        assert_eq!(retries, 2);
        assert_ne!(socket.local_addr().unwrap().port(), taken_addr.port());
    }

    #[test]
    fn fixed_port_collision_is_an_error() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = bind(taken.local_addr().unwrap(), false, false, random_port).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn random_port_is_unprivileged() {
        for _ in 0..1000 {
            assert!(random_port() >= 1024);
        }
    }

    #[test]
    fn split_coalesced_datagram() {
        let first = query(1, "example.net.", RecordType::A).to_vec().unwrap();
        let second = query(2, "example.org.", RecordType::MX).to_vec().unwrap();
        let mut datagram = first.clone();
        datagram.extend_from_slice(&second);

        let mut out = Vec::new();
        split_datagram(&datagram, &mut out);
        assert_eq!(out, vec![first, second]);
    }

    #[test]
    fn split_drops_trailing_garbage() {
        let first = query(1, "example.net.", RecordType::A).to_vec().unwrap();
        let mut datagram = first.clone();
        datagram.extend_from_slice(&[0xde, 0xad, 0xbe]);

        let mut out = Vec::new();
        split_datagram(&datagram, &mut out);
        assert_eq!(out, vec![first]);

        out.clear();
        split_datagram(&[0xff; 5], &mut out);
        assert!(out.is_empty());
    }
}
