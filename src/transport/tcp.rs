//! TCP streams for DNS queries.
//!
//! TCP DNS messages are prefixed with a 2-byte length. Reads accumulate in
//! the connection's receive buffer until at least one frame is complete;
//! several frames may be extracted from one read, and a partial trailing
//! frame waits for the next readiness event.

use std::io::{self, Read};
use std::net::SocketAddr;

use mio::net::TcpStream;
use socket2::{Domain, Protocol, Socket, Type};

use crate::wire;

/// Start a nonblocking connect from `local` to `remote`.
///
/// The local address is only bound explicitly when it names an interface
/// or a port; otherwise the OS chooses.
pub(crate) fn connect(
    local: SocketAddr,
    remote: SocketAddr,
    reuse_address: bool,
) -> io::Result<TcpStream> {
    if local.ip().is_unspecified() && local.port() == 0 {
        return TcpStream::connect(remote);
    }
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if reuse_address {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&local.into())?;
    match socket.connect(&remote.into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    Ok(TcpStream::from_std(socket.into()))
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == io::ErrorKind::WouldBlock
}

/// Check whether a pending connect has finished.
///
/// `Ok(false)` means the readiness event was spurious and the connect is
/// still in flight.
pub(crate) fn finish_connect(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

/// Drain the stream into `recv` and extract every complete frame.
///
/// Returns `Ok(false)` once the peer has closed its side.
pub(crate) fn read_frames(
    stream: &mut TcpStream,
    recv: &mut Vec<u8>,
    scratch: &mut [u8],
) -> (Vec<Vec<u8>>, io::Result<bool>) {
    let status = loop {
        match stream.read(scratch) {
            Ok(0) => break Ok(false),
            Ok(n) => recv.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => break Err(e),
        }
    };
    (extract_frames(recv), status)
}

/// Remove all complete frames from the front of `buf`, without their
/// length prefixes.
pub(crate) fn extract_frames(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut start = 0;
    while let Some(len) = wire::frame_len(&buf[start..]) {
        frames.push(buf[start + 2..start + len].to_vec());
        start += len;
    }
    buf.drain(..start);
    frames
}
