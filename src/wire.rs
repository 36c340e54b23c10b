//! DNS message handling.
//!
//! The engine treats messages as opaque payloads. Everything it needs to know
//! about them (transaction id, length, truncation, payload size, whether a
//! buffer holds a whole frame) goes through this module, which leans on
//! `hickory-proto` for the actual wire format.

use hickory_proto::op::{Edns, Message, OpCode};
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};

use crate::error::{Error, Result};

/// Length of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// Largest message that fits behind a TCP length prefix.
pub const MAX_MESSAGE_LEN: usize = 65535;

/// UDP payload limit for queries without EDNS.
pub const DEFAULT_UDP_SIZE: usize = 512;

/// EDNS payload size advertised when the configuration asks for the default.
pub const DEFAULT_EDNS_PAYLOAD: u16 = 1280;

/// Error type returned by [`Signer`] implementations.
pub type SignError = Box<dyn std::error::Error + Send + Sync>;

/// The message signing construct (TSIG and friends).
///
/// `sign` is applied to the defensive copy of every outgoing query, `verify`
/// to every reply that matched its query's transaction id. A verification
/// failure is delivered to the caller as [`Error::Signing`].
pub trait Signer: Send + Sync {
    fn sign(&self, query: &mut Message) -> std::result::Result<(), SignError>;

    fn verify(
        &self,
        query: &Message,
        reply: &Message,
        raw: &[u8],
    ) -> std::result::Result<(), SignError>;
}

/// Parse one message from the start of `bytes`.
pub fn parse(bytes: &[u8]) -> Result<Message> {
    parse_prefix(bytes).map(|(message, _)| message)
}

/// Parse one message from the start of `bytes`, returning it together with
/// the number of bytes it occupied.
///
/// A datagram may carry more than one message; the returned length tells the
/// caller where the next one starts.
pub fn parse_prefix(bytes: &[u8]) -> Result<(Message, usize)> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Decode(format!(
            "{} bytes is shorter than a DNS header",
            bytes.len()
        )));
    }
    let mut decoder = BinDecoder::new(bytes);
    let message = Message::read(&mut decoder)?;
    Ok((message, decoder.index()))
}

/// Number of bytes the first message in `bytes` occupies.
pub fn message_len(bytes: &[u8]) -> Result<usize> {
    parse_prefix(bytes).map(|(_, len)| len)
}

/// Encode a message, refusing anything that would not fit a TCP frame.
pub fn serialize(message: &Message) -> Result<Vec<u8>> {
    let bytes = message.to_vec()?;
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(Error::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Total length (prefix included) of the first length-prefixed frame in
/// `buf`, or `None` if the frame is not complete yet.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let len = 2 + u16::from_be_bytes([buf[0], buf[1]]) as usize;
    (buf.len() >= len).then_some(len)
}

/// Whether `buf` holds exactly one complete length-prefixed frame.
pub fn is_complete(buf: &[u8]) -> bool {
    frame_len(buf) == Some(buf.len())
}

/// Prepend the two byte length used on stream transports.
pub fn frame(message: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&(message.len() as u16).to_be_bytes());
    framed.extend_from_slice(message);
    framed
}

/// Largest UDP reply the query allows, from its EDNS record if it has one.
pub fn max_udp_size(message: &Message) -> usize {
    message
        .extensions()
        .as_ref()
        .map_or(DEFAULT_UDP_SIZE, |edns| {
            usize::from(edns.max_payload()).max(DEFAULT_UDP_SIZE)
        })
}

/// Add an EDNS record advertising `payload` unless the message already has
/// one. A payload of zero means the default.
pub fn apply_edns(message: &mut Message, payload: u16) {
    if message.extensions().is_some() {
        return;
    }
    let payload = if payload == 0 { DEFAULT_EDNS_PAYLOAD } else { payload };
    let mut edns = Edns::new();
    edns.set_max_payload(payload);
    message.set_edns(edns);
}

/// Zone transfers need a streaming exchange this engine does not do.
pub fn is_zone_transfer(message: &Message) -> bool {
    message.op_code() == OpCode::Query
        && message
            .queries()
            .first()
            .is_some_and(|q| matches!(q.query_type(), RecordType::AXFR | RecordType::IXFR))
}
