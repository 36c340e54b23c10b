//! Mock DNS server for integration tests.
//!
//! Listens for UDP and TCP on the same loopback port and answers every query
//! with one A record after a small random delay. The first label of the
//! query name selects a misbehaviour:
//!
//! - `timeout.` never answers
//! - `slow.` answers after 100ms
//! - `truncate.` sets TC over UDP, answers in full over TCP
//! - `foreign.` sends a reply with the wrong id before the real one
//! - `garbage.` sends an undecodable datagram before the real reply over
//!   UDP, and only an undecodable frame over TCP
//! - `hangup.` closes the TCP connection without answering
//! - `partial.` writes the start of a TCP frame, then closes the connection

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Runtime;

/// Upper bound of the random reply delay.
const JITTER_MS: u64 = 20;

const ANSWER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

#[derive(Clone)]
pub struct MockServer {
    pub addr: SocketAddr,
    pub udp_queries: Arc<AtomicUsize>,
    pub tcp_queries: Arc<AtomicUsize>,
    /// Transaction ids of every query that was left unanswered.
    pub unanswered_ids: Arc<Mutex<Vec<u16>>>,
}

impl MockServer {
    /// Bind UDP and TCP on one port and serve from a background runtime.
    pub fn start() -> Self {
        let server = MockServer {
            addr: "127.0.0.1:0".parse().unwrap(),
            udp_queries: Arc::new(AtomicUsize::new(0)),
            tcp_queries: Arc::new(AtomicUsize::new(0)),
            unanswered_ids: Arc::new(Mutex::new(Vec::new())),
        };
        let (tx, rx) = std::sync::mpsc::channel();

        let state = server.clone();
        std::thread::spawn(move || {
            let rt = Runtime::new().unwrap();
            rt.block_on(async move {
                let (udp, tcp) = bind_pair().await;
                tx.send(udp.local_addr().unwrap()).unwrap();
                tokio::spawn(serve_tcp(tcp, state.clone()));
                serve_udp(udp, state).await;
            });
        });

        let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        MockServer { addr, ..server }
    }

    pub fn udp_count(&self) -> usize {
        self.udp_queries.load(Ordering::SeqCst)
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp_queries.load(Ordering::SeqCst)
    }

    pub fn unanswered(&self) -> Vec<u16> {
        self.unanswered_ids.lock().unwrap().clone()
    }
}

/// A UDP socket and a TCP listener on the same port.
async fn bind_pair() -> (UdpSocket, TcpListener) {
    loop {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        if let Ok(tcp) = TcpListener::bind(udp.local_addr().unwrap()).await {
            return (udp, tcp);
        }
    }
}

pub fn query(id: u16, name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_ascii(name).unwrap(), rtype));
    message
}

fn answer(query: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true);
    reply.add_queries(query.queries().to_vec());
    if let Some(question) = query.queries().first() {
        reply.add_answer(Record::from_rdata(
            question.name().clone(),
            300,
            RData::A(A(ANSWER)),
        ));
    }
    reply
}

fn first_label(query: &Message) -> String {
    query
        .queries()
        .first()
        .map(|q| q.name().to_string().to_ascii_lowercase())
        .unwrap_or_default()
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

async fn delay(label: &str) {
    let ms = if label == "slow" {
        100
    } else {
        rand::rng().random_range(0..=JITTER_MS)
    };
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn serve_udp(socket: UdpSocket, state: MockServer) {
    let socket = Arc::new(socket);
    let mut buf = [0u8; 4096];
    loop {
        let Ok((len, src)) = socket.recv_from(&mut buf).await else {
            continue;
        };
        let Ok(query) = Message::from_vec(&buf[..len]) else {
            continue;
        };
        state.udp_queries.fetch_add(1, Ordering::SeqCst);
        let socket = socket.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let label = first_label(&query);
            if label == "timeout" {
                state.unanswered_ids.lock().unwrap().push(query.id());
                return;
            }
            delay(&label).await;

            let mut reply = answer(&query);
            match label.as_str() {
                "truncate" => {
                    reply.take_answers();
                    reply.set_truncated(true);
                }
                "foreign" => {
                    let mut wrong = reply.clone();
                    wrong.set_id(query.id().wrapping_add(1));
                    let _ = socket.send_to(&wrong.to_vec().unwrap(), src).await;
                }
                "garbage" => {
                    let _ = socket.send_to(&[0xff; 7], src).await;
                }
                _ => {}
            }
            let _ = socket.send_to(&reply.to_vec().unwrap(), src).await;
        });
    }
}

async fn serve_tcp(listener: TcpListener, state: MockServer) {
    loop {
        if let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_tcp_connection(stream, state.clone()));
        }
    }
}

/// Answer every frame on one connection; replies may go out of order.
async fn serve_tcp_connection(stream: TcpStream, state: MockServer) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    loop {
        let mut len = [0u8; 2];
        if reader.read_exact(&mut len).await.is_err() {
            return;
        }
        let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let Ok(query) = Message::from_vec(&body) else {
            return;
        };
        state.tcp_queries.fetch_add(1, Ordering::SeqCst);
        match first_label(&query).as_str() {
            "hangup" => return,
            "partial" => {
                let _ = writer.lock().await.write_all(&[0x00, 0x40, 0x12, 0x34]).await;
                return;
            }
            _ => {
                tokio::spawn(reply_tcp(query, writer.clone(), state.clone()));
            }
        }
    }
}

async fn reply_tcp(query: Message, writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>, state: MockServer) {
    let label = first_label(&query);
    if label == "timeout" {
        state.unanswered_ids.lock().unwrap().push(query.id());
        return;
    }
    delay(&label).await;

    let body = if label == "garbage" {
        vec![0xff; 5]
    } else {
        answer(&query).to_vec().unwrap()
    };
    let mut frame = (body.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(&body);
    let _ = writer.lock().await.write_all(&frame).await;
}
