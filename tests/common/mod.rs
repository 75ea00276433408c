//! Fake appliances for integration tests: a TCP command endpoint speaking
//! v2 or v3 and UDP discovery responders.

#![allow(dead_code)]

use rustmidea::crypto::{Endian, Role, SecureSession, SessionKey, udpid};
use rustmidea::frame::Frame;
use rustmidea::protocol::{
    MIN_HEADER_LENGTH, PacketHeader, PacketType, ProtocolVersion, encode_v3_header, pack_packet,
    parse_header, unpack_packet,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

pub const DEVICE_ID: u64 = 15393162840672;
pub const V3_DEVICE_ID: u64 = 147334558165565;

/// Power on, cool, 21 C, auto fan, vertical swing, eco.
pub const STATE_FRAME: &str =
    "aa23ac00000000000303c00145660000003c0010045c6b20000000000000000000020d79";

pub const TOKEN: [u8; 64] = [0x42; 64];
pub const KEY: &str = "101112131415161718191a1b1c1d1e1f202122232425262728292a2b2c2d2e2f";
const HANDSHAKE_DATA: &str = "9188548c3df516e2c71cade7c037d2e4bcc31388427700fb2a6bbb96ebde6dedab5f8b5cb9435354c7b58603592d5faf081e17ceb05f7a7c67f4b666f12ca457";
const SESSION_KEY: &str = "131b030b0b333b23235b534b4b437b73535ba3ababb3bb83839b93ebebe3fbf3";

pub fn key() -> Vec<u8> {
    hex::decode(KEY).unwrap()
}

pub fn state_frame() -> Vec<u8> {
    hex::decode(STATE_FRAME).unwrap()
}

/// What the fake appliance does with one request frame.
pub enum Reply {
    Frame(Vec<u8>),
    Silent,
    Close,
}

type Responder = dyn Fn(&Frame) -> Reply + Send + Sync;

/// Answers every state-bearing request with [`STATE_FRAME`].
pub fn state_responder() -> Arc<Responder> {
    Arc::new(|_: &Frame| Reply::Frame(state_frame()))
}

/// A command endpoint on 127.0.0.1.
pub struct FakeAppliance {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl FakeAppliance {
    pub async fn v2(responder: Arc<Responder>) -> Self {
        Self::spawn(ProtocolVersion::V2, true, responder).await
    }

    pub async fn v3(responder: Arc<Responder>) -> Self {
        Self::spawn(ProtocolVersion::V3, true, responder).await
    }

    /// A v3 appliance that answers every handshake with an error envelope.
    pub async fn v3_rejecting() -> Self {
        Self::spawn(ProtocolVersion::V3, false, state_responder()).await
    }

    async fn spawn(version: ProtocolVersion, accept_handshake: bool, responder: Arc<Responder>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let connections = connections.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        version,
                        accept_handshake,
                        responder.clone(),
                        requests.clone(),
                    ));
                }
            })
        };

        Self {
            addr,
            connections,
            requests,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Bodies of every request frame received so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeAppliance {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_packet(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; MIN_HEADER_LENGTH];
    stream.read_exact(&mut header).await.ok()?;
    let total_length = parse_header(&header).ok()?.total_length();
    let mut packet = vec![0u8; total_length];
    packet[..MIN_HEADER_LENGTH].copy_from_slice(&header);
    stream
        .read_exact(&mut packet[MIN_HEADER_LENGTH..])
        .await
        .ok()?;
    Some(packet)
}

fn handshake_reply(accept: bool) -> Vec<u8> {
    if !accept {
        let mut reply = encode_v3_header(2, PacketType::Error, 0).unwrap().to_vec();
        reply.extend_from_slice(&[0, 0, 0xFF, 0xFF]);
        return reply;
    }
    let data = hex::decode(HANDSHAKE_DATA).unwrap();
    let mut reply = encode_v3_header(data.len(), PacketType::HandshakeResponse, 0)
        .unwrap()
        .to_vec();
    reply.extend_from_slice(&[0, 0]);
    reply.extend_from_slice(&data);
    reply
}

fn appliance_session() -> SecureSession {
    let mut key = [0u8; 32];
    key.copy_from_slice(&hex::decode(SESSION_KEY).unwrap());
    SecureSession::established(SessionKey::new(key), Role::Appliance)
}

async fn serve(
    mut stream: TcpStream,
    version: ProtocolVersion,
    accept_handshake: bool,
    responder: Arc<Responder>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
) {
    let mut session: Option<SecureSession> = None;

    while let Some(packet) = read_packet(&mut stream).await {
        let lan = match (version, parse_header(&packet)) {
            (ProtocolVersion::V3, Ok(PacketHeader::V3 { packet_type, .. }))
                if packet_type == PacketType::HandshakeRequest.raw() =>
            {
                if accept_handshake {
                    session = Some(appliance_session());
                }
                if stream.write_all(&handshake_reply(accept_handshake)).await.is_err() {
                    return;
                }
                continue;
            }
            (ProtocolVersion::V3, _) => match session.as_mut().map(|s| s.open(&packet)) {
                Some(Ok(lan)) => lan,
                _ => return,
            },
            _ => packet,
        };

        let Ok(frame) = unpack_packet(&lan).and_then(|f| Frame::decode(&f)) else {
            return;
        };
        requests.lock().unwrap().push(frame.body.clone());

        let reply = match responder(&frame) {
            Reply::Frame(reply) => reply,
            Reply::Silent => continue,
            Reply::Close => return,
        };
        let mut out = pack_packet(DEVICE_ID, &reply).unwrap();
        if let Some(session) = session.as_mut() {
            out = session.seal(&out).unwrap();
        }
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Encrypted discovery info announcing a device at 127.0.0.1:`port`.
fn discovery_info(port: u16, name: &str) -> Vec<u8> {
    let mut info = vec![1, 0, 0, 127];
    info.extend_from_slice(&port.to_le_bytes());
    info.extend_from_slice(&[0, 0]);
    info.extend_from_slice(b"000000P0000000Q1F0C9D153F7B40000");
    info.push(name.len() as u8);
    info.extend_from_slice(name.as_bytes());
    info.extend_from_slice(&[0u8; 8]);
    info
}

pub fn v2_discovery_reply(id: u64, port: u16, name: &str) -> Vec<u8> {
    pack_packet(id, &discovery_info(port, name)).unwrap()
}

pub fn v3_discovery_reply(id: u64, port: u16, name: &str) -> Vec<u8> {
    let lan = pack_packet(id, &discovery_info(port, name)).unwrap();
    let mut reply = vec![0x83, 0x70];
    reply.extend_from_slice(&((lan.len() + 16) as u16).to_be_bytes());
    reply.extend_from_slice(&[0x20, 0x0F, 0x00, 0x00]);
    reply.extend_from_slice(&lan);
    reply.extend_from_slice(&udpid(id, Endian::Big));
    reply
}

/// Answers every datagram with `reply`.
pub struct DiscoveryResponder {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl DiscoveryResponder {
    pub async fn spawn(reply: Vec<u8>) -> Self {
        Self::spawn_sequence(vec![reply]).await
    }

    /// Answers the n-th datagram with `replies[n]`, repeating the last one.
    pub async fn spawn_sequence(replies: Vec<Vec<u8>>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let mut sent = 0usize;
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                let reply = &replies[sent.min(replies.len() - 1)];
                let _ = socket.send_to(reply, from).await;
                sent += 1;
            }
        });
        Self { addr, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
