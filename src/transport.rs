//! Network plumbing: the TCP command connection and UDP discovery probes.

use crate::error::{MideaError, Result};
use crate::protocol::{MIN_HEADER_LENGTH, PREFIX_LAN, PREFIX_V3, parse_header};
use futures_core::Stream;
use log::{debug, error, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout, timeout_at};

/// Garbage tolerated in front of a packet before the stream is declared
/// desynchronized.
const MAX_SKIPPED_BYTES: usize = 1024;
const DATAGRAM_BUFFER: usize = 2048;

/// A TCP connection to an appliance's command port.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self> {
        debug!("Connecting to {}", addr);
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MideaError::Timeout)?
            .map_err(|e| MideaError::Connection(format!("{}: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        Ok(Self { stream, peer: addr })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, data: &[u8], deadline: Duration) -> Result<()> {
        debug!("Sending {} bytes to {}: {}", data.len(), self.peer, hex::encode(data));
        timeout(deadline, self.stream.write_all(data))
            .await
            .map_err(|_| MideaError::Timeout)??;
        Ok(())
    }

    /// Read exactly one packet (LAN packet or v3 envelope).
    pub async fn receive(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        let packet = timeout(deadline, self.read_packet())
            .await
            .map_err(|_| MideaError::Timeout)??;
        debug!(
            "Received {} bytes from {}: {}",
            packet.len(),
            self.peer,
            hex::encode(&packet)
        );
        Ok(packet)
    }

    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; MIN_HEADER_LENGTH];
        self.scan_for_prefix(&mut header).await?;
        self.stream.read_exact(&mut header[2..]).await?;

        let total_length = parse_header(&header)?.total_length();
        let mut packet = vec![0u8; total_length];
        packet[..MIN_HEADER_LENGTH].copy_from_slice(&header);
        self.stream
            .read_exact(&mut packet[MIN_HEADER_LENGTH..])
            .await?;
        Ok(packet)
    }

    /// Fill `header[..2]` with a known packet prefix, skipping anything before it.
    async fn scan_for_prefix(&mut self, header: &mut [u8; MIN_HEADER_LENGTH]) -> Result<()> {
        header[0] = self.stream.read_u8().await?;
        header[1] = self.stream.read_u8().await?;

        for skipped in 0..MAX_SKIPPED_BYTES {
            let prefix = u16::from_be_bytes([header[0], header[1]]);
            if prefix == PREFIX_LAN || prefix == PREFIX_V3 {
                if skipped > 0 {
                    debug!("Skipped {} bytes before packet from {}", skipped, self.peer);
                }
                return Ok(());
            }
            header[0] = header[1];
            header[1] = self.stream.read_u8().await?;
        }
        Err(MideaError::Frame(format!(
            "No packet start within {} bytes",
            MAX_SKIPPED_BYTES
        )))
    }
}

fn create_probe_socket(bind: IpAddr) -> Result<UdpSocket> {
    let addr = SocketAddr::new(bind, 0);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!("Failed to set reuse_address on {}: {}", addr, e);
    }
    if let Err(e) = socket.set_broadcast(true) {
        warn!("Failed to set broadcast on {}: {}", addr, e);
    }
    if let Err(e) = socket.bind(&SockAddr::from(addr)) {
        error!("Failed to bind to {}: {}", addr, e);
        return Err(e.into());
    }
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Send `payload` `repeats` times to every target, then yield each reply
/// until `window` has elapsed.
///
/// Every call owns its socket, so concurrent probes never see each other's
/// replies.
pub fn broadcast(
    payload: Vec<u8>,
    targets: Vec<SocketAddr>,
    repeats: u32,
    window: Duration,
    bind: IpAddr,
) -> impl Stream<Item = (SocketAddr, Vec<u8>)> + Send + 'static {
    async_stream::stream! {
        let deadline = Instant::now() + window;
        let socket = match create_probe_socket(bind) {
            Ok(socket) => socket,
            Err(e) => {
                error!("Discovery socket unavailable: {}", e);
                return;
            }
        };

        for target in &targets {
            debug!("Discovery sent to {}", target);
            for _ in 0..repeats.max(1) {
                if let Err(e) = socket.send_to(&payload, *target).await {
                    warn!("Failed to send discovery probe to {}: {}", target, e);
                    break;
                }
            }
        }

        let mut buf = vec![0u8; DATAGRAM_BUFFER];
        loop {
            match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Ok((len, addr))) => {
                    debug!("Received UDP packet from {}: {} bytes", addr, len);
                    yield (addr, buf[..len].to_vec());
                }
                Ok(Err(e)) => {
                    // Some platforms surface ICMP port unreachable here
                    debug!("Discovery receive error: {}", e);
                    let retry_at = Instant::now() + Duration::from_millis(50);
                    tokio::time::sleep_until(deadline.min(retry_at)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(
            Connection::connect(addr, Duration::from_secs(1)),
            listener.accept()
        );
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn receives_one_packet_after_garbage() {
        let (mut conn, mut server) = pair().await;

        let envelope = vec![0x83, 0x70, 0x00, 0x02, 0x20, 0x00, 0x00, 0x00, 0xAB, 0xCD];
        let mut wire = vec![0x00, 0x83, 0x11];
        wire.extend_from_slice(&envelope);
        wire.extend_from_slice(&[0x83, 0x70]);
        server.write_all(&wire).await.unwrap();

        let packet = conn.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(packet, envelope);

        assert!(matches!(
            conn.receive(Duration::from_millis(100)).await,
            Err(MideaError::Timeout)
        ));
    }

    #[tokio::test]
    async fn eof_is_a_connection_error() {
        let (mut conn, server) = pair().await;
        drop(server);
        assert!(matches!(
            conn.receive(Duration::from_secs(1)).await,
            Err(MideaError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn refused_connect_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(
            Connection::connect(addr, Duration::from_secs(1)).await,
            Err(MideaError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_collects_replies_until_deadline() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            responder.send_to(&buf[..len], from).await.unwrap();
        });

        let started = Instant::now();
        let replies: Vec<_> = broadcast(
            b"probe".to_vec(),
            vec![target],
            1,
            Duration::from_millis(300),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
        .collect()
        .await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, target);
        assert_eq!(replies[0].1, b"probe".to_vec());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
