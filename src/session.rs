//! Per-device command session.
//!
//! A session owns one TCP connection and, for v3 devices, the negotiated
//! session key. Commands are strictly sequential: `&mut self` guarantees a
//! connection is never shared between two requests.
//!
//! ```text
//! Disconnected -> Connected -> Handshaking (v3) -> Ready
//!       ^                                            |
//!       +---------------- any failure ---------------+
//! ```

use crate::command::Command;
use crate::config::SessionConfig;
use crate::crypto::CryptoSession;
use crate::error::{MideaError, Result};
use crate::frame::Frame;
use crate::model::DeviceDescriptor;
use crate::protocol::{ProtocolVersion, pack_packet, unpack_packet};
use crate::transport::Connection;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Connection state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Handshaking,
    Ready,
}

#[derive(Debug)]
pub struct DeviceSession {
    descriptor: DeviceDescriptor,
    config: SessionConfig,
    state: SessionState,
    connection: Option<Connection>,
    crypto: CryptoSession,
    connected_at: Option<Instant>,
    frame_id: u8,
    // Set while a request is on the wire; still set on entry means the
    // previous request future was dropped and the stream is out of sync.
    in_flight: bool,
    cancel: Option<CancellationToken>,
}

impl DeviceSession {
    pub fn new(descriptor: DeviceDescriptor, config: SessionConfig) -> Result<Self> {
        let crypto = CryptoSession::for_version(descriptor.version())?;
        Ok(Self {
            descriptor,
            config,
            state: SessionState::Disconnected,
            connection: None,
            crypto,
            connected_at: None,
            frame_id: 0,
            in_flight: false,
            cancel: None,
        })
    }

    /// Abort pending receives when `token` is cancelled.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn set_cancellation_token(&mut self, token: Option<CancellationToken>) {
        self.cancel = token;
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_online(&mut self, online: bool) {
        self.descriptor.set_online(online);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Ready for commands without reconnecting.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
            && self.connection.is_some()
            && !self.crypto.needs_handshake()
            && !self.expired()
    }

    fn expired(&self) -> bool {
        match (self.config.max_connection_lifetime(), self.connected_at) {
            (Some(lifetime), Some(at)) => at.elapsed() >= lifetime,
            _ => false,
        }
    }

    fn peer(&self) -> SocketAddr {
        SocketAddr::new(self.descriptor.ip(), self.descriptor.port())
    }

    fn next_frame_id(&mut self) -> u8 {
        self.frame_id = self.frame_id.wrapping_add(1);
        self.frame_id
    }

    /// Open a fresh connection and, for v3 devices, authenticate it.
    pub async fn connect(&mut self) -> Result<()> {
        self.disconnect().await;

        match self.descriptor.version() {
            ProtocolVersion::V3 => self.connect_secure().await,
            _ => {
                self.open_connection().await?;
                self.state = SessionState::Ready;
                info!("Connected to device {} at {}", self.descriptor.id(), self.peer());
                Ok(())
            }
        }
    }

    async fn open_connection(&mut self) -> Result<()> {
        let connection = Connection::connect(self.peer(), self.config.connect_timeout()).await?;
        self.connection = Some(connection);
        self.connected_at = Some(Instant::now());
        self.state = SessionState::Connected;
        Ok(())
    }

    async fn connect_secure(&mut self) -> Result<()> {
        let (token, key) = match (self.descriptor.token(), self.descriptor.key()) {
            (Some(token), Some(key)) => (token.to_vec(), key.to_vec()),
            _ => {
                return Err(MideaError::Credential(format!(
                    "Device {} requires a token and key",
                    self.descriptor.id()
                )));
            }
        };

        let attempts = self.config.max_handshake_retries.max(1);
        for attempt in 1..=attempts {
            if let Err(e) = self.open_connection().await {
                self.disconnect().await;
                return Err(e);
            }

            match self.handshake(&token, &key).await {
                Ok(()) => {
                    info!(
                        "Authenticated with device {} at {}",
                        self.descriptor.id(),
                        self.peer()
                    );
                    let settle = self.config.settle_delay();
                    if !settle.is_zero() {
                        tokio::time::sleep(settle).await;
                    }
                    self.state = SessionState::Ready;
                    return Ok(());
                }
                Err(e @ (MideaError::Handshake(_) | MideaError::Timeout | MideaError::Frame(_))) => {
                    warn!(
                        "Handshake attempt {}/{} with device {} failed: {}",
                        attempt,
                        attempts,
                        self.descriptor.id(),
                        e
                    );
                    self.disconnect().await;
                }
                Err(e) => {
                    self.disconnect().await;
                    return Err(e);
                }
            }
        }

        Err(MideaError::Handshake(format!(
            "Device {} rejected {} handshake attempts",
            self.descriptor.id(),
            attempts
        )))
    }

    async fn handshake(&mut self, token: &[u8], key: &[u8]) -> Result<()> {
        self.state = SessionState::Handshaking;
        let request = self.crypto.handshake_request(token)?;
        let timeout = self.config.command_timeout();
        self.connection_mut()?.send(&request, timeout).await?;
        let reply = self.receive(timeout).await?;
        self.crypto.complete_handshake(&reply, key)
    }

    /// Drop the connection and any session key. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!("Disconnecting from device {}", self.descriptor.id());
            connection.close().await;
        }
        self.crypto.reset();
        self.state = SessionState::Disconnected;
        self.connected_at = None;
        self.frame_id = 0;
        self.in_flight = false;
    }

    /// Send a command and return the frame that answers it.
    ///
    /// Reconnects first when the session is not ready (never connected,
    /// expired, or torn down by an earlier failure). Failures that leave the
    /// stream in an unknown state disconnect before returning.
    pub async fn send_command(&mut self, command: &Command) -> Result<Frame> {
        if self.in_flight {
            warn!(
                "Previous request to device {} was abandoned, reconnecting",
                self.descriptor.id()
            );
            self.disconnect().await;
        }
        if !self.is_ready() {
            self.connect().await?;
        }

        self.in_flight = true;
        let result = self.exchange(command).await;
        self.in_flight = false;

        if let Err(e) = &result
            && e.is_session_fatal()
        {
            debug!("Session with device {} failed: {}", self.descriptor.id(), e);
            self.disconnect().await;
        }
        result
    }

    async fn exchange(&mut self, command: &Command) -> Result<Frame> {
        let frame_id = self.next_frame_id();
        let frame = command.encode(frame_id)?;
        debug!("Sending {:?} as frame {}", command, hex::encode(&frame));
        let packet = pack_packet(self.descriptor.id(), &frame)?;
        let sealed = self.crypto.seal(&packet)?;

        let timeout = self.config.command_timeout();
        self.connection_mut()?.send(&sealed, timeout).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MideaError::Timeout);
            }

            let raw = self.receive(remaining).await?;
            let packet = self.crypto.open(&raw)?;
            let frame = Frame::decode(&unpack_packet(&packet)?)?;

            match command.expected_response() {
                Some(id) if frame.body.first() != Some(&id.raw()) => {
                    debug!(
                        "Discarding unsolicited frame from device {}: {}",
                        self.descriptor.id(),
                        hex::encode(&frame.body)
                    );
                }
                _ => return Ok(frame),
            }
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| MideaError::Connection("Not connected".into()))?;
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(MideaError::Cancelled),
                result = connection.receive(timeout) => result,
            },
            None => connection.receive(timeout).await,
        }
    }

    fn connection_mut(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| MideaError::Connection("Not connected".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DeviceType;
    use std::net::{IpAddr, Ipv4Addr};

    fn descriptor(version: ProtocolVersion) -> DeviceDescriptor {
        DeviceDescriptor::new(
            15393162840672,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            6444,
            DeviceType::AirConditioner,
            version,
        )
        .unwrap()
    }

    #[test]
    fn v1_devices_are_rejected() {
        assert!(matches!(
            DeviceSession::new(descriptor(ProtocolVersion::V1), SessionConfig::default()),
            Err(MideaError::UnsupportedVersion(1))
        ));
    }

    #[tokio::test]
    async fn v3_without_credentials_fails_before_connecting() {
        let mut session =
            DeviceSession::new(descriptor(ProtocolVersion::V3), SessionConfig::default()).unwrap();
        assert!(matches!(session.connect().await, Err(MideaError::Credential(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut session =
            DeviceSession::new(descriptor(ProtocolVersion::V2), SessionConfig::default()).unwrap();
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_ready());
    }

    #[test]
    fn frame_ids_wrap() {
        let mut session =
            DeviceSession::new(descriptor(ProtocolVersion::V2), SessionConfig::default()).unwrap();
        assert_eq!(session.next_frame_id(), 1);
        session.frame_id = u8::MAX;
        assert_eq!(session.next_frame_id(), 0);
    }

    #[test]
    fn lifetime_expires_connections() {
        let config = SessionConfig::default().with_max_connection_lifetime(Some(Duration::ZERO));
        let mut session = DeviceSession::new(descriptor(ProtocolVersion::V2), config).unwrap();
        assert!(!session.expired());
        session.connected_at = Some(Instant::now());
        assert!(session.expired());
    }
}
