//! Appliance discovery over broadcast UDP.
//!
//! Appliances answer a fixed probe with a LAN packet (v2) or a LAN packet
//! wrapped in a v3 header (v3). The encrypted body carries the address,
//! serial number and SSID-style name of the device:
//!
//! ```text
//! 0..4    IPv4 address, reversed
//! 4..6    command port (LE)
//! 8..40   serial number (ASCII)
//! 40      name length
//! 41..    name, e.g. "net_ac_F7B4" (the second field is the device type in hex)
//! ```

use crate::config::{DiscoveryConfig, SessionConfig};
use crate::credentials::CredentialSource;
use crate::crypto::{Endian, udpid};
use crate::error::{MideaError, Result};
use crate::frame::DeviceType;
use crate::model::DeviceDescriptor;
use crate::protocol::{PREFIX_LAN, PREFIX_V3, ProtocolVersion, packet_device_id, unpack_packet};
use crate::session::DeviceSession;
use futures_util::StreamExt;
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Probe every appliance answers.
pub const DISCOVERY_MSG: [u8; 72] = [
    0x5a, 0x5a, 0x01, 0x11, 0x48, 0x00, 0x92, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7f, 0x75, 0xbd, 0x6b, 0x3e, 0x4f, 0x8b, 0x76,
    0x2e, 0x84, 0x9c, 0x6e, 0x57, 0x8d, 0x65, 0x90, 0x03, 0x6e, 0x9d, 0x43, 0x42, 0xa5, 0x0f, 0x1f,
    0x56, 0x9e, 0xb8, 0xec, 0x91, 0x8e, 0x92, 0xe5,
];

/// v3 replies wrap the LAN packet between an 8-byte header and a 16-byte trailer.
const V3_REPLY_HEADER: usize = 8;
const V3_REPLY_TRAILER: usize = 16;
const INFO_NAME_OFFSET: usize = 40;

/// One discovery reply and what became of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub addr: SocketAddr,
    pub outcome: Result<DeviceDescriptor>,
}

/// Protocol generation of a discovery reply.
pub fn detect_version(data: &[u8]) -> Result<ProtocolVersion> {
    // v1 appliances answer with an XML document
    let text = String::from_utf8_lossy(data);
    if text.trim_start().starts_with('<') {
        return Ok(ProtocolVersion::V1);
    }

    match data.get(0..2).map(|p| u16::from_be_bytes([p[0], p[1]])) {
        Some(PREFIX_LAN) => Ok(ProtocolVersion::V2),
        Some(PREFIX_V3) => Ok(ProtocolVersion::V3),
        _ => Err(MideaError::Frame(format!(
            "Unknown discovery reply: {}",
            hex::encode(data)
        ))),
    }
}

/// Parse a discovery reply received from `ip`.
pub fn parse_reply(ip: IpAddr, data: &[u8]) -> Result<DeviceDescriptor> {
    let version = detect_version(data)?;
    let packet = match version {
        ProtocolVersion::V1 => return Err(MideaError::UnsupportedVersion(1)),
        ProtocolVersion::V2 => data,
        ProtocolVersion::V3 => data
            .get(V3_REPLY_HEADER..data.len().saturating_sub(V3_REPLY_TRAILER))
            .ok_or_else(|| MideaError::Frame("v3 discovery reply too short".into()))?,
    };

    let id = packet_device_id(packet)?;
    let info = unpack_packet(packet)?;
    debug!("Decrypted discovery reply from {}: {}", ip, hex::encode(&info));

    if info.len() <= INFO_NAME_OFFSET {
        return Err(MideaError::Frame(format!(
            "Discovery info too short ({} bytes)",
            info.len()
        )));
    }

    let reported = Ipv4Addr::new(info[3], info[2], info[1], info[0]);
    if IpAddr::V4(reported) != ip {
        warn!(
            "Reported device IP {} does not match received IP {}. Using received IP.",
            reported, ip
        );
    }
    let port = u16::from_le_bytes([info[4], info[5]]);
    let serial_number = String::from_utf8_lossy(&info[8..INFO_NAME_OFFSET])
        .trim_end_matches('\0')
        .to_string();

    let name_length = info[INFO_NAME_OFFSET] as usize;
    let name = info
        .get(INFO_NAME_OFFSET + 1..INFO_NAME_OFFSET + 1 + name_length)
        .map(|n| String::from_utf8_lossy(n).to_string())
        .ok_or_else(|| MideaError::Frame("Discovery info name is truncated".into()))?;
    let device_type = name
        .split('_')
        .nth(1)
        .and_then(|t| u8::from_str_radix(t, 16).ok())
        .map(DeviceType::from)
        .ok_or_else(|| MideaError::Frame(format!("No device type in name '{}'", name)))?;

    Ok(DeviceDescriptor::new(id, ip, port, device_type, version)?
        .with_serial_number(serial_number)
        .with_name(name)
        .with_online(version == ProtocolVersion::V2))
}

/// Finds appliances on the local network.
#[derive(Clone, Default)]
pub struct Discover {
    config: DiscoveryConfig,
    session_config: SessionConfig,
    credentials: Option<Arc<dyn CredentialSource>>,
}

impl std::fmt::Debug for Discover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discover")
            .field("config", &self.config)
            .field("session_config", &self.session_config)
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl Discover {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Resolve and verify credentials of v3 devices through `source`.
    pub fn with_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Session settings used to verify v3 credentials.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Probe `targets` and report every distinct reply, including the ones
    /// that could not be turned into a descriptor.
    pub async fn scan(&self, targets: &[IpAddr], timeout: Duration) -> Vec<ScanResult> {
        let destinations: Vec<SocketAddr> = targets
            .iter()
            .flat_map(|ip| self.config.ports.iter().map(|port| SocketAddr::new(*ip, *port)))
            .collect();

        let replies = crate::transport::broadcast(
            DISCOVERY_MSG.to_vec(),
            destinations,
            self.config.probe_count,
            timeout,
            self.config.bind_addr,
        );
        let mut replies = std::pin::pin!(replies);

        // Each request goes out several times; one result per source address
        let mut index: HashMap<SocketAddr, usize> = HashMap::new();
        let mut results: Vec<ScanResult> = Vec::new();
        while let Some((addr, data)) = replies.next().await {
            debug!("Discovery response from {}: {}", addr, hex::encode(&data));
            let outcome = parse_reply(addr.ip(), &data);
            if let Err(e) = &outcome {
                warn!("Ignoring discovery reply from {}: {}", addr, e);
            }

            match index.get(&addr).copied() {
                // A failed reply never hides a good one
                Some(i) if outcome.is_ok() || results[i].outcome.is_err() => {
                    results[i].outcome = outcome;
                }
                Some(_) => {}
                None => {
                    index.insert(addr, results.len());
                    results.push(ScanResult { addr, outcome });
                }
            }
        }
        results
    }

    /// Find every supported air conditioner answering the configured targets.
    ///
    /// Devices that answer more than once are reported once, with the data of
    /// their last reply.
    pub async fn discover_all(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        info!(
            "Starting discovery (targets: {:?}, ports: {:?})",
            self.config.targets, self.config.ports
        );
        let results = self.scan(&self.config.targets, timeout).await;

        let mut devices: Vec<DeviceDescriptor> = Vec::new();
        for descriptor in results.into_iter().filter_map(|r| r.outcome.ok()) {
            if !descriptor.device_type().is_supported() {
                info!(
                    "Skipping device {} of type 0x{:02X}",
                    descriptor.id(),
                    descriptor.device_type().raw()
                );
                continue;
            }
            match devices.iter_mut().find(|d| d.id() == descriptor.id()) {
                Some(existing) => *existing = descriptor,
                None => devices.push(descriptor),
            }
        }

        let devices = join_all(devices.into_iter().map(|d| self.resolve_credentials(d))).await;
        info!("Discovery finished. Found {} devices.", devices.len());
        Ok(devices)
    }

    /// Probe a single host.
    pub async fn discover_single(&self, host: IpAddr, timeout: Duration) -> Result<DeviceDescriptor> {
        let results = self.scan(&[host], timeout).await;

        let mut error = None;
        for result in results {
            match result.outcome {
                Ok(descriptor) if descriptor.device_type().is_supported() => {
                    return Ok(self.resolve_credentials(descriptor).await);
                }
                Ok(descriptor) => {
                    info!(
                        "Device {} at {} is of unsupported type 0x{:02X}",
                        descriptor.id(),
                        host,
                        descriptor.device_type().raw()
                    );
                }
                Err(e @ MideaError::UnsupportedVersion(_)) => error = Some(e),
                Err(_) => {}
            }
        }
        Err(error.unwrap_or_else(|| MideaError::NotFound(host.to_string())))
    }

    /// Attach verified credentials to a v3 descriptor when a source is
    /// configured. Failures are logged and the descriptor is returned as is.
    async fn resolve_credentials(&self, descriptor: DeviceDescriptor) -> DeviceDescriptor {
        let Some(source) = &self.credentials else {
            return descriptor;
        };
        if descriptor.version() != ProtocolVersion::V3 || descriptor.has_credentials() {
            return descriptor;
        }

        for endian in Endian::LOOKUP_ORDER {
            let lookup_id = udpid(descriptor.id(), endian);
            debug!(
                "Fetching token and key for udpid '{}' ({:?})",
                hex::encode(lookup_id),
                endian
            );
            let (token, key) = match source.token_and_key(descriptor.id(), &lookup_id).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("No credentials for device {}: {}", descriptor.id(), e);
                    continue;
                }
            };
            let candidate = match descriptor.clone().with_credentials(token, key) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!("Unusable credentials for device {}: {}", descriptor.id(), e);
                    continue;
                }
            };

            match self.verify(candidate).await {
                Ok(verified) => {
                    info!("Authenticated device {} ({:?})", verified.id(), endian);
                    return verified;
                }
                Err(e) => warn!(
                    "Credentials for device {} rejected ({:?}): {}",
                    descriptor.id(),
                    endian,
                    e
                ),
            }
        }
        descriptor
    }

    async fn verify(&self, candidate: DeviceDescriptor) -> Result<DeviceDescriptor> {
        // A single attempt per candidate; the next endian is the retry.
        // The session is dropped right away, so nothing waits on it to settle.
        let config = self
            .session_config
            .clone()
            .with_max_handshake_retries(1)
            .with_settle_delay(Duration::ZERO);
        let mut session = DeviceSession::new(candidate.clone(), config)?;
        let result = session.connect().await;
        session.disconnect().await;
        result.map(|()| candidate.with_online(true))
    }
}
