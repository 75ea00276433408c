//! Session and discovery configuration.
//!
//! Durations are stored as plain integers so the structs read naturally from
//! JSON; accessors hand out [`Duration`]s.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// TCP port appliances accept commands on.
pub const COMMAND_PORT: u16 = 6444;
/// UDP ports appliances answer discovery probes on.
pub const DISCOVERY_PORTS: [u16; 2] = [6445, 20086];

/// Timeouts and retry policy of a device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// TCP command port (default: 6444)
    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP connect deadline in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Deadline for a single response in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// v3 handshake attempts before giving up (default: 2, i.e. one retry)
    #[serde(default = "default_handshake_retries")]
    pub max_handshake_retries: u32,

    /// Pause after a v3 handshake before the first command
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Reconnect after this many seconds (unset = keep the connection)
    #[serde(default)]
    pub max_connection_lifetime_secs: Option<u64>,
}

fn default_port() -> u16 {
    COMMAND_PORT
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_command_timeout() -> u64 {
    2_000
}

fn default_handshake_retries() -> u32 {
    2
}

fn default_settle_delay() -> u64 {
    1_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
            max_handshake_retries: default_handshake_retries(),
            settle_delay_ms: default_settle_delay(),
            max_connection_lifetime_secs: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn max_connection_lifetime(&self) -> Option<Duration> {
        self.max_connection_lifetime_secs.map(Duration::from_secs)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Clamped to at least one attempt.
    pub fn with_max_handshake_retries(mut self, retries: u32) -> Self {
        self.max_handshake_retries = retries.max(1);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_connection_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_connection_lifetime_secs = lifetime.map(|d| d.as_secs());
        self
    }
}

/// Where and how long to probe for appliances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Probe destinations (default: limited broadcast)
    #[serde(default = "default_targets")]
    pub targets: Vec<IpAddr>,

    /// Discovery ports every target is probed on
    #[serde(default = "default_discovery_ports")]
    pub ports: Vec<u16>,

    /// Times each probe is repeated
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,

    /// Collection window in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Local address of the probing socket
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
}

fn default_targets() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::BROADCAST)]
}

fn default_discovery_ports() -> Vec<u16> {
    DISCOVERY_PORTS.to_vec()
}

fn default_probe_count() -> u32 {
    3
}

fn default_probe_timeout() -> u64 {
    5_000
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            ports: default_discovery_ports(),
            probe_count: default_probe_count(),
            probe_timeout_ms: default_probe_timeout(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn with_targets(mut self, targets: Vec<IpAddr>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_probe_count(mut self, count: u32) -> Self {
        self.probe_count = count.max(1);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }
}
