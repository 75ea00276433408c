//! # rustmidea
//!
//! Asynchronous local-network control of Midea-protocol air conditioners:
//! UDP discovery, the v2/v3 packet codec, v3 session authentication and
//! typed state and capability queries, without cloud round trips.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rustmidea::{Device, Discover, DiscoveryConfig, SessionConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> rustmidea::Result<()> {
//! let discover = Discover::new(DiscoveryConfig::default());
//! for descriptor in discover.discover_all(Duration::from_secs(5)).await? {
//!     let mut device = Device::new(descriptor, SessionConfig::default())?;
//!     let power_on = device.refresh().await?.power_on;
//!     println!("{} power: {}", device.id(), power_on);
//! }
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod command;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod device;
pub mod discover;
pub mod error;
pub mod frame;
pub mod model;
pub mod protocol;
pub mod response;
pub mod session;
pub mod transport;

pub use command::Command;
pub use config::{DiscoveryConfig, SessionConfig};
pub use credentials::{CredentialSource, StaticCredentials};
pub use device::Device;
pub use discover::{Discover, ScanResult};
pub use error::{MideaError, Result};
pub use frame::DeviceType;
pub use model::{
    CapabilitySet, DesiredState, DeviceDescriptor, DeviceState, FanSpeed, OperationalMode,
    SwingAngle, SwingMode,
};
pub use protocol::ProtocolVersion;
pub use session::{DeviceSession, SessionState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
