//! Appliance data model: device descriptors, air conditioner enums, state and
//! capabilities.

use crate::crypto::{KEY_LENGTH, TOKEN_LENGTH};
use crate::error::{MideaError, Result};
use crate::frame::DeviceType;
use crate::protocol::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Instant;

/// Device ids are 48-bit values.
pub const MAX_DEVICE_ID: u64 = (1 << 48) - 1;

/// Everything needed to reach one appliance.
///
/// Validated on construction and immutable afterwards, except for the
/// `online` flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DescriptorRecord", into = "DescriptorRecord")]
pub struct DeviceDescriptor {
    id: u64,
    ip: IpAddr,
    port: u16,
    device_type: DeviceType,
    version: ProtocolVersion,
    serial_number: Option<String>,
    name: Option<String>,
    token: Option<Vec<u8>>,
    key: Option<Vec<u8>>,
    online: bool,
}

impl DeviceDescriptor {
    pub fn new(
        id: u64,
        ip: IpAddr,
        port: u16,
        device_type: DeviceType,
        version: ProtocolVersion,
    ) -> Result<Self> {
        if id == 0 || id > MAX_DEVICE_ID {
            return Err(MideaError::InvalidDescriptor(format!(
                "Device id {} is not a 48-bit id",
                id
            )));
        }
        if port == 0 {
            return Err(MideaError::InvalidDescriptor("Port must not be 0".into()));
        }
        Ok(Self {
            id,
            ip,
            port,
            device_type,
            version,
            serial_number: None,
            name: None,
            token: None,
            key: None,
            online: false,
        })
    }

    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach v3 credentials. Token must be 64 bytes and key 32 bytes.
    pub fn with_credentials(mut self, token: Vec<u8>, key: Vec<u8>) -> Result<Self> {
        if token.len() != TOKEN_LENGTH {
            return Err(MideaError::InvalidDescriptor(format!(
                "Token must be {} bytes, got {}",
                TOKEN_LENGTH,
                token.len()
            )));
        }
        if key.len() != KEY_LENGTH {
            return Err(MideaError::InvalidDescriptor(format!(
                "Key must be {} bytes, got {}",
                KEY_LENGTH,
                key.len()
            )));
        }
        self.token = Some(token);
        self.key = Some(key);
        Ok(self)
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Whether this crate can control the device.
    pub fn supported(&self) -> bool {
        self.device_type.is_supported() && self.version != ProtocolVersion::V1
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn token(&self) -> Option<&[u8]> {
        self.token.as_deref()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn has_credentials(&self) -> bool {
        self.token.is_some() && self.key.is_some()
    }

    pub fn online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }
}

/// Serialized form of a descriptor; token and key as hex strings.
#[derive(Serialize, Deserialize)]
struct DescriptorRecord {
    id: u64,
    ip: IpAddr,
    port: u16,
    device_type: DeviceType,
    version: ProtocolVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default)]
    online: bool,
}

impl TryFrom<DescriptorRecord> for DeviceDescriptor {
    type Error = MideaError;

    fn try_from(record: DescriptorRecord) -> Result<Self> {
        let mut descriptor = DeviceDescriptor::new(
            record.id,
            record.ip,
            record.port,
            record.device_type,
            record.version,
        )?;
        descriptor.serial_number = record.serial_number;
        descriptor.name = record.name;
        descriptor.online = record.online;

        match (record.token, record.key) {
            (Some(token), Some(key)) => {
                let decode = |field: &str, value: &str| {
                    hex::decode(value).map_err(|e| {
                        MideaError::InvalidDescriptor(format!("Invalid {} hex: {}", field, e))
                    })
                };
                descriptor.with_credentials(decode("token", &token)?, decode("key", &key)?)
            }
            (None, None) => Ok(descriptor),
            _ => Err(MideaError::InvalidDescriptor(
                "Token and key must be given together".into(),
            )),
        }
    }
}

impl From<DeviceDescriptor> for DescriptorRecord {
    fn from(d: DeviceDescriptor) -> Self {
        Self {
            id: d.id,
            ip: d.ip,
            port: d.port,
            device_type: d.device_type,
            version: d.version,
            serial_number: d.serial_number,
            name: d.name,
            token: d.token.map(hex::encode),
            key: d.key.map(hex::encode),
            online: d.online,
        }
    }
}

define_id_enum! {
    #[derive(Serialize, Deserialize)]
    pub enum OperationalMode: u8, default = FanOnly {
        Auto = 1,
        Cool = 2,
        Dry = 3,
        Heat = 4,
        FanOnly = 5,
    }
}

define_id_enum! {
    #[derive(Serialize, Deserialize)]
    pub enum SwingMode: u8, default = Off {
        Off = 0x0,
        Vertical = 0xC,
        Horizontal = 0x3,
        Both = 0xF,
    }
}

define_id_enum! {
    /// Louver position, as a percentage of travel.
    #[derive(Serialize, Deserialize)]
    pub enum SwingAngle: u8, default = Off {
        Off = 0,
        Pos1 = 1,
        Pos2 = 25,
        Pos3 = 50,
        Pos4 = 75,
        Pos5 = 100,
    }
}

/// Fan speed. Devices with custom speed support report any value 1..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum FanSpeed {
    #[default]
    Auto,
    High,
    Medium,
    Low,
    Silent,
    Custom(u8),
}

impl FanSpeed {
    /// Named speeds, slowest first.
    pub const PRESETS: [FanSpeed; 5] = [
        FanSpeed::Silent,
        FanSpeed::Low,
        FanSpeed::Medium,
        FanSpeed::High,
        FanSpeed::Auto,
    ];

    pub fn from_raw(value: u8) -> Self {
        match value {
            102 => FanSpeed::Auto,
            80 => FanSpeed::High,
            60 => FanSpeed::Medium,
            40 => FanSpeed::Low,
            20 => FanSpeed::Silent,
            v => FanSpeed::Custom(v),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            FanSpeed::Auto => 102,
            FanSpeed::High => 80,
            FanSpeed::Medium => 60,
            FanSpeed::Low => 40,
            FanSpeed::Silent => 20,
            FanSpeed::Custom(v) => v,
        }
    }

    pub fn is_custom(self) -> bool {
        matches!(self, FanSpeed::Custom(_))
    }
}

impl From<u8> for FanSpeed {
    fn from(value: u8) -> Self {
        FanSpeed::from_raw(value)
    }
}

impl From<FanSpeed> for u8 {
    fn from(value: FanSpeed) -> Self {
        value.raw()
    }
}

/// Last known state of an air conditioner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub power_on: bool,
    pub operational_mode: OperationalMode,
    pub target_temperature: f32,
    pub indoor_temperature: Option<f32>,
    pub outdoor_temperature: Option<f32>,
    pub fan_speed: FanSpeed,
    pub swing_mode: SwingMode,
    pub eco_mode: bool,
    pub turbo_mode: bool,
    pub freeze_protection: bool,
    pub sleep_mode: bool,
    pub fahrenheit: bool,
    pub display_on: bool,
    pub filter_alert: bool,
    pub follow_me: bool,
    pub target_humidity: u8,
    pub indoor_humidity: Option<u8>,
    pub power_usage: Option<f64>,
    pub horizontal_swing_angle: SwingAngle,
    pub vertical_swing_angle: SwingAngle,
    /// When a state response was last applied. `None` until the first refresh.
    #[serde(skip)]
    pub last_updated: Option<Instant>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            power_on: false,
            operational_mode: OperationalMode::Auto,
            target_temperature: 17.0,
            indoor_temperature: None,
            outdoor_temperature: None,
            fan_speed: FanSpeed::Auto,
            swing_mode: SwingMode::Off,
            eco_mode: false,
            turbo_mode: false,
            freeze_protection: false,
            sleep_mode: false,
            fahrenheit: false,
            display_on: false,
            filter_alert: false,
            follow_me: false,
            target_humidity: 40,
            indoor_humidity: None,
            power_usage: None,
            horizontal_swing_angle: SwingAngle::Off,
            vertical_swing_angle: SwingAngle::Off,
            last_updated: None,
        }
    }
}

impl DeviceState {
    pub fn is_stale(&self) -> bool {
        self.last_updated.is_none()
    }
}

/// Value of a single decoded capability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Flag(bool),
    Number(f32),
}

/// Capabilities reported by a device, by name.
///
/// Names follow the decoder table in [`crate::response`]; the typed accessors
/// apply the defaults used for devices that omit a capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet {
    values: BTreeMap<String, CapabilityValue>,
    #[serde(skip)]
    additional: bool,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: CapabilityValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<CapabilityValue> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, CapabilityValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Another capability page must be queried.
    pub fn has_additional(&self) -> bool {
        self.additional
    }

    pub(crate) fn set_additional(&mut self, additional: bool) {
        self.additional = additional;
    }

    /// Add (and overwrite with) the capabilities of another page.
    pub fn merge(&mut self, other: CapabilitySet) {
        self.values.extend(other.values);
        log::debug!("Merged capabilities: {:?}", self.values);
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some(CapabilityValue::Flag(true)))
    }

    fn number(&self, name: &str) -> Option<f32> {
        match self.get(name) {
            Some(CapabilityValue::Number(n)) => Some(n),
            _ => None,
        }
    }

    pub fn operational_modes(&self) -> Vec<OperationalMode> {
        let mut modes = vec![OperationalMode::FanOnly];
        for (name, mode) in [
            ("dry_mode", OperationalMode::Dry),
            ("cool_mode", OperationalMode::Cool),
            ("heat_mode", OperationalMode::Heat),
            ("auto_mode", OperationalMode::Auto),
        ] {
            if self.flag(name) {
                modes.push(mode);
            }
        }
        modes
    }

    pub fn swing_modes(&self) -> Vec<SwingMode> {
        let mut modes = vec![SwingMode::Off];
        let horizontal = self.flag("swing_horizontal");
        let vertical = self.flag("swing_vertical");
        if horizontal {
            modes.push(SwingMode::Horizontal);
        }
        if vertical {
            modes.push(SwingMode::Vertical);
        }
        if horizontal && vertical {
            modes.push(SwingMode::Both);
        }
        modes
    }

    /// Fan speeds the device accepts. Devices that report no fan capability
    /// get low, medium, high and auto.
    pub fn fan_speeds(&self) -> Vec<FanSpeed> {
        let reported = self.values.keys().any(|k| k.starts_with("fan_"));
        let custom = self.supports_custom_fan_speed();
        FanSpeed::PRESETS
            .into_iter()
            .filter(|speed| {
                let name = match speed {
                    FanSpeed::Silent => "fan_silent",
                    FanSpeed::Low => "fan_low",
                    FanSpeed::Medium => "fan_medium",
                    FanSpeed::High => "fan_high",
                    _ => "fan_auto",
                };
                if reported {
                    self.flag(name) || custom
                } else {
                    *speed != FanSpeed::Silent
                }
            })
            .collect()
    }

    pub fn supports_custom_fan_speed(&self) -> bool {
        self.flag("fan_custom")
    }

    pub fn supports_eco(&self) -> bool {
        self.flag("eco_mode") || self.flag("eco_mode_2")
    }

    pub fn supports_turbo(&self) -> bool {
        self.flag("turbo_heat") || self.flag("turbo_cool")
    }

    pub fn supports_freeze_protection(&self) -> bool {
        self.flag("freeze_protection")
    }

    pub fn supports_display_control(&self) -> bool {
        self.flag("display_control")
    }

    pub fn supports_filter_reminder(&self) -> bool {
        self.flag("filter_notice")
    }

    pub fn supports_power_usage(&self) -> bool {
        self.flag("power_stats")
    }

    pub fn power_usage_bcd(&self) -> bool {
        self.flag("power_bcd")
    }

    pub fn supports_humidity(&self) -> bool {
        self.flag("humidity_auto_set") || self.flag("humidity_manual_set")
    }

    pub fn supports_horizontal_swing_angle(&self) -> bool {
        self.flag("swing_horizontal_angle")
    }

    pub fn supports_vertical_swing_angle(&self) -> bool {
        self.flag("swing_vertical_angle")
    }

    /// Lowest target temperature across cool, auto and heat (default 16).
    pub fn min_temperature(&self) -> f32 {
        ["cool", "auto", "heat"]
            .iter()
            .map(|m| self.number(&format!("{}_min_temperature", m)).unwrap_or(16.0))
            .fold(f32::INFINITY, f32::min)
    }

    /// Highest target temperature across cool, auto and heat (default 30).
    pub fn max_temperature(&self) -> f32 {
        ["cool", "auto", "heat"]
            .iter()
            .map(|m| self.number(&format!("{}_max_temperature", m)).unwrap_or(30.0))
            .fold(f32::NEG_INFINITY, f32::max)
    }
}

/// Settings to push to an air conditioner with [`crate::Device::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub power_on: bool,
    pub operational_mode: OperationalMode,
    pub target_temperature: f32,
    pub fan_speed: FanSpeed,
    pub swing_mode: SwingMode,
    pub eco_mode: bool,
    pub turbo_mode: bool,
    pub freeze_protection: bool,
    pub sleep_mode: bool,
    pub fahrenheit: bool,
    pub follow_me: bool,
    pub target_humidity: u8,
    /// Sound the buzzer on acceptance
    pub beep: bool,
    /// Only sent when set
    pub horizontal_swing_angle: Option<SwingAngle>,
    pub vertical_swing_angle: Option<SwingAngle>,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self::from(&DeviceState::default())
    }
}

impl From<&DeviceState> for DesiredState {
    /// Start from the device's current settings.
    fn from(state: &DeviceState) -> Self {
        Self {
            power_on: state.power_on,
            operational_mode: state.operational_mode,
            target_temperature: state.target_temperature,
            fan_speed: state.fan_speed,
            swing_mode: state.swing_mode,
            eco_mode: state.eco_mode,
            turbo_mode: state.turbo_mode,
            freeze_protection: state.freeze_protection,
            sleep_mode: state.sleep_mode,
            fahrenheit: state.fahrenheit,
            follow_me: state.follow_me,
            target_humidity: state.target_humidity,
            beep: false,
            horizontal_swing_angle: None,
            vertical_swing_angle: None,
        }
    }
}

impl DesiredState {
    pub fn with_power(mut self, on: bool) -> Self {
        self.power_on = on;
        self
    }

    pub fn with_mode(mut self, mode: OperationalMode) -> Self {
        self.operational_mode = mode;
        self
    }

    pub fn with_target_temperature(mut self, temperature: f32) -> Self {
        self.target_temperature = temperature;
        self
    }

    pub fn with_fan_speed(mut self, speed: FanSpeed) -> Self {
        self.fan_speed = speed;
        self
    }

    pub fn with_swing_mode(mut self, mode: SwingMode) -> Self {
        self.swing_mode = mode;
        self
    }

    pub fn with_beep(mut self, beep: bool) -> Self {
        self.beep = beep;
        self
    }

    pub fn with_horizontal_swing_angle(mut self, angle: SwingAngle) -> Self {
        self.horizontal_swing_angle = Some(angle);
        self
    }

    pub fn with_vertical_swing_angle(mut self, angle: SwingAngle) -> Self {
        self.vertical_swing_angle = Some(angle);
        self
    }
}
