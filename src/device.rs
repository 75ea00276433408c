//! Air conditioner control on top of a [`DeviceSession`].
//!
//! The device keeps the last known [`DeviceState`] and capabilities. State
//! is only touched after a response has been fully verified and decoded, so
//! a failed request never leaves partial updates behind.

use crate::command::{Command, PropertyId};
use crate::config::SessionConfig;
use crate::error::{MideaError, Result};
use crate::frame::Frame;
use crate::model::{
    CapabilitySet, DesiredState, DeviceDescriptor, DeviceState, FanSpeed, OperationalMode,
    SwingAngle, SwingMode,
};
use crate::response::{Response, StateResponse};
use crate::session::{DeviceSession, SessionState};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A connected (or connectable) air conditioner.
#[derive(Debug)]
pub struct Device {
    session: DeviceSession,
    state: DeviceState,
    capabilities: Option<CapabilitySet>,
    // Some firmware sends property responses with a broken CRC
    properties_crc_disabled: bool,
}

impl Device {
    pub fn new(descriptor: DeviceDescriptor, config: SessionConfig) -> Result<Self> {
        if !descriptor.device_type().is_supported() {
            return Err(MideaError::InvalidDescriptor(format!(
                "Device {} is of type 0x{:02X}, not an air conditioner",
                descriptor.id(),
                descriptor.device_type().raw()
            )));
        }
        Ok(Self {
            session: DeviceSession::new(descriptor, config)?,
            state: DeviceState::default(),
            capabilities: None,
            properties_crc_disabled: false,
        })
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.session.set_cancellation_token(Some(token));
        self
    }

    /// Replace the token; a cancelled token stays cancelled.
    pub fn set_cancellation_token(&mut self, token: Option<CancellationToken>) {
        self.session.set_cancellation_token(token);
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        self.session.descriptor()
    }

    pub fn id(&self) -> u64 {
        self.session.descriptor().id()
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Capabilities from the last successful query, if any.
    pub fn capabilities(&self) -> Option<&CapabilitySet> {
        self.capabilities.as_ref()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn online(&self) -> bool {
        self.session.descriptor().online()
    }

    pub async fn connect(&mut self) -> Result<()> {
        let result = self.session.connect().await;
        self.session.set_online(result.is_ok());
        result
    }

    pub async fn disconnect(&mut self) {
        self.session.disconnect().await;
    }

    /// Send a command and apply its response to the local state.
    pub async fn send_command(&mut self, command: &Command) -> Result<&DeviceState> {
        let response = self.request(command).await?;
        self.apply_response(response);
        Ok(&self.state)
    }

    async fn request(&mut self, command: &Command) -> Result<Response> {
        let frame = self.exchange(command).await?;
        self.construct(command, &frame)
    }

    async fn exchange(&mut self, command: &Command) -> Result<Frame> {
        let result = self.session.send_command(command).await;
        // Any answer, even an unusable one, proves the device is reachable
        self.session.set_online(result.is_ok());
        result
    }

    fn construct(&mut self, command: &Command, frame: &Frame) -> Result<Response> {
        let skip_crc = command.is_properties() && self.properties_crc_disabled;
        match Response::construct(frame, skip_crc) {
            Err(MideaError::Command(reason)) if command.is_properties() && !skip_crc => {
                warn!(
                    "Device {} sent a properties response with an invalid CRC ({}), \
                     disabling CRC checks for properties",
                    self.id(),
                    reason
                );
                self.properties_crc_disabled = true;
                Response::construct(frame, true)
            }
            result => result,
        }
    }

    fn apply_response(&mut self, response: Response) {
        match response {
            Response::State(state) => self.apply_state(&state),
            Response::Properties(properties) | Response::PropertiesAck(properties) => {
                self.apply_properties(&properties)
            }
            Response::PowerUsage(usage) => {
                let bcd = self
                    .capabilities
                    .as_ref()
                    .is_some_and(CapabilitySet::power_usage_bcd);
                self.state.power_usage = Some(if bcd { usage.bcd } else { usage.binary });
            }
            Response::Humidity(humidity) => self.state.indoor_humidity = Some(humidity),
            Response::Capabilities(_) => {
                debug!("Ignored capabilities response outside a capability query");
            }
            Response::Other { id, payload } => {
                debug!(
                    "Ignored response 0x{:02X} from device {}: {}",
                    id,
                    self.id(),
                    hex::encode(payload)
                );
            }
        }
    }

    fn apply_state(&mut self, response: &StateResponse) {
        let state = &mut self.state;
        state.power_on = response.power_on;
        state.target_temperature = response.target_temperature;
        state.operational_mode = OperationalMode::from_raw_or_default(response.operational_mode);
        state.fan_speed = FanSpeed::from_raw(response.fan_speed);
        state.swing_mode = SwingMode::from_raw_or_default(response.swing_mode);
        state.turbo_mode = response.turbo_mode;
        state.eco_mode = response.eco_mode;
        state.sleep_mode = response.sleep_mode;
        state.fahrenheit = response.fahrenheit;
        state.follow_me = response.follow_me;
        state.indoor_temperature = response.indoor_temperature;
        state.outdoor_temperature = response.outdoor_temperature;
        state.filter_alert = response.filter_alert;
        state.display_on = response.display_on;
        if let Some(humidity) = response.target_humidity {
            state.target_humidity = humidity;
        }
        if let Some(freeze) = response.freeze_protection {
            state.freeze_protection = freeze;
        }
        state.last_updated = Some(Instant::now());
        debug!("Device {} state: {:?}", self.id(), self.state);
    }

    fn apply_properties(&mut self, properties: &BTreeMap<PropertyId, Vec<u8>>) {
        for (id, value) in properties {
            let Some(&first) = value.first() else {
                continue;
            };
            match id {
                PropertyId::SwingUdAngle => {
                    self.state.vertical_swing_angle = SwingAngle::from_raw_or_default(first)
                }
                PropertyId::SwingLrAngle => {
                    self.state.horizontal_swing_angle = SwingAngle::from_raw_or_default(first)
                }
                PropertyId::IndoorHumidity => self.state.indoor_humidity = Some(first),
                other => debug!("Ignored property {:?} = {}", other, hex::encode(value)),
            }
        }
    }

    /// Angle properties this device reports support for.
    fn supported_properties(&self) -> Vec<PropertyId> {
        let Some(caps) = &self.capabilities else {
            return Vec::new();
        };
        let mut properties = Vec::new();
        if caps.supports_vertical_swing_angle() {
            properties.push(PropertyId::SwingUdAngle);
        }
        if caps.supports_horizontal_swing_angle() {
            properties.push(PropertyId::SwingLrAngle);
        }
        properties
    }

    /// Query the current state, plus power usage, humidity and louver
    /// angles where the capabilities report support for them.
    pub async fn refresh(&mut self) -> Result<&DeviceState> {
        self.send_command(&Command::GetState).await?;

        let (power, humidity) = self.capabilities.as_ref().map_or((false, false), |caps| {
            (caps.supports_power_usage(), caps.supports_humidity())
        });
        if power {
            self.send_command(&Command::GetPowerUsage).await?;
        }
        if humidity {
            self.send_command(&Command::GetHumidity).await?;
        }

        let properties = self.supported_properties();
        if !properties.is_empty() {
            self.send_command(&Command::GetProperties(properties)).await?;
        }
        Ok(&self.state)
    }

    /// Cached capabilities, querying the device on first use.
    pub async fn get_capabilities(&mut self) -> Result<&CapabilitySet> {
        if self.capabilities.is_none() {
            self.query_capabilities().await?;
        }
        self.capabilities
            .as_ref()
            .ok_or_else(|| MideaError::Command("Capabilities unavailable".into()))
    }

    /// Query capabilities, including the additional page when flagged, and
    /// replace the cached set.
    pub async fn query_capabilities(&mut self) -> Result<&CapabilitySet> {
        let mut caps = match self
            .request(&Command::GetCapabilities { additional: false })
            .await?
        {
            Response::Capabilities(caps) => caps,
            other => {
                return Err(MideaError::Command(format!(
                    "Expected capabilities, got response 0x{:02X}",
                    other.id()
                )));
            }
        };

        if caps.has_additional() {
            match self
                .request(&Command::GetCapabilities { additional: true })
                .await
            {
                Ok(Response::Capabilities(additional)) => caps.merge(additional),
                Ok(other) => warn!(
                    "Failed to query additional capabilities: got response 0x{:02X}",
                    other.id()
                ),
                Err(e) => warn!("Failed to query additional capabilities: {}", e),
            }
        }

        info!("Device {} reports {} capabilities", self.id(), caps.len());
        Ok(&*self.capabilities.insert(caps))
    }

    fn warn_unsupported(&self, desired: &DesiredState) {
        let Some(caps) = &self.capabilities else {
            return;
        };
        if !caps.operational_modes().contains(&desired.operational_mode) {
            warn!(
                "Device {} is not capable of operational mode {:?}",
                self.id(),
                desired.operational_mode
            );
        }
        if !caps.fan_speeds().contains(&desired.fan_speed) && !caps.supports_custom_fan_speed() {
            warn!(
                "Device {} is not capable of fan speed {:?}",
                self.id(),
                desired.fan_speed
            );
        }
        if !caps.swing_modes().contains(&desired.swing_mode) {
            warn!(
                "Device {} is not capable of swing mode {:?}",
                self.id(),
                desired.swing_mode
            );
        }
        if desired.turbo_mode && !caps.supports_turbo() {
            warn!("Device {} is not capable of turbo mode", self.id());
        }
        if desired.eco_mode && !caps.supports_eco() {
            warn!("Device {} is not capable of eco mode", self.id());
        }
        if desired.freeze_protection && !caps.supports_freeze_protection() {
            warn!("Device {} is not capable of freeze protection", self.id());
        }
    }

    /// Push settings to the device. Unsupported requests are logged and sent
    /// anyway; the device decides what it accepts.
    pub async fn apply(&mut self, desired: &DesiredState) -> Result<&DeviceState> {
        self.warn_unsupported(desired);
        self.send_command(&Command::SetState(desired.clone())).await?;

        let supported = self.supported_properties();
        let mut properties = Vec::new();
        for (id, angle) in [
            (PropertyId::SwingUdAngle, desired.vertical_swing_angle),
            (PropertyId::SwingLrAngle, desired.horizontal_swing_angle),
        ] {
            let Some(angle) = angle else {
                continue;
            };
            if !supported.contains(&id) {
                warn!("Device {} is not capable of property {:?}", self.id(), id);
            }
            properties.push((id, vec![angle.raw()]));
        }

        if !properties.is_empty() {
            self.send_command(&Command::SetProperties(properties)).await?;
        }
        Ok(&self.state)
    }

    /// Toggle the front panel display, then refresh to learn its new state.
    pub async fn toggle_display(&mut self, beep: bool) -> Result<&DeviceState> {
        let supported = self
            .capabilities
            .as_ref()
            .is_some_and(CapabilitySet::supports_display_control);
        if !supported {
            warn!("Device {} is not capable of display control", self.id());
        }

        // The reply to a toggle does not reflect the new display state
        match self.exchange(&Command::ToggleDisplay { beep }).await {
            Ok(_) | Err(MideaError::Timeout) => {}
            Err(e) => return Err(e),
        }
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DeviceType;
    use crate::model::CapabilityValue;
    use crate::protocol::ProtocolVersion;
    use std::net::{IpAddr, Ipv4Addr};

    const STATE_FRAME: &str =
        "aa23ac00000000000303c00145660000003c0010045c6b20000000000000000000020d79";
    const BAD_CRC_PROPERTIES: &str = "aa14ac00000000000303b10109000001003c000042";

    fn device() -> Device {
        let descriptor = DeviceDescriptor::new(
            15393162840672,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            6444,
            DeviceType::AirConditioner,
            ProtocolVersion::V2,
        )
        .unwrap();
        Device::new(descriptor, SessionConfig::default()).unwrap()
    }

    fn frame(hex_frame: &str) -> Frame {
        Frame::decode(&hex::decode(hex_frame).unwrap()).unwrap()
    }

    #[test]
    fn rejects_other_device_types() {
        let descriptor = DeviceDescriptor::new(
            1,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            6444,
            DeviceType::Other(0xA1),
            ProtocolVersion::V2,
        )
        .unwrap();
        assert!(matches!(
            Device::new(descriptor, SessionConfig::default()),
            Err(MideaError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn state_response_updates_state() {
        let mut device = device();
        assert!(device.state().is_stale());

        let response = device.construct(&Command::GetState, &frame(STATE_FRAME)).unwrap();
        device.apply_response(response);

        let state = device.state();
        assert!(state.power_on);
        assert_eq!(state.operational_mode, OperationalMode::Cool);
        assert_eq!(state.target_temperature, 21.0);
        assert_eq!(state.fan_speed, FanSpeed::Auto);
        assert_eq!(state.swing_mode, SwingMode::Vertical);
        assert!(state.eco_mode);
        assert!(!state.is_stale());
    }

    #[test]
    fn properties_crc_quirk_only_affects_properties() {
        let mut device = device();
        let bad = frame(BAD_CRC_PROPERTIES);

        assert!(matches!(
            device.construct(&Command::GetState, &bad),
            Err(MideaError::Command(_))
        ));
        assert!(!device.properties_crc_disabled);

        let get = Command::GetProperties(vec![PropertyId::SwingUdAngle]);
        let response = device.construct(&get, &bad).unwrap();
        assert!(device.properties_crc_disabled);
        assert!(matches!(response, Response::Properties(_)));

        // Still checked for everything else
        assert!(device.construct(&Command::GetState, &bad).is_err());
    }

    #[test]
    fn property_and_group_responses_update_state() {
        let mut device = device();
        let mut caps = CapabilitySet::new();
        caps.insert("power_bcd", CapabilityValue::Flag(true));
        device.capabilities = Some(caps);

        let ack = frame("aa18ac00000000000302b0020a0000013209001101000089a4");
        let response = device
            .construct(&Command::SetProperties(Vec::new()), &ack)
            .unwrap();
        device.apply_response(response);
        assert_eq!(device.state().horizontal_swing_angle, SwingAngle::Pos3);
        assert_eq!(device.state().vertical_swing_angle, SwingAngle::Off);

        device.apply_response(Response::PowerUsage(crate::response::PowerUsage {
            binary: 466.0,
            bcd: 123.4,
        }));
        device.apply_response(Response::Humidity(48));
        assert_eq!(device.state().power_usage, Some(123.4));
        assert_eq!(device.state().indoor_humidity, Some(48));
    }

    #[test]
    fn supported_properties_follow_capabilities() {
        let mut device = device();
        assert!(device.supported_properties().is_empty());

        let mut caps = CapabilitySet::new();
        caps.insert("swing_vertical_angle", CapabilityValue::Flag(true));
        caps.insert("swing_horizontal_angle", CapabilityValue::Flag(false));
        device.capabilities = Some(caps);
        assert_eq!(device.supported_properties(), vec![PropertyId::SwingUdAngle]);
    }
}
