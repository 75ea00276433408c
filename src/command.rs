//! Air conditioner commands.

use crate::error::Result;
use crate::frame::{DeviceType, FrameType, encode_command};
use crate::model::DesiredState;

/// Marks the command as coming from the app (as opposed to the remote).
const CONTROL_SOURCE: u8 = 0x02;
const BEEP: u8 = 0x40;

define_id_enum! {
    /// First byte of a response body.
    pub enum ResponseId: u8 {
        PropertiesAck = 0xB0,
        Properties = 0xB1,
        Capabilities = 0xB5,
        State = 0xC0,
        GroupData = 0xC1,
    }
}

define_id_enum! {
    /// Extended properties read and written with the 0xB0/0xB1 commands.
    #[derive(PartialOrd, Ord)]
    pub enum PropertyId: u16 {
        SwingUdAngle = 0x0009,
        SwingLrAngle = 0x000A,
        IndoorHumidity = 0x0015,
        SelfClean = 0x0039,
        RateSelect = 0x0048,
        FreshAir = 0x004B,
        Anion = 0x021E,
    }
}

define_id_enum! {
    pub enum TemperatureType: u8 {
        Unknown = 0x0,
        Indoor = 0x2,
        Outdoor = 0x3,
    }
}

/// A request to an air conditioner.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetCapabilities { additional: bool },
    GetState,
    GetPowerUsage,
    GetHumidity,
    SetState(DesiredState),
    /// Sent as a query; the device answers with its state.
    ToggleDisplay { beep: bool },
    GetProperties(Vec<PropertyId>),
    SetProperties(Vec<(PropertyId, Vec<u8>)>),
}

impl Command {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Command::SetState(_) | Command::SetProperties(_) => FrameType::Control,
            _ => FrameType::Query,
        }
    }

    /// Response id that answers this command, if the device sends a
    /// dedicated one.
    pub fn expected_response(&self) -> Option<ResponseId> {
        match self {
            Command::GetCapabilities { .. } => Some(ResponseId::Capabilities),
            Command::GetState | Command::SetState(_) | Command::ToggleDisplay { .. } => {
                Some(ResponseId::State)
            }
            Command::GetPowerUsage | Command::GetHumidity => Some(ResponseId::GroupData),
            Command::GetProperties(_) => Some(ResponseId::Properties),
            Command::SetProperties(_) => None,
        }
    }

    /// Property commands are subject to the CRC quirk of some firmware.
    pub fn is_properties(&self) -> bool {
        matches!(self, Command::GetProperties(_) | Command::SetProperties(_))
    }

    /// Command body before the frame id and CRC are appended.
    pub fn body(&self) -> Vec<u8> {
        match self {
            Command::GetCapabilities { additional: false } => vec![0xB5, 0x01, 0x00],
            Command::GetCapabilities { additional: true } => vec![0xB5, 0x01, 0x01, 0x01],
            Command::GetState => {
                let mut body = vec![0x41, 0x81, 0x00, 0xFF, 0x03, 0xFF, 0x00];
                body.push(TemperatureType::Indoor.raw());
                body.extend_from_slice(&[0u8; 12]);
                body.push(0x03);
                body
            }
            Command::GetPowerUsage => group_query(0x44),
            Command::GetHumidity => group_query(0x45),
            Command::SetState(state) => set_state_body(state),
            Command::ToggleDisplay { beep } => {
                let mut body = vec![0u8; 21];
                body[0] = 0x41;
                body[1] = CONTROL_SOURCE | if *beep { BEEP } else { 0 };
                body[3] = 0xFF;
                body[4] = 0x02;
                body[6] = 0x02;
                body
            }
            Command::GetProperties(props) => {
                let mut body = vec![0xB1, props.len() as u8];
                for prop in props {
                    body.extend_from_slice(&prop.raw().to_le_bytes());
                }
                body
            }
            Command::SetProperties(props) => {
                let mut body = vec![0xB0, props.len() as u8];
                for (prop, value) in props {
                    body.extend_from_slice(&prop.raw().to_le_bytes());
                    body.push(value.len() as u8);
                    body.extend_from_slice(value);
                }
                body
            }
        }
    }

    /// Encode to a complete appliance frame.
    pub fn encode(&self, frame_id: u8) -> Result<Vec<u8>> {
        encode_command(
            self.frame_type(),
            DeviceType::AirConditioner,
            frame_id,
            &self.body(),
        )
    }
}

fn group_query(group: u8) -> Vec<u8> {
    let mut body = vec![0u8; 20];
    body[..4].copy_from_slice(&[0x41, 0x21, 0x01, group]);
    body
}

/// Target temperature as `(temperature|half-degree bits, alternate byte)`.
///
/// 17..=30 °C uses the primary nibble, anything else the alternate byte.
fn encode_temperature(target: f32) -> (u8, u8) {
    let integral = target.trunc() as i32;
    let half = target.fract() > 0.0;

    let (mut temperature, alternate) = if (17..=30).contains(&integral) {
        (((integral - 16) & 0x0F) as u8, 0)
    } else {
        (0, ((integral - 12) & 0x1F) as u8)
    };
    if half {
        temperature |= 0x10;
    }
    (temperature, alternate)
}

fn set_state_body(state: &DesiredState) -> Vec<u8> {
    let beep = if state.beep { BEEP } else { 0 };
    let power = if state.power_on { 0x01 } else { 0 };
    let (temperature, temperature_alt) = encode_temperature(state.target_temperature);
    let mode = (state.operational_mode.raw() & 0x07) << 5;

    let swing = 0x30 | (state.swing_mode.raw() & 0x3F);
    let follow_me = if state.follow_me { 0x80 } else { 0 };
    let turbo_alt = if state.turbo_mode { 0x20 } else { 0 };
    let eco = if state.eco_mode { 0x80 } else { 0 };
    let sleep = if state.sleep_mode { 0x01 } else { 0 };
    let turbo = if state.turbo_mode { 0x02 } else { 0 };
    let fahrenheit = if state.fahrenheit { 0x04 } else { 0 };
    let freeze = if state.freeze_protection { 0x80 } else { 0 };

    let mut body = vec![
        0x40,
        CONTROL_SOURCE | beep | power,
        temperature | mode,
        state.fan_speed.raw(),
        0x7F,
        0x7F,
        0x00,
        swing,
        follow_me | turbo_alt,
        eco,
        sleep | turbo | fahrenheit,
    ];
    body.extend_from_slice(&[0u8; 7]);
    body.extend_from_slice(&[
        temperature_alt,
        state.target_humidity & 0x7F,
        0x00,
        freeze,
        0x00,
        0x00,
    ]);
    body
}
