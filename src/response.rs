//! Air conditioner response parsing.
//!
//! A response payload is the frame body without its trailing CRC. The first
//! payload byte is the [`ResponseId`].

use crate::command::{PropertyId, ResponseId};
use crate::error::{MideaError, Result};
use crate::frame::{Frame, checksum, crc8};
use crate::model::{CapabilitySet, CapabilityValue};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use std::collections::BTreeMap;

define_id_enum! {
    /// Capability ids found in 0xB5 responses.
    pub enum CapabilityId: u16 {
        SwingUdAngle = 0x0009,
        SwingLrAngle = 0x000A,
        SilkyCool = 0x0018,
        SmartEye = 0x0030,
        WindOnMe = 0x0032,
        WindOffMe = 0x0033,
        SelfClean = 0x0039,
        OneKeyNoWindOnMe = 0x0042,
        BreezeControl = 0x0043,
        RateSelect = 0x0048,
        FreshAir = 0x004B,
        FanSpeedControl = 0x0210,
        PresetEco = 0x0212,
        PresetFreezeProtection = 0x0213,
        Modes = 0x0214,
        SwingModes = 0x0215,
        Power = 0x0216,
        FilterRemind = 0x0217,
        AuxElectricHeat = 0x0219,
        PresetTurbo = 0x021A,
        Anion = 0x021E,
        Humidity = 0x021F,
        FilterCheck = 0x0221,
        Fahrenheit = 0x0222,
        DisplayControl = 0x0224,
        Temperatures = 0x0225,
        Buzzer = 0x022C,
    }
}

/// Named flags decoded from the first value byte `v` of a capability.
fn read_capability(id: CapabilityId, v: u8) -> Vec<(&'static str, bool)> {
    match id {
        CapabilityId::Anion => vec![("anion", v == 1)],
        CapabilityId::AuxElectricHeat => vec![("aux_electric_heat", v == 1)],
        CapabilityId::BreezeControl => vec![("breeze_control", v == 1)],
        CapabilityId::Buzzer => vec![("buzzer", v == 1)],
        CapabilityId::DisplayControl => vec![("display_control", matches!(v, 1 | 2 | 100))],
        CapabilityId::Fahrenheit => vec![("fahrenheit", v == 0)],
        CapabilityId::FanSpeedControl => vec![
            ("fan_silent", v == 6),
            ("fan_low", (3..=7).contains(&v)),
            ("fan_medium", (5..=7).contains(&v)),
            ("fan_high", (3..=7).contains(&v)),
            ("fan_auto", (4..=6).contains(&v)),
            ("fan_custom", v == 1),
        ],
        CapabilityId::FilterRemind => vec![
            ("filter_notice", matches!(v, 1 | 2 | 4)),
            ("filter_clean", matches!(v, 3 | 4)),
        ],
        CapabilityId::Humidity => vec![
            ("humidity_auto_set", matches!(v, 1 | 2)),
            ("humidity_manual_set", matches!(v, 2 | 3)),
        ],
        CapabilityId::Modes => vec![
            ("heat_mode", matches!(v, 1 | 2 | 4 | 6 | 7 | 9)),
            ("cool_mode", v != 2),
            ("dry_mode", matches!(v, 0 | 1 | 5 | 6 | 9)),
            ("auto_mode", matches!(v, 0 | 1 | 2 | 7 | 8 | 9)),
        ],
        CapabilityId::OneKeyNoWindOnMe => vec![("one_key_no_wind_on_me", v == 1)],
        CapabilityId::Power => vec![
            ("power_stats", (2..=5).contains(&v)),
            ("power_setting", matches!(v, 3 | 5)),
            ("power_bcd", matches!(v, 4 | 5)),
        ],
        CapabilityId::PresetEco => vec![("eco_mode", v == 1), ("eco_mode_2", v == 2)],
        CapabilityId::PresetFreezeProtection => vec![("freeze_protection", v == 1)],
        CapabilityId::PresetTurbo => vec![
            ("turbo_heat", v == 1 || v == 3),
            ("turbo_cool", v < 2),
        ],
        CapabilityId::SelfClean => vec![("self_clean", v == 1)],
        CapabilityId::SilkyCool => vec![("silky_cool", v == 1)],
        CapabilityId::SmartEye => vec![("smart_eye", v == 1)],
        CapabilityId::SwingLrAngle => vec![("swing_horizontal_angle", v == 1)],
        CapabilityId::SwingUdAngle => vec![("swing_vertical_angle", v == 1)],
        CapabilityId::SwingModes => vec![
            ("swing_horizontal", v == 1 || v == 3),
            ("swing_vertical", v < 2),
        ],
        CapabilityId::WindOffMe => vec![("wind_off_me", v == 1)],
        CapabilityId::WindOnMe => vec![("wind_on_me", v == 1)],
        _ => Vec::new(),
    }
}

/// Decoded 0xC0 state response.
#[derive(Debug, Clone, PartialEq)]
pub struct StateResponse {
    pub power_on: bool,
    pub target_temperature: f32,
    pub operational_mode: u8,
    pub fan_speed: u8,
    pub swing_mode: u8,
    pub turbo_mode: bool,
    pub follow_me: bool,
    pub eco_mode: bool,
    pub sleep_mode: bool,
    pub fahrenheit: bool,
    pub indoor_temperature: Option<f32>,
    pub outdoor_temperature: Option<f32>,
    pub filter_alert: bool,
    pub display_on: bool,
    /// Missing from short payloads sent by some firmware
    pub target_humidity: Option<u8>,
    pub freeze_protection: Option<bool>,
}

/// Decoded 0xC1 group 4 response; which reading applies depends on the
/// `power_bcd` capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerUsage {
    pub binary: f64,
    pub bcd: f64,
}

/// A parsed response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    State(StateResponse),
    Capabilities(CapabilitySet),
    Properties(BTreeMap<PropertyId, Vec<u8>>),
    PropertiesAck(BTreeMap<PropertyId, Vec<u8>>),
    PowerUsage(PowerUsage),
    Humidity(u8),
    Other { id: u8, payload: Vec<u8> },
}

impl Response {
    pub fn id(&self) -> u8 {
        match self {
            Response::State(_) => ResponseId::State.raw(),
            Response::Capabilities(_) => ResponseId::Capabilities.raw(),
            Response::Properties(_) => ResponseId::Properties.raw(),
            Response::PropertiesAck(_) => ResponseId::PropertiesAck.raw(),
            Response::PowerUsage(_) | Response::Humidity(_) => ResponseId::GroupData.raw(),
            Response::Other { id, .. } => *id,
        }
    }

    /// Whether the body's last byte matches either the CRC-8 or the checksum
    /// of the rest of the body. Firmware uses one or the other.
    pub fn verify_crc(frame: &Frame) -> bool {
        match frame.body.split_last() {
            Some((&received, rest)) if !rest.is_empty() => {
                received == crc8(rest) || received == checksum(rest)
            }
            _ => false,
        }
    }

    /// Parse a decoded frame. The frame checksum was already verified by
    /// [`Frame::decode`]; `skip_crc` also skips the body check.
    pub fn construct(frame: &Frame, skip_crc: bool) -> Result<Response> {
        if frame.body.len() < 2 {
            return Err(MideaError::Command("Response body is empty".into()));
        }
        if !skip_crc && !Self::verify_crc(frame) {
            return Err(MideaError::Command(format!(
                "Payload '{}' failed CRC and checksum",
                hex::encode(&frame.body)
            )));
        }

        let payload = &frame.body[..frame.body.len() - 1];
        match ResponseId::from_raw(payload[0]) {
            Some(ResponseId::State) => Ok(Response::State(parse_state(payload)?)),
            Some(ResponseId::Capabilities) => {
                Ok(Response::Capabilities(parse_capabilities(payload)?))
            }
            Some(ResponseId::Properties) => Ok(Response::Properties(parse_properties(payload)?)),
            Some(ResponseId::PropertiesAck) => {
                Ok(Response::PropertiesAck(parse_properties(payload)?))
            }
            Some(ResponseId::GroupData) if payload.len() > 3 => match payload[3] & 0x0F {
                4 => Ok(Response::PowerUsage(parse_power_usage(payload)?)),
                5 => Ok(Response::Humidity(parse_humidity(payload)?)),
                _ => Ok(Response::Other {
                    id: payload[0],
                    payload: payload.to_vec(),
                }),
            },
            _ => Ok(Response::Other {
                id: payload[0],
                payload: payload.to_vec(),
            }),
        }
    }
}

fn require_len(payload: &[u8], len: usize, what: &str) -> Result<()> {
    if payload.len() < len {
        return Err(MideaError::Command(format!(
            "{} payload too short ({} bytes, need {})",
            what,
            payload.len(),
            len
        )));
    }
    Ok(())
}

pub fn parse_state(payload: &[u8]) -> Result<StateResponse> {
    require_len(payload, 16, "State")?;
    debug!("State response payload: {}", hex::encode(payload));

    let half = if payload[2] & 0x10 != 0 { 0.5 } else { 0.0 };
    let mut target_temperature = (payload[2] & 0x0F) as f32 + 16.0 + half;
    let alt = payload[13] & 0x1F;
    if alt != 0 {
        target_temperature = alt as f32 + 12.0 + half;
    }

    let decode_temp = |d: u8| (d != 0xFF).then(|| (d as f32 - 50.0) / 2.0);
    // Tenths are only reported for non-zero readings
    let indoor_temperature = decode_temp(payload[11])
        .map(|t| if t != 0.0 { t + (payload[15] & 0x0F) as f32 / 10.0 } else { t });
    let outdoor_temperature = decode_temp(payload[12])
        .map(|t| if t != 0.0 { t + (payload[15] >> 4) as f32 / 10.0 } else { t });

    Ok(StateResponse {
        power_on: payload[1] & 0x01 != 0,
        target_temperature,
        operational_mode: (payload[2] >> 5) & 0x07,
        fan_speed: payload[3],
        swing_mode: payload[7] & 0x0F,
        turbo_mode: payload[8] & 0x20 != 0 || payload[10] & 0x02 != 0,
        follow_me: payload[8] & 0x80 != 0,
        eco_mode: payload[9] & 0x10 != 0,
        sleep_mode: payload[10] & 0x01 != 0,
        fahrenheit: payload[10] & 0x04 != 0,
        indoor_temperature,
        outdoor_temperature,
        filter_alert: payload[13] & 0x20 != 0,
        display_on: payload[14] != 0x70,
        target_humidity: payload.get(19).map(|h| h & 0x7F),
        freeze_protection: payload.get(21).map(|f| f & 0x80 != 0),
    })
}

pub fn parse_capabilities(payload: &[u8]) -> Result<CapabilitySet> {
    require_len(payload, 2, "Capabilities")?;
    debug!("Capabilities response payload: {}", hex::encode(payload));

    let mut caps = CapabilitySet::new();
    let count = payload[1];
    let mut rest = &payload[2..];

    for _ in 0..count {
        if rest.len() < 3 {
            break;
        }
        let raw_id = LittleEndian::read_u16(&rest[0..2]);
        let size = rest[2] as usize;
        if size == 0 {
            rest = &rest[3..];
            continue;
        }
        if rest.len() < 3 + size {
            warn!("Capability 0x{:04X} truncated", raw_id);
            break;
        }
        let values = &rest[3..3 + size];

        match CapabilityId::from_raw(raw_id) {
            Some(CapabilityId::Temperatures) => {
                if size >= 6 {
                    for (i, name) in [
                        "cool_min_temperature",
                        "cool_max_temperature",
                        "auto_min_temperature",
                        "auto_max_temperature",
                        "heat_min_temperature",
                        "heat_max_temperature",
                    ]
                    .into_iter()
                    .enumerate()
                    {
                        caps.insert(name, CapabilityValue::Number(values[i] as f32 * 0.5));
                    }
                    let decimals = if size > 6 { values[6] } else { size as u8 };
                    caps.insert("decimals", CapabilityValue::Flag(decimals != 0));
                }
            }
            Some(id) => {
                let flags = read_capability(id, values[0]);
                if flags.is_empty() {
                    warn!("Unsupported capability. ID: 0x{:04X}, Size: {}", raw_id, size);
                }
                for (name, value) in flags {
                    caps.insert(name, CapabilityValue::Flag(value));
                }
            }
            None => {
                warn!("Unknown capability. ID: 0x{:04X}, Size: {}", raw_id, size);
            }
        }
        rest = &rest[3 + size..];
    }

    if rest.len() > 1 {
        caps.set_additional(rest[rest.len() - 2] != 0);
    }
    debug!("Raw capabilities: {:?}", caps);
    Ok(caps)
}

pub fn parse_properties(payload: &[u8]) -> Result<BTreeMap<PropertyId, Vec<u8>>> {
    require_len(payload, 2, "Properties")?;
    debug!("Properties response payload: {}", hex::encode(payload));

    let mut properties = BTreeMap::new();
    let count = payload[1];
    let mut rest = &payload[2..];

    for _ in 0..count {
        if rest.len() < 4 {
            break;
        }
        let raw_id = LittleEndian::read_u16(&rest[0..2]);
        let size = rest[3] as usize;
        if size == 0 {
            rest = &rest[4..];
            continue;
        }
        if rest.len() < 4 + size {
            warn!("Property 0x{:04X} truncated", raw_id);
            break;
        }
        match PropertyId::from_raw(raw_id) {
            Some(id) => {
                properties.insert(id, rest[4..4 + size].to_vec());
            }
            None => warn!("Unknown property. ID: 0x{:04X}, Size: {}", raw_id, size),
        }
        rest = &rest[4 + size..];
    }
    Ok(properties)
}

fn decode_bcd(d: u8) -> f64 {
    (10 * (d >> 4) + (d & 0x0F)) as f64
}

pub fn parse_power_usage(payload: &[u8]) -> Result<PowerUsage> {
    require_len(payload, 19, "Power usage")?;
    let (a, b, c) = (payload[16], payload[17], payload[18]);
    Ok(PowerUsage {
        binary: ((a as u32) << 16 | (b as u32) << 8 | c as u32) as f64 / 10.0,
        bcd: 1000.0 * decode_bcd(a) + 10.0 * decode_bcd(b) + decode_bcd(c) / 10.0,
    })
}

pub fn parse_humidity(payload: &[u8]) -> Result<u8> {
    require_len(payload, 5, "Humidity")?;
    Ok(payload[4])
}
