//! Appliance frame codec.
//!
//! Every command and response exchanged with an appliance is an `0xAA`
//! frame, independent of the transport generation that carries it:
//!
//! ```text
//! 0     1        2            3..8      8         9           10..N-1  N-1
//! 0xAA  length   device type  reserved  protocol  frame type  body     checksum
//! ```
//!
//! `length` counts every byte after the start byte. The checksum is the two's
//! complement of the byte sum of `frame[1..N-1]`. Command bodies end with a
//! frame id and a CRC-8 over the rest of the body.

use crate::error::{MideaError, Result};
use crc::{CRC_8_MAXIM_DOW, Crc};
use serde::{Deserialize, Serialize};

pub const FRAME_START: u8 = 0xAA;
pub const HEADER_LENGTH: usize = 10;

const BODY_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);

define_id_enum! {
    /// Frame (message) type carried in header byte 9.
    pub enum FrameType: u8 {
        Control = 0x02,
        Query = 0x03,
        Notify1 = 0x04,
        Notify2 = 0x05,
        Exception = 0x06,
        QueryAppliance = 0xA0,
    }
}

/// Appliance category carried in header byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum DeviceType {
    AirConditioner,
    Other(u8),
}

impl DeviceType {
    pub const AIR_CONDITIONER: u8 = 0xAC;

    pub fn raw(self) -> u8 {
        match self {
            DeviceType::AirConditioner => Self::AIR_CONDITIONER,
            DeviceType::Other(v) => v,
        }
    }

    pub fn is_supported(self) -> bool {
        self == DeviceType::AirConditioner
    }
}

impl From<u8> for DeviceType {
    fn from(value: u8) -> Self {
        match value {
            Self::AIR_CONDITIONER => DeviceType::AirConditioner,
            v => DeviceType::Other(v),
        }
    }
}

impl From<DeviceType> for u8 {
    fn from(value: DeviceType) -> Self {
        value.raw()
    }
}

/// A decoded appliance frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub device_type: DeviceType,
    pub protocol_version: u8,
    /// Raw frame type; devices occasionally answer with types outside [`FrameType`].
    pub frame_type: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(device_type: DeviceType, frame_type: FrameType, body: Vec<u8>) -> Self {
        Self {
            device_type,
            protocol_version: 0,
            frame_type: frame_type.raw(),
            body,
        }
    }

    /// Length of the encoded frame including start byte and checksum.
    pub fn encoded_len(&self) -> usize {
        HEADER_LENGTH + self.body.len() + 1
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let total = self.encoded_len();
        if total - 1 > u8::MAX as usize {
            return Err(MideaError::Frame(format!(
                "Body of {} bytes does not fit in a frame",
                self.body.len()
            )));
        }

        let mut data = Vec::with_capacity(total);
        data.push(FRAME_START);
        data.push((total - 1) as u8);
        data.push(self.device_type.raw());
        data.extend_from_slice(&[0u8; 5]);
        data.push(self.protocol_version);
        data.push(self.frame_type);
        data.extend_from_slice(&self.body);
        data.push(checksum(&data[1..]));
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Frame> {
        if data.len() < HEADER_LENGTH + 1 {
            return Err(MideaError::Frame(format!(
                "Frame too short ({} bytes)",
                data.len()
            )));
        }
        if data[0] != FRAME_START {
            return Err(MideaError::Frame(format!(
                "Invalid start byte 0x{:02X}",
                data[0]
            )));
        }

        let declared = data[1] as usize + 1;
        if declared != data.len() {
            return Err(MideaError::Frame(format!(
                "Declared length {} does not match actual length {}",
                declared,
                data.len()
            )));
        }

        let received = data[data.len() - 1];
        let expected = checksum(&data[1..data.len() - 1]);
        if received != expected {
            return Err(MideaError::Frame(format!(
                "Checksum mismatch. Received: 0x{:02X}, Expected: 0x{:02X}",
                received, expected
            )));
        }

        Ok(Frame {
            device_type: DeviceType::from(data[2]),
            protocol_version: data[8],
            frame_type: data[9],
            body: data[HEADER_LENGTH..data.len() - 1].to_vec(),
        })
    }
}

/// Two's complement of the byte sum.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

/// CRC-8/MAXIM used to protect command and response bodies.
pub fn crc8(data: &[u8]) -> u8 {
    BODY_CRC.checksum(data)
}

/// Encode a command: `body ‖ frame_id ‖ crc8(body ‖ frame_id)` wrapped in a frame.
pub fn encode_command(
    frame_type: FrameType,
    device_type: DeviceType,
    frame_id: u8,
    body: &[u8],
) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(body.len() + 2);
    payload.extend_from_slice(body);
    payload.push(frame_id);
    payload.push(crc8(&payload));
    Frame::new(device_type, frame_type, payload).encode()
}
