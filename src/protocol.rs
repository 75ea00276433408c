//! Midea LAN wire protocol.
//! Handles packet framing, header parsing and signature verification for the
//! LAN packet shared by all protocol versions and for the v3 envelope.

use crate::crypto;
use crate::error::{MideaError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use chrono::{Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const PREFIX_LAN: u16 = 0x5A5A;
pub const PREFIX_V3: u16 = 0x8370;

/// Bytes needed to determine the length of any packet.
pub const MIN_HEADER_LENGTH: usize = 6;

pub const LAN_HEADER_LENGTH: usize = 40;
pub const LAN_SIGN_LENGTH: usize = 16;
const LAN_MESSAGE_TYPE: u16 = 0x0111;
const LAN_MAGIC: u16 = 0x2000;
const LAN_DEVICE_ID_OFFSET: usize = 20;

pub const V3_HEADER_LENGTH: usize = 6;
pub const V3_PACKET_ID_LENGTH: usize = 2;
pub const V3_HASH_LENGTH: usize = 32;
const V3_MAGIC: u8 = 0x20;

define_id_enum! {
    /// Protocol generation of an appliance.
    #[derive(Serialize, Deserialize, PartialOrd, Ord)]
    #[serde(try_from = "u8", into = "u8")]
    pub enum ProtocolVersion: u8 {
        /// Legacy XML/plaintext protocol, detected but not controllable.
        V1 = 1,
        /// LAN packets with the fixed-key frame encryption only.
        V2 = 2,
        /// LAN packets wrapped in an authenticated, session-keyed envelope.
        V3 = 3,
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(value: ProtocolVersion) -> Self {
        value.raw()
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.raw())
    }
}

define_id_enum! {
    /// Packet type of a v3 envelope (low nibble of header byte 5).
    pub enum PacketType: u8 {
        HandshakeRequest = 0x0,
        HandshakeResponse = 0x1,
        EncryptedResponse = 0x3,
        EncryptedRequest = 0x6,
        Error = 0xF,
    }
}

/// Parsed header of any packet found on a command connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    Lan {
        total_length: usize,
    },
    V3 {
        total_length: usize,
        packet_type: u8,
        pad: usize,
    },
}

impl PacketHeader {
    pub fn total_length(&self) -> usize {
        match self {
            PacketHeader::Lan { total_length } | PacketHeader::V3 { total_length, .. } => {
                *total_length
            }
        }
    }
}

/// Parse the first [`MIN_HEADER_LENGTH`] bytes of a packet.
pub fn parse_header(data: &[u8]) -> Result<PacketHeader> {
    if data.len() < MIN_HEADER_LENGTH {
        return Err(MideaError::Frame("Header too short".into()));
    }

    match BigEndian::read_u16(&data[0..2]) {
        PREFIX_LAN => {
            let total_length = LittleEndian::read_u16(&data[4..6]) as usize;
            if total_length < LAN_HEADER_LENGTH + LAN_SIGN_LENGTH {
                return Err(MideaError::Frame(format!(
                    "LAN packet length {} is shorter than its header",
                    total_length
                )));
            }
            Ok(PacketHeader::Lan { total_length })
        }
        PREFIX_V3 => {
            if data[4] != V3_MAGIC {
                return Err(MideaError::Frame(format!(
                    "Invalid magic byte 0x{:02X}",
                    data[4]
                )));
            }
            // Header + packet id + size (payload, padding and hash)
            let total_length =
                BigEndian::read_u16(&data[2..4]) as usize + V3_HEADER_LENGTH + V3_PACKET_ID_LENGTH;
            Ok(PacketHeader::V3 {
                total_length,
                packet_type: data[5] & 0x0F,
                pad: (data[5] >> 4) as usize,
            })
        }
        prefix => Err(MideaError::Frame(format!(
            "Invalid start of packet 0x{:04X}",
            prefix
        ))),
    }
}

/// Build a v3 envelope header.
pub fn encode_v3_header(size: usize, packet_type: PacketType, pad: usize) -> Result<[u8; 6]> {
    if size > u16::MAX as usize || pad > 0x0F {
        return Err(MideaError::Frame(format!(
            "Envelope size {} with padding {} is not encodable",
            size, pad
        )));
    }
    let mut header = [0u8; V3_HEADER_LENGTH];
    BigEndian::write_u16(&mut header[0..2], PREFIX_V3);
    BigEndian::write_u16(&mut header[2..4], size as u16);
    header[4] = V3_MAGIC;
    header[5] = ((pad as u8) << 4) | packet_type.raw();
    Ok(header)
}

/// Pack an appliance frame into a signed LAN packet.
pub fn pack_packet(device_id: u64, frame: &[u8]) -> Result<Vec<u8>> {
    let encrypted = crypto::encrypt_frame(frame);
    let length = LAN_HEADER_LENGTH + encrypted.len() + LAN_SIGN_LENGTH;
    if length > u16::MAX as usize {
        return Err(MideaError::Frame(format!(
            "Frame of {} bytes does not fit in a packet",
            frame.len()
        )));
    }

    let mut data = Vec::with_capacity(length);
    data.write_u16::<BigEndian>(PREFIX_LAN)?;
    data.write_u16::<BigEndian>(LAN_MESSAGE_TYPE)?;
    data.write_u16::<LittleEndian>(length as u16)?;
    data.write_u16::<BigEndian>(LAN_MAGIC)?;
    data.write_u32::<BigEndian>(0)?; // Message id
    data.extend_from_slice(&timestamp());
    data.write_u64::<LittleEndian>(device_id)?;
    data.extend_from_slice(&[0u8; 12]);

    data.extend_from_slice(&encrypted);

    let sign = crypto::sign(&data);
    data.extend_from_slice(&sign);
    Ok(data)
}

/// Verify and unpack a LAN packet, returning the appliance frame it carries.
///
/// Bytes past the declared length are ignored.
pub fn unpack_packet(data: &[u8]) -> Result<Vec<u8>> {
    let length = match parse_header(data)? {
        PacketHeader::Lan { total_length } => total_length,
        PacketHeader::V3 { .. } => {
            return Err(MideaError::Frame("Expected a LAN packet, got a v3 envelope".into()));
        }
    };

    if data.len() < length {
        return Err(MideaError::Frame(format!(
            "Packet is truncated. Expected {} bytes, only have {}",
            length,
            data.len()
        )));
    }

    let packet = &data[..length];
    let (signed, received_sign) = packet.split_at(length - LAN_SIGN_LENGTH);
    if crypto::sign(signed).as_slice() != received_sign {
        return Err(MideaError::Frame("Packet signature mismatch".into()));
    }

    crypto::decrypt_frame(&signed[LAN_HEADER_LENGTH..])
}

/// Device id carried in a LAN packet header (48 significant bits).
pub fn packet_device_id(data: &[u8]) -> Result<u64> {
    if data.len() < LAN_DEVICE_ID_OFFSET + 6 {
        return Err(MideaError::Frame("Packet too short for a device id".into()));
    }
    Ok(LittleEndian::read_u48(
        &data[LAN_DEVICE_ID_OFFSET..LAN_DEVICE_ID_OFFSET + 6],
    ))
}

/// Packet timestamp: each byte is one 2-digit component, least significant first.
fn timestamp() -> [u8; 8] {
    let now = Utc::now();
    [
        (now.timestamp_subsec_micros() / 10_000) as u8,
        now.second() as u8,
        now.minute() as u8,
        now.hour() as u8,
        now.day() as u8,
        now.month() as u8,
        (now.year() % 100) as u8,
        (now.year() / 100) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE_PACKET: &str = "5a5a01116800208000000000000000000000000060ca0000000e0000000000000000000001000000c6a90377a364cb55af337259514c6f96bf084e8c7a899b50b68920cdea36cecf11c882a88861d1f46cd87912f201218c66151f0c9fbe5941c5384e707c36ff76";
    const STATE_FRAME: &str =
        "aa22ac00000000000303c0014566000000300010045cff2070000000000000008bed19";

    #[test]
    fn unpacks_captured_packet() {
        let packet = hex::decode(STATE_PACKET).unwrap();
        let frame = unpack_packet(&packet).unwrap();
        assert_eq!(hex::encode(frame), STATE_FRAME);
    }

    #[test]
    fn pack_unpack_preserves_frame() {
        let frame = hex::decode(
            "aa21ac8d000000000003418100ff03ff000200000000000000000000000003016971",
        )
        .unwrap();
        let packet = pack_packet(123456, &frame).unwrap();
        assert_eq!(
            parse_header(&packet).unwrap(),
            PacketHeader::Lan {
                total_length: packet.len()
            }
        );
        assert_eq!(packet_device_id(&packet).unwrap(), 123456);
        assert_eq!(unpack_packet(&packet).unwrap(), frame);
    }

    #[test]
    fn rejects_tampered_packet() {
        let mut packet = hex::decode(STATE_PACKET).unwrap();
        packet[45] ^= 0x01;
        assert!(matches!(unpack_packet(&packet), Err(MideaError::Frame(_))));
    }

    #[test]
    fn rejects_truncated_packet() {
        let packet = hex::decode(STATE_PACKET).unwrap();
        assert!(matches!(
            unpack_packet(&packet[..packet.len() - 1]),
            Err(MideaError::Frame(_))
        ));
    }

    #[test]
    fn parses_v3_header() {
        let header = encode_v3_header(0x8E, PacketType::EncryptedResponse, 6).unwrap();
        assert_eq!(hex::encode(header), "8370008e2063");
        assert_eq!(
            parse_header(&header).unwrap(),
            PacketHeader::V3 {
                total_length: 0x8E + 8,
                packet_type: PacketType::EncryptedResponse.raw(),
                pad: 6,
            }
        );
    }

    #[test]
    fn rejects_unknown_prefix_and_magic() {
        assert!(matches!(
            parse_header(&[0x12, 0x34, 0, 0, 0, 0]),
            Err(MideaError::Frame(_))
        ));
        assert!(matches!(
            parse_header(&[0x83, 0x70, 0, 0x10, 0x21, 0x03]),
            Err(MideaError::Frame(_))
        ));
    }

    #[test]
    fn protocol_version_round_trips_through_u8() {
        assert_eq!(ProtocolVersion::from_raw(3), Some(ProtocolVersion::V3));
        assert_eq!(ProtocolVersion::try_from(4u8), Err(4));
        assert_eq!(u8::from(ProtocolVersion::V2), 2);
    }
}
