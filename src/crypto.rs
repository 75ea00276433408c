//! Midea LAN encryption and signing.
//!
//! Two layers exist:
//! * the fixed-key frame layer (AES-128-ECB + MD5 signature) used by every
//!   LAN packet, and
//! * the v3 session layer (AES-256-CBC + SHA-256) keyed by a per-connection
//!   key negotiated with the device's token and key.

use crate::error::{MideaError, Result};
use crate::protocol::{
    PacketHeader, PacketType, ProtocolVersion, V3_HASH_LENGTH, V3_HEADER_LENGTH,
    V3_PACKET_ID_LENGTH, encode_v3_header, parse_header,
};
use aes::{Aes128, Aes256};
use cipher::block_padding::NoPadding;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use ecb::{Decryptor, Encryptor};
use log::debug;
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

/// Appended to every LAN packet before hashing to form its signature.
pub const SIGN_KEY: &[u8] = b"xhdiwjnchekd4d512chdjx5d8e4c394D2D7S";

/// `md5(SIGN_KEY)`, the fixed AES-128 key of the frame layer.
pub const ENC_KEY: [u8; 16] = [
    0x6a, 0x92, 0xef, 0x40, 0x6b, 0xad, 0x2f, 0x03, 0x59, 0xba, 0xad, 0x99, 0x41, 0x71, 0xea, 0x6d,
];

/// Token and key length of a v3 device.
pub const TOKEN_LENGTH: usize = 64;
pub const KEY_LENGTH: usize = 32;

/// A negotiated session key is only trusted for this long.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);

const BLOCK_SIZE: usize = 16;
const ZERO_IV: [u8; 16] = [0u8; 16];
const PACKET_ID_MASK: u16 = 0x0FFF;

/// Encrypt an appliance frame with the fixed frame key (PKCS7 padded).
pub fn encrypt_frame(data: &[u8]) -> Vec<u8> {
    let mut encryptor = Encryptor::<Aes128>::new(&ENC_KEY.into());

    let padding_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut ciphertext = Vec::with_capacity(data.len() + padding_len);
    ciphertext.extend_from_slice(data);
    ciphertext.resize(data.len() + padding_len, padding_len as u8);

    for chunk in ciphertext.chunks_mut(BLOCK_SIZE) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
    ciphertext
}

/// Decrypt an appliance frame encrypted with the fixed frame key.
pub fn decrypt_frame(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(MideaError::Decrypt);
    }

    let mut decryptor = Decryptor::<Aes128>::new(&ENC_KEY.into());
    let mut plaintext = data.to_vec();
    for chunk in plaintext.chunks_mut(BLOCK_SIZE) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }

    let pad_len = plaintext[plaintext.len() - 1] as usize;
    if pad_len == 0 || pad_len > BLOCK_SIZE {
        return Err(MideaError::Decrypt);
    }
    if plaintext[plaintext.len() - pad_len..]
        .iter()
        .any(|&b| b as usize != pad_len)
    {
        return Err(MideaError::Decrypt);
    }
    plaintext.truncate(plaintext.len() - pad_len);
    Ok(plaintext)
}

/// LAN packet signature: `md5(data ‖ SIGN_KEY)`.
pub fn sign(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.update(SIGN_KEY);
    hasher.finalize().into()
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn encrypt_cbc(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(MideaError::Frame("Envelope payload is not block aligned".into()));
    }
    let encryptor = cbc::Encryptor::<Aes256>::new_from_slices(key, &ZERO_IV)
        .map_err(|_| MideaError::Credential("Key must be 32 bytes".into()))?;
    Ok(encryptor.encrypt_padded_vec_mut::<NoPadding>(data))
}

fn decrypt_cbc(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let decryptor = cbc::Decryptor::<Aes256>::new_from_slices(key, &ZERO_IV)
        .map_err(|_| MideaError::Credential("Key must be 32 bytes".into()))?;
    decryptor
        .decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|_| MideaError::Decrypt)
}

/// Byte order used to serialize a device id before hashing it into a udpid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Order in which cloud lookups should try the two encodings.
    pub const LOOKUP_ORDER: [Endian; 2] = [Endian::Little, Endian::Big];
}

/// Cloud lookup identifier of a device: the two halves of
/// `sha256(id as 6 bytes)` XORed together.
pub fn udpid(device_id: u64, endian: Endian) -> [u8; 16] {
    let bytes = match endian {
        Endian::Little => {
            let le = device_id.to_le_bytes();
            [le[0], le[1], le[2], le[3], le[4], le[5]]
        }
        Endian::Big => {
            let be = device_id.to_be_bytes();
            [be[2], be[3], be[4], be[5], be[6], be[7]]
        }
    };
    let digest = sha256(&[&bytes[..]]);
    let mut id = [0u8; 16];
    for (i, b) in id.iter_mut().enumerate() {
        *b = digest[i] ^ digest[i + 16];
    }
    id
}

/// A negotiated v3 session key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LENGTH]);

impl SessionKey {
    pub fn new(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Authentication state of a v3 session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unauthenticated,
    HandshakeSent,
    Established,
}

/// Which end of the connection a session seals for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends requests and opens responses.
    Client,
    /// Sends responses and opens requests.
    Appliance,
}

impl Role {
    fn outbound(self) -> PacketType {
        match self {
            Role::Client => PacketType::EncryptedRequest,
            Role::Appliance => PacketType::EncryptedResponse,
        }
    }

    fn inbound(self) -> PacketType {
        match self {
            Role::Client => PacketType::EncryptedResponse,
            Role::Appliance => PacketType::EncryptedRequest,
        }
    }
}

/// v3 session: handshake state, session key and rolling packet id.
#[derive(Debug)]
pub struct SecureSession {
    role: Role,
    state: HandshakeState,
    session_key: Option<SessionKey>,
    established_at: Option<Instant>,
    packet_id: u16,
}

impl Default for SecureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureSession {
    pub fn new() -> Self {
        Self {
            role: Role::Client,
            state: HandshakeState::Unauthenticated,
            session_key: None,
            established_at: None,
            packet_id: 0,
        }
    }

    /// A session that already holds a key, e.g. the appliance end of a test link.
    pub fn established(session_key: SessionKey, role: Role) -> Self {
        Self {
            role,
            state: HandshakeState::Established,
            session_key: Some(session_key),
            established_at: Some(Instant::now()),
            packet_id: 0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    /// Established and younger than [`SESSION_LIFETIME`].
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
            && self
                .established_at
                .is_some_and(|at| at.elapsed() < SESSION_LIFETIME)
    }

    pub fn reset(&mut self) {
        self.state = HandshakeState::Unauthenticated;
        self.session_key = None;
        self.established_at = None;
        self.packet_id = 0;
    }

    fn next_packet_id(&mut self) -> [u8; 2] {
        let id = self.packet_id;
        self.packet_id = (self.packet_id + 1) & PACKET_ID_MASK;
        id.to_be_bytes()
    }

    /// Build the handshake request carrying the device token.
    pub fn handshake_request(&mut self, token: &[u8]) -> Result<Vec<u8>> {
        if token.len() != TOKEN_LENGTH {
            return Err(MideaError::Credential(format!(
                "Token must be {} bytes, got {}",
                TOKEN_LENGTH,
                token.len()
            )));
        }
        self.reset();

        let header = encode_v3_header(token.len(), PacketType::HandshakeRequest, 0)?;
        let mut packet = Vec::with_capacity(V3_HEADER_LENGTH + V3_PACKET_ID_LENGTH + token.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&self.next_packet_id());
        packet.extend_from_slice(token);

        self.state = HandshakeState::HandshakeSent;
        Ok(packet)
    }

    /// Verify the device's handshake reply and derive the session key.
    ///
    /// Any failure returns the session to `Unauthenticated`.
    pub fn complete_handshake(&mut self, packet: &[u8], key: &[u8]) -> Result<()> {
        let result = self.derive_session_key(packet, key);
        match result {
            Ok(session_key) => {
                self.session_key = Some(session_key);
                self.state = HandshakeState::Established;
                self.established_at = Some(Instant::now());
                debug!("v3 session established");
                Ok(())
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn derive_session_key(&self, packet: &[u8], key: &[u8]) -> Result<SessionKey> {
        if self.state != HandshakeState::HandshakeSent {
            return Err(MideaError::Handshake("No handshake in progress".into()));
        }
        if key.len() != KEY_LENGTH {
            return Err(MideaError::Credential(format!(
                "Key must be {} bytes, got {}",
                KEY_LENGTH,
                key.len()
            )));
        }

        let packet_type = match parse_header(packet)? {
            PacketHeader::V3 { packet_type, .. } => packet_type,
            PacketHeader::Lan { .. } => {
                return Err(MideaError::Handshake("Expected a v3 envelope".into()));
            }
        };
        if packet_type == PacketType::Error.raw() {
            return Err(MideaError::Handshake("Device rejected the token".into()));
        }
        if packet_type != PacketType::HandshakeResponse.raw() {
            return Err(MideaError::Handshake(format!(
                "Unexpected packet type 0x{:X}",
                packet_type
            )));
        }

        let data = packet
            .get(V3_HEADER_LENGTH + V3_PACKET_ID_LENGTH..)
            .filter(|d| d.len() == 2 * KEY_LENGTH)
            .ok_or_else(|| MideaError::Handshake("Handshake reply has wrong length".into()))?;
        let (encrypted, hash) = data.split_at(KEY_LENGTH);

        let plain = decrypt_cbc(key, encrypted)?;
        if !bool::from(sha256(&[&plain[..]])[..].ct_eq(hash)) {
            return Err(MideaError::Handshake("Handshake reply failed verification".into()));
        }

        let mut session_key = [0u8; KEY_LENGTH];
        for (i, b) in session_key.iter_mut().enumerate() {
            *b = plain[i] ^ key[i];
        }
        Ok(SessionKey::new(session_key))
    }

    /// Wrap a LAN packet in an encrypted, hashed envelope.
    pub fn seal(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let session_key = self.active_key()?.clone();

        let pad = (BLOCK_SIZE - (data.len() + V3_PACKET_ID_LENGTH) % BLOCK_SIZE) % BLOCK_SIZE;
        let size = data.len() + pad + V3_HASH_LENGTH;
        let header = encode_v3_header(size, self.role.outbound(), pad)?;

        let mut plain = Vec::with_capacity(V3_PACKET_ID_LENGTH + data.len() + pad);
        plain.extend_from_slice(&self.next_packet_id());
        plain.extend_from_slice(data);
        let mut padding = vec![0u8; pad];
        rand::rng().fill_bytes(&mut padding);
        plain.extend_from_slice(&padding);

        let hash = sha256(&[&header[..], &plain[..]]);
        let encrypted = encrypt_cbc(session_key.as_bytes(), &plain)?;

        let mut packet = Vec::with_capacity(V3_HEADER_LENGTH + encrypted.len() + V3_HASH_LENGTH);
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&encrypted);
        packet.extend_from_slice(&hash);
        Ok(packet)
    }

    /// Verify and unwrap an envelope. A failed integrity check resets the session.
    pub fn open(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let result = self.open_inner(packet);
        if matches!(result, Err(MideaError::Decrypt)) {
            self.reset();
        }
        result
    }

    fn open_inner(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let session_key = self.active_key()?;

        let (total_length, packet_type, pad) = match parse_header(packet)? {
            PacketHeader::V3 {
                total_length,
                packet_type,
                pad,
            } => (total_length, packet_type, pad),
            PacketHeader::Lan { .. } => {
                return Err(MideaError::Frame("Expected a v3 envelope".into()));
            }
        };
        if packet_type == PacketType::Error.raw() {
            return Err(MideaError::Connection("Device reported an envelope error".into()));
        }
        if packet_type != self.role.inbound().raw() {
            return Err(MideaError::Frame(format!(
                "Unexpected packet type 0x{:X}",
                packet_type
            )));
        }
        if packet.len() != total_length
            || total_length < V3_HEADER_LENGTH + BLOCK_SIZE + V3_HASH_LENGTH
        {
            return Err(MideaError::Frame(format!(
                "Envelope length {} does not match declared {}",
                packet.len(),
                total_length
            )));
        }

        let (header, rest) = packet.split_at(V3_HEADER_LENGTH);
        let (encrypted, hash) = rest.split_at(rest.len() - V3_HASH_LENGTH);
        if encrypted.len() % BLOCK_SIZE != 0 {
            return Err(MideaError::Decrypt);
        }

        let plain = decrypt_cbc(session_key.as_bytes(), encrypted)?;
        if !bool::from(sha256(&[header, &plain[..]])[..].ct_eq(hash)) {
            return Err(MideaError::Decrypt);
        }
        if plain.len() < V3_PACKET_ID_LENGTH + pad {
            return Err(MideaError::Decrypt);
        }
        Ok(plain[V3_PACKET_ID_LENGTH..plain.len() - pad].to_vec())
    }

    fn active_key(&self) -> Result<&SessionKey> {
        match &self.session_key {
            Some(key) if self.is_established() => Ok(key),
            _ => Err(MideaError::Handshake("Session is not authenticated".into())),
        }
    }
}

/// Envelope handling for a connection, chosen by protocol version.
#[derive(Debug)]
pub enum CryptoSession {
    /// v2: LAN packets go on the wire as they are.
    Plain,
    /// v3: LAN packets travel inside authenticated envelopes.
    Secure(SecureSession),
}

impl CryptoSession {
    pub fn for_version(version: ProtocolVersion) -> Result<Self> {
        match version {
            ProtocolVersion::V1 => Err(MideaError::UnsupportedVersion(version.raw())),
            ProtocolVersion::V2 => Ok(CryptoSession::Plain),
            ProtocolVersion::V3 => Ok(CryptoSession::Secure(SecureSession::new())),
        }
    }

    /// Whether a handshake must complete before [`seal`](Self::seal) is usable.
    pub fn needs_handshake(&self) -> bool {
        match self {
            CryptoSession::Plain => false,
            CryptoSession::Secure(session) => !session.is_established(),
        }
    }

    pub fn handshake_request(&mut self, token: &[u8]) -> Result<Vec<u8>> {
        match self {
            CryptoSession::Plain => Err(MideaError::Handshake(
                "Plain sessions do not negotiate keys".into(),
            )),
            CryptoSession::Secure(session) => session.handshake_request(token),
        }
    }

    pub fn complete_handshake(&mut self, packet: &[u8], key: &[u8]) -> Result<()> {
        match self {
            CryptoSession::Plain => Err(MideaError::Handshake(
                "Plain sessions do not negotiate keys".into(),
            )),
            CryptoSession::Secure(session) => session.complete_handshake(packet, key),
        }
    }

    pub fn seal(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CryptoSession::Plain => Ok(data.to_vec()),
            CryptoSession::Secure(session) => session.seal(data),
        }
    }

    pub fn open(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        match self {
            CryptoSession::Plain => Ok(packet.to_vec()),
            CryptoSession::Secure(session) => session.open(packet),
        }
    }

    pub fn reset(&mut self) {
        if let CryptoSession::Secure(session) = self {
            session.reset();
        }
    }
}
