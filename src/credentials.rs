//! Token/key lookup for v3 appliances.
//!
//! v3 appliances only accept commands after a handshake with a 64-byte token
//! and 32-byte key issued by the vendor cloud. This crate does not talk to the
//! cloud itself; callers plug in a [`CredentialSource`].

use crate::error::{MideaError, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Provides the `(token, key)` pair of a device.
///
/// `udpid` is the device's cloud lookup id (see [`crate::crypto::udpid`]).
/// Cloud lookups are keyed by it, so the same device may be asked for twice
/// with different udpids until one of them resolves.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn token_and_key(&self, device_id: u64, udpid: &[u8; 16]) -> Result<(Vec<u8>, Vec<u8>)>;
}

/// Credentials known up front, keyed by device id.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<u64, (Vec<u8>, Vec<u8>)>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device_id: u64, token: Vec<u8>, key: Vec<u8>) -> Self {
        self.insert(device_id, token, key);
        self
    }

    pub fn insert(&mut self, device_id: u64, token: Vec<u8>, key: Vec<u8>) {
        self.entries.insert(device_id, (token, key));
    }

    /// Add a device from hex-encoded token and key.
    pub fn insert_hex(&mut self, device_id: u64, token: &str, key: &str) -> Result<()> {
        let token = hex::decode(token)
            .map_err(|e| MideaError::Credential(format!("Invalid token hex: {}", e)))?;
        let key =
            hex::decode(key).map_err(|e| MideaError::Credential(format!("Invalid key hex: {}", e)))?;
        self.insert(device_id, token, key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn token_and_key(&self, device_id: u64, _udpid: &[u8; 16]) -> Result<(Vec<u8>, Vec<u8>)> {
        self.entries
            .get(&device_id)
            .cloned()
            .ok_or_else(|| MideaError::Credential(format!("No token and key for device {}", device_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credentials_lookup() {
        let mut creds = StaticCredentials::new().with_device(1, vec![0xAA; 64], vec![0xBB; 32]);
        creds.insert_hex(2, "0102", "0304").unwrap();
        assert_eq!(creds.len(), 2);

        let (token, key) = creds.token_and_key(1, &[0; 16]).await.unwrap();
        assert_eq!(token, vec![0xAA; 64]);
        assert_eq!(key, vec![0xBB; 32]);
        assert_eq!(
            creds.token_and_key(2, &[0; 16]).await.unwrap(),
            (vec![1, 2], vec![3, 4])
        );

        assert!(matches!(
            creds.token_and_key(3, &[0; 16]).await,
            Err(MideaError::Credential(_))
        ));
    }

    #[test]
    fn rejects_bad_hex() {
        let mut creds = StaticCredentials::new();
        assert!(matches!(
            creds.insert_hex(1, "zz", "00"),
            Err(MideaError::Credential(_))
        ));
        assert!(creds.is_empty());
    }
}
