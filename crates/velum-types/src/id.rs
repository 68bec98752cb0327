//! Relay, descriptor, and service identifiers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length in bytes of a relay or descriptor identity digest.
pub const DIGEST_LEN: usize = 20;

/// Length in characters of a base32 service id.
pub const SERVICE_ID_LEN: usize = 16;

/// Errors produced when constructing an identifier from untrusted input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// The service id is not a well-formed base32 string of the right length.
    #[error("invalid service id")]
    InvalidServiceId,
}

/// A 20-byte relay identity digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelayId(pub [u8; DIGEST_LEN]);

impl RelayId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Convert to an uppercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != DIGEST_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// True if every byte is zero. The zero digest is never a real identity.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Display for RelayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 hex chars
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// A 20-byte descriptor id digest, the directory-side cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorId(pub [u8; DIGEST_LEN]);

impl DescriptorId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Convert to an uppercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl std::fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// A validated service id: a fixed-length lowercase base32 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    /// Validate and construct a service id.
    pub fn new(s: &str) -> Result<Self, IdError> {
        let normalized = s.to_ascii_lowercase();
        if !Self::is_valid(&normalized) {
            return Err(IdError::InvalidServiceId);
        }
        Ok(Self(normalized))
    }

    /// Check whether a string is a well-formed service id without
    /// allocating.
    pub fn is_valid(s: &str) -> bool {
        s.len() == SERVICE_ID_LEN
            && s.bytes()
                .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b))
    }

    /// Borrow the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_id_hex_round_trip() {
        let id = RelayId::from_bytes([0xab; DIGEST_LEN]);
        let parsed = RelayId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn relay_id_hex_rejects_bad_length() {
        assert!(RelayId::from_hex("abcd").is_err());
    }

    #[test]
    fn relay_id_zero() {
        assert!(RelayId::from_bytes([0; DIGEST_LEN]).is_zero());
        assert!(!RelayId::from_bytes([1; DIGEST_LEN]).is_zero());
    }

    #[test]
    fn service_id_validation() {
        assert!(ServiceId::new("abcdefghij234567").is_ok());
        // Uppercase input is normalized.
        assert_eq!(
            ServiceId::new("ABCDEFGHIJ234567").unwrap().as_str(),
            "abcdefghij234567"
        );
        // Wrong length.
        assert_eq!(
            ServiceId::new("abc").unwrap_err(),
            IdError::InvalidServiceId
        );
        // '0', '1', '8', '9' are not base32 digits.
        assert!(ServiceId::new("abcdefghij234501").is_err());
        assert!(ServiceId::new("abcdefghij23456!").is_err());
    }
}
