//! Content hashing
//!
//! Objects are addressed by the SHA-256 of their uncompressed payload. Remote
//! transfers additionally carry a DJB-style rolling checksum used to match a
//! resumed upload against the bytes it started with.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{EmbrError, Result};

/// Length of a full hash in hex characters
pub const HASH_HEX_LEN: usize = 64;

/// Content address of an object (SHA-256 of the payload)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a payload
    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a full 64-character hex hash
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != HASH_HEX_LEN {
            return Err(EmbrError::invalid(format!(
                "expected {} hex characters, got '{}'",
                HASH_HEX_LEN, hex_str
            )));
        }
        let bytes = hex::decode(hex_str)
            .map_err(|e| EmbrError::invalid(format!("bad hash '{}': {}", hex_str, e)))?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First `n` hex characters, for display
    pub fn short(&self, n: usize) -> String {
        let mut s = self.to_hex();
        s.truncate(n.min(HASH_HEX_LEN));
        s
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.short(12))
    }
}

impl FromStr for ObjectHash {
    type Err = EmbrError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// True if `s` is a non-empty lowercase/uppercase hex string no longer than a full hash
pub fn is_hash_prefix(s: &str) -> bool {
    !s.is_empty() && s.len() <= HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// DJB rolling checksum (`h = h * 33 + b`, starting at 5381) with 64-bit wraparound
pub fn djb_checksum(data: &[u8]) -> u64 {
    data.iter().fold(5381u64, |h, &b| {
        h.wrapping_shl(5).wrapping_add(h).wrapping_add(b as u64)
    })
}

/// Checksum formatted the way it is stored in operation records
pub fn djb_checksum_hex(data: &[u8]) -> String {
    format!("{:x}", djb_checksum(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_roundtrip() {
        let h = ObjectHash::from_data(b"payload");
        let hex = h.to_hex();
        assert_eq!(hex.len(), HASH_HEX_LEN);
        assert_eq!(ObjectHash::from_hex(&hex).unwrap(), h);
        assert_eq!(hex.parse::<ObjectHash>().unwrap(), h);
    }

    #[test]
    fn test_from_hex_rejects_short_and_garbage() {
        assert!(ObjectHash::from_hex("abcd").is_err());
        assert!(ObjectHash::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_distinct_payloads_distinct_hashes() {
        assert_ne!(ObjectHash::from_data(b"a"), ObjectHash::from_data(b"b"));
        assert_eq!(ObjectHash::from_data(b"a"), ObjectHash::from_data(b"a"));
    }

    #[test]
    fn test_is_hash_prefix() {
        assert!(is_hash_prefix("abc123"));
        assert!(!is_hash_prefix(""));
        assert!(!is_hash_prefix("xyz"));
        assert!(!is_hash_prefix(&"a".repeat(65)));
    }

    #[test]
    fn test_djb_checksum_known_values() {
        assert_eq!(djb_checksum(b""), 5381);
        // 5381 * 33 + 'a'(97)
        assert_eq!(djb_checksum(b"a"), 177670);
        assert_eq!(djb_checksum_hex(b"a"), "2b606");
    }

    #[test]
    fn test_serde_as_hex_string() {
        let h = ObjectHash::from_data(b"x");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: ObjectHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }
}
