//! Link-layer addresses and symmetric key material

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseAddressError {
    #[error("expected 6 octets separated by ':' or '-', got '{0}'")]
    MacFormat(String),
    #[error("expected 32 hex characters, got {0}")]
    KeyLength(usize),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// 6-byte Bluetooth/Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(ParseAddressError::MacFormat(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ParseAddressError::MacFormat(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| ParseAddressError::MacFormat(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// AES-128 key used by a device for its broadcast encryption
///
/// `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 16]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First key byte, which devices repeat in the clear as a key check
    pub fn check_byte(&self) -> u8 {
        self.0[0]
    }
}

impl FromStr for EncryptionKey {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 32 {
            return Err(ParseAddressError::KeyLength(s.len()));
        }
        let mut key = [0u8; 16];
        hex::decode_to_slice(s, &mut key)?;
        Ok(Self(key))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}
