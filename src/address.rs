//! Compact radio address type for BLE devices under test.
//!
//! Addresses arrive from the radio as raw bytes and from operators as text in
//! several spellings (`AABBCCDDEEFF`, `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff`).
//! Everything is normalised into one 6-byte value so that equality and hashing
//! are case- and separator-insensitive.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use thiserror::Error;

/// A BLE hardware address stored as a 6-byte array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RadioAddress(pub [u8; 6]);

impl RadioAddress {
    /// The 12 uppercase hex character form, without separators.
    pub fn compact(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Display for RadioAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Errors returned when parsing an address string.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseAddressError {
    #[error("invalid address: expected 12 hex digits, got {0}")]
    InvalidLength(usize),
    #[error("invalid address: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for RadioAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();

        if digits.len() != 12 {
            return Err(ParseAddressError::InvalidLength(digits.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = digits
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| ParseAddressError::InvalidHex(s.to_string()))?;
            // `from_str_radix` alone would accept a sign
            if !pair.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ParseAddressError::InvalidHex(pair.to_string()));
            }
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| ParseAddressError::InvalidHex(pair.to_string()))?;
        }

        Ok(RadioAddress(bytes))
    }
}

impl From<[u8; 6]> for RadioAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for RadioAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<RadioAddress> for bluer::Address {
    fn from(addr: RadioAddress) -> Self {
        bluer::Address(addr.0)
    }
}

impl Serialize for RadioAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RadioAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
