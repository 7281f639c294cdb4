//! Device identity: a validated, normalized Bluetooth hardware address

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Canonical form: six upper-case hex octets separated by colons
const ADDRESS_PATTERN: &str = r"^([0-9A-F]{2}:){5}[0-9A-F]{2}$";

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ADDRESS_PATTERN).expect("address pattern is a valid regex"))
}

/// Address validation failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Bluetooth address is empty")]
    Empty,

    #[error("Invalid Bluetooth address '{0}', expected AA:BB:CC:DD:EE:FF")]
    Malformed(String),
}

/// A Bluetooth hardware address in canonical `AA:BB:CC:DD:EE:FF` form.
///
/// Construction always goes through [`DeviceAddress::parse`], so a value of
/// this type is valid by construction and is never re-derived afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Parse and normalize a user-supplied address.
    ///
    /// Surrounding whitespace is ignored, lower-case hex is accepted and
    /// `-` is accepted as an alternative separator.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let normalized = trimmed.to_ascii_uppercase().replace('-', ":");
        if !address_regex().is_match(&normalized) {
            return Err(AddressError::Malformed(trimmed.to_string()));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(normalized.split(':')) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| AddressError::Malformed(trimmed.to_string()))?;
        }
        Ok(Self(octets))
    }

    /// Raw octets, most significant first
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Address with the last three octets redacted, for logs and diagnostics
    pub fn masked(&self) -> String {
        format!("{:02X}:{:02X}:{:02X}:**:**:**", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(feature = "ble")]
impl From<DeviceAddress> for btleplug::api::BDAddr {
    fn from(address: DeviceAddress) -> Self {
        btleplug::api::BDAddr::from(address.octets())
    }
}
