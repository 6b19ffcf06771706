//! Shared identifier and observation types.
//!
//! Hardware addresses are canonicalised here once, at the ingestion
//! boundary, so every other module can compare them byte-for-byte.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use utoipa::ToSchema;

/// Maximum accepted length of an advertised network name (802.11 limit).
pub const MAX_SSID_LENGTH: usize = 32;

/// Maximum accepted length of the raw frame payload, in characters.
pub const MAX_RAW_LENGTH: usize = 4096;

/// Errors raised while parsing a hardware address.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The input does not look like a 48-bit address at all.
    #[error("'{0}' is not a 48-bit hardware address")]
    Malformed(String),

    /// The all-zero address is a placeholder, not a device.
    #[error("the all-zero address does not identify a device")]
    Unspecified,

    /// Group (multicast/broadcast) addresses never originate probe requests.
    #[error("'{0}' is a group address and cannot identify a single device")]
    GroupAddress(String),
}

/// A canonical 48-bit hardware address.
///
/// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff` and the
/// bare `aabbccddeeff` form. Always displays as upper-case, colon separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Builds an address from raw octets.
    ///
    /// # Errors
    ///
    /// Rejects the all-zero address and group addresses.
    pub fn from_octets(octets: [u8; 6]) -> Result<Self, AddressError> {
        if octets == [0; 6] {
            return Err(AddressError::Unspecified);
        }
        let addr = Self(octets);
        if octets[0] & 0x01 == 0x01 {
            return Err(AddressError::GroupAddress(addr.to_string()));
        }
        Ok(addr)
    }

    /// Raw octets of the address.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether the address is locally administered (typically randomised).
    #[must_use]
    pub const fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 == 0x02
    }

    /// File-system friendly form (`aabbccddeeff`).
    #[must_use]
    pub fn to_compact(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl FromStr for MacAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if !crate::config::is_valid_mac_address(trimmed) {
            return Err(AddressError::Malformed(s.to_string()));
        }
        let hex: String = trimmed.chars().filter(char::is_ascii_hexdigit).collect();
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| AddressError::Malformed(s.to_string()))?;
        }
        Self::from_octets(octets)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
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

/// Identifier of a tracked person, as assigned by the enrollment system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct PersonId(pub u64);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a recurring course, as assigned by the enrollment system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct CourseId(pub u64);

impl fmt::Display for CourseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single received probe request. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    /// Source hardware address of the probe.
    pub device: MacAddress,

    /// When the probe was captured (UTC).
    pub timestamp: DateTime<Utc>,

    /// Received signal strength in dBm, if the sensor reported it.
    pub rssi: Option<i16>,

    /// Network name the device was probing for; empty for wildcard probes.
    pub ssid: Option<String>,

    /// Raw frame payload as delivered by the sensor.
    pub raw: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_common_notations() {
        let expected = MacAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xf0]);
        for input in [
            "AA:BB:CC:DD:EE:F0",
            "aa:bb:cc:dd:ee:f0",
            "aa-bb-cc-dd-ee-f0",
            "aabb.ccdd.eef0",
            "aabbccddeef0",
            "  aa:bb:cc:dd:ee:f0\n",
        ] {
            assert_eq!(input.parse::<MacAddress>().unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_display_is_canonical() {
        let addr: MacAddress = "0a-1b-2c-3d-4e-5f".parse().unwrap();
        assert_eq!(addr.to_string(), "0A:1B:2C:3D:4E:5F");
        assert_eq!(addr.to_compact(), "0a1b2c3d4e5f");
    }

    #[test]
    fn test_rejects_malformed() {
        for input in ["", "AA:BB:CC", "GG:BB:CC:DD:EE:FF", "AA:BB:CC:DD:EE:FF:00", "AA:BB-CC:DD:EE:FF"] {
            assert!(
                matches!(input.parse::<MacAddress>(), Err(AddressError::Malformed(_))),
                "{input}"
            );
        }
    }

    #[test]
    fn test_rejects_placeholder_and_group_addresses() {
        assert_eq!(
            "00:00:00:00:00:00".parse::<MacAddress>(),
            Err(AddressError::Unspecified)
        );
        assert!(matches!(
            "FF:FF:FF:FF:FF:FF".parse::<MacAddress>(),
            Err(AddressError::GroupAddress(_))
        ));
        assert!(matches!(
            "01:00:5E:00:00:01".parse::<MacAddress>(),
            Err(AddressError::GroupAddress(_))
        ));
    }

    #[test]
    fn test_locally_administered_bit() {
        let random: MacAddress = "DA:A1:19:00:00:01".parse().unwrap();
        let vendor: MacAddress = "D8:A1:19:00:00:01".parse().unwrap();
        assert!(random.is_locally_administered());
        assert!(!vendor.is_locally_administered());
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let addr: MacAddress = "aabbccddeef0".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:F0\"");
        let back: MacAddress = serde_json::from_str("\"aa-bb-cc-dd-ee-f0\"").unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }
}
