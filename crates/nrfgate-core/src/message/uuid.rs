//! 4-byte device identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::MessageError;

/// Durable 4-byte identity of a device (or of the gateway itself)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceUuid(pub [u8; 4]);

impl DeviceUuid {
    /// Build from raw bytes
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Read four bytes starting at `offset`
    pub(crate) fn from_slice(raw: &[u8], offset: usize) -> Option<Self> {
        let bytes: [u8; 4] = raw.get(offset..offset + 4)?.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl From<[u8; 4]> for DeviceUuid {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d)
    }
}

impl FromStr for DeviceUuid {
    type Err = MessageError;

    /// Accepts `85:83:F7:7E` (hex) or `133, 131, 247, 126` (decimal, comma
    /// and/or whitespace separated).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('[').trim_end_matches(']');
        let invalid = || MessageError::InvalidUuid(s.to_string());

        let parts: Vec<u8> = if s.contains(':') {
            s.split(':')
                .map(|p| u8::from_str_radix(p.trim(), 16))
                .collect::<Result<_, _>>()
                .map_err(|_| invalid())?
        } else {
            s.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|p| !p.is_empty())
                .map(str::parse::<u8>)
                .collect::<Result<_, _>>()
                .map_err(|_| invalid())?
        };

        let bytes: [u8; 4] = parts.try_into().map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_display() {
        let uuid = DeviceUuid::new([0x85, 0x83, 0xF7, 0x7E]);
        assert_eq!(uuid.to_string(), "85:83:F7:7E");
    }

    #[test]
    fn test_parse_forms() {
        let expected = DeviceUuid::new([0x85, 0x83, 0xF7, 0x7E]);
        assert_eq!("85:83:f7:7e".parse::<DeviceUuid>().unwrap(), expected);
        assert_eq!("133, 131, 247, 126".parse::<DeviceUuid>().unwrap(), expected);
        assert_eq!("[133,131,247,126]".parse::<DeviceUuid>().unwrap(), expected);
        assert!("1:2:3".parse::<DeviceUuid>().is_err());
        assert!("1,2,3,256".parse::<DeviceUuid>().is_err());
    }

    #[test]
    fn test_serde_as_array() {
        let uuid = DeviceUuid::new([1, 2, 3, 4]);
        assert_eq!(serde_json::to_string(&uuid).unwrap(), "[1,2,3,4]");
        let back: DeviceUuid = serde_json::from_str("[1,2,3,4]").unwrap();
        assert_eq!(back, uuid);
    }
}
