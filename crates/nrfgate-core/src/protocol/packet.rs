//! Host-dongle packets
//!
//! A packet is a one byte type code plus an opaque payload. The payload of a
//! `Msg` packet is a device message relayed by the dongle; all other types are
//! addressed to the dongle itself.

use std::fmt;

/// Packet type codes understood by the dongle firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    None = 0,
    Ok = 1,
    Error = 2,
    Msg = 3,
    Init = 4,
    Setting = 5,
    Reboot = 6,
}

impl PacketType {
    /// All packet types in code order
    pub const ALL: [PacketType; 7] = [
        PacketType::None,
        PacketType::Ok,
        PacketType::Error,
        PacketType::Msg,
        PacketType::Init,
        PacketType::Setting,
        PacketType::Reboot,
    ];

    /// Wire code of this type
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a type by its wire code
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Name used by the clear-text framing
    pub fn name(self) -> &'static str {
        match self {
            PacketType::None => "NONE",
            PacketType::Ok => "OK",
            PacketType::Error => "ERROR",
            PacketType::Msg => "MSG",
            PacketType::Init => "INIT",
            PacketType::Setting => "SETTING",
            PacketType::Reboot => "REBOOT",
        }
    }

    /// Look up a type by its clear-text name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single framed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type
    pub packet_type: PacketType,
    /// Packet payload
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a new packet
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            payload,
        }
    }

    /// Create a packet without payload
    pub fn empty(packet_type: PacketType) -> Self {
        Self::new(packet_type, Vec::new())
    }

    /// Payload interpreted as text (dongle status and error strings)
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for t in PacketType::ALL {
            assert_eq!(PacketType::from_code(t.code()), Some(t));
            assert_eq!(PacketType::from_name(t.name()), Some(t));
        }
        assert_eq!(PacketType::from_code(7), None);
        assert_eq!(PacketType::from_name("msg"), None);
    }

    #[test]
    fn test_payload_text() {
        let packet = Packet::new(PacketType::Error, b"NRF CONNECTION ERROR!".to_vec());
        assert_eq!(packet.payload_text(), "NRF CONNECTION ERROR!");
        assert!(Packet::empty(PacketType::Ok).payload.is_empty());
    }
}
