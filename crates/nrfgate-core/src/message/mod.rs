//! Device Message Codec
//!
//! Application-level messages exchanged between the gateway and the wireless
//! devices. The dongle relays these opaquely inside MSG packets.
//!
//! Every message ends in an additive 16-bit checksum over all preceding bytes,
//! transmitted high byte first. Parsing never panics: malformed input yields a
//! [`MessageError`].
//!
//! ```text
//! HostMessage    [0x00, UUID(4), TYPE, DATA..., CS(2)]
//! DeviceMessage  [LINK_ID, UUID(4), TYPE, FW, BATTERY, STATUS_INTERVAL, MSG_NUM, DATA..., CS(2)]
//! RemoteMessage  [LINK_ID, UUID(4), REMOTE, TARGET_UUID(4), LAYER, VALUE, CS(2)]
//! SetMessage     [PARAM_INDEX, CHANGE_TYPE, VALUE_LEN, VALUE...]
//! ```

mod error;
mod uuid;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::MessageError;
pub use uuid::DeviceUuid;

/// Message types of the host/device protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgType {
    Error = 0,
    Init = 1,
    Boot = 2,
    Set = 3,
    Reset = 4,
    Status = 5,
    Remote = 6,
    Ok = 7,
}

impl MsgType {
    /// Wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Error),
            1 => Some(Self::Init),
            2 => Some(Self::Boot),
            3 => Some(Self::Set),
            4 => Some(Self::Reset),
            5 => Some(Self::Status),
            6 => Some(Self::Remote),
            7 => Some(Self::Ok),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "ERROR",
            Self::Init => "INIT",
            Self::Boot => "BOOT",
            Self::Set => "SET",
            Self::Reset => "RESET",
            Self::Status => "STATUS",
            Self::Remote => "REMOTE",
            Self::Ok => "OK",
        };
        f.write_str(name)
    }
}

/// How a [`SetMessage`] value is applied on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChangeType {
    #[default]
    Invalid = 0,
    Set = 1,
    Toggle = 2,
    Increase = 3,
    Decrease = 4,
}

impl ChangeType {
    /// Parse a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Invalid),
            1 => Some(Self::Set),
            2 => Some(Self::Toggle),
            3 => Some(Self::Increase),
            4 => Some(Self::Decrease),
            _ => None,
        }
    }
}

/// Additive checksum: sum of all bytes, truncated to 16 bits
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)))
}

/// Append the big-endian checksum of `body` to it
fn seal(mut body: Vec<u8>) -> Vec<u8> {
    let mut cs = [0u8; 2];
    BigEndian::write_u16(&mut cs, checksum(&body));
    body.extend_from_slice(&cs);
    body
}

/// Check length and trailing checksum of a received message
fn verify(raw: &[u8], min: usize) -> Result<u16, MessageError> {
    if raw.len() < min {
        return Err(MessageError::TooShort {
            len: raw.len(),
            min,
        });
    }
    let (body, tail) = raw.split_at(raw.len() - 2);
    let actual = BigEndian::read_u16(tail);
    let expected = checksum(body);
    if actual != expected {
        return Err(MessageError::ChecksumMismatch { expected, actual });
    }
    Ok(actual)
}

/// Message sent from the gateway to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMessage {
    /// The gateway's own UUID
    pub uuid: DeviceUuid,
    pub msg_type: MsgType,
    pub data: Vec<u8>,
}

impl HostMessage {
    /// Wire length without data
    pub const HEADER_LEN: usize = 6;

    pub fn new(uuid: DeviceUuid, msg_type: MsgType, data: Vec<u8>) -> Self {
        Self {
            uuid,
            msg_type,
            data,
        }
    }

    /// Serialize including the checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Self::HEADER_LEN + self.data.len() + 2);
        body.push(0);
        body.extend_from_slice(self.uuid.as_bytes());
        body.push(self.msg_type.code());
        body.extend_from_slice(&self.data);
        seal(body)
    }

    /// Parse a host message (as a device would)
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        verify(raw, Self::HEADER_LEN + 2)?;
        let msg_type = MsgType::from_code(raw[5]).ok_or(MessageError::UnknownType(raw[5]))?;
        let uuid = DeviceUuid::from_slice(raw, 1).ok_or(MessageError::TooShort {
            len: raw.len(),
            min: Self::HEADER_LEN + 2,
        })?;
        Ok(Self {
            uuid,
            msg_type,
            data: raw[Self::HEADER_LEN..raw.len() - 2].to_vec(),
        })
    }
}

impl fmt::Display for HostMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostMessage {} {} data={:02X?}", self.uuid, self.msg_type, self.data)
    }
}

/// Message sent from a device to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    /// Link ID the device currently uses (transient ID before INIT completes)
    pub link_id: u8,
    pub uuid: DeviceUuid,
    pub msg_type: MsgType,
    pub firmware_version: u8,
    /// Raw battery level
    pub battery: u8,
    /// Seconds between unsolicited status reports
    pub status_interval: u8,
    /// Sequence counter incremented by the device
    pub msg_num: u8,
    pub data: Vec<u8>,
}

impl DeviceMessage {
    /// Wire length without data
    pub const HEADER_LEN: usize = 10;
    /// Shortest valid message
    pub const MIN_LEN: usize = Self::HEADER_LEN + 2;

    /// Validate length, checksum and type, then unpack the fields
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        verify(raw, Self::MIN_LEN)?;
        let msg_type = MsgType::from_code(raw[5]).ok_or(MessageError::UnknownType(raw[5]))?;
        let uuid = DeviceUuid::from_slice(raw, 1).ok_or(MessageError::TooShort {
            len: raw.len(),
            min: Self::MIN_LEN,
        })?;
        Ok(Self {
            link_id: raw[0],
            uuid,
            msg_type,
            firmware_version: raw[6],
            battery: raw[7],
            status_interval: raw[8],
            msg_num: raw[9],
            data: raw[Self::HEADER_LEN..raw.len() - 2].to_vec(),
        })
    }

    /// Serialize including the checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Self::MIN_LEN + self.data.len());
        body.push(self.link_id);
        body.extend_from_slice(self.uuid.as_bytes());
        body.extend_from_slice(&[
            self.msg_type.code(),
            self.firmware_version,
            self.battery,
            self.status_interval,
            self.msg_num,
        ]);
        body.extend_from_slice(&self.data);
        seal(body)
    }

    /// DATA interpreted as ASCII text (INIT carries the device type)
    pub fn data_text(&self) -> String {
        String::from_utf8_lossy(&self.data)
            .trim_end_matches('\0')
            .to_string()
    }
}

impl fmt::Display for DeviceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceMessage id={} {} {} fw={} battery={} num={} data={:02X?}",
            self.link_id,
            self.uuid,
            self.msg_type,
            self.firmware_version,
            self.battery,
            self.msg_num,
            self.data
        )
    }
}

/// Remote-control event a device relays through the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMessage {
    pub link_id: u8,
    pub uuid: DeviceUuid,
    /// Device the event is aimed at
    pub target_uuid: DeviceUuid,
    pub layer: u8,
    pub value: u8,
}

impl RemoteMessage {
    /// Shortest valid message
    pub const MIN_LEN: usize = 14;

    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        verify(raw, Self::MIN_LEN)?;
        if raw[5] != MsgType::Remote.code() {
            return Err(MessageError::UnknownType(raw[5]));
        }
        let too_short = MessageError::TooShort {
            len: raw.len(),
            min: Self::MIN_LEN,
        };
        let uuid = DeviceUuid::from_slice(raw, 1).ok_or_else(|| too_short.clone())?;
        let target_uuid = DeviceUuid::from_slice(raw, 6).ok_or(too_short)?;
        Ok(Self {
            link_id: raw[0],
            uuid,
            target_uuid,
            layer: raw[10],
            value: raw[11],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Self::MIN_LEN);
        body.push(self.link_id);
        body.extend_from_slice(self.uuid.as_bytes());
        body.push(MsgType::Remote.code());
        body.extend_from_slice(self.target_uuid.as_bytes());
        body.push(self.layer);
        body.push(self.value);
        seal(body)
    }
}

/// Any message a device may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Device(DeviceMessage),
    Remote(RemoteMessage),
}

impl InboundMessage {
    /// Dispatch on the message type byte, then validate the matching shape
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        match raw.get(5) {
            Some(&code) if code == MsgType::Remote.code() => {
                RemoteMessage::parse(raw).map(Self::Remote)
            }
            _ => DeviceMessage::parse(raw).map(Self::Device),
        }
    }

    /// UUID of the sending device
    pub fn uuid(&self) -> DeviceUuid {
        match self {
            Self::Device(m) => m.uuid,
            Self::Remote(m) => m.uuid,
        }
    }
}

/// Parameter change carried in the DATA of a SET host message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetMessage {
    /// Index of the parameter in the device's settable list
    pub index: u8,
    pub change_type: ChangeType,
    /// Value bytes, multi-byte numbers little-endian
    pub value: Vec<u8>,
}

impl SetMessage {
    /// A plain SET of `value`
    pub fn set(index: u8, value: Vec<u8>) -> Self {
        Self {
            index,
            change_type: ChangeType::Set,
            value,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(3 + self.value.len());
        raw.push(self.index);
        raw.push(self.change_type as u8);
        raw.push(self.value.len() as u8);
        raw.extend_from_slice(&self.value);
        raw
    }

    /// Parse the way the device firmware does
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        if raw.len() < 3 {
            return Err(MessageError::TooShort {
                len: raw.len(),
                min: 3,
            });
        }
        let change_type =
            ChangeType::from_code(raw[1]).ok_or(MessageError::InvalidChangeType(raw[1]))?;
        let declared = raw[2] as usize;
        if raw.len() - 3 != declared {
            return Err(MessageError::LengthMismatch {
                declared,
                actual: raw.len() - 3,
            });
        }
        Ok(Self {
            index: raw[0],
            change_type,
            value: raw[3..].to_vec(),
        })
    }
}
