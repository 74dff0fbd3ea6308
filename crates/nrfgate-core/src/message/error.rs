//! Device message errors

use thiserror::Error;

/// Reasons a device message fails validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Invalid change type: {0}")]
    InvalidChangeType(u8),

    #[error("Value length {declared} does not match {actual} value bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),
}
