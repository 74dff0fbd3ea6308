//! Link errors

use thiserror::Error;

/// Errors that can occur while talking to the radio dongle
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Timed out waiting for the dongle")]
    Timeout,

    #[error("Not connected to dongle")]
    NotConnected,

    #[error("Dongle handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Invalid link configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for LinkError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => LinkError::PortNotFound(err.description),
            _ => LinkError::Serial(err.description),
        }
    }
}
