//! Dongle Communication
//!
//! Implements the host side of the USB radio dongle protocol: packet framing
//! over the serial link, the dongle handshake, and relaying device messages.

mod error;
pub mod framer;
mod link;
mod packet;
pub mod serial;
pub mod stream;

pub use error::LinkError;
pub use framer::{Framer, Framing};
pub use link::{DongleInfo, DongleLink, LinkConfig, LinkState};
pub use packet::{Packet, PacketType};
pub use serial::{list_ports, PortInfo};
pub use stream::{CommunicationChannel, PacketChannel, SerialChannel};

/// Default baud rate of the dongle firmware
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default radio channel
pub const DEFAULT_CHANNEL: u8 = 101;

/// Highest radio channel the nRF24 supports
pub const MAX_CHANNEL: u8 = 125;

/// Default timeout for the dongle handshake in milliseconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 2500;

/// Default timeout for a send acknowledgement in milliseconds
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 500;

/// Device-message transport used by the communication manager.
///
/// Implementations serialize access to the radio: at most one `send` is in
/// flight at any time, and a `send` blocks the calling thread until the dongle
/// answers or the ack timeout elapses.
pub trait MessageLink: Send + Sync {
    /// Relay `payload` to the device with link ID `destination`.
    ///
    /// Returns `Some(reply)` on success (empty when `require_ack` is false or the
    /// device sent no ack payload) and `None` on error or timeout.
    fn send(&self, destination: u8, payload: &[u8], require_ack: bool) -> Option<Vec<u8>>;

    /// Pop the oldest received device message, if any
    fn receive(&self) -> Option<Vec<u8>>;

    /// Whether the link is up and receiving
    fn is_connected(&self) -> bool {
        true
    }

    /// Re-establish a link that went down
    fn reconnect(&self) -> Result<(), LinkError> {
        Ok(())
    }
}
