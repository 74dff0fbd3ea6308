//! Byte channels and packet I/O
//!
//! [`CommunicationChannel`] abstracts the serial port so the link can run over
//! any byte stream. [`PacketChannel`] pairs a channel with a [`Framer`] for
//! the dongle's output.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::framer::{self, Framer, Framing};
use super::packet::Packet;
use super::LinkError;

/// Abstraction for the byte stream between host and dongle
pub trait CommunicationChannel: Read + Write + Send {
    /// Get number of bytes available to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Discard unread input
    fn clear_input_buffer(&mut self) -> io::Result<()>;
}

/// Serial port wrapper implementing CommunicationChannel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }
}

/// Interval between polls while waiting for a packet
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A channel plus the framing state parsing its input
pub struct PacketChannel {
    channel: Box<dyn CommunicationChannel>,
    framer: Framer,
    read_buf: [u8; 256],
}

impl PacketChannel {
    pub fn new(channel: Box<dyn CommunicationChannel>, framing: Framing) -> Self {
        Self {
            channel,
            framer: Framer::new(framing),
            read_buf: [0u8; 256],
        }
    }

    /// Encoding the dongle uses for its output on this channel
    pub fn framing(&self) -> Framing {
        self.framer.framing()
    }

    /// Frame and write a packet. The dongle only parses binary frames, so
    /// host packets are always binary whatever the output framing.
    pub fn write_packet(&mut self, packet: &Packet) -> Result<(), LinkError> {
        let bytes = framer::encode(Framing::Binary, packet);
        trace!(packet_type = %packet.packet_type, "Writing {} bytes: {:02x?}", bytes.len(), bytes);
        self.channel
            .write_all(&bytes)
            .map_err(|e| LinkError::Serial(e.to_string()))?;
        self.channel
            .flush()
            .map_err(|e| LinkError::Serial(e.to_string()))
    }

    /// Non-blocking read: pull whatever bytes are waiting and return at most one
    /// completed packet.
    pub fn read_packet(&mut self) -> Result<Option<Packet>, LinkError> {
        if let Some(packet) = self.framer.next_packet() {
            return Ok(Some(packet));
        }

        let available = self
            .channel
            .bytes_to_read()
            .map_err(|e| LinkError::Serial(e.to_string()))?;
        if available == 0 {
            return Ok(None);
        }

        let to_read = std::cmp::min(available as usize, self.read_buf.len());
        match self.channel.read(&mut self.read_buf[..to_read]) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.framer.push(&self.read_buf[..n]);
                Ok(self.framer.next_packet())
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(LinkError::Serial(e.to_string())),
        }
    }

    /// Poll [`read_packet`](Self::read_packet) until a packet arrives or the
    /// timeout elapses.
    pub fn wait_for_packet(&mut self, timeout: Duration) -> Result<Packet, LinkError> {
        let start = Instant::now();
        loop {
            if let Some(packet) = self.read_packet()? {
                return Ok(packet);
            }
            if start.elapsed() >= timeout {
                debug!("No packet within {}ms", timeout.as_millis());
                return Err(LinkError::Timeout);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Discard unread input and any partially parsed frame
    pub fn clear_input(&mut self) -> Result<(), LinkError> {
        self.framer.reset();
        self.channel
            .clear_input_buffer()
            .map_err(|e| LinkError::Serial(e.to_string()))
    }
}
