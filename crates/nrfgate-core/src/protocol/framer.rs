//! Packet framing
//!
//! Turns the serial byte stream into [`Packet`]s and back. Two encodings are
//! supported, both delimited by [`MESSAGE_SEPARATOR`]:
//!
//! - Binary: `; TYPE PAYLOAD... ;` where an [`ESCAPE_BYTE`] makes the following
//!   byte literal, so payloads may contain the separator and escape bytes.
//! - Clear text: `;TYPE_NAME:b0:b1:...:bn;` with decimal byte values.
//!
//! Clear text only applies to what the dongle sends. Its input parser always
//! reads binary frames, so host packets are binary in either mode.
//!
//! The dongle terminates every packet with `;\n`. Every separator is treated as
//! a frame boundary and frames holding nothing but line endings are skipped, so
//! the parser resynchronizes on its own after line noise.
//!
//! After power-on the dongle announces itself in clear text regardless of the
//! mode the host asked for earlier. A binary framer therefore also accepts
//! frames that start with an ASCII type name; binary type codes never collide
//! with those.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use super::packet::{Packet, PacketType};

/// Frame delimiter
pub const MESSAGE_SEPARATOR: u8 = b';';

/// Escape prefix (binary framing only)
pub const ESCAPE_BYTE: u8 = 0xF0;

/// Byte value separator (clear-text framing only)
pub const BYTE_SEPARATOR: u8 = b':';

/// Frames longer than this are discarded as noise
pub const MAX_FRAME_SIZE: usize = 512;

/// Wire encoding selected at connection time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Byte-stuffed binary frames
    Binary,
    /// ASCII frames, the dongle firmware's power-on default
    #[default]
    ClearText,
}

/// Incremental packet parser and encoder
#[derive(Debug)]
pub struct Framer {
    framing: Framing,
    /// Bytes pushed but not yet parsed
    pending: VecDeque<u8>,
    /// Unescaped bytes of the frame being assembled
    frame: Vec<u8>,
    in_escape: bool,
    overflowed: bool,
}

impl Framer {
    /// Create a framer for the given encoding
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending: VecDeque::new(),
            frame: Vec::new(),
            in_escape: false,
            overflowed: false,
        }
    }

    /// Encoding used by this framer
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Append raw bytes received from the serial port
    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend(data);
    }

    /// Number of bytes pushed but not yet consumed
    pub fn buffered(&self) -> usize {
        self.pending.len() + self.frame.len()
    }

    /// Drop all buffered state
    pub fn reset(&mut self) {
        self.pending.clear();
        self.frame.clear();
        self.in_escape = false;
        self.overflowed = false;
    }

    /// Parse buffered bytes until one packet completes.
    ///
    /// Returns at most one packet per call; call again to drain further
    /// packets already buffered. Never blocks. Malformed frames are logged and
    /// skipped.
    pub fn next_packet(&mut self) -> Option<Packet> {
        while let Some(byte) = self.pending.pop_front() {
            if self.in_escape {
                self.in_escape = false;
                self.push_frame_byte(byte);
                continue;
            }

            if byte == ESCAPE_BYTE && self.framing == Framing::Binary {
                self.in_escape = true;
                continue;
            }

            if byte == MESSAGE_SEPARATOR {
                let frame = std::mem::take(&mut self.frame);
                if std::mem::replace(&mut self.overflowed, false) {
                    warn!("Discarding oversized frame");
                    continue;
                }
                if let Some(packet) = self.decode_frame(&frame) {
                    return Some(packet);
                }
                continue;
            }

            self.push_frame_byte(byte);
        }
        None
    }

    fn push_frame_byte(&mut self, byte: u8) {
        if self.frame.len() >= MAX_FRAME_SIZE {
            self.overflowed = true;
            return;
        }
        self.frame.push(byte);
    }

    fn decode_frame(&self, frame: &[u8]) -> Option<Packet> {
        if frame.iter().all(|b| matches!(b, b'\r' | b'\n')) {
            return None;
        }
        match self.framing {
            Framing::Binary if frame[0].is_ascii_uppercase() => decode_clear_text(frame),
            Framing::Binary => decode_binary(frame),
            Framing::ClearText => decode_clear_text(frame),
        }
    }

    /// Encode a packet for transmission
    pub fn encode(&self, packet: &Packet) -> Vec<u8> {
        encode(self.framing, packet)
    }
}

/// Encode a packet with an explicit framing
pub fn encode(framing: Framing, packet: &Packet) -> Vec<u8> {
    match framing {
        Framing::Binary => encode_binary(packet),
        Framing::ClearText => encode_clear_text(packet),
    }
}

fn decode_binary(frame: &[u8]) -> Option<Packet> {
    let (&code, payload) = frame.split_first()?;
    match PacketType::from_code(code) {
        Some(packet_type) => Some(Packet::new(packet_type, payload.to_vec())),
        None => {
            warn!(code, "Unsupported packet type");
            None
        }
    }
}

fn decode_clear_text(frame: &[u8]) -> Option<Packet> {
    let Ok(text) = std::str::from_utf8(frame) else {
        warn!("Clear-text frame is not valid ASCII: {:02x?}", frame);
        return None;
    };
    let text = text.trim();
    let (name, values) = match text.split_once(BYTE_SEPARATOR as char) {
        Some((name, values)) => (name, values),
        None => (text, ""),
    };

    let Some(packet_type) = PacketType::from_name(name) else {
        warn!("Unsupported packet type {:?}", name);
        return None;
    };

    let mut payload = Vec::new();
    if !values.is_empty() {
        for token in values.split(BYTE_SEPARATOR as char) {
            match parse_decimal_byte(token) {
                Some(byte) => payload.push(byte),
                None => {
                    warn!("Malformed byte {:?} in {} packet, dropping it", token, name);
                    return None;
                }
            }
        }
    }

    debug!(%packet_type, len = payload.len(), "Decoded clear-text packet");
    Some(Packet::new(packet_type, payload))
}

fn parse_decimal_byte(token: &str) -> Option<u8> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

fn encode_binary(packet: &Packet) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(packet.payload.len() * 2 + 4);
    bytes.push(MESSAGE_SEPARATOR);
    bytes.push(packet.packet_type.code());
    for &byte in &packet.payload {
        if byte == MESSAGE_SEPARATOR || byte == ESCAPE_BYTE {
            bytes.push(ESCAPE_BYTE);
        }
        bytes.push(byte);
    }
    bytes.push(MESSAGE_SEPARATOR);
    bytes.push(b'\n');
    bytes
}

fn encode_clear_text(packet: &Packet) -> Vec<u8> {
    let values: Vec<String> = packet.payload.iter().map(|b| b.to_string()).collect();
    let mut bytes = Vec::with_capacity(packet.payload.len() * 4 + 12);
    bytes.push(MESSAGE_SEPARATOR);
    bytes.extend_from_slice(packet.packet_type.name().as_bytes());
    bytes.push(BYTE_SEPARATOR);
    bytes.extend_from_slice(values.join(":").as_bytes());
    bytes.push(MESSAGE_SEPARATOR);
    bytes.push(b'\n');
    bytes
}
