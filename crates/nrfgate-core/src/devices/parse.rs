//! Parameter value parsing
//!
//! Converts the string values received from web/MQTT clients into the value
//! bytes of a [`SetMessage`](crate::message::SetMessage). Multi-byte numbers
//! are little-endian, the native order of the AVR devices.

use byteorder::{ByteOrder, LittleEndian};

/// `1/0`, `true/false`, `on/off` (case-insensitive) as one byte
pub fn parse_bool(value: &str) -> Option<Vec<u8>> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(vec![1]),
        "0" | "false" | "off" => Some(vec![0]),
        _ => None,
    }
}

/// A single byte in 0..=255
pub fn parse_byte(value: &str) -> Option<Vec<u8>> {
    value.trim().parse::<u8>().ok().map(|b| vec![b])
}

/// A signed 32-bit integer, little-endian
pub fn parse_int(value: &str) -> Option<Vec<u8>> {
    let n = value.trim().parse::<i32>().ok()?;
    let mut buf = vec![0u8; 4];
    LittleEndian::write_i32(&mut buf, n);
    Some(buf)
}

/// Comma separated bytes, e.g. `255,128,0` or `[255, 128, 0]`
pub fn parse_bytes(value: &str) -> Option<Vec<u8>> {
    let inner = value.trim().trim_start_matches('[').trim_end_matches(']');
    if inner.trim().is_empty() {
        return None;
    }
    inner
        .split(',')
        .map(|part| part.trim().parse::<u8>().ok())
        .collect()
}

/// Little-endian IEEE-754 float from exactly four bytes
pub fn parse_f32(bytes: &[u8]) -> Option<f32> {
    if bytes.len() != 4 {
        return None;
    }
    Some(LittleEndian::read_f32(bytes))
}

/// Round to `decimals` places; non-finite values become `None`
pub fn round_to(value: f32, decimals: i32) -> Option<f64> {
    let value = f64::from(value);
    if !value.is_finite() {
        return None;
    }
    let factor = 10f64.powi(decimals);
    Some((value * factor).round() / factor)
}
