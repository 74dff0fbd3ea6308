//! Three-channel LED controller
//!
//! Status layout (10 bytes):
//!
//! ```text
//! [power, brightness, ch_1, ch_2, ch_3, num_channels, power_scale(f32 LE)]
//! ```
//!
//! Channels 1 and 2 drive warm and cold white; colour temperature is derived
//! from their mix.

use serde::Serialize;

use super::parse::{parse_bool, parse_byte, parse_bytes, parse_f32, parse_int, round_to};
use super::{expect_len, DecodeError, DeviceCodec};
use crate::message::SetMessage;

const STATUS_LEN: usize = 10;

/// Warmest colour temperature in Kelvin
pub const MIN_CCT: f64 = 2500.0;
/// Coldest colour temperature in Kelvin
pub const MAX_CCT: f64 = 6500.0;

/// Decoded controller status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedStatus {
    pub power: u8,
    pub brightness: u8,
    pub brightness_percent: u8,
    pub ch_1: u8,
    pub ch_2: u8,
    pub ch_3: u8,
    pub cct: u32,
    pub cct_mired: u32,
    pub num_channels: u8,
    pub power_scale: Option<f64>,
}

/// Colour temperature of a warm/cold mix
pub fn cct_from_channels(ch_1: u8, ch_2: u8) -> u32 {
    let mix = ((f64::from(ch_2) - f64::from(ch_1)) / 255.0 + 1.0) / 2.0;
    (MIN_CCT + (MAX_CCT - MIN_CCT) * mix) as u32
}

/// Warm/cold mix for a colour temperature, clamped to the supported range
pub fn channels_from_cct(kelvin: f64) -> (u8, u8) {
    let kelvin = kelvin.clamp(MIN_CCT, MAX_CCT);
    let mix = (kelvin - MIN_CCT) / (MAX_CCT - MIN_CCT);
    (((1.0 - mix) * 255.0) as u8, (mix * 255.0) as u8)
}

fn mired(kelvin: u32) -> u32 {
    if kelvin == 0 {
        return 0;
    }
    1_000_000 / kelvin
}

/// Codec for `LedController3Ch`
#[derive(Debug, Clone, Copy, Default)]
pub struct LedController3Ch;

impl LedController3Ch {
    fn index(&self, parameter: &str) -> Option<u8> {
        self.parameter_index(parameter)
    }

    fn set_rgb_from_cct(&self, kelvin: f64) -> Option<SetMessage> {
        if !(MIN_CCT..=MAX_CCT).contains(&kelvin) {
            tracing::warn!(kelvin, "cct out of bounds, clamping");
        }
        let (ch_1, ch_2) = channels_from_cct(kelvin);
        Some(SetMessage::set(self.index("rgb")?, vec![ch_1, ch_2, 0]))
    }
}

impl DeviceCodec for LedController3Ch {
    fn device_type(&self) -> &'static str {
        "LedController3Ch"
    }

    fn settable_parameters(&self) -> &'static [&'static str] {
        &[
            "power",
            "brightness",
            "ch_1",
            "ch_2",
            "ch_3",
            "rgb",
            "output_power_limit",
            "status_interval",
            // Mapped onto rgb / brightness
            "cct",
            "cct_mired",
            "brightness_percent",
        ]
    }

    fn supported_firmware_versions(&self) -> &'static [u8] {
        &[1]
    }

    fn decode_status(&self, data: &[u8]) -> Result<serde_json::Value, DecodeError> {
        expect_len(data, STATUS_LEN)?;
        let power_scale = parse_f32(&data[6..10]).and_then(|v| round_to(v, 2));
        let cct = cct_from_channels(data[2], data[3]);
        let status = LedStatus {
            power: data[0],
            brightness: data[1],
            brightness_percent: (u16::from(data[1]) * 100 / 255) as u8,
            ch_1: data[2],
            ch_2: data[3],
            ch_3: data[4],
            cct,
            cct_mired: mired(cct),
            num_channels: data[5],
            power_scale,
        };
        serde_json::to_value(status).map_err(|e| DecodeError::Invalid(e.to_string()))
    }

    fn build_set_message(&self, parameter: &str, value: &str) -> Option<SetMessage> {
        match parameter {
            "power" => Some(SetMessage::set(self.index(parameter)?, parse_bool(value)?)),
            "brightness" | "ch_1" | "ch_2" | "ch_3" | "status_interval" => {
                Some(SetMessage::set(self.index(parameter)?, parse_byte(value)?))
            }
            "rgb" => {
                let rgb = parse_bytes(value).filter(|v| v.len() == 3)?;
                Some(SetMessage::set(self.index(parameter)?, rgb))
            }
            "output_power_limit" => Some(SetMessage::set(self.index(parameter)?, parse_int(value)?)),
            "cct" => {
                let kelvin = value.trim().parse::<i64>().ok()?;
                self.set_rgb_from_cct(kelvin as f64)
            }
            "cct_mired" => {
                let mired = value.trim().parse::<i64>().ok().filter(|m| *m > 0)?;
                self.set_rgb_from_cct(1_000_000.0 / mired as f64)
            }
            "brightness_percent" => {
                let percent = value.trim().parse::<u8>().ok().filter(|p| *p <= 100)?;
                let raw = (f64::from(percent) * 255.0 / 100.0).round() as u8;
                Some(SetMessage::set(self.index("brightness")?, vec![raw]))
            }
            _ => None,
        }
    }

    fn get_param(&self, parameter: &str, status: &serde_json::Value) -> Option<String> {
        let channel = |name: &str| status.get(name).and_then(|v| v.as_u64());
        match parameter {
            "rgb" => Some(format!(
                "{},{},{}",
                channel("ch_1")?,
                channel("ch_2")?,
                channel("ch_3")?
            )),
            "cct" => {
                let ch_1 = u8::try_from(channel("ch_1")?).ok()?;
                let ch_2 = u8::try_from(channel("ch_2")?).ok()?;
                Some(cct_from_channels(ch_1, ch_2).to_string())
            }
            _ => match status.get(parameter)? {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            },
        }
    }
}
