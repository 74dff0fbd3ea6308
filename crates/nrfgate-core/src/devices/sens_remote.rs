//! Battery powered sensor remote with two buttons
//!
//! Status layout (13 bytes):
//!
//! ```text
//! [target_id, target_uuid(4), temperature(f32 LE), humidity(f32 LE)]
//! ```

use serde::Serialize;

use super::parse::{parse_f32, round_to};
use super::rot_remote::{target_message, RotRemoteStatus};
use super::{expect_len, DecodeError, DeviceCodec};
use crate::message::{DeviceUuid, SetMessage};

const STATUS_LEN: usize = 13;

/// Decoded sensor status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensRemoteStatus {
    #[serde(rename = "targetID")]
    pub target_id: u8,
    #[serde(rename = "targetUUID")]
    pub target_uuid: DeviceUuid,
    /// Degrees Celsius
    pub temperature: Option<f64>,
    /// Relative humidity in percent
    pub humidity: Option<f64>,
}

/// Codec for `SensRemote`
#[derive(Debug, Clone, Copy, Default)]
pub struct SensRemote;

impl DeviceCodec for SensRemote {
    fn device_type(&self) -> &'static str {
        "SensRemote"
    }

    fn settable_parameters(&self) -> &'static [&'static str] {
        &["target"]
    }

    fn supported_firmware_versions(&self) -> &'static [u8] {
        &[1]
    }

    fn decode_status(&self, data: &[u8]) -> Result<serde_json::Value, DecodeError> {
        expect_len(data, STATUS_LEN)?;
        let target = RotRemoteStatus::parse(&data[..5])?;
        let status = SensRemoteStatus {
            target_id: target.target_id,
            target_uuid: target.target_uuid,
            temperature: parse_f32(&data[5..9]).and_then(|v| round_to(v, 1)),
            humidity: parse_f32(&data[9..13]).and_then(|v| round_to(v, 1)),
        };
        serde_json::to_value(status).map_err(|e| DecodeError::Invalid(e.to_string()))
    }

    fn build_set_message(&self, parameter: &str, value: &str) -> Option<SetMessage> {
        match parameter {
            "target" => target_message(self.parameter_index(parameter)?, value),
            _ => None,
        }
    }

    fn remote_event_name(&self, layer: u8, value: u8) -> String {
        match (layer, value) {
            (0, 2) => "click_up".to_string(),
            (0, 3) => "click_down".to_string(),
            (1, 0) => "hold_up".to_string(),
            (1, 1) => "hold_down".to_string(),
            _ => format!("event_{}:{}", layer, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_status() {
        let mut data = vec![2, 9, 8, 7, 6];
        data.extend_from_slice(&21.46f32.to_le_bytes());
        data.extend_from_slice(&48.04f32.to_le_bytes());

        let status = SensRemote.decode_status(&data).unwrap();
        assert_eq!(
            status,
            serde_json::json!({
                "targetID": 2,
                "targetUUID": [9, 8, 7, 6],
                "temperature": 21.5,
                "humidity": 48.0,
            })
        );
    }

    #[test]
    fn test_remote_event_names() {
        assert_eq!(SensRemote.remote_event_name(0, 2), "click_up");
        assert_eq!(SensRemote.remote_event_name(0, 3), "click_down");
        assert_eq!(SensRemote.remote_event_name(1, 0), "hold_up");
        assert_eq!(SensRemote.remote_event_name(1, 1), "hold_down");
        assert_eq!(SensRemote.remote_event_name(2, 7), "event_2:7");
    }
}
