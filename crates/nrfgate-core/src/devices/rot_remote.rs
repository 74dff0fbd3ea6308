//! Rotary remote control

use serde::Serialize;

use super::parse::parse_bytes;
use super::{expect_len, DecodeError, DeviceCodec};
use crate::message::{DeviceUuid, SetMessage};

/// Status: `[target_id, target_uuid(4)]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotRemoteStatus {
    #[serde(rename = "targetID")]
    pub target_id: u8,
    #[serde(rename = "targetUUID")]
    pub target_uuid: DeviceUuid,
}

impl RotRemoteStatus {
    pub(crate) fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let target_uuid = DeviceUuid::from_slice(data, 1)
            .ok_or_else(|| DecodeError::Invalid("missing target UUID".to_string()))?;
        Ok(Self {
            target_id: data[0],
            target_uuid,
        })
    }
}

/// Value of the `target` parameter: link ID followed by the UUID, 5 bytes
pub(crate) fn target_message(index: u8, value: &str) -> Option<SetMessage> {
    let target = parse_bytes(value).filter(|v| v.len() == 5)?;
    Some(SetMessage::set(index, target))
}

/// Codec for `RotRemote`
#[derive(Debug, Clone, Copy, Default)]
pub struct RotRemote;

impl DeviceCodec for RotRemote {
    fn device_type(&self) -> &'static str {
        "RotRemote"
    }

    fn settable_parameters(&self) -> &'static [&'static str] {
        &["target"]
    }

    fn supported_firmware_versions(&self) -> &'static [u8] {
        &[1]
    }

    fn decode_status(&self, data: &[u8]) -> Result<serde_json::Value, DecodeError> {
        expect_len(data, 5)?;
        let status = RotRemoteStatus::parse(data)?;
        serde_json::to_value(status).map_err(|e| DecodeError::Invalid(e.to_string()))
    }

    fn build_set_message(&self, parameter: &str, value: &str) -> Option<SetMessage> {
        match parameter {
            "target" => target_message(self.parameter_index(parameter)?, value),
            _ => None,
        }
    }
}
