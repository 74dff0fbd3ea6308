//! Device codecs
//!
//! Each supported device model has a [`DeviceCodec`] that decodes its status
//! payload and encodes parameter changes. Codecs are registered by device-type
//! tag in a [`CodecRegistry`] at startup; the tag is the ASCII string a device
//! sends in its INIT message.

mod led_controller;
pub mod parse;
mod rot_remote;
mod sens_remote;

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::message::SetMessage;

pub use led_controller::{LedController3Ch, LedStatus};
pub use rot_remote::{RotRemote, RotRemoteStatus};
pub use sens_remote::{SensRemote, SensRemoteStatus};

/// Status payload decoding errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Status payload must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("Invalid status payload: {0}")]
    Invalid(String),
}

/// Check the exact payload length a device model reports
pub(crate) fn expect_len(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() != expected {
        return Err(DecodeError::Length {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Codec for one device model
pub trait DeviceCodec: Send + Sync {
    /// Tag the device announces itself with
    fn device_type(&self) -> &'static str;

    /// Parameters clients may set, in the device's index order
    fn settable_parameters(&self) -> &'static [&'static str];

    /// Firmware versions this codec understands
    fn supported_firmware_versions(&self) -> &'static [u8];

    /// Decode the DATA of a STATUS or OK message
    fn decode_status(&self, data: &[u8]) -> Result<serde_json::Value, DecodeError>;

    /// Build the change for `parameter`; `None` if unsupported or the value
    /// does not parse.
    fn build_set_message(&self, parameter: &str, value: &str) -> Option<SetMessage>;

    /// Current value of `parameter` as a string, read from a decoded status
    fn get_param(&self, parameter: &str, status: &serde_json::Value) -> Option<String> {
        match status.get(parameter)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Name of a remote-control event
    fn remote_event_name(&self, layer: u8, value: u8) -> String {
        format!("event_{}:{}", layer, value)
    }

    /// Battery charge in percent from the raw battery byte
    fn battery_percent(&self, level: u8) -> u8 {
        (u16::from(level) * 100 / 255) as u8
    }

    fn is_settable(&self, parameter: &str) -> bool {
        self.settable_parameters().contains(&parameter)
    }

    fn supports_firmware(&self, version: u8) -> bool {
        self.supported_firmware_versions().contains(&version)
    }

    /// Wire index of a settable parameter
    fn parameter_index(&self, parameter: &str) -> Option<u8> {
        self.settable_parameters()
            .iter()
            .position(|p| *p == parameter)
            .and_then(|i| u8::try_from(i).ok())
    }
}

/// Device-type tag to codec mapping
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<String, Arc<dyn DeviceCodec>>,
}

impl CodecRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every bundled device model
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LedController3Ch));
        registry.register(Arc::new(RotRemote));
        registry.register(Arc::new(SensRemote));
        registry
    }

    /// Add or replace the codec for its device type
    pub fn register(&mut self, codec: Arc<dyn DeviceCodec>) {
        self.codecs.insert(codec.device_type().to_string(), codec);
    }

    /// Codec for a device-type tag
    pub fn get(&self, device_type: &str) -> Option<Arc<dyn DeviceCodec>> {
        self.codecs.get(device_type).cloned()
    }

    pub fn contains(&self, device_type: &str) -> bool {
        self.codecs.contains_key(device_type)
    }

    /// Registered device-type tags, sorted
    pub fn device_types(&self) -> Vec<&str> {
        self.codecs.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("device_types", &self.device_types())
            .finish()
    }
}
