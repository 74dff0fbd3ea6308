//! Device Registry
//!
//! Key-value store of [`DeviceRecord`]s indexed by UUID, with a
//! change-notification queue for external consumers. The communication
//! manager only talks to the [`DeviceRegistry`] trait; [`JsonRegistry`] is the
//! bundled file-backed implementation.

mod json;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::DeviceUuid;

pub use json::JsonRegistry;

/// Lowest assignable link ID
pub const MIN_LINK_ID: u8 = 1;
/// Highest assignable link ID
pub const MAX_LINK_ID: u8 = 254;

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Device {0} not found")]
    NotFound(DeviceUuid),

    #[error("Device {0} already registered")]
    AlreadyExists(DeviceUuid),

    #[error("Link ID {0} already in use")]
    LinkIdInUse(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistent record of one wireless device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Durable identity
    pub uuid: DeviceUuid,
    /// Current link ID
    #[serde(rename = "id")]
    pub link_id: u8,
    /// Device-type tag selecting the codec
    #[serde(rename = "type")]
    pub device_type: String,
    /// Firmware version
    pub version: u8,
    pub battery_powered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<u8>,
    /// Last decoded status, shaped by the device codec
    #[serde(default)]
    pub status: serde_json::Value,
    /// Seconds between unsolicited status reports
    #[serde(default)]
    pub status_interval: u8,
    pub last_seen: DateTime<Local>,
    #[serde(default = "full_health")]
    pub connection_health: f64,
    #[serde(default)]
    pub offline: bool,
    /// Human-readable name
    pub name: String,
}

fn full_health() -> f64 {
    1.0
}

impl DeviceRecord {
    /// Record for a freshly announced device, named after its type
    pub fn new(
        uuid: DeviceUuid,
        link_id: u8,
        device_type: impl Into<String>,
        version: u8,
        battery_powered: bool,
    ) -> Self {
        let device_type = device_type.into();
        Self {
            uuid,
            link_id,
            name: device_type.clone(),
            device_type,
            version,
            battery_powered,
            battery_level: None,
            battery_percent: None,
            status: serde_json::Value::Null,
            status_interval: 0,
            last_seen: Local::now(),
            connection_health: 1.0,
            offline: false,
        }
    }
}

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// Notification queued for every registry mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub uuid: DeviceUuid,
    pub kind: ChangeKind,
    /// Top-level record fields whose value changed
    pub changed_fields: Vec<String>,
}

/// Store of device records. All operations must be safe to call concurrently.
pub trait DeviceRegistry: Send + Sync {
    /// Find a record by UUID
    fn lookup(&self, uuid: &DeviceUuid) -> Option<DeviceRecord>;

    /// Find the record currently holding a link ID
    fn lookup_by_link_id(&self, link_id: u8) -> Option<DeviceRecord>;

    /// Snapshot of all records
    fn list_all(&self) -> Vec<DeviceRecord>;

    /// Smallest unused link ID in `MIN_LINK_ID..=MAX_LINK_ID`
    fn allocate_free_link_id(&self) -> Option<u8>;

    /// Add a new record
    fn insert(&self, record: DeviceRecord) -> Result<(), RegistryError>;

    /// Replace an existing record, queueing a change event if anything changed
    fn update(&self, record: DeviceRecord) -> Result<(), RegistryError>;

    /// Apply `apply` to the stored record under the registry's own lock, so
    /// fields it leaves alone keep any concurrent change. `apply` must not
    /// touch `uuid` or `link_id`.
    fn update_with(
        &self,
        uuid: &DeviceUuid,
        apply: &mut dyn FnMut(&mut DeviceRecord),
    ) -> Result<(), RegistryError>;

    /// Delete a record
    fn remove(&self, uuid: &DeviceUuid) -> Result<DeviceRecord, RegistryError>;

    fn set_offline(&self, uuid: &DeviceUuid, offline: bool) -> Result<(), RegistryError>;

    fn set_connection_health(&self, uuid: &DeviceUuid, health: f64) -> Result<(), RegistryError>;

    fn rename(&self, uuid: &DeviceUuid, name: &str) -> Result<(), RegistryError>;

    /// UUID the gateway identifies itself with towards devices
    fn host_uuid(&self) -> DeviceUuid;

    /// Oldest queued change notification
    fn pop_change_event(&self) -> Option<ChangeEvent>;
}
