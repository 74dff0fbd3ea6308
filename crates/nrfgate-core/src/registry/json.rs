//! JSON file backed registry

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ChangeEvent, ChangeKind, DeviceRecord, DeviceRegistry, RegistryError, MAX_LINK_ID,
    MIN_LINK_ID,
};
use crate::lock;
use crate::message::DeviceUuid;

/// Maximum number of undelivered change events
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    host_uuid: DeviceUuid,
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

/// Registry keeping all records in memory, optionally persisted as one pretty
/// JSON document rewritten after each mutation.
pub struct JsonRegistry {
    path: Option<PathBuf>,
    doc: Mutex<Document>,
    events: Mutex<VecDeque<ChangeEvent>>,
}

fn random_uuid() -> DeviceUuid {
    DeviceUuid::new(rand::thread_rng().gen())
}

impl JsonRegistry {
    /// Default registry file location (in app data)
    pub fn default_path() -> io::Result<PathBuf> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "Could not find app data directory")
            })?;
        Ok(base.join("nrfgate").join("registry.json"))
    }

    /// Registry that is never written to disk
    pub fn in_memory() -> Self {
        Self::with_document(
            None,
            Document {
                host_uuid: random_uuid(),
                devices: Vec::new(),
            },
        )
    }

    /// Load the registry file, creating it with a fresh host UUID if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();

        let doc = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let doc: Document = serde_json::from_str(&content)?;
            info!(
                path = %path.display(),
                devices = doc.devices.len(),
                host_uuid = %doc.host_uuid,
                "Loaded device registry"
            );
            doc
        } else {
            let doc = Document {
                host_uuid: random_uuid(),
                devices: Vec::new(),
            };
            info!(path = %path.display(), host_uuid = %doc.host_uuid, "Creating device registry");
            doc
        };

        let registry = Self::with_document(Some(path), doc);
        registry.save(&lock(&registry.doc))?;
        Ok(registry)
    }

    fn with_document(path: Option<PathBuf>, doc: Document) -> Self {
        Self {
            path,
            doc: Mutex::new(doc),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// File the registry persists to, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn save(&self, doc: &Document) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(doc)?;
        fs::write(path, content)?;
        Ok(())
    }

    fn push_event(&self, event: ChangeEvent) {
        let mut events = lock(&self.events);
        if events.len() >= EVENT_QUEUE_CAPACITY {
            warn!("Registry event queue full, dropping oldest event");
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Apply `f` to a copy of the record of `uuid`, persist, and only then
    /// commit it and queue an event listing the fields that changed.
    fn modify<F>(&self, uuid: &DeviceUuid, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let mut doc = lock(&self.doc);
        let index = doc
            .devices
            .iter()
            .position(|d| d.uuid == *uuid)
            .ok_or(RegistryError::NotFound(*uuid))?;

        let mut record = doc.devices[index].clone();
        let before = serde_json::to_value(&record)?;
        f(&mut record);
        let after = serde_json::to_value(&record)?;

        let changed = changed_fields(&before, &after);
        if changed.is_empty() {
            return Ok(());
        }
        let mut next = doc.clone();
        next.devices[index] = record;
        self.save(&next)?;
        *doc = next;
        drop(doc);

        debug!(uuid = %uuid, fields = ?changed, "Device record updated");
        self.push_event(ChangeEvent {
            uuid: *uuid,
            kind: ChangeKind::Updated,
            changed_fields: changed,
        });
        Ok(())
    }
}

/// Names of the top-level keys that differ between two JSON objects
fn changed_fields(before: &serde_json::Value, after: &serde_json::Value) -> Vec<String> {
    let (Some(before), Some(after)) = (before.as_object(), after.as_object()) else {
        return Vec::new();
    };
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|k| before.get(*k) != after.get(*k))
        .cloned()
        .collect()
}

impl DeviceRegistry for JsonRegistry {
    fn lookup(&self, uuid: &DeviceUuid) -> Option<DeviceRecord> {
        lock(&self.doc)
            .devices
            .iter()
            .find(|d| d.uuid == *uuid)
            .cloned()
    }

    fn lookup_by_link_id(&self, link_id: u8) -> Option<DeviceRecord> {
        lock(&self.doc)
            .devices
            .iter()
            .find(|d| d.link_id == link_id)
            .cloned()
    }

    fn list_all(&self) -> Vec<DeviceRecord> {
        lock(&self.doc).devices.clone()
    }

    fn allocate_free_link_id(&self) -> Option<u8> {
        let doc = lock(&self.doc);
        let used: BTreeSet<u8> = doc.devices.iter().map(|d| d.link_id).collect();
        (MIN_LINK_ID..=MAX_LINK_ID).find(|id| !used.contains(id))
    }

    fn insert(&self, record: DeviceRecord) -> Result<(), RegistryError> {
        let mut doc = lock(&self.doc);
        if doc.devices.iter().any(|d| d.uuid == record.uuid) {
            return Err(RegistryError::AlreadyExists(record.uuid));
        }
        if doc.devices.iter().any(|d| d.link_id == record.link_id) {
            return Err(RegistryError::LinkIdInUse(record.link_id));
        }

        let uuid = record.uuid;
        let fields: Vec<String> = serde_json::to_value(&record)?
            .as_object()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        let mut next = doc.clone();
        next.devices.push(record);
        self.save(&next)?;
        *doc = next;
        drop(doc);

        info!(uuid = %uuid, "Device added to registry");
        self.push_event(ChangeEvent {
            uuid,
            kind: ChangeKind::Added,
            changed_fields: fields,
        });
        Ok(())
    }

    fn update(&self, record: DeviceRecord) -> Result<(), RegistryError> {
        let uuid = record.uuid;
        {
            let doc = lock(&self.doc);
            if let Some(holder) = doc
                .devices
                .iter()
                .find(|d| d.link_id == record.link_id && d.uuid != uuid)
            {
                warn!(uuid = %uuid, holder = %holder.uuid, "Link ID collision on update");
                return Err(RegistryError::LinkIdInUse(record.link_id));
            }
        }
        self.modify(&uuid, |existing| *existing = record)
    }

    fn update_with(
        &self,
        uuid: &DeviceUuid,
        apply: &mut dyn FnMut(&mut DeviceRecord),
    ) -> Result<(), RegistryError> {
        self.modify(uuid, |record| apply(record))
    }

    fn remove(&self, uuid: &DeviceUuid) -> Result<DeviceRecord, RegistryError> {
        let mut doc = lock(&self.doc);
        let index = doc
            .devices
            .iter()
            .position(|d| d.uuid == *uuid)
            .ok_or(RegistryError::NotFound(*uuid))?;
        let mut next = doc.clone();
        let record = next.devices.remove(index);
        self.save(&next)?;
        *doc = next;
        drop(doc);

        info!(uuid = %uuid, link_id = record.link_id, "Device removed from registry");
        self.push_event(ChangeEvent {
            uuid: *uuid,
            kind: ChangeKind::Removed,
            changed_fields: Vec::new(),
        });
        Ok(record)
    }

    fn set_offline(&self, uuid: &DeviceUuid, offline: bool) -> Result<(), RegistryError> {
        self.modify(uuid, |d| d.offline = offline)
    }

    fn set_connection_health(&self, uuid: &DeviceUuid, health: f64) -> Result<(), RegistryError> {
        self.modify(uuid, |d| d.connection_health = health)
    }

    fn rename(&self, uuid: &DeviceUuid, name: &str) -> Result<(), RegistryError> {
        self.modify(uuid, |d| d.name = name.to_string())
    }

    fn host_uuid(&self) -> DeviceUuid {
        lock(&self.doc).host_uuid
    }

    fn pop_change_event(&self) -> Option<ChangeEvent> {
        lock(&self.events).pop_front()
    }
}
