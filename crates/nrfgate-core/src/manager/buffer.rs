//! Pending parameter buffer
//!
//! Values written by clients wait here until the device confirms them. A newer
//! write to the same key replaces the buffered value, so only the latest value
//! is ever sent.

use std::collections::{BTreeMap, HashMap};

use crate::message::DeviceUuid;

/// UUID -> parameter -> pending value
#[derive(Debug, Clone, Default)]
pub struct ParameterBuffer {
    pending: HashMap<DeviceUuid, BTreeMap<String, String>>,
    /// Values delivered to the device and awaiting its confirmation
    sent: HashMap<DeviceUuid, BTreeMap<String, String>>,
}

impl ParameterBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or overwrite a pending value
    pub fn set(&mut self, uuid: DeviceUuid, parameter: &str, value: &str) {
        self.pending
            .entry(uuid)
            .or_default()
            .insert(parameter.to_string(), value.to_string());
    }

    /// Copy of the pending values of one device
    pub fn snapshot(&self, uuid: &DeviceUuid) -> Vec<(String, String)> {
        self.pending
            .get(uuid)
            .map(|p| p.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Pending values of one device
    pub fn get(&self, uuid: &DeviceUuid) -> BTreeMap<String, String> {
        self.pending.get(uuid).cloned().unwrap_or_default()
    }

    pub fn has_pending(&self, uuid: &DeviceUuid) -> bool {
        self.pending.get(uuid).is_some_and(|p| !p.is_empty())
    }

    /// Remove `parameter` unless a different value was written since `value`
    /// was read. Returns whether it was removed.
    pub fn remove_if_unchanged(&mut self, uuid: &DeviceUuid, parameter: &str, value: &str) -> bool {
        let Some(entries) = self.pending.get_mut(uuid) else {
            return false;
        };
        if entries.get(parameter).map(String::as_str) != Some(value) {
            return false;
        }
        entries.remove(parameter);
        if entries.is_empty() {
            self.pending.remove(uuid);
        }
        true
    }

    /// Note that `value` was delivered for `parameter`
    pub fn mark_sent(&mut self, uuid: DeviceUuid, parameter: &str, value: &str) {
        self.sent
            .entry(uuid)
            .or_default()
            .insert(parameter.to_string(), value.to_string());
    }

    /// Drop delivered values that are still current. Returns the parameters
    /// removed from the buffer.
    pub fn confirm_sent(&mut self, uuid: &DeviceUuid) -> Vec<String> {
        let Some(sent) = self.sent.remove(uuid) else {
            return Vec::new();
        };
        sent.into_iter()
            .filter(|(parameter, value)| self.remove_if_unchanged(uuid, parameter, value))
            .map(|(parameter, _)| parameter)
            .collect()
    }

    /// Parameters delivered but not yet confirmed
    pub fn unconfirmed(&self, uuid: &DeviceUuid) -> Vec<String> {
        self.sent
            .get(uuid)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Discard everything buffered for a device
    pub fn clear(&mut self, uuid: &DeviceUuid) -> usize {
        self.sent.remove(uuid);
        self.pending.remove(uuid).map_or(0, |p| p.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const UUID: DeviceUuid = DeviceUuid::new([1, 2, 3, 4]);

    #[test]
    fn test_latest_write_wins() {
        let mut buffer = ParameterBuffer::new();
        buffer.set(UUID, "brightness", "10");
        buffer.set(UUID, "brightness", "20");
        assert_eq!(
            buffer.snapshot(&UUID),
            vec![("brightness".to_string(), "20".to_string())]
        );
    }

    #[test]
    fn test_remove_only_if_unchanged() {
        let mut buffer = ParameterBuffer::new();
        buffer.set(UUID, "power", "1");
        buffer.set(UUID, "power", "0");
        assert!(!buffer.remove_if_unchanged(&UUID, "power", "1"));
        assert!(buffer.has_pending(&UUID));
        assert!(buffer.remove_if_unchanged(&UUID, "power", "0"));
        assert!(!buffer.has_pending(&UUID));
    }

    #[test]
    fn test_confirm_keeps_newer_writes() {
        let mut buffer = ParameterBuffer::new();
        buffer.set(UUID, "power", "1");
        buffer.set(UUID, "ch_1", "5");
        buffer.mark_sent(UUID, "power", "1");
        buffer.mark_sent(UUID, "ch_1", "5");
        buffer.set(UUID, "ch_1", "6");

        assert_eq!(buffer.confirm_sent(&UUID), vec!["power".to_string()]);
        assert_eq!(buffer.get(&UUID).get("ch_1").map(String::as_str), Some("6"));
        assert!(buffer.unconfirmed(&UUID).is_empty());
    }

    #[test]
    fn test_clear() {
        let mut buffer = ParameterBuffer::new();
        buffer.set(UUID, "a", "1");
        buffer.set(UUID, "b", "2");
        buffer.mark_sent(UUID, "a", "1");
        assert_eq!(buffer.clear(&UUID), 2);
        assert!(buffer.snapshot(&UUID).is_empty());
        assert!(buffer.unconfirmed(&UUID).is_empty());
    }
}
