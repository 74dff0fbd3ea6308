//! Communication Manager
//!
//! Drives the device lifecycle on top of a [`MessageLink`]:
//!
//! - **listen**: drains inbound device messages, registers new devices,
//!   applies status reports, tracks connection health and forwards
//!   remote-control events.
//! - **reconcile**: flushes buffered parameter changes to the devices,
//!   retrying until the device confirms, a newer value supersedes it, or the
//!   device is declared offline.
//!
//! Both loops run on their own thread until [`CommunicationManager::shutdown`].

mod buffer;
mod health;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::devices::{CodecRegistry, DeviceCodec};
use crate::lock;
use crate::message::{
    DeviceMessage, DeviceUuid, HostMessage, InboundMessage, MsgType, RemoteMessage,
};
use crate::protocol::MessageLink;
use crate::registry::{DeviceRecord, DeviceRegistry, RegistryError};

pub use buffer::ParameterBuffer;
pub use health::ConnectionHealth;

/// Errors returned synchronously to callers of the manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Device {0} not found")]
    UnknownDevice(DeviceUuid),

    #[error("Unsupported device type: {0}")]
    UnsupportedDeviceType(String),

    #[error("Parameter {0} not supported")]
    UnsupportedParameter(String),
}

/// Manager timing and sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Listen loop poll interval when no message is waiting
    pub listen_interval_ms: u64,
    /// Pause between reconciliation passes
    pub reconcile_interval_ms: u64,
    /// Pause after each SET sent
    pub send_pacing_ms: u64,
    /// How long sends to a device may keep failing before it is marked offline
    pub offline_timeout_ms: u64,
    /// Sequence numbers kept per device for health estimation
    pub health_window: usize,
    /// Minimum time between link reconnect attempts
    pub reconnect_interval_ms: u64,
    /// Maximum number of undelivered remote events
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_interval_ms: 10,
            reconcile_interval_ms: 500,
            send_pacing_ms: 100,
            offline_timeout_ms: 5000,
            health_window: health::DEFAULT_WINDOW,
            reconnect_interval_ms: 3000,
            event_capacity: 256,
        }
    }
}

/// Remote-control event relayed by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Device that produced the event
    pub uuid: DeviceUuid,
    /// Codec-specific event name, e.g. `click_up`
    pub event: String,
}

/// Inbound bookkeeping shared by health estimation and duplicate suppression
#[derive(Debug, Default)]
struct InboundState {
    health: ConnectionHealth,
    last_msg_num: HashMap<DeviceUuid, u8>,
}

/// Orchestrates device registration, status updates and parameter delivery
pub struct CommunicationManager {
    link: Arc<dyn MessageLink>,
    registry: Arc<dyn DeviceRegistry>,
    codecs: CodecRegistry,
    config: ManagerConfig,
    pending: Mutex<ParameterBuffer>,
    /// Link IDs that were sent a SET and have not reported back yet
    wait_for_ack: Mutex<HashSet<u8>>,
    /// Time of the first failed send in the current failure streak
    send_failures: Mutex<HashMap<DeviceUuid, Instant>>,
    inbound: Mutex<InboundState>,
    events: Mutex<VecDeque<RemoteEvent>>,
    shutdown: Arc<AtomicBool>,
}

/// Join handles of the two manager loops
pub struct ManagerThreads {
    listen: JoinHandle<()>,
    reconcile: JoinHandle<()>,
}

impl ManagerThreads {
    /// Wait for both loops to exit
    pub fn join(self) {
        for (name, handle) in [("listen", self.listen), ("reconcile", self.reconcile)] {
            if handle.join().is_err() {
                error!("Manager {} loop panicked", name);
            }
        }
    }
}

impl CommunicationManager {
    pub fn new(
        link: Arc<dyn MessageLink>,
        registry: Arc<dyn DeviceRegistry>,
        codecs: CodecRegistry,
        config: ManagerConfig,
    ) -> Self {
        Self::with_shutdown_flag(link, registry, codecs, config, Arc::new(AtomicBool::new(false)))
    }

    /// Construct with a shutdown flag shared with other components
    pub fn with_shutdown_flag(
        link: Arc<dyn MessageLink>,
        registry: Arc<dyn DeviceRegistry>,
        codecs: CodecRegistry,
        config: ManagerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let inbound = InboundState {
            health: ConnectionHealth::new(config.health_window),
            last_msg_num: HashMap::new(),
        };
        Self {
            link,
            registry,
            codecs,
            config,
            pending: Mutex::new(ParameterBuffer::new()),
            wait_for_ack: Mutex::new(HashSet::new()),
            send_failures: Mutex::new(HashMap::new()),
            inbound: Mutex::new(inbound),
            events: Mutex::new(VecDeque::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// The flag both loops watch
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Ask both loops to exit after their current iteration
    pub fn shutdown(&self) {
        info!("Communication manager shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Spawn the listen and reconcile loops
    pub fn start(self: &Arc<Self>) -> std::io::Result<ManagerThreads> {
        let manager = Arc::clone(self);
        let listen = thread::Builder::new()
            .name("nrfgate-listen".to_string())
            .spawn(move || manager.listen())?;

        let manager = Arc::clone(self);
        let reconcile = thread::Builder::new()
            .name("nrfgate-reconcile".to_string())
            .spawn(move || manager.reconcile_forever())?;

        Ok(ManagerThreads { listen, reconcile })
    }

    /// Sleep for `duration`, waking early on shutdown
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_shutdown() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(Duration::from_millis(20)));
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Inbound loop: process device messages until shutdown
    pub fn listen(&self) {
        info!("Listening for device messages");
        let idle = Duration::from_millis(self.config.listen_interval_ms.max(1));
        let reconnect_interval = Duration::from_millis(self.config.reconnect_interval_ms);
        let mut last_reconnect: Option<Instant> = None;

        while !self.is_shutdown() {
            if !self.link.is_connected() {
                if last_reconnect.map_or(true, |t| t.elapsed() >= reconnect_interval) {
                    last_reconnect = Some(Instant::now());
                    warn!("Dongle link down, reconnecting");
                    match self.link.reconnect() {
                        Ok(()) => info!("Dongle link re-established"),
                        Err(e) => error!("Reconnect failed: {}", e),
                    }
                }
                thread::sleep(idle);
                continue;
            }

            match self.link.receive() {
                Some(raw) => self.handle_message(&raw),
                None => thread::sleep(idle),
            }
        }
        info!("Stopped listening");
    }

    /// Validate and apply one raw device message
    pub fn handle_message(&self, raw: &[u8]) {
        let msg = match InboundMessage::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping invalid message {:02x?}: {}", raw, e);
                return;
            }
        };

        match msg {
            InboundMessage::Remote(remote) => self.handle_remote(&remote),
            InboundMessage::Device(msg) => {
                if !self.track_sequence(&msg) {
                    return;
                }
                match msg.msg_type {
                    MsgType::Init => self.handle_init(&msg),
                    MsgType::Boot => self.handle_boot(&msg),
                    MsgType::Status | MsgType::Ok => self.handle_status(&msg),
                    _ => info!("Ignoring {}", msg),
                }
            }
        }
    }

    /// Duplicate suppression and health update. Returns false for a duplicate.
    fn track_sequence(&self, msg: &DeviceMessage) -> bool {
        let health = {
            let mut inbound = lock(&self.inbound);
            if inbound.last_msg_num.get(&msg.uuid) == Some(&msg.msg_num) {
                info!(uuid = %msg.uuid, msg_num = msg.msg_num, "Dropping duplicate message");
                return false;
            }
            inbound.last_msg_num.insert(msg.uuid, msg.msg_num);
            inbound.health.record(msg.uuid, msg.msg_num)
        };

        if self.registry.lookup(&msg.uuid).is_some() {
            if let Err(e) = self.registry.set_connection_health(&msg.uuid, health) {
                warn!(uuid = %msg.uuid, "Failed to store connection health: {}", e);
            }
        }
        true
    }

    fn send_init(&self, destination: u8, link_id: u8) -> bool {
        let reply = HostMessage::new(self.registry.host_uuid(), MsgType::Init, vec![link_id]);
        debug!(destination, link_id, "Sending INIT");
        self.link.send(destination, &reply.encode(), true).is_some()
    }

    fn handle_init(&self, msg: &DeviceMessage) {
        let device_type = msg.data_text();
        info!(uuid = %msg.uuid, device_type = %device_type, "Device announced itself");

        if !self.codecs.contains(&device_type) {
            warn!(uuid = %msg.uuid, "Unsupported device type {:?}", device_type);
            return;
        }

        if let Some(existing) = self.registry.lookup(&msg.uuid) {
            info!(
                uuid = %msg.uuid,
                link_id = existing.link_id,
                "Device already registered, re-sending its link ID"
            );
            if !self.send_init(msg.link_id, existing.link_id) {
                error!(uuid = %msg.uuid, "Failed to re-initialize device");
            }
            return;
        }

        let Some(link_id) = self.registry.allocate_free_link_id() else {
            error!(uuid = %msg.uuid, "No free link ID available");
            return;
        };
        info!(uuid = %msg.uuid, link_id, "Assigning link ID");

        if !self.send_init(msg.link_id, link_id) {
            error!(uuid = %msg.uuid, "Failed to initialize {} device", device_type);
            return;
        }

        let battery_powered = msg.battery != 0;
        let mut record = DeviceRecord::new(
            msg.uuid,
            link_id,
            device_type,
            msg.firmware_version,
            battery_powered,
        );
        record.status_interval = msg.status_interval;
        if battery_powered {
            record.battery_level = Some(msg.battery);
            if let Some(codec) = self.codecs.get(&record.device_type) {
                record.battery_percent = Some(codec.battery_percent(msg.battery));
            }
        }
        if let Some(health) = lock(&self.inbound).health.score(&msg.uuid) {
            record.connection_health = health;
        }

        if let Err(e) = self.registry.insert(record) {
            error!(uuid = %msg.uuid, "Failed to register device: {}", e);
        }
    }

    fn handle_boot(&self, msg: &DeviceMessage) {
        info!(uuid = %msg.uuid, "Device booted");
        let host_uuid = self.registry.host_uuid();
        if msg.data.as_slice() != host_uuid.as_bytes() {
            warn!(
                uuid = %msg.uuid,
                "Device reports host UUID {:02X?} instead of {}",
                msg.data,
                host_uuid
            );
        }
    }

    /// Registered device and its codec, provided the reporting link ID matches
    fn registered_sender(
        &self,
        uuid: &DeviceUuid,
        link_id: u8,
    ) -> Option<(DeviceRecord, Arc<dyn DeviceCodec>)> {
        let Some(record) = self.registry.lookup(uuid) else {
            warn!(uuid = %uuid, "Message from unregistered device");
            return None;
        };
        if record.link_id != link_id {
            warn!(
                uuid = %uuid,
                link_id,
                expected = record.link_id,
                "Link ID does not match registry, dropping message"
            );
            return None;
        }
        let Some(codec) = self.codecs.get(&record.device_type) else {
            error!(uuid = %uuid, "Unsupported device type {} in registry", record.device_type);
            return None;
        };
        Some((record, codec))
    }

    fn handle_status(&self, msg: &DeviceMessage) {
        let Some((_, codec)) = self.registered_sender(&msg.uuid, msg.link_id) else {
            return;
        };

        if !codec.supports_firmware(msg.firmware_version) {
            warn!(
                uuid = %msg.uuid,
                version = msg.firmware_version,
                "Firmware version not supported by {} codec",
                codec.device_type()
            );
        }

        let status = match codec.decode_status(&msg.data) {
            Ok(status) => status,
            Err(e) => {
                error!(uuid = %msg.uuid, "Failed to decode status: {}", e);
                return;
            }
        };

        // Only the reported fields are written; name and other admin fields
        // keep whatever the registry holds at this point
        let now = chrono::Local::now();
        let mut status = Some(status);
        let result = self.registry.update_with(&msg.uuid, &mut |record: &mut DeviceRecord| {
            if record.battery_powered {
                record.battery_level = Some(msg.battery);
                record.battery_percent = Some(codec.battery_percent(msg.battery));
            }
            if let Some(status) = status.take() {
                record.status = status;
            }
            record.last_seen = now;
            record.version = msg.firmware_version;
            record.status_interval = msg.status_interval;
            record.offline = false;
        });
        if let Err(e) = result {
            error!(uuid = %msg.uuid, "Failed to update device: {}", e);
            return;
        }

        // The device answered, so any failure streak is over
        lock(&self.send_failures).remove(&msg.uuid);

        if lock(&self.wait_for_ack).remove(&msg.link_id) {
            debug!(uuid = %msg.uuid, link_id = msg.link_id, "Acknowledged");
        }
    }

    fn handle_remote(&self, msg: &RemoteMessage) {
        let Some((_, codec)) = self.registered_sender(&msg.uuid, msg.link_id) else {
            return;
        };
        let event = codec.remote_event_name(msg.layer, msg.value);
        info!(uuid = %msg.uuid, target = %msg.target_uuid, event = %event, "Remote event");

        let mut events = lock(&self.events);
        if events.len() >= self.config.event_capacity.max(1) {
            warn!("Remote event queue full, dropping oldest event");
            events.pop_front();
        }
        events.push_back(RemoteEvent {
            uuid: msg.uuid,
            event,
        });
    }

    /// Oldest undelivered remote event
    pub fn pop_event(&self) -> Option<RemoteEvent> {
        lock(&self.events).pop_front()
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Buffer a parameter change; it is sent by the reconcile loop
    pub fn set_device_param(
        &self,
        uuid: &DeviceUuid,
        parameter: &str,
        value: &str,
    ) -> Result<(), CommandError> {
        info!(uuid = %uuid, parameter, value, "Set parameter");
        let record = self
            .registry
            .lookup(uuid)
            .ok_or(CommandError::UnknownDevice(*uuid))?;
        let codec = self
            .codecs
            .get(&record.device_type)
            .ok_or_else(|| CommandError::UnsupportedDeviceType(record.device_type.clone()))?;
        if !codec.is_settable(parameter) {
            warn!(uuid = %uuid, "Parameter {} not supported", parameter);
            return Err(CommandError::UnsupportedParameter(parameter.to_string()));
        }

        lock(&self.pending).set(*uuid, parameter, value);
        Ok(())
    }

    /// Current value of a parameter from the last decoded status
    pub fn get_device_param(&self, uuid: &DeviceUuid, parameter: &str) -> Option<String> {
        let record = self.registry.lookup(uuid)?;
        let codec = self.codecs.get(&record.device_type)?;
        codec.get_param(parameter, &record.status)
    }

    /// Values still waiting for delivery or confirmation
    pub fn pending_parameters(&self, uuid: &DeviceUuid) -> BTreeMap<String, String> {
        lock(&self.pending).get(uuid)
    }

    /// Outbound loop: reconcile pending values until shutdown
    pub fn reconcile_forever(&self) {
        info!("Reconciling parameters");
        let interval = Duration::from_millis(self.config.reconcile_interval_ms);
        while !self.is_shutdown() {
            self.reconcile_once();
            self.pause(interval);
        }
        info!("Stopped reconciling");
    }

    /// One pass over every device with pending values
    pub fn reconcile_once(&self) {
        for device in self.registry.list_all() {
            if self.is_shutdown() {
                return;
            }
            self.confirm_delivered(&device);
            if lock(&self.pending).has_pending(&device.uuid) {
                self.flush_device(&device);
                self.confirm_delivered(&device);
            }
            // Nothing left to deliver: the next failure starts a new streak
            if !lock(&self.pending).has_pending(&device.uuid) {
                lock(&self.send_failures).remove(&device.uuid);
            }
        }
    }

    /// Drop delivered values once the device has reported back
    fn confirm_delivered(&self, device: &DeviceRecord) {
        let mut pending = lock(&self.pending);
        let unconfirmed = pending.unconfirmed(&device.uuid);
        if unconfirmed.is_empty() {
            return;
        }
        if lock(&self.wait_for_ack).contains(&device.link_id) {
            debug!(uuid = %device.uuid, params = ?unconfirmed, "Confirmation outstanding");
            return;
        }
        let confirmed = pending.confirm_sent(&device.uuid);
        if !confirmed.is_empty() {
            info!(uuid = %device.uuid, params = ?confirmed, "Parameters confirmed");
        }
    }

    fn flush_device(&self, device: &DeviceRecord) {
        let Some(codec) = self.codecs.get(&device.device_type) else {
            error!(uuid = %device.uuid, "Registry contains unsupported device {}", device.device_type);
            return;
        };
        let host_uuid = self.registry.host_uuid();
        let pacing = Duration::from_millis(self.config.send_pacing_ms);
        let entries = lock(&self.pending).snapshot(&device.uuid);

        for (parameter, value) in entries {
            let Some(set) = codec.build_set_message(&parameter, &value) else {
                error!(uuid = %device.uuid, "Cannot encode {} = {:?}, discarding", parameter, value);
                lock(&self.pending).remove_if_unchanged(&device.uuid, &parameter, &value);
                continue;
            };

            let msg = HostMessage::new(host_uuid, MsgType::Set, set.encode());
            info!(uuid = %device.uuid, link_id = device.link_id, "Sending SET {} = {}", parameter, value);

            // Armed before sending: the STATUS answer can beat the ack back
            let armed = lock(&self.wait_for_ack).insert(device.link_id);
            if self.link.send(device.link_id, &msg.encode(), true).is_none() {
                error!(uuid = %device.uuid, "Failed to send SET {}", parameter);
                if armed {
                    lock(&self.wait_for_ack).remove(&device.link_id);
                }
                if self.record_send_failure(device) {
                    return;
                }
            } else {
                self.record_send_success(device);
                lock(&self.pending).mark_sent(device.uuid, &parameter, &value);
            }

            if !pacing.is_zero() {
                self.pause(pacing);
            }
        }
    }

    /// Start or extend the failure streak. Returns true once the device was
    /// declared offline.
    fn record_send_failure(&self, device: &DeviceRecord) -> bool {
        let timeout = Duration::from_millis(self.config.offline_timeout_ms);
        let first_failure = *lock(&self.send_failures)
            .entry(device.uuid)
            .or_insert_with(Instant::now);
        if first_failure.elapsed() < timeout {
            return false;
        }

        warn!(uuid = %device.uuid, "Device unreachable for {:?}, marking offline", timeout);
        let already_offline = self
            .registry
            .lookup(&device.uuid)
            .map_or(device.offline, |d| d.offline);
        if !already_offline {
            if let Err(e) = self.registry.set_offline(&device.uuid, true) {
                error!(uuid = %device.uuid, "Failed to mark device offline: {}", e);
            }
        }

        let dropped = lock(&self.pending).clear(&device.uuid);
        if dropped > 0 {
            warn!(uuid = %device.uuid, dropped, "Discarded pending parameters");
        }
        lock(&self.send_failures).remove(&device.uuid);
        lock(&self.wait_for_ack).remove(&device.link_id);
        true
    }

    fn record_send_success(&self, device: &DeviceRecord) {
        lock(&self.send_failures).remove(&device.uuid);
        let offline = self
            .registry
            .lookup(&device.uuid)
            .map_or(device.offline, |d| d.offline);
        if offline {
            info!(uuid = %device.uuid, "Device back online");
            if let Err(e) = self.registry.set_offline(&device.uuid, false) {
                error!(uuid = %device.uuid, "Failed to mark device online: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Delete a device and everything tracked for it
    pub fn remove_device(&self, uuid: &DeviceUuid) -> Result<DeviceRecord, RegistryError> {
        let record = self.registry.remove(uuid)?;
        lock(&self.pending).clear(uuid);
        lock(&self.send_failures).remove(uuid);
        lock(&self.wait_for_ack).remove(&record.link_id);
        {
            let mut inbound = lock(&self.inbound);
            inbound.health.remove(uuid);
            inbound.last_msg_num.remove(uuid);
        }
        info!(uuid = %uuid, "Device removed");
        Ok(record)
    }

    pub fn rename_device(&self, uuid: &DeviceUuid, name: &str) -> Result<(), RegistryError> {
        self.registry.rename(uuid, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::LedController3Ch;
    use crate::message::SetMessage;
    use crate::registry::{ChangeEvent, ChangeKind, JsonRegistry};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    const DEVICE: DeviceUuid = DeviceUuid::new([0x85, 0x83, 0xF7, 0x7E]);

    /// Link double recording sends and replaying queued inbound messages
    #[derive(Default)]
    struct ScriptedLink {
        sent: Mutex<Vec<(u8, Vec<u8>)>>,
        inbound: Mutex<VecDeque<Vec<u8>>>,
        fail_sends: AtomicBool,
        disconnected: AtomicBool,
        reconnects: AtomicUsize,
    }

    impl ScriptedLink {
        fn sent(&self) -> Vec<(u8, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MessageLink for ScriptedLink {
        fn send(&self, destination: u8, payload: &[u8], _require_ack: bool) -> Option<Vec<u8>> {
            self.sent.lock().unwrap().push((destination, payload.to_vec()));
            if self.fail_sends.load(Ordering::SeqCst) {
                None
            } else {
                Some(Vec::new())
            }
        }

        fn receive(&self) -> Option<Vec<u8>> {
            self.inbound.lock().unwrap().pop_front()
        }

        fn is_connected(&self) -> bool {
            !self.disconnected.load(Ordering::SeqCst)
        }

        fn reconnect(&self) -> Result<(), crate::protocol::LinkError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            self.disconnected.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            listen_interval_ms: 1,
            reconcile_interval_ms: 5,
            send_pacing_ms: 0,
            offline_timeout_ms: 30,
            reconnect_interval_ms: 10,
            ..ManagerConfig::default()
        }
    }

    fn setup() -> (Arc<ScriptedLink>, Arc<JsonRegistry>, CommunicationManager) {
        let link = Arc::new(ScriptedLink::default());
        let registry = Arc::new(JsonRegistry::in_memory());
        let manager = CommunicationManager::new(
            link.clone(),
            registry.clone(),
            CodecRegistry::builtin(),
            fast_config(),
        );
        (link, registry, manager)
    }

    fn device_msg(link_id: u8, msg_type: MsgType, msg_num: u8, data: Vec<u8>) -> Vec<u8> {
        DeviceMessage {
            link_id,
            uuid: DEVICE,
            msg_type,
            firmware_version: 1,
            battery: 0,
            status_interval: 30,
            msg_num,
            data,
        }
        .encode()
    }

    fn led_status(brightness: u8) -> Vec<u8> {
        let mut data = vec![1, brightness, 10, 20, 30, 3];
        data.extend_from_slice(&1.0f32.to_le_bytes());
        data
    }

    fn register(manager: &CommunicationManager) {
        manager.handle_message(&device_msg(0, MsgType::Init, 0, b"LedController3Ch".to_vec()));
    }

    #[test]
    fn test_init_registers_device() {
        let (link, registry, manager) = setup();
        register(&manager);

        let record = registry.lookup(&DEVICE).unwrap();
        assert_eq!(record.link_id, 1);
        assert_eq!(record.device_type, "LedController3Ch");
        assert_eq!(record.name, "LedController3Ch");
        assert!(!record.battery_powered);

        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 0);
        let reply = HostMessage::parse(&sent[0].1).unwrap();
        assert_eq!(reply.msg_type, MsgType::Init);
        assert_eq!(reply.uuid, registry.host_uuid());
        assert_eq!(reply.data, vec![1]);
    }

    #[test]
    fn test_init_send_failure_leaves_device_unregistered() {
        let (link, registry, manager) = setup();
        link.fail_sends.store(true, Ordering::SeqCst);
        register(&manager);
        assert!(registry.lookup(&DEVICE).is_none());
    }

    #[test]
    fn test_init_unknown_type_ignored() {
        let (link, registry, manager) = setup();
        manager.handle_message(&device_msg(0, MsgType::Init, 0, b"Toaster".to_vec()));
        assert!(registry.lookup(&DEVICE).is_none());
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_reannounce_resends_existing_link_id() {
        let (link, registry, manager) = setup();
        register(&manager);
        manager.handle_message(&device_msg(0, MsgType::Init, 1, b"LedController3Ch".to_vec()));

        assert_eq!(registry.list_all().len(), 1);
        let sent = link.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(HostMessage::parse(&sent[1].1).unwrap().data, vec![1]);
    }

    #[test]
    fn test_status_updates_record() {
        let (_, registry, manager) = setup();
        register(&manager);
        manager.handle_message(&device_msg(1, MsgType::Status, 1, led_status(128)));

        let record = registry.lookup(&DEVICE).unwrap();
        assert_eq!(record.status["brightness"], 128);
        assert_eq!(record.status_interval, 30);
        assert_eq!(manager.get_device_param(&DEVICE, "brightness"), Some("128".to_string()));
        assert_eq!(manager.get_device_param(&DEVICE, "rgb"), Some("10,20,30".to_string()));
    }

    #[test]
    fn test_link_id_mismatch_does_not_mutate() {
        let (_, registry, manager) = setup();
        register(&manager);
        let before = registry.lookup(&DEVICE).unwrap();

        manager.handle_message(&device_msg(9, MsgType::Status, 1, led_status(128)));
        let after = registry.lookup(&DEVICE).unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.last_seen, before.last_seen);
    }

    #[test]
    fn test_duplicate_msg_num_dropped() {
        let (_, registry, manager) = setup();
        register(&manager);
        manager.handle_message(&device_msg(1, MsgType::Status, 1, led_status(10)));
        while registry.pop_change_event().is_some() {}

        manager.handle_message(&device_msg(1, MsgType::Status, 1, led_status(99)));
        assert_eq!(registry.lookup(&DEVICE).unwrap().status["brightness"], 10);
        assert!(registry.pop_change_event().is_none());
    }

    #[test]
    fn test_health_written_to_registry() {
        let (_, registry, manager) = setup();
        register(&manager);
        manager.handle_message(&device_msg(1, MsgType::Status, 2, led_status(1)));
        manager.handle_message(&device_msg(1, MsgType::Status, 3, led_status(1)));

        // window [0, 2, 3]
        assert_eq!(registry.lookup(&DEVICE).unwrap().connection_health, 0.75);
    }

    #[test]
    fn test_invalid_messages_dropped() {
        let (_, registry, manager) = setup();
        register(&manager);
        let mut raw = device_msg(1, MsgType::Status, 1, led_status(5));
        raw[8] ^= 0xFF;
        manager.handle_message(&raw);
        manager.handle_message(&[1, 2, 3]);
        // undecodable status payload
        manager.handle_message(&device_msg(1, MsgType::Status, 2, vec![1, 2]));
        assert_eq!(registry.lookup(&DEVICE).unwrap().status, serde_json::Value::Null);
    }

    #[test]
    fn test_set_device_param_validation() {
        let (_, _, manager) = setup();
        assert_eq!(
            manager.set_device_param(&DEVICE, "brightness", "10"),
            Err(CommandError::UnknownDevice(DEVICE))
        );
        register(&manager);
        assert_eq!(
            manager.set_device_param(&DEVICE, "volume", "10"),
            Err(CommandError::UnsupportedParameter("volume".to_string()))
        );
        assert!(manager.set_device_param(&DEVICE, "brightness", "10").is_ok());
    }

    #[test]
    fn test_latest_write_wins_single_send() {
        let (link, _, manager) = setup();
        register(&manager);
        manager.set_device_param(&DEVICE, "brightness", "10").unwrap();
        manager.set_device_param(&DEVICE, "brightness", "20").unwrap();

        manager.reconcile_once();

        let sets: Vec<HostMessage> = link
            .sent()
            .iter()
            .skip(1)
            .map(|(_, raw)| HostMessage::parse(raw).unwrap())
            .collect();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].msg_type, MsgType::Set);
        assert_eq!(
            SetMessage::parse(&sets[0].data).unwrap(),
            LedController3Ch.build_set_message("brightness", "20").unwrap()
        );
    }

    #[test]
    fn test_value_retained_until_status_confirms() {
        let (link, _, manager) = setup();
        register(&manager);
        manager.set_device_param(&DEVICE, "brightness", "20").unwrap();

        manager.reconcile_once();
        assert_eq!(
            manager.pending_parameters(&DEVICE).get("brightness").map(String::as_str),
            Some("20")
        );

        manager.handle_message(&device_msg(1, MsgType::Status, 1, led_status(20)));
        manager.reconcile_once();
        assert!(manager.pending_parameters(&DEVICE).is_empty());
        // confirmed without a second send
        assert_eq!(link.sent().len(), 2);
    }

    #[test]
    fn test_unencodable_value_discarded() {
        let (link, _, manager) = setup();
        register(&manager);
        manager.set_device_param(&DEVICE, "brightness", "bright").unwrap();
        manager.reconcile_once();
        assert!(manager.pending_parameters(&DEVICE).is_empty());
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn test_failure_streak_resets_after_status() {
        let (link, registry, manager) = setup();
        register(&manager);
        manager.set_device_param(&DEVICE, "brightness", "20").unwrap();
        manager.reconcile_once();

        // The resend of the unconfirmed value fails, then the device reports
        link.fail_sends.store(true, Ordering::SeqCst);
        manager.reconcile_once();
        manager.handle_message(&device_msg(1, MsgType::Status, 1, led_status(20)));
        manager.reconcile_once();
        assert!(manager.pending_parameters(&DEVICE).is_empty());

        thread::sleep(Duration::from_millis(60));
        manager.set_device_param(&DEVICE, "power", "0").unwrap();
        manager.reconcile_once();

        assert!(!registry.lookup(&DEVICE).unwrap().offline);
        assert_eq!(
            manager.pending_parameters(&DEVICE).get("power").map(String::as_str),
            Some("0")
        );
    }

    /// Registry that renames the device right after the next lookup, as an
    /// admin edit racing the listener would
    struct RenamingRegistry {
        inner: JsonRegistry,
        rename_on_lookup: AtomicBool,
    }

    impl DeviceRegistry for RenamingRegistry {
        fn lookup(&self, uuid: &DeviceUuid) -> Option<DeviceRecord> {
            let record = self.inner.lookup(uuid);
            if self.rename_on_lookup.swap(false, Ordering::SeqCst) {
                self.inner.rename(uuid, "Kitchen").unwrap();
            }
            record
        }

        fn lookup_by_link_id(&self, link_id: u8) -> Option<DeviceRecord> {
            self.inner.lookup_by_link_id(link_id)
        }

        fn list_all(&self) -> Vec<DeviceRecord> {
            self.inner.list_all()
        }

        fn allocate_free_link_id(&self) -> Option<u8> {
            self.inner.allocate_free_link_id()
        }

        fn insert(&self, record: DeviceRecord) -> Result<(), RegistryError> {
            self.inner.insert(record)
        }

        fn update(&self, record: DeviceRecord) -> Result<(), RegistryError> {
            self.inner.update(record)
        }

        fn update_with(
            &self,
            uuid: &DeviceUuid,
            apply: &mut dyn FnMut(&mut DeviceRecord),
        ) -> Result<(), RegistryError> {
            self.inner.update_with(uuid, apply)
        }

        fn remove(&self, uuid: &DeviceUuid) -> Result<DeviceRecord, RegistryError> {
            self.inner.remove(uuid)
        }

        fn set_offline(&self, uuid: &DeviceUuid, offline: bool) -> Result<(), RegistryError> {
            self.inner.set_offline(uuid, offline)
        }

        fn set_connection_health(&self, uuid: &DeviceUuid, health: f64) -> Result<(), RegistryError> {
            self.inner.set_connection_health(uuid, health)
        }

        fn rename(&self, uuid: &DeviceUuid, name: &str) -> Result<(), RegistryError> {
            self.inner.rename(uuid, name)
        }

        fn host_uuid(&self) -> DeviceUuid {
            self.inner.host_uuid()
        }

        fn pop_change_event(&self) -> Option<ChangeEvent> {
            self.inner.pop_change_event()
        }
    }

    #[test]
    fn test_status_keeps_concurrent_rename() {
        let registry = Arc::new(RenamingRegistry {
            inner: JsonRegistry::in_memory(),
            rename_on_lookup: AtomicBool::new(false),
        });
        let manager = CommunicationManager::new(
            Arc::new(ScriptedLink::default()),
            registry.clone(),
            CodecRegistry::builtin(),
            fast_config(),
        );
        register(&manager);

        registry.rename_on_lookup.store(true, Ordering::SeqCst);
        manager.handle_message(&device_msg(1, MsgType::Status, 1, led_status(64)));

        let record = registry.lookup(&DEVICE).unwrap();
        assert_eq!(record.name, "Kitchen");
        assert_eq!(record.status["brightness"], 64);
    }

    #[test]
    fn test_offline_exactly_once() {
        let (link, registry, manager) = setup();
        register(&manager);
        link.fail_sends.store(true, Ordering::SeqCst);
        manager.set_device_param(&DEVICE, "power", "1").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !manager.pending_parameters(&DEVICE).is_empty() && Instant::now() < deadline {
            manager.reconcile_once();
            thread::sleep(Duration::from_millis(5));
        }
        // further passes must not re-mark the device
        manager.reconcile_once();
        manager.reconcile_once();

        assert!(manager.pending_parameters(&DEVICE).is_empty());
        assert!(registry.lookup(&DEVICE).unwrap().offline);

        let mut offline_events = 0;
        while let Some(event) = registry.pop_change_event() {
            if event.kind == ChangeKind::Updated && event.changed_fields.contains(&"offline".to_string()) {
                offline_events += 1;
            }
        }
        assert_eq!(offline_events, 1);
    }

    #[test]
    fn test_remote_event_forwarded() {
        let link = Arc::new(ScriptedLink::default());
        let registry = Arc::new(JsonRegistry::in_memory());
        let manager = CommunicationManager::new(
            link,
            registry.clone(),
            CodecRegistry::builtin(),
            fast_config(),
        );
        manager.handle_message(&device_msg(0, MsgType::Init, 0, b"SensRemote".to_vec()));

        let remote = RemoteMessage {
            link_id: 1,
            uuid: DEVICE,
            target_uuid: DeviceUuid::new([1, 2, 3, 4]),
            layer: 0,
            value: 2,
        };
        manager.handle_message(&remote.encode());
        assert_eq!(
            manager.pop_event(),
            Some(RemoteEvent {
                uuid: DEVICE,
                event: "click_up".to_string()
            })
        );
        assert_eq!(manager.pop_event(), None);
    }

    #[test]
    fn test_remove_device_clears_state() {
        let (_, registry, manager) = setup();
        register(&manager);
        manager.set_device_param(&DEVICE, "power", "1").unwrap();
        manager.remove_device(&DEVICE).unwrap();

        assert!(registry.lookup(&DEVICE).is_none());
        assert!(manager.pending_parameters(&DEVICE).is_empty());
        assert!(matches!(
            manager.remove_device(&DEVICE),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_threads_stop_on_shutdown() {
        let link = Arc::new(ScriptedLink::default());
        link.disconnected.store(true, Ordering::SeqCst);
        let registry = Arc::new(JsonRegistry::in_memory());
        let manager = Arc::new(CommunicationManager::new(
            link.clone(),
            registry.clone(),
            CodecRegistry::builtin(),
            fast_config(),
        ));
        link.inbound
            .lock()
            .unwrap()
            .push_back(device_msg(0, MsgType::Init, 0, b"RotRemote".to_vec()));

        let threads = manager.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while registry.lookup(&DEVICE).is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        manager.shutdown();
        threads.join();

        assert!(link.reconnects.load(Ordering::SeqCst) >= 1);
        assert_eq!(registry.lookup(&DEVICE).unwrap().device_type, "RotRemote");
    }
}
