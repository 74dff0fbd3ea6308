//! Dongle link
//!
//! Owns the serial connection to the dongle: handshake, request/ack exchange,
//! and the background read loop feeding the inbound message queue.
//!
//! All traffic on the serial line goes through one lock, so exactly one
//! exchange (a `send` waiting for its OK/ERROR, or one read-loop poll) runs at a
//! time. This also makes the dongle's OK/ERROR answers unambiguous: there is
//! never more than one outstanding `send`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{
    serial::{clear_buffers, configure_port, open_port},
    Framing, LinkError, MessageLink, Packet, PacketChannel, PacketType, SerialChannel,
    CommunicationChannel, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_BAUD_RATE, DEFAULT_CHANNEL,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, MAX_CHANNEL,
};
use crate::lock;

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Not connected
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Handshake or I/O failure
    Error,
}

/// Link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Radio channel (0..=125)
    pub channel: u8,
    /// Radio address of the dongle
    pub address: u8,
    /// Wire encoding
    pub framing: Framing,
    /// Let the dongle blink its LED on every radio message
    pub blink_on_message: bool,
    /// Timeout for each handshake step in milliseconds
    pub handshake_timeout_ms: u64,
    /// Timeout for a send acknowledgement in milliseconds
    pub ack_timeout_ms: u64,
    /// Read loop poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum number of queued inbound messages
    pub queue_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_name: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            channel: DEFAULT_CHANNEL,
            address: 0,
            framing: Framing::default(),
            blink_on_message: false,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            poll_interval_ms: 10,
            queue_capacity: 256,
        }
    }
}

impl LinkConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.channel > MAX_CHANNEL {
            return Err(LinkError::InvalidConfig(format!(
                "channel must be between 0 and {}, got {}",
                MAX_CHANNEL, self.channel
            )));
        }
        if self.baud_rate == 0 {
            return Err(LinkError::InvalidConfig("baud rate must be non-zero".into()));
        }
        if self.queue_capacity == 0 {
            return Err(LinkError::InvalidConfig("queue capacity must be non-zero".into()));
        }
        Ok(())
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Identity the dongle reports in its INIT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DongleInfo {
    /// Firmware version
    pub firmware_version: u8,
    /// 32-bit serial number
    pub serial_number: [u8; 4],
}

impl DongleInfo {
    fn from_init_payload(payload: &[u8]) -> Result<Self, LinkError> {
        match payload {
            [version, s0, s1, s2, s3] => Ok(Self {
                firmware_version: *version,
                serial_number: [*s0, *s1, *s2, *s3],
            }),
            _ => Err(LinkError::HandshakeFailed(format!(
                "INIT payload must be 5 bytes, got {}",
                payload.len()
            ))),
        }
    }
}

type ChannelOpener =
    Box<dyn Fn(&LinkConfig) -> Result<Box<dyn CommunicationChannel>, LinkError> + Send + Sync>;

/// State shared between the link handle and its read loop
struct Shared {
    config: LinkConfig,
    /// The serial line; `None` once closed
    io: Mutex<Option<PacketChannel>>,
    state: Mutex<LinkState>,
    dongle: Mutex<Option<DongleInfo>>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    /// OK/ERROR that arrived while no `send` was waiting for it
    late_response: Mutex<Option<Packet>>,
    stop: AtomicBool,
    running: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: LinkState) {
        *lock(&self.state) = state;
    }

    fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    fn push_inbound(&self, payload: Vec<u8>) {
        let mut inbound = lock(&self.inbound);
        if inbound.len() >= self.config.queue_capacity {
            warn!("Inbound queue full, dropping oldest message");
            inbound.pop_front();
        }
        inbound.push_back(payload);
    }

    /// Wait for the dongle's INIT announcement and answer it
    fn handshake(&self, io: &mut PacketChannel) -> Result<DongleInfo, LinkError> {
        info!(
            channel = self.config.channel,
            address = self.config.address,
            "Initializing dongle"
        );
        self.set_state(LinkState::Connecting);

        let deadline = Instant::now() + self.config.handshake_timeout();
        let init = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match io.wait_for_packet(remaining) {
                Ok(packet) if packet.packet_type == PacketType::Init => break packet,
                Ok(packet) => debug!(packet_type = %packet.packet_type, "Ignoring packet before INIT"),
                Err(LinkError::Timeout) => {
                    self.set_state(LinkState::Error);
                    return Err(LinkError::HandshakeFailed(
                        "dongle did not send INIT".to_string(),
                    ));
                }
                Err(e) => {
                    self.set_state(LinkState::Error);
                    return Err(e);
                }
            }
        };

        self.answer_init(io, &init.payload)
    }

    /// Reply to an INIT packet with the radio settings and wait for OK
    fn answer_init(&self, io: &mut PacketChannel, payload: &[u8]) -> Result<DongleInfo, LinkError> {
        self.set_state(LinkState::Connecting);
        let result = self.exchange_init(io, payload);
        match &result {
            Ok(dongle) => {
                info!(
                    firmware = dongle.firmware_version,
                    serial = ?dongle.serial_number,
                    "Dongle initialized"
                );
                *lock(&self.dongle) = Some(*dongle);
                self.set_state(LinkState::Connected);
            }
            Err(e) => {
                error!("Dongle initialization failed: {}", e);
                self.set_state(LinkState::Error);
            }
        }
        result
    }

    fn exchange_init(&self, io: &mut PacketChannel, payload: &[u8]) -> Result<DongleInfo, LinkError> {
        let dongle = DongleInfo::from_init_payload(payload)?;
        debug!(
            "Dongle reports firmware {} serial {:02X?}",
            dongle.firmware_version, dongle.serial_number
        );

        let clear_text = self.config.framing == Framing::ClearText;
        let reply = Packet::new(
            PacketType::Init,
            vec![
                self.config.channel,
                self.config.address,
                clear_text as u8,
                self.config.blink_on_message as u8,
            ],
        );
        io.write_packet(&reply)?;

        let deadline = Instant::now() + self.config.handshake_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match io.wait_for_packet(remaining) {
                Ok(packet) => match packet.packet_type {
                    PacketType::Ok => {
                        debug!("Dongle: {}", packet.payload_text());
                        return Ok(dongle);
                    }
                    PacketType::Error => {
                        return Err(LinkError::HandshakeFailed(packet.payload_text()));
                    }
                    // Repeated announcements while the dongle processes our reply
                    other => debug!(packet_type = %other, "Ignoring packet while awaiting OK"),
                },
                Err(LinkError::Timeout) => {
                    return Err(LinkError::HandshakeFailed(
                        "dongle did not acknowledge INIT".to_string(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One read-loop iteration. Returns whether a packet was handled.
    fn poll_once(&self, io: &mut PacketChannel) -> Result<bool, LinkError> {
        let Some(packet) = io.read_packet()? else {
            return Ok(false);
        };
        debug!(packet_type = %packet.packet_type, len = packet.payload.len(), "Read loop packet");

        match packet.packet_type {
            PacketType::Msg => self.push_inbound(packet.payload),
            PacketType::Init => {
                warn!("Dongle appears to have reset, re-initializing");
                self.answer_init(io, &packet.payload)?;
            }
            PacketType::Error => {
                error!("Dongle reported ERROR: {}", packet.payload_text());
                *lock(&self.late_response) = Some(packet);
            }
            PacketType::Ok => {
                *lock(&self.late_response) = Some(packet);
            }
            PacketType::None | PacketType::Setting | PacketType::Reboot => {
                debug!(packet_type = %packet.packet_type, "Ignoring packet");
            }
        }
        Ok(true)
    }
}

fn read_loop(shared: Arc<Shared>) {
    info!("Dongle read loop started");
    let poll_interval = shared.config.poll_interval();

    while !shared.stop.load(Ordering::SeqCst) {
        let result = {
            let mut io = lock(&shared.io);
            match io.as_mut() {
                Some(channel) => shared.poll_once(channel),
                None => Err(LinkError::NotConnected),
            }
        };

        match result {
            Ok(true) => continue,
            Ok(false) => thread::sleep(poll_interval),
            Err(e) => {
                error!("Dongle read loop failed: {}", e);
                shared.set_state(LinkState::Disconnected);
                break;
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    info!("Dongle read loop stopped");
}

/// Open, configure and flush the serial port named in the config
fn open_serial(config: &LinkConfig) -> Result<Box<dyn CommunicationChannel>, LinkError> {
    let mut port = open_port(&config.port_name, Some(config.baud_rate))?;
    configure_port(port.as_mut())?;
    clear_buffers(port.as_mut())?;
    Ok(Box::new(SerialChannel::new(port)))
}

/// Connection to the USB radio dongle
pub struct DongleLink {
    shared: Arc<Shared>,
    opener: Option<ChannelOpener>,
    read_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DongleLink {
    fn build(
        config: LinkConfig,
        channel: Box<dyn CommunicationChannel>,
        opener: Option<ChannelOpener>,
    ) -> Self {
        let framing = config.framing;
        Self {
            shared: Arc::new(Shared {
                config,
                io: Mutex::new(Some(PacketChannel::new(channel, framing))),
                state: Mutex::new(LinkState::Disconnected),
                dongle: Mutex::new(None),
                inbound: Mutex::new(VecDeque::new()),
                late_response: Mutex::new(None),
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            opener,
            read_thread: Mutex::new(None),
        }
    }

    /// Open the configured serial port, perform the handshake and start the
    /// read loop.
    pub fn open(config: LinkConfig) -> Result<Self, LinkError> {
        config.validate()?;
        let channel = open_serial(&config)?;
        let link = Self::build(config, channel, Some(Box::new(open_serial)));
        link.connect()?;
        link.start()?;
        Ok(link)
    }

    /// Handshake over an already open channel. The read loop is not started.
    pub fn with_channel(
        config: LinkConfig,
        channel: Box<dyn CommunicationChannel>,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let link = Self::build(config, channel, None);
        link.connect()?;
        Ok(link)
    }

    /// Perform the blocking dongle handshake
    pub fn connect(&self) -> Result<DongleInfo, LinkError> {
        let mut io = lock(&self.shared.io);
        let channel = io.as_mut().ok_or(LinkError::NotConnected)?;
        self.shared.handshake(channel)
    }

    /// Start the background read loop
    pub fn start(&self) -> Result<(), LinkError> {
        let mut handle = lock(&self.read_thread);
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Reap a loop that exited on its own
        if let Some(old) = handle.take() {
            let _ = old.join();
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("dongle-read-loop".to_string())
            .spawn(move || read_loop(shared));

        match spawned {
            Ok(join) => {
                *handle = Some(join);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(LinkError::Io(e))
            }
        }
    }

    /// Signal the read loop to stop and wait for it, unless called from the
    /// loop itself.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let Some(handle) = lock(&self.read_thread).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        info!("Stopping dongle read loop");
        if handle.join().is_err() {
            error!("Dongle read loop panicked");
        }
    }

    /// Stop the read loop and release the serial port
    pub fn close(&self) {
        self.stop();
        *lock(&self.shared.io) = None;
        self.shared.set_state(LinkState::Disconnected);
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Whether the background read loop is alive
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Identity reported by the dongle during the last handshake
    pub fn dongle_info(&self) -> Option<DongleInfo> {
        *lock(&self.shared.dongle)
    }

    /// Link configuration
    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Take an OK/ERROR the dongle sent after its `send` had already returned
    pub fn take_late_response(&self) -> Option<Packet> {
        lock(&self.shared.late_response).take()
    }

    /// Number of device messages waiting in the inbound queue
    pub fn pending_messages(&self) -> usize {
        lock(&self.shared.inbound).len()
    }

    /// Ask the dongle to reboot; it announces itself with INIT afterwards
    pub fn reboot(&self) -> Result<(), LinkError> {
        self.write_control(Packet::empty(PacketType::Reboot))
    }

    /// Toggle the dongle's activity LED
    pub fn set_blink_on_message(&self, enabled: bool) -> Result<(), LinkError> {
        self.write_control(Packet::new(PacketType::Setting, vec![enabled as u8]))
    }

    fn write_control(&self, packet: Packet) -> Result<(), LinkError> {
        let mut io = lock(&self.shared.io);
        let channel = io.as_mut().ok_or(LinkError::NotConnected)?;
        channel.write_packet(&packet)
    }

    /// Send a device message and, if requested, wait for the dongle's
    /// OK (delivered) or ERROR (not delivered).
    pub fn send(&self, destination: u8, payload: &[u8], require_ack: bool) -> Option<Vec<u8>> {
        if self.shared.state() != LinkState::Connected {
            debug!(destination, "Dropping send, dongle not connected");
            return None;
        }

        let mut io = lock(&self.shared.io);
        let channel = io.as_mut()?;
        *lock(&self.shared.late_response) = None;

        let mut data = Vec::with_capacity(payload.len() + 2);
        data.push(destination);
        data.push(require_ack as u8);
        data.extend_from_slice(payload);
        debug!(destination, require_ack, "Sending {:02x?}", payload);

        if let Err(e) = channel.write_packet(&Packet::new(PacketType::Msg, data)) {
            error!("Failed to write to dongle: {}", e);
            self.shared.set_state(LinkState::Disconnected);
            return None;
        }
        if !require_ack {
            return Some(Vec::new());
        }

        let deadline = Instant::now() + self.shared.config.ack_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match channel.wait_for_packet(remaining) {
                Ok(packet) => match packet.packet_type {
                    PacketType::Ok => return Some(packet.payload),
                    PacketType::Error => {
                        warn!(destination, "Dongle reported ERROR: {}", packet.payload_text());
                        return None;
                    }
                    PacketType::Msg => self.shared.push_inbound(packet.payload),
                    PacketType::Init => {
                        warn!("Dongle reset during send, re-initializing");
                        if let Err(e) = self.shared.answer_init(channel, &packet.payload) {
                            error!("Re-initialization failed: {}", e);
                        }
                        return None;
                    }
                    other => debug!(packet_type = %other, "Ignoring packet while awaiting ack"),
                },
                Err(LinkError::Timeout) => {
                    warn!(destination, "No response from dongle");
                    return None;
                }
                Err(e) => {
                    error!("Serial error while awaiting ack: {}", e);
                    self.shared.set_state(LinkState::Disconnected);
                    return None;
                }
            }
        }
    }

    /// Pop the oldest received device message
    pub fn receive(&self) -> Option<Vec<u8>> {
        lock(&self.shared.inbound).pop_front()
    }

    /// Reopen the port (when the link owns it), handshake and restart the
    /// read loop.
    pub fn reconnect(&self) -> Result<(), LinkError> {
        self.stop();
        if let Some(opener) = &self.opener {
            *lock(&self.shared.io) = None;
            let channel = opener(&self.shared.config)?;
            *lock(&self.shared.io) = Some(PacketChannel::new(channel, self.shared.config.framing));
        } else if let Some(channel) = lock(&self.shared.io).as_mut() {
            channel.clear_input()?;
        }
        self.connect()?;
        self.start()
    }
}

impl MessageLink for DongleLink {
    fn send(&self, destination: u8, payload: &[u8], require_ack: bool) -> Option<Vec<u8>> {
        DongleLink::send(self, destination, payload, require_ack)
    }

    fn receive(&self) -> Option<Vec<u8>> {
        DongleLink::receive(self)
    }

    fn is_connected(&self) -> bool {
        self.is_running() && self.state() == LinkState::Connected
    }

    fn reconnect(&self) -> Result<(), LinkError> {
        DongleLink::reconnect(self)
    }
}

impl Drop for DongleLink {
    fn drop(&mut self) {
        self.stop();
    }
}
