//! Simulated radio dongle for integration tests

#![allow(dead_code)]

use nrfgate_core::protocol::framer::{self, Framer};
use nrfgate_core::protocol::{CommunicationChannel, Framing, Packet, PacketType};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How the simulated dongle answers a MSG that requests an ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Ok,
    Error,
    Silent,
}

/// Called for every MSG the host relays: `(destination, payload)`, returns raw
/// device messages the dongle should deliver back to the host.
pub type DeviceHook = Box<dyn FnMut(u8, &[u8]) -> Vec<Vec<u8>> + Send>;

pub struct SimState {
    to_host: VecDeque<u8>,
    /// Input is always binary; `framing` only selects the output encoding
    parser: Framer,
    framing: Framing,
    pub received: Vec<Packet>,
    /// Raw bytes written by the host
    pub written: Vec<u8>,
    pub relayed: Vec<(u8, bool, Vec<u8>)>,
    pub ack_mode: AckMode,
    pub ack_payload: Vec<u8>,
    pub reject_init: bool,
    pub serial: [u8; 4],
    pub hook: Option<DeviceHook>,
}

impl SimState {
    fn emit(&mut self, packet: &Packet) {
        let bytes = framer::encode(self.framing, packet);
        self.to_host.extend(bytes);
    }

    fn handle(&mut self, packet: Packet) {
        self.received.push(packet.clone());
        match packet.packet_type {
            PacketType::Init => {
                if self.reject_init {
                    self.emit(&Packet::new(PacketType::Error, b"bad settings".to_vec()));
                    return;
                }
                let clear_text = packet.payload.get(2).copied().unwrap_or(1) != 0;
                self.framing = if clear_text {
                    Framing::ClearText
                } else {
                    Framing::Binary
                };
                self.emit(&Packet::new(PacketType::Ok, b"ready".to_vec()));
            }
            PacketType::Msg if packet.payload.len() >= 2 => {
                let destination = packet.payload[0];
                let require_ack = packet.payload[1] != 0;
                let payload = packet.payload[2..].to_vec();
                self.relayed.push((destination, require_ack, payload.clone()));

                if require_ack {
                    match self.ack_mode {
                        AckMode::Ok => {
                            let ack = Packet::new(PacketType::Ok, self.ack_payload.clone());
                            self.emit(&ack);
                        }
                        AckMode::Error => self.emit(&Packet::new(PacketType::Error, b"no ack".to_vec())),
                        AckMode::Silent => {}
                    }
                }
                if self.ack_mode == AckMode::Ok {
                    let replies = match self.hook.as_mut() {
                        Some(hook) => hook(destination, &payload),
                        None => Vec::new(),
                    };
                    for reply in replies {
                        self.emit(&Packet::new(PacketType::Msg, reply));
                    }
                }
            }
            PacketType::Setting => self.emit(&Packet::empty(PacketType::Ok)),
            PacketType::Reboot => self.power_on(),
            _ => {}
        }
    }

    /// Power-on announcement, always clear text
    fn power_on(&mut self) {
        self.framing = Framing::ClearText;
        self.parser = Framer::new(Framing::Binary);
        let mut payload = vec![3];
        payload.extend_from_slice(&self.serial);
        let init = framer::encode(Framing::ClearText, &Packet::new(PacketType::Init, payload));
        self.to_host.extend(init);
    }
}

/// Handle to the simulated dongle shared with the test
#[derive(Clone)]
pub struct SimDongle {
    state: Arc<Mutex<SimState>>,
}

impl SimDongle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                to_host: VecDeque::new(),
                parser: Framer::new(Framing::Binary),
                framing: Framing::ClearText,
                received: Vec::new(),
                written: Vec::new(),
                relayed: Vec::new(),
                ack_mode: AckMode::Ok,
                ack_payload: Vec::new(),
                reject_init: false,
                serial: [0x12, 0x34, 0x56, 0x78],
                hook: None,
            })),
        }
    }

    /// A dongle that has just powered on and announced itself
    pub fn powered_on() -> Self {
        let sim = Self::new();
        sim.power_on();
        sim
    }

    pub fn power_on(&self) {
        self.state.lock().unwrap().power_on();
    }

    /// Simulate a reset with a new serial number
    pub fn reset_with_serial(&self, serial: [u8; 4]) {
        let mut state = self.state.lock().unwrap();
        state.serial = serial;
        state.power_on();
    }

    /// Deliver a device message to the host
    pub fn inject_msg(&self, payload: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.emit(&Packet::new(PacketType::Msg, payload));
    }

    /// Push raw bytes towards the host
    pub fn inject_bytes(&self, bytes: &[u8]) {
        self.state.lock().unwrap().to_host.extend(bytes.iter().copied());
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn channel(&self) -> Box<dyn CommunicationChannel> {
        Box::new(SimChannel {
            state: Arc::clone(&self.state),
        })
    }
}

struct SimChannel {
    state: Arc<Mutex<SimState>>,
}

impl Read for SimChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let n = buf.len().min(state.to_host.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.to_host.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for SimChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.written.extend_from_slice(buf);
        state.parser.push(buf);
        while let Some(packet) = state.parser.next_packet() {
            state.handle(packet);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for SimChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.state.lock().unwrap().to_host.len() as u32)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().to_host.clear();
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
