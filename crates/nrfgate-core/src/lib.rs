//! # nrfgate Core Library
//!
//! Gateway between a host and a fleet of nRF24 wireless devices, reached
//! through a USB radio dongle.
//!
//! This library provides:
//! - Serial framing and the dongle link (handshake, send-with-ack, receive loop)
//! - The device message codec (checksummed host/device/remote messages)
//! - Device codecs for the supported device models
//! - A device registry interface with a JSON file implementation
//! - The communication manager (device lifecycle, parameter delivery,
//!   connection health)
//!
//! ## Example
//!
//! ```rust,ignore
//! use nrfgate_core::prelude::*;
//! use std::sync::Arc;
//!
//! let config = GatewayConfig::load("gateway.json")?;
//! let link = Arc::new(DongleLink::open(config.link.clone())?);
//! let registry = Arc::new(JsonRegistry::open(config.registry_path()?)?);
//! let manager = Arc::new(CommunicationManager::new(
//!     link,
//!     registry,
//!     CodecRegistry::builtin(),
//!     config.manager.clone(),
//! ));
//!
//! let threads = manager.start()?;
//! manager.set_device_param(&"85:83:F7:7E".parse()?, "brightness", "128")?;
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::sync::{Mutex, MutexGuard};

pub mod config;
pub mod devices;
pub mod logging;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod registry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, GatewayConfig};
    pub use crate::devices::{CodecRegistry, DecodeError, DeviceCodec};
    pub use crate::logging::{LogLine, LogTail};
    pub use crate::manager::{
        CommandError, CommunicationManager, ManagerConfig, ManagerThreads, RemoteEvent,
    };
    pub use crate::message::{
        ChangeType, DeviceMessage, DeviceUuid, HostMessage, InboundMessage, MessageError,
        MsgType, RemoteMessage, SetMessage,
    };
    pub use crate::protocol::{
        DongleInfo, DongleLink, Framing, LinkConfig, LinkError, LinkState, MessageLink,
        Packet, PacketType,
    };
    pub use crate::registry::{
        ChangeEvent, ChangeKind, DeviceRecord, DeviceRegistry, JsonRegistry, RegistryError,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lock a mutex, recovering the data if another thread panicked while
/// holding it. Background loops must keep running after such a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
