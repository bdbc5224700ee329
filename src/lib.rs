//! # EtherNet/IP to Message Bus Bridge
//!
//! Relays Class-1 (implicit, cyclic) I/O data from an EtherNet/IP device to a
//! publish/subscribe message bus, and optionally relays output data from the
//! bus back to the device.
//!
//! The crate is the connection-and-scan engine only: it opens the cyclic
//! connection with a (Large) Forward Open, exchanges UDP datagrams at the
//! requested packet interval, detects dead connections and reopens them, and
//! encodes every received payload into a bus message. The bus itself sits
//! behind the [`MessageBus`] trait; a NATS implementation is available with
//! the `nats` feature.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use eip_bridge::{
//!     devices, BridgeConfig, ConnectionParameters, EipBridge, MessageBus, OutputFormat, Result,
//! };
//!
//! struct LogBus;
//!
//! impl MessageBus for LogBus {
//!     fn connect(&self) -> Result<()> { Ok(()) }
//!     fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
//!         println!("{} <- {} bytes", subject, payload.len());
//!         Ok(())
//!     }
//!     fn disconnect(&self) {}
//! }
//!
//! fn main() -> Result<()> {
//!     let params = ConnectionParameters::new("192.168.17.200")
//!         .with_preset(devices::CLIPX)
//!         .with_sizes(0, 166)
//!         .with_rpi(2000)
//!         .with_receive_port(2222);
//!
//!     let config = BridgeConfig::new(params, "log://", "plant.clipx.input")
//!         .with_format(OutputFormat::Binary { header: false });
//!
//!     let mut bridge = EipBridge::new(config, Arc::new(LogBus))?;
//!     bridge.start()?;
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     println!("{}", bridge);
//!     bridge.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`ConnectionManager`] | Forward Open / Large Forward Open handshake and Forward Close |
//! | [`IoScanner`] | Cyclic O->T send, T->O receive and validation, liveness detection |
//! | [`ReconnectSupervisor`] | Fault handling and automatic reopen with backoff |
//! | [`Codec`] | Payload to message body (binary or JSON) |
//! | [`Publisher`] | Hand-off to the bus, publish accounting |
//! | [`BridgeStats`] | Lock-free counters |
//! | [`EipBridge`] | Public facade tying it all together |
//!
//! ## Forward Open Variant
//!
//! The standard Forward Open carries each connection size in a 9-bit field.
//! The connection size is the data size plus the 2-byte sequence count plus
//! the 4-byte run/idle header where one is used. If either direction exceeds
//! 511 bytes the Large Forward Open is sent instead.
//!
//! | Data (T->O, no header) | Connection size | Service |
//! |------------------------|-----------------|---------|
//! | 166 bytes | 168 | Forward Open (0x54) |
//! | 509 bytes | 511 | Forward Open (0x54) |
//! | 510 bytes | 512 | Large Forward Open (0x5B) |
//!
//! ## Receive Port
//!
//! Every Forward Open carries a T->O socket address item advertising
//! `receive_port`, so several bridges on one host can each bind their own
//! port. Devices that ignore the item send to 2222, the default.
//!
//! ## Error Handling
//!
//! Errors from [`EipBridge::start`] are returned to the caller: invalid
//! configuration, an unreachable bus, a device that refuses the connection.
//! Once running, faults are absorbed by the supervisor and only visible
//! through the counters and `tracing` events.
//!
//! | Error | When |
//! |-------|------|
//! | [`BridgeError::Configuration`] | Invalid parameters |
//! | [`BridgeError::RejectedByDevice`] | Forward Open refused with a CIP status |
//! | [`BridgeError::Timeout`] | Device did not answer in time |
//! | [`BridgeError::Transport`] | Socket failure |
//! | [`BridgeError::ProtocolViolation`] | Malformed reply |
//! | [`BridgeError::Publish`] | Bus unreachable |
//!
//! ## Logging
//!
//! The crate emits `tracing` events and never installs a subscriber.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod bridge;
mod codec;
mod config;
mod connection;
pub mod encap;
mod error;
pub mod forward_open;
pub mod io_frame;
#[cfg(feature = "nats")]
mod nats;
mod params;
mod publisher;
mod reply;
mod scanner;
mod session;
mod stats;
mod supervisor;
pub mod utils;

pub use bridge::EipBridge;
pub use codec::{Codec, DataEncoding, DecodedFrame, FrameMetadata, OutputFormat};
pub use config::{BridgeConfig, DEFAULT_BUS_URL, DEFAULT_SUBJECT};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionState};
pub use error::{cip_status_description, extended_status_description, BridgeError, Result};
pub use forward_open::{ConnectionTriad, ForwardCloseRequest, ForwardOpenParams, ForwardOpenRequest};
pub use io_frame::IoFrame;
#[cfg(feature = "nats")]
pub use nats::NatsBus;
pub use params::{
    devices, requires_large_forward_open, ConnectionParameters, DevicePreset,
    DEFAULT_EXPLICIT_PORT, DEFAULT_IMPLICIT_PORT, DEFAULT_RPI_MICROS,
    STANDARD_MAX_CONNECTION_SIZE,
};
pub use publisher::{MessageBus, MessageHandler, Publisher};
pub use reply::{ForwardOpenReply, MessageRouterReply};
pub use scanner::{IoScanner, OutputData, ScanOutcome, DEFAULT_LIVENESS_MULTIPLIER};
pub use session::{ExplicitSession, RrDataReply};
pub use stats::{BridgeStats, StatsSnapshot};
pub use supervisor::{
    ReconnectPolicy, ReconnectSupervisor, SharedState, SupervisorState, MAX_RECONNECT_DELAY,
};
