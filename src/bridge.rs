//! The bridge facade.
//!
//! [`EipBridge`] ties a message bus to one device connection. `start()`
//! connects the bus first, then opens the cyclic connection on the caller's
//! thread, then hands the connection to a dedicated thread that scans and
//! recovers until `stop()`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use eip_bridge::{devices, BridgeConfig, ConnectionParameters, EipBridge, MessageBus, Result};
//!
//! struct StdoutBus;
//!
//! impl MessageBus for StdoutBus {
//!     fn connect(&self) -> Result<()> { Ok(()) }
//!     fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
//!         println!("{}: {} bytes", subject, payload.len());
//!         Ok(())
//!     }
//!     fn disconnect(&self) {}
//! }
//!
//! let params = ConnectionParameters::new("192.168.17.200")
//!     .with_preset(devices::RM75E)
//!     .with_sizes(0, 100);
//! let config = BridgeConfig::new(params, "stdout://", "plant.rm75e");
//!
//! let mut bridge = EipBridge::new(config, Arc::new(StdoutBus))?;
//! bridge.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! println!("{}", bridge);
//! bridge.stop();
//! # Ok::<(), eip_bridge::BridgeError>(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::codec::Codec;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::{MessageBus, Publisher};
use crate::scanner::{IoScanner, OutputData};
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::supervisor::{ReconnectSupervisor, SharedState, SupervisorState};

/// Bridge between one EtherNet/IP device and a message bus.
pub struct EipBridge {
    config: BridgeConfig,
    bus: Arc<dyn MessageBus>,
    stats: Arc<BridgeStats>,
    output: OutputData,
    state: Arc<SharedState>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EipBridge {
    /// Creates a stopped bridge.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if the configuration is invalid.
    pub fn new(config: BridgeConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        config.validate()?;
        let output = OutputData::new(
            usize::from(config.connection.o2t_size),
            config.initial_output.as_deref(),
        )?;

        info!(
            device = %config.connection.device_address,
            subject = %config.subject,
            t2o_size = config.connection.t2o_size,
            o2t_size = config.connection.o2t_size,
            rpi_us = config.connection.rpi_microseconds,
            receive_port = config.connection.receive_port,
            format = ?config.format,
            "Bridge created"
        );

        Ok(Self {
            config,
            bus,
            stats: Arc::new(BridgeStats::new()),
            output,
            state: Arc::new(SharedState::default()),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Connects the bus, opens the device connection and starts scanning.
    ///
    /// Blocks for at most the handshake timeout. A failed first open is
    /// returned here and not retried.
    ///
    /// # Errors
    ///
    /// - `BridgeError::AlreadyRunning` if the bridge is running
    /// - `BridgeError::Publish` if the bus cannot be reached
    /// - any handshake error of [`ConnectionManager::open`](crate::ConnectionManager::open)
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }
        self.stop.store(false, Ordering::Release);

        if let Err(err) = self.connect_bus() {
            error!(error = %err, "Bus connection failed");
            self.state.set(SupervisorState::Stopped);
            return Err(err);
        }

        let publisher = Publisher::new(
            Arc::clone(&self.bus),
            self.config.subject.clone(),
            Arc::clone(&self.stats),
        );
        let scanner = IoScanner::new(
            Codec::new(self.config.format),
            publisher,
            Arc::clone(&self.stats),
            self.output.clone(),
            Arc::clone(&self.stop),
            self.config.connection.device_address.clone(),
        )
        .with_liveness_multiplier(self.config.liveness_multiplier);

        let mut supervisor = ReconnectSupervisor::new(
            scanner,
            self.config.connection.clone(),
            self.config.reconnect.clone(),
            Arc::clone(&self.stats),
            Arc::clone(&self.stop),
            Arc::clone(&self.state),
        );

        if let Err(err) = supervisor.start() {
            error!(
                device = %self.config.connection.device_address,
                error = %err,
                "Bridge start failed"
            );
            self.bus.disconnect();
            return Err(err);
        }

        let name = format!("eip-bridge-{}", self.config.connection.receive_port);
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || supervisor.run());
        match worker {
            Ok(worker) => self.worker = Some(worker),
            Err(err) => {
                self.state.set(SupervisorState::Stopped);
                self.bus.disconnect();
                return Err(BridgeError::Transport(err));
            }
        }

        info!(
            device = %self.config.connection.device_address,
            subject = %self.config.subject,
            "Bridge started"
        );
        Ok(())
    }

    fn connect_bus(&self) -> Result<()> {
        self.bus.connect()?;
        if let Some(subject) = &self.config.control_subject {
            let output = self.output.clone();
            let handler = Box::new(move |data: &[u8]| {
                if let Err(err) = output.set(data) {
                    warn!(error = %err, "Control message ignored");
                }
            });
            if let Err(err) = self.bus.subscribe(subject, handler) {
                self.bus.disconnect();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stops scanning, closes the connection and disconnects the bus.
    ///
    /// Waits for the bridge thread to exit, so the receive port is free when
    /// this returns. Does nothing if the bridge is not running.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.stop.store(true, Ordering::Release);
        worker.thread().unpark();
        if worker.join().is_err() {
            error!("Bridge thread panicked");
        }
        self.state.set(SupervisorState::Stopped);
        self.bus.disconnect();

        info!(
            device = %self.config.connection.device_address,
            received = self.stats.received(),
            published = self.stats.published(),
            reconnects = self.stats.reconnects(),
            "Bridge stopped"
        );
    }

    /// Returns whether the bridge thread is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Current supervisor state.
    pub fn state(&self) -> SupervisorState {
        self.state.get()
    }

    /// Datagrams successfully parsed from the device.
    pub fn received_count(&self) -> u64 {
        self.stats.received()
    }

    /// Messages handed to the bus.
    pub fn published_count(&self) -> u64 {
        self.stats.published()
    }

    /// Completed reconnects after a fault.
    pub fn reconnect_count(&self) -> u64 {
        self.stats.reconnects()
    }

    /// Dropped datagrams.
    pub fn protocol_error_count(&self) -> u64 {
        self.stats.protocol_errors()
    }

    /// Messages the bus refused.
    pub fn publish_error_count(&self) -> u64 {
        self.stats.publish_errors()
    }

    /// All counters at once.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Replaces the output data sent to the device.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` unless `data` is exactly
    /// `o2t_size` bytes.
    pub fn set_output_data(&self, data: &[u8]) -> Result<()> {
        self.output.set(data)
    }

    /// Current output data.
    pub fn output_data(&self) -> Vec<u8> {
        self.output.snapshot()
    }

    /// The configuration this bridge was built from.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl fmt::Display for EipBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EipBridge running={} received={} published={} reconnects={}>",
            self.is_running(),
            self.received_count(),
            self.published_count(),
            self.reconnect_count()
        )
    }
}

impl fmt::Debug for EipBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EipBridge")
            .field("device", &self.config.connection.device_address)
            .field("subject", &self.config.subject)
            .field("state", &self.state.get())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl Drop for EipBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ConnectionParameters;
    use crate::publisher::tests::MemoryBus;
    use std::net::TcpListener;

    fn config(address: &str) -> BridgeConfig {
        BridgeConfig::new(
            ConnectionParameters::new(address).with_sizes(2, 8),
            "memory://",
            "plant.device",
        )
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let bus = Arc::new(MemoryBus::default());
        let err = EipBridge::new(config("10.0.0.1").with_initial_output(vec![1]), bus).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration { .. }));
    }

    #[test]
    fn test_display_when_stopped() {
        let bus = Arc::new(MemoryBus::default());
        let bridge = EipBridge::new(config("10.0.0.1"), bus).unwrap();
        assert_eq!(
            bridge.to_string(),
            "<EipBridge running=false received=0 published=0 reconnects=0>"
        );
        assert_eq!(bridge.state(), SupervisorState::Idle);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let bus = Arc::new(MemoryBus::default());
        let mut bridge = EipBridge::new(config("10.0.0.1"), bus).unwrap();
        bridge.stop();
        bridge.stop();
        assert!(!bridge.is_running());
        assert_eq!(bridge.stats(), StatsSnapshot::default());
    }

    #[test]
    fn test_output_data() {
        let bus = Arc::new(MemoryBus::default());
        let bridge = EipBridge::new(config("10.0.0.1"), bus).unwrap();
        assert_eq!(bridge.output_data(), vec![0, 0]);
        bridge.set_output_data(&[1, 2]).unwrap();
        assert_eq!(bridge.output_data(), vec![1, 2]);
        assert!(bridge.set_output_data(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_start_fails_when_bus_offline() {
        let bus = Arc::new(MemoryBus::default());
        bus.offline.store(true, Ordering::SeqCst);
        let mut bridge = EipBridge::new(config("10.0.0.1"), bus).unwrap();
        let err = bridge.start().unwrap_err();
        assert!(matches!(err, BridgeError::Publish { .. }));
        assert!(!bridge.is_running());
    }

    #[test]
    fn test_start_fails_when_device_unreachable() {
        // Reserve a port, then free it so nothing listens there.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let bus = Arc::new(MemoryBus::default());
        let params = ConnectionParameters::new(format!("127.0.0.1:{}", port))
            .with_sizes(2, 8)
            .with_receive_port(0xB5E0);
        let mut bridge =
            EipBridge::new(BridgeConfig::new(params, "memory://", "plant.device"), bus.clone()).unwrap();

        assert!(bridge.start().is_err());
        assert!(!bridge.is_running());
        assert!(!bus.connected.load(Ordering::SeqCst));
        assert_eq!(bridge.state(), SupervisorState::Stopped);
    }
}
