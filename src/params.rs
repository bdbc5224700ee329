//! Connection parameters for a Class-1 cyclic I/O connection.
//!
//! [`ConnectionParameters`] describes everything the Forward Open needs:
//! the device endpoint, the three assembly instances, the data sizes of both
//! directions, the RPI and the local UDP port the scanner listens on.
//!
//! # Example
//!
//! ```
//! use eip_bridge::{devices, ConnectionParameters};
//!
//! let params = ConnectionParameters::new("192.168.17.114")
//!     .with_preset(devices::CLIPX)
//!     .with_sizes(44, 166)
//!     .with_rpi(2000)
//!     .with_receive_port(2223);
//!
//! assert!(params.validate().is_ok());
//! assert!(!params.requires_large_forward_open());
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Default TCP port for EtherNet/IP explicit messaging.
pub const DEFAULT_EXPLICIT_PORT: u16 = 44818;

/// Default UDP port for Class-1 implicit I/O.
pub const DEFAULT_IMPLICIT_PORT: u16 = 2222;

/// Default Requested Packet Interval in microseconds.
pub const DEFAULT_RPI_MICROS: u32 = 2000;

/// Default bound on the Forward Open handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest connection size the standard Forward Open can express (9-bit field).
pub const STANDARD_MAX_CONNECTION_SIZE: u32 = 0x01FF;

/// Largest connection size the Large Forward Open can express (16-bit field).
pub const LARGE_MAX_CONNECTION_SIZE: u32 = 0xFFFF;

/// Bytes of the CIP sequence count that prefixes Class-1 data.
pub const SEQUENCE_COUNT_SIZE: usize = 2;

/// Bytes of the 32-bit run/idle header.
pub const RUN_IDLE_HEADER_SIZE: usize = 4;

/// Vendor ID the bridge identifies itself with.
pub const DEFAULT_ORIGINATOR_VENDOR_ID: u16 = 342;

/// Originator serial number used in the connection triad.
pub const DEFAULT_ORIGINATOR_SERIAL: u32 = 0x0001_2345;

/// Assembly instance numbers for a known device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePreset {
    /// Configuration assembly instance.
    pub config_assembly: u16,
    /// Output (O->T) assembly instance.
    pub o2t_assembly: u16,
    /// Input (T->O) assembly instance.
    pub t2o_assembly: u16,
}

/// Assembly presets for devices the bridge has been used with.
pub mod devices {
    use super::DevicePreset;

    /// RM75E preset (the default).
    pub const RM75E: DevicePreset = DevicePreset {
        config_assembly: 4,
        o2t_assembly: 2,
        t2o_assembly: 1,
    };

    /// HBK ClipX preset.
    pub const CLIPX: DevicePreset = DevicePreset {
        config_assembly: 151,
        o2t_assembly: 150,
        t2o_assembly: 100,
    };
}

/// Parameters of one cyclic I/O connection. Immutable once a bridge is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParameters {
    /// Device host, optionally with the explicit-messaging port (`host[:port]`).
    pub device_address: String,
    /// Configuration assembly instance.
    pub config_assembly: u16,
    /// Output (O->T) assembly instance.
    pub o2t_assembly: u16,
    /// Input (T->O) assembly instance.
    pub t2o_assembly: u16,
    /// Output data size in bytes. Zero opens a heartbeat-only output.
    pub o2t_size: u16,
    /// Input data size in bytes.
    pub t2o_size: u16,
    /// Requested Packet Interval, proposed for both directions.
    pub rpi_microseconds: u32,
    /// Local UDP port for inbound T->O datagrams.
    pub receive_port: u16,
    /// Whether O->T data carries the 32-bit run/idle header.
    pub o2t_run_idle_header: bool,
    /// Whether T->O data carries the 32-bit run/idle header.
    pub t2o_run_idle_header: bool,
    /// Vendor ID of this originator.
    pub originator_vendor_id: u16,
    /// Serial number of this originator.
    pub originator_serial_number: u32,
    /// Connection timeout multiplier index (0 = x4, 1 = x8, ... 7 = x512).
    pub timeout_multiplier: u8,
    /// Bound on each explicit-messaging exchange of the handshake.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            device_address: String::new(),
            config_assembly: devices::RM75E.config_assembly,
            o2t_assembly: devices::RM75E.o2t_assembly,
            t2o_assembly: devices::RM75E.t2o_assembly,
            o2t_size: 0,
            t2o_size: 100,
            rpi_microseconds: DEFAULT_RPI_MICROS,
            receive_port: DEFAULT_IMPLICIT_PORT,
            o2t_run_idle_header: true,
            t2o_run_idle_header: false,
            originator_vendor_id: DEFAULT_ORIGINATOR_VENDOR_ID,
            originator_serial_number: DEFAULT_ORIGINATOR_SERIAL,
            timeout_multiplier: 0,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ConnectionParameters {
    /// Creates parameters for a device with the RM75E preset and defaults.
    ///
    /// # Example
    ///
    /// ```
    /// use eip_bridge::ConnectionParameters;
    ///
    /// let params = ConnectionParameters::new("192.168.17.200");
    /// assert_eq!(params.receive_port, 2222);
    /// assert_eq!(params.rpi_microseconds, 2000);
    /// ```
    pub fn new(device_address: impl Into<String>) -> Self {
        Self {
            device_address: device_address.into(),
            ..Self::default()
        }
    }

    /// Uses the assembly instances of a device preset.
    pub fn with_preset(mut self, preset: DevicePreset) -> Self {
        self.config_assembly = preset.config_assembly;
        self.o2t_assembly = preset.o2t_assembly;
        self.t2o_assembly = preset.t2o_assembly;
        self
    }

    /// Sets the configuration, output and input assembly instances.
    pub fn with_assemblies(mut self, config: u16, o2t: u16, t2o: u16) -> Self {
        self.config_assembly = config;
        self.o2t_assembly = o2t;
        self.t2o_assembly = t2o;
        self
    }

    /// Sets the output and input data sizes in bytes.
    pub fn with_sizes(mut self, o2t_size: u16, t2o_size: u16) -> Self {
        self.o2t_size = o2t_size;
        self.t2o_size = t2o_size;
        self
    }

    /// Sets the Requested Packet Interval in microseconds.
    pub fn with_rpi(mut self, rpi_microseconds: u32) -> Self {
        self.rpi_microseconds = rpi_microseconds;
        self
    }

    /// Sets the local UDP port for T->O data.
    ///
    /// Every bridge running on one host needs its own port.
    pub fn with_receive_port(mut self, port: u16) -> Self {
        self.receive_port = port;
        self
    }

    /// Sets the run/idle header usage of both directions.
    pub fn with_run_idle_headers(mut self, o2t: bool, t2o: bool) -> Self {
        self.o2t_run_idle_header = o2t;
        self.t2o_run_idle_header = t2o;
        self
    }

    /// Sets the originator vendor ID and serial number.
    pub fn with_originator(mut self, vendor_id: u16, serial_number: u32) -> Self {
        self.originator_vendor_id = vendor_id;
        self.originator_serial_number = serial_number;
        self
    }

    /// Sets the connection timeout multiplier index.
    pub fn with_timeout_multiplier(mut self, multiplier: u8) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Returns the RPI as a duration.
    pub fn rpi(&self) -> Duration {
        Duration::from_micros(u64::from(self.rpi_microseconds))
    }

    /// O->T connection size as sent in the Forward Open.
    ///
    /// Class-1 data is prefixed by the sequence count and, if enabled,
    /// the run/idle header.
    pub fn o2t_connection_size(&self) -> u32 {
        connection_size(self.o2t_size, self.o2t_run_idle_header)
    }

    /// T->O connection size as sent in the Forward Open.
    pub fn t2o_connection_size(&self) -> u32 {
        connection_size(self.t2o_size, self.t2o_run_idle_header)
    }

    /// Returns whether either direction needs the Large Forward Open.
    ///
    /// # Example
    ///
    /// ```
    /// use eip_bridge::ConnectionParameters;
    ///
    /// let small = ConnectionParameters::new("10.0.0.1").with_sizes(44, 166);
    /// assert!(!small.requires_large_forward_open());
    ///
    /// let large = ConnectionParameters::new("10.0.0.1").with_sizes(0, 1024);
    /// assert!(large.requires_large_forward_open());
    /// ```
    pub fn requires_large_forward_open(&self) -> bool {
        requires_large_forward_open(self.o2t_connection_size(), self.t2o_connection_size())
    }

    /// Resolves the explicit-messaging endpoint of the device.
    ///
    /// A bare host uses port 44818.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if the address does not resolve.
    pub fn explicit_endpoint(&self) -> Result<SocketAddr> {
        let address = self.device_address.trim();
        let with_port = if address.parse::<SocketAddr>().is_ok() || has_port(address) {
            address.to_string()
        } else {
            format!("{}:{}", address, DEFAULT_EXPLICIT_PORT)
        };

        let mut candidates = with_port.to_socket_addrs().map_err(|e| {
            BridgeError::configuration("device_address", format!("{}: {}", address, e))
        })?;
        let first = candidates.next().ok_or_else(|| {
            BridgeError::configuration("device_address", format!("{} did not resolve", address))
        })?;
        if first.is_ipv4() {
            return Ok(first);
        }
        Ok(candidates.find(SocketAddr::is_ipv4).unwrap_or(first))
    }

    /// Checks the parameters for combinations no device can accept.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` naming the first offending parameter.
    pub fn validate(&self) -> Result<()> {
        if self.device_address.trim().is_empty() {
            return Err(BridgeError::configuration("device_address", "must not be empty"));
        }
        for (name, value) in [
            ("config_assembly", self.config_assembly),
            ("o2t_assembly", self.o2t_assembly),
            ("t2o_assembly", self.t2o_assembly),
        ] {
            if value == 0 {
                return Err(BridgeError::configuration(name, "assembly instance 0 is reserved"));
            }
        }
        if self.t2o_size == 0 {
            return Err(BridgeError::configuration("t2o_size", "must be greater than 0"));
        }
        if self.o2t_connection_size() > LARGE_MAX_CONNECTION_SIZE {
            return Err(BridgeError::configuration(
                "o2t_size",
                format!("connection size exceeds {} bytes", LARGE_MAX_CONNECTION_SIZE),
            ));
        }
        if self.t2o_connection_size() > LARGE_MAX_CONNECTION_SIZE {
            return Err(BridgeError::configuration(
                "t2o_size",
                format!("connection size exceeds {} bytes", LARGE_MAX_CONNECTION_SIZE),
            ));
        }
        if self.rpi_microseconds == 0 {
            return Err(BridgeError::configuration("rpi_microseconds", "must be greater than 0"));
        }
        if self.receive_port == 0 {
            return Err(BridgeError::configuration("receive_port", "must not be 0"));
        }
        if self.timeout_multiplier > 7 {
            return Err(BridgeError::configuration("timeout_multiplier", "must be 0-7"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(BridgeError::configuration("handshake_timeout", "must not be zero"));
        }
        Ok(())
    }
}

/// Returns whether the given connection sizes need the Large Forward Open.
pub fn requires_large_forward_open(o2t_connection_size: u32, t2o_connection_size: u32) -> bool {
    o2t_connection_size > STANDARD_MAX_CONNECTION_SIZE
        || t2o_connection_size > STANDARD_MAX_CONNECTION_SIZE
}

fn connection_size(data_size: u16, run_idle_header: bool) -> u32 {
    let header = if run_idle_header { RUN_IDLE_HEADER_SIZE } else { 0 };
    (usize::from(data_size) + SEQUENCE_COUNT_SIZE + header) as u32
}

fn has_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = ConnectionParameters::new("192.168.17.200");
        assert_eq!(params.config_assembly, 4);
        assert_eq!(params.o2t_assembly, 2);
        assert_eq!(params.t2o_assembly, 1);
        assert_eq!(params.t2o_size, 100);
        assert_eq!(params.o2t_size, 0);
        assert_eq!(params.receive_port, DEFAULT_IMPLICIT_PORT);
        assert_eq!(params.originator_vendor_id, 342);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_preset() {
        let params = ConnectionParameters::new("10.0.0.1").with_preset(devices::CLIPX);
        assert_eq!(params.config_assembly, 151);
        assert_eq!(params.o2t_assembly, 150);
        assert_eq!(params.t2o_assembly, 100);
    }

    #[test]
    fn test_connection_sizes() {
        let params = ConnectionParameters::new("10.0.0.1").with_sizes(44, 166);
        // sequence count + run/idle header on O->T, sequence count only on T->O
        assert_eq!(params.o2t_connection_size(), 50);
        assert_eq!(params.t2o_connection_size(), 168);
    }

    #[test]
    fn test_large_forward_open_threshold() {
        // 509 + 2 = 511 still fits the standard 9-bit field
        let at_limit = ConnectionParameters::new("10.0.0.1").with_sizes(0, 509);
        assert!(!at_limit.requires_large_forward_open());

        let over = ConnectionParameters::new("10.0.0.1").with_sizes(0, 510);
        assert!(over.requires_large_forward_open());

        let output_over = ConnectionParameters::new("10.0.0.1").with_sizes(600, 10);
        assert!(output_over.requires_large_forward_open());
    }

    #[test]
    fn test_validate_rejects_zero_t2o_size() {
        let params = ConnectionParameters::new("10.0.0.1").with_sizes(0, 0);
        let err = params.validate().unwrap_err();
        assert!(matches!(err, BridgeError::Configuration { ref parameter, .. } if parameter == "t2o_size"));
    }

    #[test]
    fn test_validate_rejects_zero_assembly() {
        let params = ConnectionParameters::new("10.0.0.1").with_assemblies(4, 0, 1);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized() {
        let params = ConnectionParameters::new("10.0.0.1").with_sizes(0, u16::MAX);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_address_and_zero_port() {
        assert!(ConnectionParameters::new("  ").validate().is_err());
        let params = ConnectionParameters::new("10.0.0.1").with_receive_port(0);
        assert!(params.validate().is_err());
        let params = ConnectionParameters::new("10.0.0.1").with_rpi(0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_explicit_endpoint_default_port() {
        let params = ConnectionParameters::new("127.0.0.1");
        let endpoint = params.explicit_endpoint().unwrap();
        assert_eq!(endpoint, "127.0.0.1:44818".parse().unwrap());
    }

    #[test]
    fn test_explicit_endpoint_custom_port() {
        let params = ConnectionParameters::new("127.0.0.1:10000");
        let endpoint = params.explicit_endpoint().unwrap();
        assert_eq!(endpoint.port(), 10000);
    }

    #[test]
    fn test_rpi_duration() {
        let params = ConnectionParameters::new("10.0.0.1").with_rpi(2500);
        assert_eq!(params.rpi(), Duration::from_micros(2500));
    }
}
