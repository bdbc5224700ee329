//! Error types for the bridge.
//!
//! Errors fall into the classes a cyclic I/O bridge has to tell apart:
//! configuration problems (never retried), device rejections of the
//! Forward Open handshake, transport failures, protocol violations in
//! received frames and failed hand-offs to the message bus.

use std::io;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while bridging EtherNet/IP I/O data.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Invalid connection parameter or parameter combination.
    #[error("Invalid configuration '{parameter}': {reason}")]
    Configuration {
        /// Name of the offending parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// The device answered the Forward Open with a CIP error.
    #[error(
        "Rejected by device: general status 0x{general_status:02X} ({}){}",
        describe_general(.general_status),
        format_extended(.extended_status)
    )]
    RejectedByDevice {
        /// CIP general status code.
        general_status: u8,
        /// First additional status word, if the device supplied one.
        extended_status: Option<u16>,
    },

    /// The device answered an encapsulation command with a non-zero status.
    #[error("Encapsulation command 0x{command:04X} failed with status 0x{status:08X}")]
    EncapsulationStatus {
        /// Encapsulation command code.
        command: u16,
        /// Encapsulation status field.
        status: u32,
    },

    /// No response within the bounded handshake window.
    #[error("Communication timeout")]
    Timeout,

    /// Socket-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// Malformed reply or datagram.
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the violation.
        reason: String,
    },

    /// The message bus refused or could not accept a message.
    #[error("Publish error: {reason}")]
    Publish {
        /// Description of the bus failure.
        reason: String,
    },

    /// Structured message encoding failed.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// `start()` was called on a bridge that is already running.
    #[error("Bridge is already running")]
    AlreadyRunning,
}

fn describe_general(status: &u8) -> &'static str {
    cip_status_description(*status)
}

fn format_extended(extended: &Option<u16>) -> String {
    match *extended {
        Some(code) => format!(
            ", extended status 0x{:04X} ({})",
            code,
            extended_status_description(code)
        ),
        None => String::new(),
    }
}

impl BridgeError {
    /// Creates a new `Configuration` error.
    ///
    /// # Example
    ///
    /// ```
    /// use eip_bridge::BridgeError;
    ///
    /// let err = BridgeError::configuration("t2o_size", "must be greater than 0");
    /// ```
    pub fn configuration(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `RejectedByDevice` error.
    pub fn rejected(general_status: u8, extended_status: Option<u16>) -> Self {
        Self::RejectedByDevice {
            general_status,
            extended_status,
        }
    }

    /// Creates a new `ProtocolViolation` error.
    ///
    /// # Example
    ///
    /// ```
    /// use eip_bridge::BridgeError;
    ///
    /// let err = BridgeError::protocol("reply too short");
    /// assert_eq!(err.to_string(), "Protocol violation: reply too short");
    /// ```
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Creates a new `Publish` error.
    pub fn publish(reason: impl Into<String>) -> Self {
        Self::Publish {
            reason: reason.into(),
        }
    }

    /// Returns whether the reconnect supervisor may retry after this error.
    ///
    /// Configuration errors and a second `start()` are never retried;
    /// everything the device or the network can cause is.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Configuration { .. } | Self::AlreadyRunning | Self::Encode(_)
        )
    }

    /// Maps socket timeouts onto `Timeout`, everything else onto `Transport`.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Transport(err),
        }
    }
}

/// Returns a short description of a CIP general status code.
///
/// # Example
///
/// ```
/// use eip_bridge::cip_status_description;
///
/// assert_eq!(cip_status_description(0x00), "success");
/// assert_eq!(cip_status_description(0x01), "connection failure");
/// ```
pub fn cip_status_description(status: u8) -> &'static str {
    match status {
        0x00 => "success",
        0x01 => "connection failure",
        0x02 => "resource unavailable",
        0x03 => "invalid parameter value",
        0x04 => "path segment error",
        0x05 => "path destination unknown",
        0x08 => "service not supported",
        0x09 => "invalid attribute value",
        0x0C => "object state conflict",
        0x10 => "device state conflict",
        0x13 => "not enough data",
        0x15 => "too much data",
        0x1E => "embedded service error",
        0x20 => "invalid parameter",
        _ => "unknown status",
    }
}

/// Returns a short description of a Connection Manager extended status code.
///
/// # Example
///
/// ```
/// use eip_bridge::extended_status_description;
///
/// assert_eq!(extended_status_description(0x0109), "invalid connection size");
/// ```
pub fn extended_status_description(status: u16) -> &'static str {
    match status {
        0x0100 => "connection in use or duplicate forward open",
        0x0103 => "transport class and trigger combination not supported",
        0x0106 => "ownership conflict",
        0x0107 => "target connection not found",
        0x0108 => "invalid network connection parameter",
        0x0109 => "invalid connection size",
        0x0110 => "target for connection not configured",
        0x0111 => "RPI not supported",
        0x0113 => "out of connections",
        0x0114 => "vendor ID or product code mismatch",
        0x0115 => "device type mismatch",
        0x0116 => "revision mismatch",
        0x0117 => "invalid produced or consumed application path",
        0x0118 => "invalid or inconsistent configuration application path",
        0x0119 => "non-listen only connection not opened",
        0x011A => "target object out of connections",
        0x0127 => "invalid O->T size",
        0x0128 => "invalid T->O size",
        0x0203 => "connection timed out",
        0x0204 => "unconnected request timed out",
        0x0315 => "invalid segment in connection path",
        _ => "unknown extended status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_display() {
        let err = BridgeError::configuration("t2o_size", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Invalid configuration 't2o_size': must be greater than 0"
        );
    }

    #[test]
    fn test_rejected_display_with_extended() {
        let err = BridgeError::rejected(0x01, Some(0x0109));
        assert_eq!(
            err.to_string(),
            "Rejected by device: general status 0x01 (connection failure), \
             extended status 0x0109 (invalid connection size)"
        );
    }

    #[test]
    fn test_rejected_display_without_extended() {
        let err = BridgeError::rejected(0x08, None);
        assert_eq!(
            err.to_string(),
            "Rejected by device: general status 0x08 (service not supported)"
        );
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(BridgeError::Timeout.to_string(), "Communication timeout");
    }

    #[test]
    fn test_encapsulation_display() {
        let err = BridgeError::EncapsulationStatus {
            command: 0x0065,
            status: 0x0000_0069,
        };
        assert_eq!(
            err.to_string(),
            "Encapsulation command 0x0065 failed with status 0x00000069"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(!BridgeError::configuration("rpi", "zero").is_recoverable());
        assert!(!BridgeError::AlreadyRunning.is_recoverable());
        assert!(BridgeError::Timeout.is_recoverable());
        assert!(BridgeError::rejected(0x01, Some(0x0113)).is_recoverable());
        assert!(BridgeError::protocol("short").is_recoverable());
        assert!(BridgeError::publish("disconnected").is_recoverable());
    }

    #[test]
    fn test_from_io_maps_timeouts() {
        let err = BridgeError::from_io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(err, BridgeError::Timeout));
        let err = BridgeError::from_io(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(err, BridgeError::Timeout));
        let err = BridgeError::from_io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(matches!(err, BridgeError::Transport(_)));
    }

    #[test]
    fn test_unknown_status_descriptions() {
        assert_eq!(cip_status_description(0xEE), "unknown status");
        assert_eq!(extended_status_description(0xFFFF), "unknown extended status");
    }
}
