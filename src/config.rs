//! Bridge configuration.
//!
//! [`BridgeConfig`] gathers everything a bridge is built from. It follows the
//! builder style of [`ConnectionParameters`] and derives serde traits so it
//! can be embedded in an application's own configuration file.
//!
//! # Example
//!
//! ```
//! use eip_bridge::{devices, BridgeConfig, ConnectionParameters, OutputFormat};
//!
//! let params = ConnectionParameters::new("192.168.17.200")
//!     .with_preset(devices::CLIPX)
//!     .with_sizes(0, 166)
//!     .with_receive_port(2223);
//!
//! let config = BridgeConfig::new(params, "nats://localhost:4222", "plant.clipx.input")
//!     .with_format(OutputFormat::Binary { header: true })
//!     .with_liveness_multiplier(8);
//!
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::OutputFormat;
use crate::error::{BridgeError, Result};
use crate::params::ConnectionParameters;
use crate::scanner::DEFAULT_LIVENESS_MULTIPLIER;
use crate::supervisor::{ReconnectPolicy, MAX_RECONNECT_DELAY};

/// Default bus endpoint.
pub const DEFAULT_BUS_URL: &str = "nats://localhost:4222";

/// Default publish subject.
pub const DEFAULT_SUBJECT: &str = "eip.data";

/// Everything a bridge is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Cyclic connection parameters.
    pub connection: ConnectionParameters,
    /// Bus endpoint URL.
    pub bus_url: String,
    /// Subject input data is published on.
    pub subject: String,
    /// Message body format.
    pub format: OutputFormat,
    /// Subject whose messages replace the output data, if any.
    pub control_subject: Option<String>,
    /// Missed T->O intervals before the connection is considered dead.
    pub liveness_multiplier: u32,
    /// Delays between reopen attempts.
    pub reconnect: ReconnectPolicy,
    /// Output data sent until replaced. All zeros if unset.
    pub initial_output: Option<Vec<u8>>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionParameters::default(),
            bus_url: DEFAULT_BUS_URL.to_string(),
            subject: DEFAULT_SUBJECT.to_string(),
            format: OutputFormat::default(),
            control_subject: None,
            liveness_multiplier: DEFAULT_LIVENESS_MULTIPLIER,
            reconnect: ReconnectPolicy::default(),
            initial_output: None,
        }
    }
}

impl BridgeConfig {
    /// Creates a configuration with default format and recovery settings.
    pub fn new(
        connection: ConnectionParameters,
        bus_url: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            bus_url: bus_url.into(),
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Sets the message body format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Subscribes to `subject` for output data.
    pub fn with_control_subject(mut self, subject: impl Into<String>) -> Self {
        self.control_subject = Some(subject.into());
        self
    }

    /// Sets the liveness multiplier.
    pub fn with_liveness_multiplier(mut self, multiplier: u32) -> Self {
        self.liveness_multiplier = multiplier;
        self
    }

    /// Sets the reconnect policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the output data sent from the first O->T datagram on.
    pub fn with_initial_output(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.initial_output = Some(data.into());
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` naming the first invalid option.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        if self.bus_url.trim().is_empty() {
            return Err(BridgeError::configuration("bus_url", "must not be empty"));
        }
        if self.subject.trim().is_empty() {
            return Err(BridgeError::configuration("subject", "must not be empty"));
        }
        if self.control_subject.as_deref() == Some(self.subject.as_str()) {
            return Err(BridgeError::configuration(
                "control_subject",
                "must differ from the publish subject",
            ));
        }
        if self.liveness_multiplier == 0 {
            return Err(BridgeError::configuration(
                "liveness_multiplier",
                "must be greater than 0",
            ));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(BridgeError::configuration(
                "reconnect",
                "max_delay must not be below initial_delay",
            ));
        }
        if self.reconnect.max_delay > MAX_RECONNECT_DELAY {
            return Err(BridgeError::configuration(
                "reconnect",
                format!("max_delay must not exceed {:?}", MAX_RECONNECT_DELAY),
            ));
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return Err(BridgeError::configuration(
                "reconnect",
                "multiplier must be finite and at least 1",
            ));
        }
        if let Some(initial) = &self.initial_output {
            if initial.len() != usize::from(self.connection.o2t_size) {
                return Err(BridgeError::configuration(
                    "initial_output",
                    format!(
                        "expected {} bytes, got {}",
                        self.connection.o2t_size,
                        initial.len()
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> BridgeConfig {
        BridgeConfig::new(
            ConnectionParameters::new("10.0.0.5").with_sizes(4, 100),
            DEFAULT_BUS_URL,
            "plant.device",
        )
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.liveness_multiplier, 4);
        assert_eq!(config.format, OutputFormat::Binary { header: false });
        assert!(config.control_subject.is_none());
    }

    #[test]
    fn test_valid() {
        assert!(config().validate().is_ok());
        assert!(config().with_initial_output(vec![1, 2, 3, 4]).validate().is_ok());
    }

    #[test]
    fn test_initial_output_size() {
        let err = config().with_initial_output(vec![1]).validate().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Configuration { ref parameter, .. } if parameter == "initial_output"
        ));
    }

    #[test]
    fn test_control_subject_must_differ() {
        assert!(config()
            .with_control_subject("plant.device")
            .validate()
            .is_err());
        assert!(config()
            .with_control_subject("plant.device.output")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_zero_liveness_multiplier() {
        assert!(config().with_liveness_multiplier(0).validate().is_err());
    }

    #[test]
    fn test_reconnect_bounds() {
        let policy = ReconnectPolicy::exponential(Duration::from_secs(5), Duration::from_secs(1), 2.0);
        assert!(config().with_reconnect_policy(policy).validate().is_err());
    }

    #[test]
    fn test_reconnect_upper_bound() {
        let policy = ReconnectPolicy::exponential(Duration::from_secs(1), Duration::MAX, 2.0);
        let err = config().with_reconnect_policy(policy).validate().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Configuration { ref parameter, .. } if parameter == "reconnect"
        ));

        let policy = ReconnectPolicy::exponential(
            Duration::from_secs(1),
            MAX_RECONNECT_DELAY,
            f64::NAN,
        );
        assert!(config().with_reconnect_policy(policy).validate().is_err());

        let policy = ReconnectPolicy::fixed(MAX_RECONNECT_DELAY);
        assert!(config().with_reconnect_policy(policy).validate().is_ok());
    }

    #[test]
    fn test_empty_bus_url() {
        let mut config = config();
        config.bus_url = " ".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Configuration { ref parameter, .. } if parameter == "bus_url"
        ));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{
                "connection": {"device_address": "192.168.17.200", "t2o_size": 166},
                "subject": "plant.clipx",
                "format": {"mode": "structured", "data": "words"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.connection.t2o_size, 166);
        assert_eq!(config.connection.receive_port, 2222);
        assert_eq!(config.bus_url, DEFAULT_BUS_URL);
        assert!(config.validate().is_ok());
    }
}
