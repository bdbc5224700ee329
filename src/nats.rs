//! NATS message bus.
//!
//! [`NatsBus`] implements [`MessageBus`] over `async-nats`. The bridge runs
//! on plain threads, so the bus owns a small tokio runtime and blocks on it
//! for connect, publish and disconnect. Subscriptions run as tasks on that
//! runtime.
//!
//! Requires the `nats` feature.
//!
//! ```no_run
//! use std::sync::Arc;
//! use eip_bridge::{BridgeConfig, ConnectionParameters, EipBridge, NatsBus};
//!
//! let params = ConnectionParameters::new("192.168.17.200");
//! let config = BridgeConfig::new(params, "nats://localhost:4222", "plant.rm75e");
//! let bus = Arc::new(NatsBus::from_config(&config)?);
//! let mut bridge = EipBridge::new(config, bus)?;
//! bridge.start()?;
//! # Ok::<(), eip_bridge::BridgeError>(())
//! ```

use std::sync::Mutex;
use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::{MessageBus, MessageHandler};

/// Client name announced to the server.
pub const DEFAULT_CLIENT_NAME: &str = "eip-bridge";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// [`MessageBus`] backed by a NATS server.
pub struct NatsBus {
    url: String,
    name: String,
    runtime: Runtime,
    client: Mutex<Option<Client>>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsBus {
    /// Creates a disconnected bus for `url`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Transport` if the runtime cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("eip-bridge-nats")
            .enable_all()
            .build()?;
        Ok(Self {
            url: url.into(),
            name: DEFAULT_CLIENT_NAME.to_string(),
            runtime,
            client: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Creates a disconnected bus for `config.bus_url`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if the URL is empty, or
    /// `BridgeError::Transport` if the runtime cannot be built.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        if config.bus_url.trim().is_empty() {
            return Err(BridgeError::configuration("bus_url", "must not be empty"));
        }
        Self::new(config.bus_url.as_str())
    }

    /// Sets the client name announced to the server.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Server URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| BridgeError::publish("not connected"))
    }
}

impl MessageBus for NatsBus {
    fn connect(&self) -> Result<()> {
        let options = ConnectOptions::new()
            .name(self.name.as_str())
            .connection_timeout(CONNECT_TIMEOUT)
            .ping_interval(PING_INTERVAL);

        let client = self
            .runtime
            .block_on(async_nats::connect_with_options(self.url.as_str(), options))
            .map_err(|e| BridgeError::publish(format!("connect to {}: {}", self.url, e)))?;

        info!(url = %self.url, "Connected to NATS");
        *self.client.lock().unwrap_or_else(|p| p.into_inner()) = Some(client);
        Ok(())
    }

    fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let client = self.client()?;
        self.runtime
            .block_on(client.publish(subject.to_string(), Bytes::copy_from_slice(payload)))
            .map_err(|e| BridgeError::publish(e.to_string()))
    }

    fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<()> {
        let client = self.client()?;
        let mut subscriber = self
            .runtime
            .block_on(client.subscribe(subject.to_string()))
            .map_err(|e| BridgeError::publish(format!("subscribe to {}: {}", subject, e)))?;

        let subject = subject.to_string();
        let task = self.runtime.spawn(async move {
            while let Some(message) = subscriber.next().await {
                debug!(subject = %subject, size = message.payload.len(), "Control message");
                handler(message.payload.as_ref());
            }
        });
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
        Ok(())
    }

    fn disconnect(&self) {
        for task in self
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            task.abort();
        }

        let client = self.client.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(client) = client {
            if let Err(err) = self.runtime.block_on(client.flush()) {
                warn!(error = %err, "Flush before disconnect failed");
            }
            info!(url = %self.url, "Disconnected from NATS");
        }
    }
}

impl std::fmt::Debug for NatsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBus")
            .field("url", &self.url)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_requires_connection() {
        let bus = NatsBus::new("nats://127.0.0.1:1").unwrap();
        let err = bus.publish("eip.test", &[1]).unwrap_err();
        assert!(matches!(err, BridgeError::Publish { .. }));
    }

    #[test]
    fn test_disconnect_when_not_connected() {
        let bus = NatsBus::new("nats://127.0.0.1:1").unwrap().with_name("test");
        bus.disconnect();
        assert_eq!(bus.url(), "nats://127.0.0.1:1");
    }

    #[test]
    fn test_from_config_uses_bus_url() {
        let params = crate::params::ConnectionParameters::new("10.0.0.5");
        let config = BridgeConfig::new(params, "nats://10.1.2.3:4333", "plant.device");
        let bus = NatsBus::from_config(&config).unwrap();
        assert_eq!(bus.url(), "nats://10.1.2.3:4333");

        let mut config = config;
        config.bus_url.clear();
        assert!(matches!(
            NatsBus::from_config(&config).unwrap_err(),
            BridgeError::Configuration { .. }
        ));
    }

    #[test]
    fn test_connect_to_closed_port_fails() {
        let bus = NatsBus::new("nats://127.0.0.1:1").unwrap();
        assert!(bus.connect().is_err());
    }
}
