//! Hand-off to the message bus.
//!
//! The bridge talks to the bus only through [`MessageBus`]. The scan thread
//! calls [`Publisher::publish`] once per received datagram; a refused
//! publish is counted and logged and the message is dropped. Cyclic data is
//! superseded every interval, so nothing is queued for replay.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::stats::BridgeStats;

/// Callback for messages arriving on a subscribed subject.
pub type MessageHandler = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// A publish/subscribe message bus.
///
/// Implementations synchronize internally; the bridge shares one instance
/// between the caller's thread and its scan thread.
pub trait MessageBus: Send + Sync {
    /// Connects to the bus.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Publish` if the bus is unreachable.
    fn connect(&self) -> Result<()>;

    /// Hands one message to the bus client.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Publish` if the client refuses the message.
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<()>;

    /// Delivers messages on `subject` to `handler`.
    ///
    /// # Errors
    ///
    /// The default implementation reports that subscriptions are unsupported.
    fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<()> {
        let _ = handler;
        Err(BridgeError::publish(format!(
            "subscriptions are not supported (subject '{}')",
            subject
        )))
    }

    /// Disconnects from the bus. Must be safe to call when not connected.
    fn disconnect(&self);
}

/// Publishes encoded messages on a fixed subject and counts the outcome.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    subject: String,
    stats: Arc<BridgeStats>,
}

impl Publisher {
    /// Creates a publisher.
    pub fn new(bus: Arc<dyn MessageBus>, subject: impl Into<String>, stats: Arc<BridgeStats>) -> Self {
        Self {
            bus,
            subject: subject.into(),
            stats,
        }
    }

    /// Subject messages are published on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publishes one message. Returns whether the bus accepted it.
    pub fn publish(&self, body: &[u8]) -> bool {
        match self.bus.publish(&self.subject, body) {
            Ok(()) => {
                self.stats.record_published();
                debug!(subject = %self.subject, size = body.len(), "Published");
                true
            }
            Err(err) => {
                self.stats.record_publish_error();
                warn!(subject = %self.subject, error = %err, "Publish failed, message dropped");
                false
            }
        }
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("subject", &self.subject)
            .finish()
    }
}
