//! Bridge counters.
//!
//! All counters only ever increase. They are written by the scan thread and
//! read from any other thread with relaxed atomics; readers never block the
//! scan loop.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters of one bridge instance.
#[derive(Debug, Default)]
pub struct BridgeStats {
    received: AtomicU64,
    published: AtomicU64,
    reconnects: AtomicU64,
    protocol_errors: AtomicU64,
    publish_errors: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Datagrams successfully parsed from the device.
    pub received: u64,
    /// Messages handed to the bus.
    pub published: u64,
    /// Completed open-after-fault cycles.
    pub reconnects: u64,
    /// Datagrams dropped as malformed, foreign or stale.
    pub protocol_errors: u64,
    /// Messages the bus refused.
    pub publish_errors: u64,
}

impl BridgeStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Datagrams successfully parsed from the device.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages handed to the bus.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Completed open-after-fault cycles.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Dropped datagrams.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Failed publishes.
    pub fn publish_errors(&self) -> u64 {
        self.publish_errors.load(Ordering::Relaxed)
    }

    /// Copies all counters.
    ///
    /// The copy is not atomic across counters; each value is individually
    /// consistent.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received(),
            published: self.published(),
            reconnects: self.reconnects(),
            protocol_errors: self.protocol_errors(),
            publish_errors: self.publish_errors(),
        }
    }
}
