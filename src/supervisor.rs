//! Connection lifecycle and automatic recovery.
//!
//! ```text
//!  Idle ──start──▶ Connecting ──ok──▶ Running ──liveness/socket──▶ Faulted
//!                      │                 ▲                            │
//!                    error               └──────── reopen ok ─────────┤
//!                      ▼                                              │
//!               (start fails)                           reopen failed: backoff, retry
//!
//!  any state ──stop──▶ Stopped
//! ```
//!
//! The first open runs on the caller's thread and its failure is returned
//! from `start()`; there is no retry for it. Once running, every fault is
//! absorbed here: the connection is closed, reopened immediately, then
//! retried with [`ReconnectPolicy`] delays until it succeeds or the bridge
//! is stopped. `reconnect_count` goes up once per successful reopen.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::error::Result;
use crate::params::ConnectionParameters;
use crate::scanner::{IoScanner, ScanOutcome};
use crate::stats::BridgeStats;

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    /// Built, never started.
    Idle = 0,
    /// Opening the connection.
    Connecting = 1,
    /// Scanning.
    Running = 2,
    /// Connection lost, recovering.
    Faulted = 3,
    /// Stopped; terminal until the next start.
    Stopped = 4,
}

impl SupervisorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Running,
            3 => Self::Faulted,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Faulted => "faulted",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Supervisor state readable from other threads.
#[derive(Debug)]
pub struct SharedState(AtomicU8);

impl Default for SharedState {
    fn default() -> Self {
        Self(AtomicU8::new(SupervisorState::Idle as u8))
    }
}

impl SharedState {
    /// Current state.
    pub fn get(&self) -> SupervisorState {
        SupervisorState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SupervisorState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Longest delay a [`ReconnectPolicy`] may be configured with.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(3600);

/// Delay between reopen attempts after the first immediate one.
///
/// Capped exponential: `initial_delay * multiplier^attempt`, never above
/// `max_delay`. A multiplier of 1 gives a fixed delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay after the first failed reopen.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Creates a capped exponential policy.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Creates a fixed-delay policy.
    pub fn fixed(delay: Duration) -> Self {
        Self::exponential(delay, delay, 1.0)
    }

    /// Delay after failed attempt number `attempt` (0-based).
    ///
    /// # Example
    ///
    /// ```
    /// use eip_bridge::ReconnectPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = ReconnectPolicy::default();
    /// assert_eq!(policy.delay(0), Duration::from_millis(500));
    /// assert_eq!(policy.delay(1), Duration::from_secs(1));
    /// assert_eq!(policy.delay(20), Duration::from_secs(10));
    /// ```
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs.max(0.0))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Drives open, scan and recovery for one bridge.
pub struct ReconnectSupervisor {
    manager: ConnectionManager,
    scanner: IoScanner,
    params: ConnectionParameters,
    policy: ReconnectPolicy,
    stats: Arc<BridgeStats>,
    stop: Arc<AtomicBool>,
    state: Arc<SharedState>,
    handle: Option<ConnectionHandle>,
}

impl ReconnectSupervisor {
    /// Creates a supervisor.
    pub fn new(
        scanner: IoScanner,
        params: ConnectionParameters,
        policy: ReconnectPolicy,
        stats: Arc<BridgeStats>,
        stop: Arc<AtomicBool>,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            manager: ConnectionManager::new(),
            scanner,
            params,
            policy,
            stats,
            stop,
            state,
            handle: None,
        }
    }

    /// Opens the connection for the first time.
    ///
    /// # Errors
    ///
    /// Returns the handshake error unchanged; the state returns to `Stopped`.
    pub fn start(&mut self) -> Result<()> {
        self.state.set(SupervisorState::Connecting);
        match self.manager.open(&self.params) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state.set(SupervisorState::Running);
                Ok(())
            }
            Err(err) => {
                self.state.set(SupervisorState::Stopped);
                Err(err)
            }
        }
    }

    /// Scans and recovers until stopped. Runs on the bridge thread.
    pub fn run(mut self) {
        while let Some(handle) = self.handle.take() {
            self.state.set(SupervisorState::Running);
            let outcome = self.scanner.run(&handle, &self.params);

            if let ScanOutcome::Transport(err) = &outcome {
                warn!(error = %err, "Socket failure");
            }
            if matches!(outcome, ScanOutcome::Stopped) {
                self.manager.close(handle);
                break;
            }

            self.state.set(SupervisorState::Faulted);
            self.manager.close(handle);

            if let Some(handle) = self.recover() {
                self.stats.record_reconnect();
                info!(
                    reconnects = self.stats.reconnects(),
                    "Connection re-established"
                );
                self.handle = Some(handle);
            }
        }
        self.state.set(SupervisorState::Stopped);
    }

    /// Reopens until success or stop.
    fn recover(&mut self) -> Option<ConnectionHandle> {
        let mut attempt = 0u32;
        loop {
            if self.stopping() {
                return None;
            }
            match self.manager.open(&self.params) {
                Ok(handle) => return Some(handle),
                Err(err) => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        error = %err,
                        retry_in = ?delay,
                        "Reconnect failed"
                    );
                    attempt = attempt.saturating_add(1);
                    if !self.sleep(delay) {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleeps for `delay` unless stopped first. Returns false on stop.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::park_timeout(deadline - now);
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("state", &self.state.get())
            .field("policy", &self.policy)
            .field("connected", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_policy_saturates_at_huge_max_delay() {
        let policy = ReconnectPolicy::exponential(Duration::from_secs(1), Duration::MAX, 2.0);
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(64), Duration::MAX);
        assert_eq!(policy.delay(u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_policy_with_infinite_multiplier() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_millis(10), Duration::from_secs(2), f64::INFINITY);
        assert_eq!(policy.delay(3), Duration::from_secs(2));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(3));
        for attempt in 0..5 {
            assert_eq!(policy.delay(attempt), Duration::from_secs(3));
        }
    }

    #[test]
    fn test_policy_ignores_shrinking_multiplier() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1), 0.5);
        assert_eq!(policy.delay(3), Duration::from_millis(100));
    }

    #[test]
    fn test_policy_serde() {
        let policy = ReconnectPolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        let back: ReconnectPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn test_shared_state() {
        let state = SharedState::default();
        assert_eq!(state.get(), SupervisorState::Idle);
        state.set(SupervisorState::Faulted);
        assert_eq!(state.get(), SupervisorState::Faulted);
        assert_eq!(state.get().to_string(), "faulted");
    }
}
