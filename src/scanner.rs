//! Cyclic I/O exchange loop.
//!
//! Once a connection is open the scanner runs on the bridge thread and does
//! two things at once:
//!
//! - sends an O->T datagram every packet interval, carrying the current
//!   output data (all zeros until set), which keeps the device's
//!   connection timer alive;
//! - receives T->O datagrams, validates them, counts them and hands the
//!   payload through the codec to the publisher.
//!
//! The receive call is the only blocking point and never waits longer than
//! the time to the next send, so a stop request is seen within one interval.
//! The loop returns a [`ScanOutcome`]; it never raises errors to the caller.
//!
//! # Dropped datagrams
//!
//! | Condition | Counted as |
//! |-----------|------------|
//! | Sender is not the device | protocol error |
//! | Length differs from the expected frame size | protocol error |
//! | Connection ID is not the T->O ID of this connection | protocol error |
//! | Encapsulation sequence not newer than the last accepted one | protocol error |
//!
//! None of these leave the running state. Only silence does: no valid
//! datagram for `liveness_multiplier` x T->O interval ends the scan with
//! [`ScanOutcome::LivenessFailure`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::codec::{Codec, FrameMetadata};
use crate::connection::ConnectionHandle;
use crate::error::{BridgeError, Result};
use crate::io_frame::{sequence_is_newer, IoFrame, RUN_IDLE_RUN};
use crate::params::ConnectionParameters;
use crate::publisher::Publisher;
use crate::stats::BridgeStats;
use crate::utils::format_hex_preview;

/// Missed intervals before the connection is considered dead.
pub const DEFAULT_LIVENESS_MULTIPLIER: u32 = 4;

/// Lower bound for a single receive wait.
const MIN_RECEIVE_WAIT: Duration = Duration::from_millis(1);

/// Bytes shown in datagram log lines.
const LOG_PREVIEW_BYTES: usize = 16;

/// Room for oversized datagrams so they are seen as wrong-length, not truncated.
const RECEIVE_SLACK: usize = 512;

/// Why a scan ended.
#[derive(Debug)]
pub enum ScanOutcome {
    /// The stop flag was raised.
    Stopped,
    /// No valid datagram within the liveness window.
    LivenessFailure,
    /// The socket failed.
    Transport(BridgeError),
}

#[derive(Debug)]
struct OutputState {
    data: Vec<u8>,
    version: u64,
}

/// Output (O->T) data shared between the caller and the scan thread.
///
/// Cloning shares the buffer. The lock is held only to copy.
#[derive(Debug, Clone)]
pub struct OutputData {
    size: usize,
    inner: Arc<Mutex<OutputState>>,
}

impl OutputData {
    /// Creates an all-zero buffer of `size` bytes, or one holding `initial`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if `initial` is not `size` bytes.
    pub fn new(size: usize, initial: Option<&[u8]>) -> Result<Self> {
        let data = match initial {
            Some(bytes) => {
                check_output_len(size, bytes.len())?;
                bytes.to_vec()
            }
            None => vec![0u8; size],
        };
        Ok(Self {
            size,
            inner: Arc::new(Mutex::new(OutputState { data, version: 0 })),
        })
    }

    /// Output data size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns whether the connection carries no output data.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Replaces the output data. Sent with the next O->T datagram.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if `data` is not exactly
    /// [`OutputData::len`] bytes.
    pub fn set(&self, data: &[u8]) -> Result<()> {
        check_output_len(self.size, data.len())?;
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.data.copy_from_slice(data);
        state.version = state.version.wrapping_add(1);
        Ok(())
    }

    /// Copies the current data. Returns its version.
    pub(crate) fn load(&self, into: &mut Vec<u8>) -> u64 {
        let state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        into.clear();
        into.extend_from_slice(&state.data);
        state.version
    }

    /// Returns a copy of the current data.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        self.load(&mut out);
        out
    }
}

fn check_output_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(BridgeError::configuration(
            "output_data",
            format!("expected {} bytes, got {}", expected, actual),
        ));
    }
    Ok(())
}

/// Per-connection sequence state of the scan loop.
#[derive(Debug, Default)]
struct Sequences {
    o2t_encap: u32,
    o2t_cip: u16,
    o2t_version: Option<u64>,
    t2o_last: Option<u32>,
    t2o_running: Option<bool>,
}

/// Runs the cyclic exchange for one open connection.
#[derive(Debug)]
pub struct IoScanner {
    codec: Codec,
    publisher: Publisher,
    stats: Arc<BridgeStats>,
    output: OutputData,
    stop: Arc<AtomicBool>,
    liveness_multiplier: u32,
    device: String,
}

impl IoScanner {
    /// Creates a scanner.
    pub fn new(
        codec: Codec,
        publisher: Publisher,
        stats: Arc<BridgeStats>,
        output: OutputData,
        stop: Arc<AtomicBool>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            codec,
            publisher,
            stats,
            output,
            stop,
            liveness_multiplier: DEFAULT_LIVENESS_MULTIPLIER,
            device: device.into(),
        }
    }

    /// Sets the number of missed intervals that ends the scan.
    pub fn with_liveness_multiplier(mut self, multiplier: u32) -> Self {
        self.liveness_multiplier = multiplier.max(1);
        self
    }

    /// Runs until stopped or the connection fails.
    pub fn run(&self, handle: &ConnectionHandle, params: &ConnectionParameters) -> ScanOutcome {
        let socket = handle.socket();
        let send_interval = effective_interval(handle.o2t_api(), params.rpi());
        let liveness = liveness_timeout(
            effective_interval(handle.t2o_api(), params.rpi()),
            self.liveness_multiplier,
        );
        let t2o_size = usize::from(params.t2o_size);
        let expected = IoFrame::expected_len(t2o_size, params.t2o_run_idle_header);
        let run_idle = params.o2t_run_idle_header.then_some(RUN_IDLE_RUN);

        let mut buf = vec![0u8; expected + RECEIVE_SLACK];
        let mut output = Vec::with_capacity(self.output.len());
        let mut seq = Sequences::default();
        let mut next_send = Instant::now();
        let mut last_valid = Instant::now();

        debug!(
            ?send_interval,
            ?liveness,
            expected_len = expected,
            "I/O scan started"
        );

        loop {
            if self.stop.load(Ordering::Acquire) {
                return ScanOutcome::Stopped;
            }

            let now = Instant::now();
            if now >= next_send {
                let frame = self.next_o2t_frame(handle, &mut seq, &mut output, run_idle);
                if let Err(err) = socket.send_to(&frame.to_bytes(), handle.o2t_destination()) {
                    if !is_transient(&err) {
                        return ScanOutcome::Transport(BridgeError::Transport(err));
                    }
                }
                next_send += send_interval;
                if next_send <= now {
                    next_send = now + send_interval;
                }
            }

            let deadline = last_valid + liveness;
            if now >= deadline {
                warn!(
                    device = %self.device,
                    ?liveness,
                    "No valid datagram within liveness window"
                );
                return ScanOutcome::LivenessFailure;
            }

            let wait = next_send
                .min(deadline)
                .saturating_duration_since(now)
                .max(MIN_RECEIVE_WAIT);
            if let Err(err) = socket.set_read_timeout(Some(wait)) {
                return ScanOutcome::Transport(BridgeError::Transport(err));
            }

            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if self.accept(&buf[..len], from, handle, params, &mut seq) {
                        last_valid = Instant::now();
                    }
                }
                Err(err) if is_transient(&err) => {}
                Err(err) => return ScanOutcome::Transport(BridgeError::Transport(err)),
            }
        }
    }

    fn next_o2t_frame(
        &self,
        handle: &ConnectionHandle,
        seq: &mut Sequences,
        output: &mut Vec<u8>,
        run_idle: Option<u32>,
    ) -> IoFrame {
        let version = self.output.load(output);
        if seq.o2t_version != Some(version) {
            seq.o2t_cip = seq.o2t_cip.wrapping_add(1);
            seq.o2t_version = Some(version);
        }
        seq.o2t_encap = seq.o2t_encap.wrapping_add(1);
        IoFrame::new(
            handle.o2t_connection_id(),
            seq.o2t_encap,
            seq.o2t_cip,
            run_idle,
            output.clone(),
        )
    }

    fn accept(
        &self,
        datagram: &[u8],
        from: SocketAddr,
        handle: &ConnectionHandle,
        params: &ConnectionParameters,
        seq: &mut Sequences,
    ) -> bool {
        if from.ip() != handle.device_ip() {
            self.stats.record_protocol_error();
            debug!(%from, "Datagram from foreign sender dropped");
            return false;
        }

        let frame = match IoFrame::parse(
            datagram,
            usize::from(params.t2o_size),
            params.t2o_run_idle_header,
        ) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.record_protocol_error();
                warn!(
                    %from,
                    error = %err,
                    datagram = %format_hex_preview(datagram, LOG_PREVIEW_BYTES),
                    "Malformed datagram dropped"
                );
                return false;
            }
        };

        if frame.connection_id != handle.t2o_connection_id() {
            self.stats.record_protocol_error();
            warn!(
                connection_id = frame.connection_id,
                expected = handle.t2o_connection_id(),
                "Datagram for another connection dropped"
            );
            return false;
        }

        if let Some(last) = seq.t2o_last {
            if !sequence_is_newer(frame.encap_sequence, last) {
                self.stats.record_protocol_error();
                debug!(
                    sequence = frame.encap_sequence,
                    last, "Stale datagram dropped"
                );
                return false;
            }
        }
        seq.t2o_last = Some(frame.encap_sequence);

        if frame.run_idle.is_some() {
            let running = frame.is_run();
            if let Some(mode) = run_mode_change(seq.t2o_running, running) {
                info!(device = %self.device, mode, "Device mode changed");
            }
            if !running {
                debug!(sequence = frame.encap_sequence, "Idle datagram");
            }
            seq.t2o_running = Some(running);
        }

        self.stats.record_received();
        let meta = FrameMetadata::new(self.device.as_str(), self.stats.received());
        debug!(
            sequence = frame.encap_sequence,
            cip_sequence = frame.cip_sequence,
            size = frame.data.len(),
            data = %format_hex_preview(&frame.data, LOG_PREVIEW_BYTES),
            "Datagram received"
        );

        match self.codec.encode(&frame.data, &meta) {
            Ok(body) => {
                self.publisher.publish(&body);
            }
            Err(err) => {
                self.stats.record_publish_error();
                warn!(error = %err, "Encoding failed, message dropped");
            }
        }
        true
    }
}

/// Mode name to report when the run/idle flag changes. A first datagram in
/// run mode is not a change.
fn run_mode_change(previous: Option<bool>, running: bool) -> Option<&'static str> {
    match previous {
        Some(previous) if previous == running => None,
        None if running => None,
        _ => Some(if running { "run" } else { "idle" }),
    }
}

/// Negotiated interval, or the requested one if the device reported zero.
fn effective_interval(api: Duration, rpi: Duration) -> Duration {
    if api.is_zero() {
        rpi
    } else {
        api
    }
}

fn liveness_timeout(interval: Duration, multiplier: u32) -> Duration {
    interval.saturating_mul(multiplier.max(1))
}

/// Errors the loop rides out: receive timeouts and ICMP port-unreachable
/// echoes some stacks report on UDP sockets.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}
