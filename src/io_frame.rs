//! Class-1 cyclic I/O datagrams.
//!
//! Every UDP datagram of an open connection is a two-item CPF packet:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | Item count (2) |
//! | 2 | 2 | Sequenced address item type (0x8002) |
//! | 4 | 2 | Item length (8) |
//! | 6 | 4 | Connection ID |
//! | 10 | 4 | Encapsulation sequence number |
//! | 14 | 2 | Connected data item type (0x00B1) |
//! | 16 | 2 | Item length |
//! | 18 | 2 | CIP sequence count |
//! | 20 | 0/4 | Run/idle header (if used in this direction) |
//! | .. | n | Assembly data |
//!
//! The encapsulation sequence number increases with every datagram and is
//! what receivers use to discard stale or reordered packets; the CIP
//! sequence count increases only when the producer has new data.
//!
//! # Example
//!
//! ```
//! use eip_bridge::IoFrame;
//!
//! let frame = IoFrame::new(0x1000_0001, 7, 3, None, vec![1, 2, 3]);
//! let bytes = frame.to_bytes();
//! assert_eq!(bytes.len(), IoFrame::expected_len(3, false));
//!
//! let parsed = IoFrame::parse(&bytes, 3, false).unwrap();
//! assert_eq!(parsed, frame);
//! ```

use crate::encap::{read_u16, read_u32, ITEM_CONNECTED_DATA, ITEM_SEQUENCED_ADDRESS};
use crate::error::{BridgeError, Result};
use crate::params::{RUN_IDLE_HEADER_SIZE, SEQUENCE_COUNT_SIZE};

/// Bytes in front of the connected data payload (item count, sequenced
/// address item, connected data item header).
pub const IO_FRAME_HEADER_SIZE: usize = 18;

/// Run/idle header value announcing run mode.
pub const RUN_IDLE_RUN: u32 = 0x0000_0001;

/// One cyclic I/O datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoFrame {
    /// Connection ID of the producing direction.
    pub connection_id: u32,
    /// Encapsulation sequence number.
    pub encap_sequence: u32,
    /// CIP sequence count.
    pub cip_sequence: u16,
    /// Run/idle header, if the direction carries one.
    pub run_idle: Option<u32>,
    /// Assembly data.
    pub data: Vec<u8>,
}

impl IoFrame {
    /// Creates a new frame.
    pub fn new(
        connection_id: u32,
        encap_sequence: u32,
        cip_sequence: u16,
        run_idle: Option<u32>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            connection_id,
            encap_sequence,
            cip_sequence,
            run_idle,
            data,
        }
    }

    /// Datagram length for a given assembly size.
    pub fn expected_len(data_size: usize, run_idle_header: bool) -> usize {
        IO_FRAME_HEADER_SIZE + connected_data_len(data_size, run_idle_header)
    }

    /// Serializes the frame into a datagram.
    pub fn to_bytes(&self) -> Vec<u8> {
        let data_len = connected_data_len(self.data.len(), self.run_idle.is_some());
        let mut out = Vec::with_capacity(IO_FRAME_HEADER_SIZE + data_len);

        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&ITEM_SEQUENCED_ADDRESS.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&self.connection_id.to_le_bytes());
        out.extend_from_slice(&self.encap_sequence.to_le_bytes());

        out.extend_from_slice(&ITEM_CONNECTED_DATA.to_le_bytes());
        out.extend_from_slice(&(data_len as u16).to_le_bytes());
        out.extend_from_slice(&self.cip_sequence.to_le_bytes());
        if let Some(header) = self.run_idle {
            out.extend_from_slice(&header.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Parses a datagram that must carry exactly `data_size` bytes of data.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ProtocolViolation` if the length differs from
    /// [`IoFrame::expected_len`] or the item layout is not a Class-1 frame.
    pub fn parse(datagram: &[u8], data_size: usize, run_idle_header: bool) -> Result<Self> {
        let expected = Self::expected_len(data_size, run_idle_header);
        if datagram.len() != expected {
            return Err(BridgeError::protocol(format!(
                "datagram length {} does not match expected {}",
                datagram.len(),
                expected
            )));
        }

        let count = read_u16(datagram, 0);
        let address_type = read_u16(datagram, 2);
        let address_len = read_u16(datagram, 4);
        if count != 2 || address_type != ITEM_SEQUENCED_ADDRESS || address_len != 8 {
            return Err(BridgeError::protocol(format!(
                "unexpected address item: count {}, type 0x{:04X}, length {}",
                count, address_type, address_len
            )));
        }

        let data_type = read_u16(datagram, 14);
        let data_len = read_u16(datagram, 16) as usize;
        if data_type != ITEM_CONNECTED_DATA
            || data_len != connected_data_len(data_size, run_idle_header)
        {
            return Err(BridgeError::protocol(format!(
                "unexpected data item: type 0x{:04X}, length {}",
                data_type, data_len
            )));
        }

        let mut pos = IO_FRAME_HEADER_SIZE + SEQUENCE_COUNT_SIZE;
        let run_idle = if run_idle_header {
            let header = read_u32(datagram, pos);
            pos += RUN_IDLE_HEADER_SIZE;
            Some(header)
        } else {
            None
        };

        Ok(Self {
            connection_id: read_u32(datagram, 6),
            encap_sequence: read_u32(datagram, 10),
            cip_sequence: read_u16(datagram, IO_FRAME_HEADER_SIZE),
            run_idle,
            data: datagram[pos..].to_vec(),
        })
    }

    /// Returns whether a run/idle header announces run mode.
    pub fn is_run(&self) -> bool {
        self.run_idle.map_or(true, |header| header & RUN_IDLE_RUN != 0)
    }
}

/// Returns whether `sequence` is newer than `last` in 32-bit serial arithmetic.
///
/// # Example
///
/// ```
/// use eip_bridge::io_frame::sequence_is_newer;
///
/// assert!(sequence_is_newer(5, 4));
/// assert!(!sequence_is_newer(4, 4));
/// assert!(sequence_is_newer(0, u32::MAX));
/// ```
pub fn sequence_is_newer(sequence: u32, last: u32) -> bool {
    (sequence.wrapping_sub(last) as i32) > 0
}

fn connected_data_len(data_size: usize, run_idle_header: bool) -> usize {
    let header = if run_idle_header { RUN_IDLE_HEADER_SIZE } else { 0 };
    SEQUENCE_COUNT_SIZE + header + data_size
}
