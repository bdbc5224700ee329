//! EtherNet/IP encapsulation header and Common Packet Format items.
//!
//! # Encapsulation Header
//!
//! Every explicit message on TCP starts with a 24-byte little-endian header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | Command |
//! | 2 | 2 | Length of the data that follows |
//! | 4 | 4 | Session handle |
//! | 8 | 4 | Status |
//! | 12 | 8 | Sender context |
//! | 20 | 4 | Options |
//!
//! # Common Packet Format
//!
//! Both SendRRData payloads and Class-1 UDP datagrams carry a list of typed
//! items: a 16-bit item count followed by `type id, length, data` triples.
//!
//! # Example
//!
//! ```
//! use eip_bridge::encap::{CpfItem, EncapHeader, ITEM_NULL_ADDRESS, ITEM_UNCONNECTED_DATA};
//! use eip_bridge::encap::{encode_cpf, parse_cpf, COMMAND_SEND_RR_DATA};
//!
//! let items = vec![
//!     CpfItem::new(ITEM_NULL_ADDRESS, Vec::new()),
//!     CpfItem::new(ITEM_UNCONNECTED_DATA, vec![0x0E, 0x02]),
//! ];
//! let cpf = encode_cpf(&items);
//! assert_eq!(parse_cpf(&cpf).unwrap(), items);
//!
//! let header = EncapHeader::new(COMMAND_SEND_RR_DATA, 0x1234_5678, cpf.len() as u16);
//! assert_eq!(header.to_bytes().len(), 24);
//! ```

use std::net::Ipv4Addr;

use crate::error::{BridgeError, Result};

/// Encapsulation header size in bytes.
pub const ENCAP_HEADER_SIZE: usize = 24;

/// RegisterSession command.
pub const COMMAND_REGISTER_SESSION: u16 = 0x0065;
/// UnRegisterSession command.
pub const COMMAND_UNREGISTER_SESSION: u16 = 0x0066;
/// SendRRData command (unconnected explicit request/reply).
pub const COMMAND_SEND_RR_DATA: u16 = 0x006F;

/// Null address item.
pub const ITEM_NULL_ADDRESS: u16 = 0x0000;
/// Connected data item (Class-1 payload).
pub const ITEM_CONNECTED_DATA: u16 = 0x00B1;
/// Unconnected data item (explicit message payload).
pub const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;
/// O->T socket address info item.
pub const ITEM_O2T_SOCKADDR: u16 = 0x8000;
/// T->O socket address info item.
pub const ITEM_T2O_SOCKADDR: u16 = 0x8001;
/// Sequenced address item (connection ID + encapsulation sequence number).
pub const ITEM_SEQUENCED_ADDRESS: u16 = 0x8002;

/// Size of a socket address info item's data.
pub const SOCKADDR_INFO_SIZE: usize = 16;

const AF_INET: i16 = 2;

/// Encapsulation header (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapHeader {
    /// Encapsulation command.
    pub command: u16,
    /// Length of the data following the header.
    pub length: u16,
    /// Session handle (0 before registration).
    pub session_handle: u32,
    /// Status (0 = success).
    pub status: u32,
    /// Echoed back unchanged by the target.
    pub sender_context: [u8; 8],
    /// Options (always 0).
    pub options: u32,
}

impl EncapHeader {
    /// Creates a request header with a zero status and context.
    pub fn new(command: u16, session_handle: u32, length: u16) -> Self {
        Self {
            command,
            length,
            session_handle,
            status: 0,
            sender_context: [0; 8],
            options: 0,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(self) -> [u8; ENCAP_HEADER_SIZE] {
        let mut out = [0u8; ENCAP_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.command.to_le_bytes());
        out[2..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.session_handle.to_le_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..20].copy_from_slice(&self.sender_context);
        out[20..24].copy_from_slice(&self.options.to_le_bytes());
        out
    }

    /// Parses a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ProtocolViolation` if the slice is too short.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ENCAP_HEADER_SIZE {
            return Err(BridgeError::protocol(format!(
                "encapsulation header too short: expected {} bytes, got {}",
                ENCAP_HEADER_SIZE,
                data.len()
            )));
        }

        let mut sender_context = [0u8; 8];
        sender_context.copy_from_slice(&data[12..20]);
        Ok(Self {
            command: read_u16(data, 0),
            length: read_u16(data, 2),
            session_handle: read_u32(data, 4),
            status: read_u32(data, 8),
            sender_context,
            options: read_u32(data, 20),
        })
    }

    /// Returns an error if the target reported a non-zero status.
    pub fn check_status(&self) -> Result<()> {
        if self.status != 0 {
            return Err(BridgeError::EncapsulationStatus {
                command: self.command,
                status: self.status,
            });
        }
        Ok(())
    }
}

/// One Common Packet Format item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfItem {
    /// Item type ID.
    pub type_id: u16,
    /// Item data.
    pub data: Vec<u8>,
}

impl CpfItem {
    /// Creates a new item.
    pub fn new(type_id: u16, data: Vec<u8>) -> Self {
        Self { type_id, data }
    }

    /// Encoded size of this item including its 4-byte type/length prefix.
    pub fn encoded_len(&self) -> usize {
        4 + self.data.len()
    }
}

/// Encodes an item list (count followed by items).
pub fn encode_cpf(items: &[CpfItem]) -> Vec<u8> {
    let total = 2 + items.iter().map(CpfItem::encoded_len).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(items.len() as u16).to_le_bytes());
    for item in items {
        out.extend_from_slice(&item.type_id.to_le_bytes());
        out.extend_from_slice(&(item.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&item.data);
    }
    out
}

/// Parses an item list.
///
/// # Errors
///
/// Returns `BridgeError::ProtocolViolation` on truncated input or trailing bytes.
pub fn parse_cpf(data: &[u8]) -> Result<Vec<CpfItem>> {
    if data.len() < 2 {
        return Err(BridgeError::protocol("CPF item count missing"));
    }
    let count = read_u16(data, 0) as usize;
    let mut items = Vec::with_capacity(count);
    let mut pos = 2;

    for index in 0..count {
        if pos + 4 > data.len() {
            return Err(BridgeError::protocol(format!(
                "CPF item {} header truncated",
                index
            )));
        }
        let type_id = read_u16(data, pos);
        let length = read_u16(data, pos + 2) as usize;
        pos += 4;
        if pos + length > data.len() {
            return Err(BridgeError::protocol(format!(
                "CPF item 0x{:04X} truncated: expected {} bytes, got {}",
                type_id,
                length,
                data.len() - pos
            )));
        }
        items.push(CpfItem::new(type_id, data[pos..pos + length].to_vec()));
        pos += length;
    }

    if pos != data.len() {
        return Err(BridgeError::protocol(format!(
            "{} trailing bytes after CPF items",
            data.len() - pos
        )));
    }
    Ok(items)
}

/// Socket address info carried in O->T / T->O sockaddr items.
///
/// Unlike the rest of EtherNet/IP, these fields are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockaddrInfo {
    /// IPv4 address (0.0.0.0 lets the target use the sender's address).
    pub address: Ipv4Addr,
    /// UDP port.
    pub port: u16,
}

impl SockaddrInfo {
    /// Creates a new sockaddr info.
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// Serializes to the 16-byte `sockaddr_in` layout.
    ///
    /// # Example
    ///
    /// ```
    /// use eip_bridge::encap::SockaddrInfo;
    /// use std::net::Ipv4Addr;
    ///
    /// let info = SockaddrInfo::new(Ipv4Addr::UNSPECIFIED, 2223);
    /// let bytes = info.to_bytes();
    /// assert_eq!(&bytes[..4], &[0x00, 0x02, 0x08, 0xAF]);
    /// ```
    pub fn to_bytes(self) -> [u8; SOCKADDR_INFO_SIZE] {
        let mut out = [0u8; SOCKADDR_INFO_SIZE];
        out[0..2].copy_from_slice(&AF_INET.to_be_bytes());
        out[2..4].copy_from_slice(&self.port.to_be_bytes());
        out[4..8].copy_from_slice(&self.address.octets());
        out
    }

    /// Parses the 16-byte `sockaddr_in` layout.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ProtocolViolation` on a wrong length or family.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != SOCKADDR_INFO_SIZE {
            return Err(BridgeError::protocol(format!(
                "sockaddr info must be {} bytes, got {}",
                SOCKADDR_INFO_SIZE,
                data.len()
            )));
        }
        let family = i16::from_be_bytes([data[0], data[1]]);
        if family != AF_INET {
            return Err(BridgeError::protocol(format!(
                "unsupported sockaddr family {}",
                family
            )));
        }
        Ok(Self {
            port: u16::from_be_bytes([data[2], data[3]]),
            address: Ipv4Addr::new(data[4], data[5], data[6], data[7]),
        })
    }

    /// Wraps this address in an item of the given type.
    pub fn to_item(self, type_id: u16) -> CpfItem {
        CpfItem::new(type_id, self.to_bytes().to_vec())
    }
}

#[inline]
pub(crate) fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

#[inline]
pub(crate) fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}
