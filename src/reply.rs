//! Message router reply parsing.
//!
//! # Reply Structure
//!
//! | Component | Size | Description |
//! |-----------|------|-------------|
//! | Reply service | 1 byte | Request service with bit 7 set |
//! | Reserved | 1 byte | Always 0x00 |
//! | General status | 1 byte | 0x00 = success |
//! | Additional status size | 1 byte | Number of 16-bit words that follow |
//! | Additional status | 2 x size | Extended status words |
//! | Data | Variable | Service specific reply data |
//!
//! A successful Forward Open reply carries the connection IDs the target
//! assigned and the actual packet intervals; a failed one carries the
//! extended status that says why (wrong size, unknown assembly, no
//! connections left, ...).

use crate::encap::{read_u16, read_u32};
use crate::error::{BridgeError, Result};
use crate::forward_open::ConnectionTriad;

/// Minimum reply size: service, reserved, general status, additional size.
pub const MIN_REPLY_SIZE: usize = 4;

/// Size of a successful Forward Open reply up to the application reply.
pub const FORWARD_OPEN_REPLY_SIZE: usize = 26;

/// Parsed message router reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRouterReply {
    /// Reply service code (request service | 0x80).
    pub service: u8,
    /// General status (0x00 = success).
    pub general_status: u8,
    /// Additional status words.
    pub additional_status: Vec<u16>,
    /// Reply data.
    pub data: Vec<u8>,
}

impl MessageRouterReply {
    /// Parses a reply from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ProtocolViolation` if the reply is truncated.
    ///
    /// # Example
    ///
    /// ```
    /// use eip_bridge::MessageRouterReply;
    ///
    /// let reply = MessageRouterReply::from_bytes(&[0xCE, 0x00, 0x01, 0x01, 0x09, 0x01]).unwrap();
    /// assert_eq!(reply.general_status, 0x01);
    /// assert_eq!(reply.extended_status(), Some(0x0109));
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_REPLY_SIZE {
            return Err(BridgeError::protocol(format!(
                "reply too short: expected at least {} bytes, got {}",
                MIN_REPLY_SIZE,
                data.len()
            )));
        }

        let additional_words = data[3] as usize;
        let data_start = MIN_REPLY_SIZE + additional_words * 2;
        if data.len() < data_start {
            return Err(BridgeError::protocol(format!(
                "reply truncated: {} additional status words announced, {} bytes available",
                additional_words,
                data.len() - MIN_REPLY_SIZE
            )));
        }

        let additional_status = (0..additional_words)
            .map(|i| read_u16(data, MIN_REPLY_SIZE + i * 2))
            .collect();

        Ok(Self {
            service: data[0],
            general_status: data[2],
            additional_status,
            data: data[data_start..].to_vec(),
        })
    }

    /// Returns whether the general status is success.
    pub fn is_success(&self) -> bool {
        self.general_status == 0
    }

    /// First additional status word, the extended status for Connection Manager errors.
    pub fn extended_status(&self) -> Option<u16> {
        self.additional_status.first().copied()
    }

    /// Checks that this replies to `request_service` and succeeded.
    ///
    /// # Errors
    ///
    /// - `BridgeError::ProtocolViolation` if the service does not match
    /// - `BridgeError::RejectedByDevice` if the general status is non-zero
    pub fn check(&self, request_service: u8) -> Result<()> {
        if self.service != request_service | 0x80 {
            return Err(BridgeError::protocol(format!(
                "reply service 0x{:02X} does not answer request 0x{:02X}",
                self.service, request_service
            )));
        }
        if !self.is_success() {
            return Err(BridgeError::rejected(
                self.general_status,
                self.extended_status(),
            ));
        }
        Ok(())
    }
}

/// Successful Forward Open reply data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOpenReply {
    /// O->T connection ID assigned by the target.
    pub o2t_connection_id: u32,
    /// T->O connection ID (echoed or reassigned by the target).
    pub t2o_connection_id: u32,
    /// Triad echoed by the target.
    pub triad: ConnectionTriad,
    /// Actual O->T packet interval in microseconds.
    pub o2t_api: u32,
    /// Actual T->O packet interval in microseconds.
    pub t2o_api: u32,
    /// Application specific reply.
    pub application_reply: Vec<u8>,
}

impl ForwardOpenReply {
    /// Parses the data of a successful (Large) Forward Open reply.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ProtocolViolation` if the data is truncated.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FORWARD_OPEN_REPLY_SIZE {
            return Err(BridgeError::protocol(format!(
                "forward open reply too short: expected {} bytes, got {}",
                FORWARD_OPEN_REPLY_SIZE,
                data.len()
            )));
        }

        let app_reply_len = data[24] as usize * 2;
        let app_reply_end = FORWARD_OPEN_REPLY_SIZE + app_reply_len;
        if data.len() < app_reply_end {
            return Err(BridgeError::protocol(format!(
                "forward open application reply truncated: expected {} bytes, got {}",
                app_reply_len,
                data.len() - FORWARD_OPEN_REPLY_SIZE
            )));
        }

        Ok(Self {
            o2t_connection_id: read_u32(data, 0),
            t2o_connection_id: read_u32(data, 4),
            triad: ConnectionTriad::new(read_u16(data, 8), read_u16(data, 10), read_u32(data, 12)),
            o2t_api: read_u32(data, 16),
            t2o_api: read_u32(data, 20),
            application_reply: data[FORWARD_OPEN_REPLY_SIZE..app_reply_end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_reply() -> Vec<u8> {
        hex::decode(concat!(
            "d4000000",         // reply service, reserved, status, additional size
            "78563412",         // O->T connection ID
            "44332211",         // T->O connection ID
            "0201", "5601", "45230100", // triad
            "d0070000",         // O->T API
            "a00f0000",         // T->O API
            "0000",             // application reply size, reserved
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_success() {
        let reply = MessageRouterReply::from_bytes(&success_reply()).unwrap();
        assert!(reply.check(0x54).is_ok());

        let open = ForwardOpenReply::from_bytes(&reply.data).unwrap();
        assert_eq!(open.o2t_connection_id, 0x1234_5678);
        assert_eq!(open.t2o_connection_id, 0x1122_3344);
        assert_eq!(open.triad, ConnectionTriad::new(0x0102, 342, 0x0001_2345));
        assert_eq!(open.o2t_api, 2000);
        assert_eq!(open.t2o_api, 4000);
        assert!(open.application_reply.is_empty());
    }

    #[test]
    fn test_parse_rejection() {
        let bytes = hex::decode("d40001010901020156014523010000").unwrap();
        let reply = MessageRouterReply::from_bytes(&bytes).unwrap();
        let err = reply.check(0x54).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::RejectedByDevice {
                general_status: 0x01,
                extended_status: Some(0x0109)
            }
        ));
    }

    #[test]
    fn test_service_mismatch() {
        let reply = MessageRouterReply::from_bytes(&success_reply()).unwrap();
        assert!(matches!(
            reply.check(0x5B),
            Err(BridgeError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_truncated_additional_status() {
        assert!(MessageRouterReply::from_bytes(&[0xD4, 0x00, 0x01, 0x02, 0x09]).is_err());
    }

    #[test]
    fn test_forward_open_reply_too_short() {
        assert!(ForwardOpenReply::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_forward_open_reply_application_data() {
        let mut bytes = success_reply();
        let len = bytes.len();
        bytes[len - 2] = 1;
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let reply = MessageRouterReply::from_bytes(&bytes).unwrap();
        let open = ForwardOpenReply::from_bytes(&reply.data).unwrap();
        assert_eq!(open.application_reply, vec![0xAA, 0xBB]);
    }
}
