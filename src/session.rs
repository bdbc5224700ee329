//! TCP explicit-messaging session.
//!
//! The Forward Open and Forward Close are unconnected explicit requests
//! sent with SendRRData inside a registered encapsulation session. This
//! module implements exactly that subset: RegisterSession, SendRRData and
//! UnRegisterSession over a blocking `TcpStream` with bounded timeouts.
//!
//! # Example
//!
//! ```no_run
//! use eip_bridge::ExplicitSession;
//! use std::time::Duration;
//!
//! let mut session = ExplicitSession::connect(
//!     "192.168.1.10:44818".parse().unwrap(),
//!     Duration::from_secs(5),
//! )?;
//! println!("session handle 0x{:08X}", session.session_handle());
//! session.unregister();
//! # Ok::<(), eip_bridge::BridgeError>(())
//! ```

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

use crate::encap::{
    encode_cpf, parse_cpf, CpfItem, EncapHeader, COMMAND_REGISTER_SESSION, COMMAND_SEND_RR_DATA,
    COMMAND_UNREGISTER_SESSION, ENCAP_HEADER_SIZE, ITEM_NULL_ADDRESS, ITEM_UNCONNECTED_DATA,
};
use crate::error::{BridgeError, Result};

/// Encapsulation protocol version sent in RegisterSession.
pub const ENCAP_PROTOCOL_VERSION: u16 = 1;

/// Reply to a SendRRData request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrDataReply {
    /// Message router reply carried in the unconnected data item.
    pub message: Vec<u8>,
    /// Other items of the reply (sockaddr info and the like).
    pub items: Vec<CpfItem>,
}

impl RrDataReply {
    /// Returns the first item of the given type.
    pub fn item(&self, type_id: u16) -> Option<&CpfItem> {
        self.items.iter().find(|item| item.type_id == type_id)
    }
}

/// Registered encapsulation session with one target.
pub struct ExplicitSession {
    stream: TcpStream,
    peer: SocketAddr,
    session_handle: u32,
    context_counter: u64,
}

impl ExplicitSession {
    /// Connects to the target and registers a session.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Timeout` if the target does not answer in time
    /// - `BridgeError::Transport` on socket errors
    /// - `BridgeError::EncapsulationStatus` if the target refuses the session
    pub fn connect(endpoint: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&endpoint, timeout).map_err(BridgeError::from_io)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let mut session = Self {
            stream,
            peer: endpoint,
            session_handle: 0,
            context_counter: 0,
        };
        session.register()?;
        debug!(
            peer = %session.peer,
            session_handle = session.session_handle,
            "Encapsulation session registered"
        );
        Ok(session)
    }

    fn register(&mut self) -> Result<()> {
        let mut body = Vec::with_capacity(4);
        body.extend_from_slice(&ENCAP_PROTOCOL_VERSION.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());

        let (header, _) = self.transact(COMMAND_REGISTER_SESSION, &body)?;
        if header.session_handle == 0 {
            return Err(BridgeError::protocol("target assigned session handle 0"));
        }
        self.session_handle = header.session_handle;
        Ok(())
    }

    /// Sends an unconnected explicit request with optional extra CPF items.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the reply carries no
    /// unconnected data item.
    pub fn send_rr_data(&mut self, request: &[u8], extra_items: &[CpfItem]) -> Result<RrDataReply> {
        let mut items = Vec::with_capacity(2 + extra_items.len());
        items.push(CpfItem::new(ITEM_NULL_ADDRESS, Vec::new()));
        items.push(CpfItem::new(ITEM_UNCONNECTED_DATA, request.to_vec()));
        items.extend_from_slice(extra_items);

        let mut body = Vec::with_capacity(6 + request.len() + 32);
        body.extend_from_slice(&0u32.to_le_bytes()); // interface handle: CIP
        body.extend_from_slice(&0u16.to_le_bytes()); // timeout: governed by the request
        body.extend_from_slice(&encode_cpf(&items));

        let (_, reply_body) = self.transact(COMMAND_SEND_RR_DATA, &body)?;
        if reply_body.len() < 6 {
            return Err(BridgeError::protocol(format!(
                "SendRRData reply too short: {} bytes",
                reply_body.len()
            )));
        }

        let mut message = None;
        let mut others = Vec::new();
        for item in parse_cpf(&reply_body[6..])? {
            if item.type_id == ITEM_UNCONNECTED_DATA && message.is_none() {
                message = Some(item.data);
            } else if item.type_id != ITEM_NULL_ADDRESS {
                others.push(item);
            }
        }

        let message =
            message.ok_or_else(|| BridgeError::protocol("no unconnected data item in reply"))?;
        Ok(RrDataReply {
            message,
            items: others,
        })
    }

    fn transact(&mut self, command: u16, body: &[u8]) -> Result<(EncapHeader, Vec<u8>)> {
        let length = u16::try_from(body.len())
            .map_err(|_| BridgeError::protocol("encapsulated request exceeds 65535 bytes"))?;
        self.context_counter = self.context_counter.wrapping_add(1);
        let context = self.context_counter.to_le_bytes();

        let mut header = EncapHeader::new(command, self.session_handle, length);
        header.sender_context = context;

        let mut packet = Vec::with_capacity(ENCAP_HEADER_SIZE + body.len());
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(body);
        self.stream.write_all(&packet).map_err(BridgeError::from_io)?;

        let mut raw_header = [0u8; ENCAP_HEADER_SIZE];
        self.stream
            .read_exact(&mut raw_header)
            .map_err(BridgeError::from_io)?;
        let reply = EncapHeader::from_bytes(&raw_header)?;

        let mut reply_body = vec![0u8; reply.length as usize];
        self.stream
            .read_exact(&mut reply_body)
            .map_err(BridgeError::from_io)?;

        if reply.command != command {
            return Err(BridgeError::protocol(format!(
                "reply command 0x{:04X} does not answer 0x{:04X}",
                reply.command, command
            )));
        }
        reply.check_status()?;
        if reply.sender_context != context {
            return Err(BridgeError::protocol("sender context mismatch"));
        }
        Ok((reply, reply_body))
    }

    /// Unregisters the session and closes the TCP connection.
    ///
    /// The target sends no reply; failures are ignored since the socket is
    /// closed right after.
    pub fn unregister(mut self) {
        let header = EncapHeader::new(COMMAND_UNREGISTER_SESSION, self.session_handle, 0);
        let _ = self.stream.write_all(&header.to_bytes());
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Session handle assigned by the target.
    pub fn session_handle(&self) -> u32 {
        self.session_handle
    }

    /// Address of the target.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the TCP connection.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }
}

impl std::fmt::Debug for ExplicitSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplicitSession")
            .field("peer", &self.peer)
            .field("session_handle", &format_args!("0x{:08X}", self.session_handle))
            .finish()
    }
}
