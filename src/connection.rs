//! Cyclic connection setup and teardown.
//!
//! [`ConnectionManager::open`] runs the whole handshake for one Class-1
//! connection:
//!
//! 1. Validate the parameters and bind the inbound UDP socket to
//!    `receive_port`. The device may start producing right after it answers
//!    the Forward Open, so the socket has to exist first.
//! 2. Register an encapsulation session with the device.
//! 3. Send a Forward Open, or a Large Forward Open when either connection
//!    size exceeds the standard format, with a T->O sockaddr item that
//!    advertises `receive_port`.
//! 4. Decode the reply into a [`ConnectionHandle`].
//!
//! [`ConnectionManager::close`] sends the matching Forward Close. It never
//! fails: the connection is torn down locally whatever the device says.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::encap::{SockaddrInfo, ITEM_O2T_SOCKADDR, ITEM_T2O_SOCKADDR};
use crate::error::{BridgeError, Result};
use crate::forward_open::{
    ConnectionTriad, ForwardCloseRequest, ForwardOpenRequest, SERVICE_FORWARD_CLOSE,
};
use crate::params::{ConnectionParameters, DEFAULT_IMPLICIT_PORT};
use crate::reply::{ForwardOpenReply, MessageRouterReply};
use crate::session::{ExplicitSession, RrDataReply};

/// Lifecycle of the one cyclic connection a manager owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, no socket.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Forward Open accepted, cyclic data flowing.
    Open,
    /// Forward Close in progress.
    Closing,
    /// The last open attempt failed.
    ///
    /// Only the handshake sets this. A connection that fails while scanning
    /// is reported by the supervisor and returns to `Disconnected` here once
    /// it is closed.
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// An open Class-1 connection.
///
/// Owns the inbound UDP socket and the explicit session the connection was
/// opened on. Dropping the handle releases both without a Forward Close;
/// use [`ConnectionManager::close`] for an orderly teardown.
pub struct ConnectionHandle {
    socket: UdpSocket,
    session: ExplicitSession,
    device_ip: IpAddr,
    o2t_destination: SocketAddr,
    o2t_connection_id: u32,
    t2o_connection_id: u32,
    triad: ConnectionTriad,
    connection_path: Vec<u8>,
    o2t_api: Duration,
    t2o_api: Duration,
    large: bool,
}

impl ConnectionHandle {
    /// Inbound socket bound to `receive_port`.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// IP address of the device.
    pub fn device_ip(&self) -> IpAddr {
        self.device_ip
    }

    /// Where O->T datagrams are sent.
    pub fn o2t_destination(&self) -> SocketAddr {
        self.o2t_destination
    }

    /// O->T connection ID assigned by the device.
    pub fn o2t_connection_id(&self) -> u32 {
        self.o2t_connection_id
    }

    /// T->O connection ID carried by every inbound datagram.
    pub fn t2o_connection_id(&self) -> u32 {
        self.t2o_connection_id
    }

    /// Triad identifying the connection.
    pub fn triad(&self) -> ConnectionTriad {
        self.triad
    }

    /// Actual O->T packet interval granted by the device.
    pub fn o2t_api(&self) -> Duration {
        self.o2t_api
    }

    /// Actual T->O packet interval granted by the device.
    pub fn t2o_api(&self) -> Duration {
        self.t2o_api
    }

    /// Whether the connection was opened with the Large Forward Open.
    pub fn is_large(&self) -> bool {
        self.large
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("o2t_destination", &self.o2t_destination)
            .field("o2t_connection_id", &format_args!("0x{:08X}", self.o2t_connection_id))
            .field("t2o_connection_id", &format_args!("0x{:08X}", self.t2o_connection_id))
            .field("triad", &self.triad)
            .field("large", &self.large)
            .finish()
    }
}

/// Opens and closes cyclic connections, one at a time.
#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    next_serial: u16,
    id_seed: u32,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Creates a manager with connection serials seeded from the clock.
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.subsec_nanos() ^ (elapsed.as_secs() as u32))
            .unwrap_or(0x5A5A_1234);
        Self {
            state: ConnectionState::Disconnected,
            next_serial: (nanos >> 8) as u16,
            id_seed: nanos,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Opens a cyclic connection.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Configuration` if the parameters are invalid
    /// - `BridgeError::RejectedByDevice` if the device refuses the Forward Open
    /// - `BridgeError::EncapsulationStatus` if the device refuses the session
    /// - `BridgeError::Timeout` if the device does not answer in time
    /// - `BridgeError::Transport` on socket errors, including a busy `receive_port`
    pub fn open(&mut self, params: &ConnectionParameters) -> Result<ConnectionHandle> {
        params.validate()?;
        self.state = ConnectionState::Connecting;
        match self.handshake(params) {
            Ok(handle) => {
                self.state = ConnectionState::Open;
                Ok(handle)
            }
            Err(err) => {
                self.state = ConnectionState::Faulted;
                Err(err)
            }
        }
    }

    fn handshake(&mut self, params: &ConnectionParameters) -> Result<ConnectionHandle> {
        let endpoint = params.explicit_endpoint()?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, params.receive_port))?;
        debug!(port = params.receive_port, "Inbound socket bound");

        let mut session = ExplicitSession::connect(endpoint, params.handshake_timeout)?;

        let triad = self.next_triad(params);
        let t2o_connection_id = self.next_connection_id();
        let request = ForwardOpenRequest::new(params, triad, t2o_connection_id);

        let (rr, open) = match Self::forward_open(&mut session, &request, params.receive_port) {
            Ok(reply) => reply,
            Err(err) => {
                session.unregister();
                return Err(err);
            }
        };

        let device_ip = endpoint.ip();
        let o2t_destination = o2t_destination(&rr, device_ip);

        info!(
            device = %endpoint,
            large = request.is_large(),
            o2t_connection_id = open.o2t_connection_id,
            t2o_connection_id = open.t2o_connection_id,
            o2t_api_us = open.o2t_api,
            t2o_api_us = open.t2o_api,
            %o2t_destination,
            "Connection opened"
        );

        Ok(ConnectionHandle {
            socket,
            session,
            device_ip,
            o2t_destination,
            o2t_connection_id: open.o2t_connection_id,
            t2o_connection_id: open.t2o_connection_id,
            triad,
            connection_path: request.params().connection_path.clone(),
            o2t_api: Duration::from_micros(u64::from(open.o2t_api)),
            t2o_api: Duration::from_micros(u64::from(open.t2o_api)),
            large: request.is_large(),
        })
    }

    fn forward_open(
        session: &mut ExplicitSession,
        request: &ForwardOpenRequest,
        receive_port: u16,
    ) -> Result<(RrDataReply, ForwardOpenReply)> {
        let t2o_sockaddr =
            SockaddrInfo::new(Ipv4Addr::UNSPECIFIED, receive_port).to_item(ITEM_T2O_SOCKADDR);
        let rr = session.send_rr_data(&request.to_bytes(), &[t2o_sockaddr])?;

        let reply = MessageRouterReply::from_bytes(&rr.message)?;
        reply.check(request.service())?;
        let open = ForwardOpenReply::from_bytes(&reply.data)?;
        Ok((rr, open))
    }

    /// Closes a connection with a best-effort Forward Close.
    ///
    /// Failures are logged. The socket and session are released either way.
    pub fn close(&mut self, handle: ConnectionHandle) {
        self.state = ConnectionState::Closing;
        let ConnectionHandle {
            socket,
            mut session,
            triad,
            connection_path,
            ..
        } = handle;

        let request = ForwardCloseRequest::new(triad, connection_path);
        match forward_close(&mut session, &request) {
            Ok(()) => info!(
                connection_serial = triad.connection_serial,
                "Connection closed"
            ),
            Err(err) => warn!(
                connection_serial = triad.connection_serial,
                error = %err,
                "Forward Close failed"
            ),
        }

        session.unregister();
        drop(socket);
        self.state = ConnectionState::Disconnected;
    }

    fn next_triad(&mut self, params: &ConnectionParameters) -> ConnectionTriad {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        ConnectionTriad::new(
            serial,
            params.originator_vendor_id,
            params.originator_serial_number,
        )
    }

    fn next_connection_id(&mut self) -> u32 {
        // xorshift32
        let mut x = self.id_seed.max(1);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.id_seed = x;
        x
    }
}

fn forward_close(session: &mut ExplicitSession, request: &ForwardCloseRequest) -> Result<()> {
    let rr = session.send_rr_data(&request.to_bytes(), &[])?;
    MessageRouterReply::from_bytes(&rr.message)?.check(SERVICE_FORWARD_CLOSE)
}

/// O->T destination: the device's sockaddr item if it sent one, otherwise
/// the device address on the default implicit port.
fn o2t_destination(rr: &RrDataReply, device_ip: IpAddr) -> SocketAddr {
    let advertised = rr
        .item(ITEM_O2T_SOCKADDR)
        .and_then(|item| SockaddrInfo::from_bytes(&item.data).ok());

    match advertised {
        Some(info) if !info.address.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(info.address), info.port)
        }
        Some(info) => SocketAddr::new(device_ip, info.port),
        None => SocketAddr::new(device_ip, DEFAULT_IMPLICIT_PORT),
    }
}
