//! Forward Open, Large Forward Open and Forward Close requests.
//!
//! Both open variants share one parameter block ([`ForwardOpenParams`]) and
//! differ only in the service code and the width of the network connection
//! parameter fields: 16 bits with a 9-bit size for the standard request,
//! 32 bits with a 16-bit size for the large one. [`ForwardOpenRequest::new`]
//! picks the variant from the connection sizes.
//!
//! # Example
//!
//! ```
//! use eip_bridge::{ConnectionParameters, ConnectionTriad, ForwardOpenRequest};
//!
//! let params = ConnectionParameters::new("10.0.0.1").with_sizes(0, 1200);
//! let triad = ConnectionTriad::new(0x0001, 342, 0x12345);
//! let request = ForwardOpenRequest::new(&params, triad, 0x1000_0001);
//!
//! assert!(request.is_large());
//! assert_eq!(request.to_bytes()[0], 0x5B);
//! ```

use crate::params::{requires_large_forward_open, ConnectionParameters};

/// Forward Open service code.
pub const SERVICE_FORWARD_OPEN: u8 = 0x54;
/// Large Forward Open service code.
pub const SERVICE_LARGE_FORWARD_OPEN: u8 = 0x5B;
/// Forward Close service code.
pub const SERVICE_FORWARD_CLOSE: u8 = 0x4E;

/// Request path of the Connection Manager object (class 0x06, instance 1).
pub const CONNECTION_MANAGER_PATH: [u8; 4] = [0x20, 0x06, 0x24, 0x01];

/// Assembly object class ID.
pub const ASSEMBLY_CLASS: u8 = 0x04;

/// Transport class 1, cyclic trigger.
pub const TRANSPORT_CLASS1_CYCLIC: u8 = 0x01;

/// Priority/time tick used for both open and close (tick = 2^10 ms).
pub const PRIORITY_TIME_TICK: u8 = 0x0A;
/// Timeout ticks for the unconnected part of the request.
pub const TIMEOUT_TICKS: u8 = 0x0E;

const NCP_POINT_TO_POINT: u16 = 0x4000;
const NCP_SCHEDULED_PRIORITY: u16 = 0x0800;
const NCP_STANDARD_SIZE_MASK: u32 = 0x01FF;
const NCP_LARGE_SIZE_MASK: u32 = 0xFFFF;

/// Identifies a connection towards the target. Must match between open and close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTriad {
    /// Connection serial number chosen by the originator.
    pub connection_serial: u16,
    /// Originator vendor ID.
    pub vendor_id: u16,
    /// Originator serial number.
    pub originator_serial: u32,
}

impl ConnectionTriad {
    /// Creates a new triad.
    pub fn new(connection_serial: u16, vendor_id: u16, originator_serial: u32) -> Self {
        Self {
            connection_serial,
            vendor_id,
            originator_serial,
        }
    }

    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.connection_serial.to_le_bytes());
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.originator_serial.to_le_bytes());
    }
}

/// Parameter block shared by the standard and large Forward Open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOpenParams {
    /// Connection triad.
    pub triad: ConnectionTriad,
    /// Proposed O->T connection ID (the target normally assigns its own).
    pub o2t_connection_id: u32,
    /// T->O connection ID chosen by the originator.
    pub t2o_connection_id: u32,
    /// Connection timeout multiplier index.
    pub timeout_multiplier: u8,
    /// O->T RPI in microseconds.
    pub o2t_rpi: u32,
    /// T->O RPI in microseconds.
    pub t2o_rpi: u32,
    /// O->T connection size including sequence count and run/idle header.
    pub o2t_connection_size: u32,
    /// T->O connection size including sequence count and run/idle header.
    pub t2o_connection_size: u32,
    /// Transport class and trigger.
    pub transport_trigger: u8,
    /// Connection path (assembly class, config instance, connection points).
    pub connection_path: Vec<u8>,
}

impl ForwardOpenParams {
    /// Builds the parameter block from connection parameters.
    pub fn from_connection(
        params: &ConnectionParameters,
        triad: ConnectionTriad,
        t2o_connection_id: u32,
    ) -> Self {
        Self {
            triad,
            o2t_connection_id: 0,
            t2o_connection_id,
            timeout_multiplier: params.timeout_multiplier,
            o2t_rpi: params.rpi_microseconds,
            t2o_rpi: params.rpi_microseconds,
            o2t_connection_size: params.o2t_connection_size(),
            t2o_connection_size: params.t2o_connection_size(),
            transport_trigger: TRANSPORT_CLASS1_CYCLIC,
            connection_path: encode_connection_path(
                params.config_assembly,
                params.o2t_assembly,
                params.t2o_assembly,
            ),
        }
    }
}

/// A Forward Open request in either format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOpenRequest {
    /// Forward Open (0x54) with 16-bit network connection parameters.
    Standard(ForwardOpenParams),
    /// Large Forward Open (0x5B) with 32-bit network connection parameters.
    Large(ForwardOpenParams),
}

impl ForwardOpenRequest {
    /// Builds a request, selecting the large format when either connection
    /// size does not fit the standard 9-bit size field.
    pub fn new(params: &ConnectionParameters, triad: ConnectionTriad, t2o_connection_id: u32) -> Self {
        Self::from_params(ForwardOpenParams::from_connection(
            params,
            triad,
            t2o_connection_id,
        ))
    }

    /// Wraps a parameter block in the variant its sizes require.
    pub fn from_params(params: ForwardOpenParams) -> Self {
        if requires_large_forward_open(params.o2t_connection_size, params.t2o_connection_size) {
            Self::Large(params)
        } else {
            Self::Standard(params)
        }
    }

    /// Returns whether this is a Large Forward Open.
    pub fn is_large(&self) -> bool {
        matches!(self, Self::Large(_))
    }

    /// Service code of this request.
    pub fn service(&self) -> u8 {
        match self {
            Self::Standard(_) => SERVICE_FORWARD_OPEN,
            Self::Large(_) => SERVICE_LARGE_FORWARD_OPEN,
        }
    }

    /// Shared parameter block.
    pub fn params(&self) -> &ForwardOpenParams {
        match self {
            Self::Standard(params) | Self::Large(params) => params,
        }
    }

    /// Serializes the message router request (service, path, data).
    pub fn to_bytes(&self) -> Vec<u8> {
        let params = self.params();
        let mut out = Vec::with_capacity(64 + params.connection_path.len());

        out.push(self.service());
        out.push((CONNECTION_MANAGER_PATH.len() / 2) as u8);
        out.extend_from_slice(&CONNECTION_MANAGER_PATH);

        out.push(PRIORITY_TIME_TICK);
        out.push(TIMEOUT_TICKS);
        out.extend_from_slice(&params.o2t_connection_id.to_le_bytes());
        out.extend_from_slice(&params.t2o_connection_id.to_le_bytes());
        params.triad.write(&mut out);
        out.push(params.timeout_multiplier);
        out.extend_from_slice(&[0, 0, 0]);

        out.extend_from_slice(&params.o2t_rpi.to_le_bytes());
        self.write_network_params(&mut out, params.o2t_connection_size);
        out.extend_from_slice(&params.t2o_rpi.to_le_bytes());
        self.write_network_params(&mut out, params.t2o_connection_size);

        out.push(params.transport_trigger);
        out.push((params.connection_path.len() / 2) as u8);
        out.extend_from_slice(&params.connection_path);
        out
    }

    fn write_network_params(&self, out: &mut Vec<u8>, size: u32) {
        match self {
            Self::Standard(_) => out.extend_from_slice(&standard_network_params(size).to_le_bytes()),
            Self::Large(_) => out.extend_from_slice(&large_network_params(size).to_le_bytes()),
        }
    }
}

/// 16-bit network connection parameters: point-to-point, scheduled, fixed size.
pub fn standard_network_params(size: u32) -> u16 {
    NCP_POINT_TO_POINT | NCP_SCHEDULED_PRIORITY | (size & NCP_STANDARD_SIZE_MASK) as u16
}

/// 32-bit network connection parameters: point-to-point, scheduled, fixed size.
pub fn large_network_params(size: u32) -> u32 {
    (u32::from(NCP_POINT_TO_POINT | NCP_SCHEDULED_PRIORITY) << 16) | (size & NCP_LARGE_SIZE_MASK)
}

/// Forward Close request for a connection opened with the same triad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCloseRequest {
    /// Triad of the connection to close.
    pub triad: ConnectionTriad,
    /// Connection path used in the open.
    pub connection_path: Vec<u8>,
}

impl ForwardCloseRequest {
    /// Creates a close request.
    pub fn new(triad: ConnectionTriad, connection_path: Vec<u8>) -> Self {
        Self {
            triad,
            connection_path,
        }
    }

    /// Serializes the message router request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.connection_path.len());
        out.push(SERVICE_FORWARD_CLOSE);
        out.push((CONNECTION_MANAGER_PATH.len() / 2) as u8);
        out.extend_from_slice(&CONNECTION_MANAGER_PATH);

        out.push(PRIORITY_TIME_TICK);
        out.push(TIMEOUT_TICKS);
        self.triad.write(&mut out);
        out.push((self.connection_path.len() / 2) as u8);
        out.push(0);
        out.extend_from_slice(&self.connection_path);
        out
    }
}

/// Encodes the connection path to the assembly object.
///
/// Instances up to 255 use 8-bit logical segments, larger ones the padded
/// 16-bit form, so the path always has an even length.
///
/// # Example
///
/// ```
/// use eip_bridge::forward_open::encode_connection_path;
///
/// assert_eq!(
///     encode_connection_path(4, 2, 1),
///     vec![0x20, 0x04, 0x24, 0x04, 0x2C, 0x02, 0x2C, 0x01]
/// );
/// ```
pub fn encode_connection_path(config: u16, o2t: u16, t2o: u16) -> Vec<u8> {
    let mut path = vec![0x20, ASSEMBLY_CLASS];
    push_logical_segment(&mut path, 0x24, config);
    push_logical_segment(&mut path, 0x2C, o2t);
    push_logical_segment(&mut path, 0x2C, t2o);
    path
}

fn push_logical_segment(path: &mut Vec<u8>, segment: u8, value: u16) {
    match u8::try_from(value) {
        Ok(short) => path.extend_from_slice(&[segment, short]),
        Err(_) => {
            path.extend_from_slice(&[segment | 0x01, 0x00]);
            path.extend_from_slice(&value.to_le_bytes());
        }
    }
}
