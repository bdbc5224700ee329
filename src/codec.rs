//! Message body encoding.
//!
//! Two output modes are fixed when the bridge is built:
//!
//! | Mode | Body | Use |
//! |------|------|-----|
//! | Binary | Raw assembly bytes, optionally behind a fixed header | Lowest overhead |
//! | Structured | JSON document | Consumers that do not know the raw layout |
//!
//! # Binary header
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | Header version (1) |
//! | 1 | 1 | Device address length `n` |
//! | 2 | n | Device address (UTF-8) |
//! | 2+n | 8 | Sequence (u64 LE) |
//! | 10+n | 8 | Timestamp, ms since the Unix epoch (u64 LE) |
//! | 18+n | 2 | Payload length (u16 LE) |
//! | 20+n | .. | Payload |
//!
//! # Structured document
//!
//! ```json
//! {"device":"192.168.17.200","timestamp":1700000000000,"sequence":42,"size":4,"data":[1,2,3,4]}
//! ```
//!
//! `data` holds byte values, little-endian 16-bit words, or a hex string.
//!
//! # Example
//!
//! ```
//! use eip_bridge::{Codec, FrameMetadata, OutputFormat};
//!
//! let codec = Codec::new(OutputFormat::Binary { header: false });
//! let meta = FrameMetadata::new("192.168.17.200", 1);
//!
//! let body = codec.encode(&[0xDE, 0xAD], &meta).unwrap();
//! assert_eq!(body, vec![0xDE, 0xAD]);
//! assert_eq!(codec.decode(&body).unwrap().payload, vec![0xDE, 0xAD]);
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::utils::{bytes_to_words, words_to_bytes};

/// Version byte of the binary header.
pub const BINARY_HEADER_VERSION: u8 = 1;

/// Representation of the payload in structured mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataEncoding {
    /// One unsigned value per byte.
    #[default]
    Bytes,
    /// One unsigned value per little-endian 16-bit word.
    Words,
    /// Lowercase hex string.
    Hex,
}

/// Body format of published messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputFormat {
    /// Raw payload, optionally prefixed with the binary header.
    Binary {
        /// Whether to prepend the binary header.
        #[serde(default)]
        header: bool,
    },
    /// JSON document.
    Structured {
        /// How `data` is represented.
        #[serde(default)]
        data: DataEncoding,
    },
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Binary { header: false }
    }
}

/// Per-message metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Device address as configured.
    pub device: String,
    /// Message sequence number.
    pub sequence: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl FrameMetadata {
    /// Creates metadata stamped with the current time.
    pub fn new(device: impl Into<String>, sequence: u64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        Self {
            device: device.into(),
            sequence,
            timestamp,
        }
    }

    /// Overrides the timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Metadata, if the body carried any.
    pub metadata: Option<FrameMetadata>,
    /// Assembly data.
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StructuredMessage {
    device: String,
    timestamp: u64,
    sequence: u64,
    size: usize,
    data: DataField,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DataField {
    Values(Vec<u16>),
    Hex(String),
}

/// Stateless encoder for message bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Codec {
    format: OutputFormat,
}

impl Codec {
    /// Creates a codec for the given format.
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the output format.
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Encodes one payload into a message body.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Configuration` if a binary header cannot hold the
    ///   device address (over 255 bytes) or the payload (over 65535 bytes)
    /// - `BridgeError::Encode` if JSON serialization fails
    pub fn encode(&self, payload: &[u8], meta: &FrameMetadata) -> Result<Vec<u8>> {
        match self.format {
            OutputFormat::Binary { header: false } => Ok(payload.to_vec()),
            OutputFormat::Binary { header: true } => encode_binary_header(payload, meta),
            OutputFormat::Structured { data } => {
                let data = match data {
                    DataEncoding::Bytes => {
                        DataField::Values(payload.iter().map(|&b| u16::from(b)).collect())
                    }
                    DataEncoding::Words => DataField::Values(bytes_to_words(payload)),
                    DataEncoding::Hex => DataField::Hex(hex::encode(payload)),
                };
                let message = StructuredMessage {
                    device: meta.device.clone(),
                    timestamp: meta.timestamp,
                    sequence: meta.sequence,
                    size: payload.len(),
                    data,
                };
                Ok(serde_json::to_vec(&message)?)
            }
        }
    }

    /// Decodes a body produced by [`Codec::encode`] with the same format.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ProtocolViolation` if the body is malformed.
    pub fn decode(&self, body: &[u8]) -> Result<DecodedFrame> {
        match self.format {
            OutputFormat::Binary { header: false } => Ok(DecodedFrame {
                metadata: None,
                payload: body.to_vec(),
            }),
            OutputFormat::Binary { header: true } => decode_binary_header(body),
            OutputFormat::Structured { data } => decode_structured(body, data),
        }
    }
}

fn encode_binary_header(payload: &[u8], meta: &FrameMetadata) -> Result<Vec<u8>> {
    let device = meta.device.as_bytes();
    let device_len = u8::try_from(device.len())
        .map_err(|_| BridgeError::configuration("device_address", "longer than 255 bytes"))?;
    let payload_len = u16::try_from(payload.len())
        .map_err(|_| BridgeError::configuration("t2o_size", "payload exceeds 65535 bytes"))?;

    let mut out = Vec::with_capacity(20 + device.len() + payload.len());
    out.push(BINARY_HEADER_VERSION);
    out.push(device_len);
    out.extend_from_slice(device);
    out.extend_from_slice(&meta.sequence.to_le_bytes());
    out.extend_from_slice(&meta.timestamp.to_le_bytes());
    out.extend_from_slice(&payload_len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

fn decode_binary_header(body: &[u8]) -> Result<DecodedFrame> {
    if body.len() < 2 {
        return Err(BridgeError::protocol("binary header truncated"));
    }
    if body[0] != BINARY_HEADER_VERSION {
        return Err(BridgeError::protocol(format!(
            "unsupported binary header version {}",
            body[0]
        )));
    }
    let device_len = body[1] as usize;
    let fixed_end = 2 + device_len + 18;
    if body.len() < fixed_end {
        return Err(BridgeError::protocol("binary header truncated"));
    }

    let device = std::str::from_utf8(&body[2..2 + device_len])
        .map_err(|_| BridgeError::protocol("device address is not UTF-8"))?
        .to_string();
    let mut pos = 2 + device_len;
    let sequence = u64::from_le_bytes(read_array(body, pos));
    pos += 8;
    let timestamp = u64::from_le_bytes(read_array(body, pos));
    pos += 8;
    let payload_len = u16::from_le_bytes(read_array(body, pos)) as usize;
    pos += 2;

    if body.len() - pos != payload_len {
        return Err(BridgeError::protocol(format!(
            "payload length {} does not match header {}",
            body.len() - pos,
            payload_len
        )));
    }

    Ok(DecodedFrame {
        metadata: Some(FrameMetadata {
            device,
            sequence,
            timestamp,
        }),
        payload: body[pos..].to_vec(),
    })
}

fn decode_structured(body: &[u8], encoding: DataEncoding) -> Result<DecodedFrame> {
    let message: StructuredMessage = serde_json::from_slice(body)
        .map_err(|e| BridgeError::protocol(format!("invalid structured message: {}", e)))?;

    let payload = match (encoding, message.data) {
        (DataEncoding::Bytes, DataField::Values(values)) => values
            .into_iter()
            .map(|v| u8::try_from(v).map_err(|_| BridgeError::protocol("byte value over 255")))
            .collect::<Result<Vec<u8>>>()?,
        (DataEncoding::Words, DataField::Values(words)) => {
            let mut bytes = words_to_bytes(&words);
            bytes.truncate(message.size);
            bytes
        }
        (DataEncoding::Hex, DataField::Hex(text)) => hex::decode(&text)
            .map_err(|e| BridgeError::protocol(format!("invalid hex data: {}", e)))?,
        _ => return Err(BridgeError::protocol("data field does not match encoding")),
    };

    if payload.len() != message.size {
        return Err(BridgeError::protocol(format!(
            "data holds {} bytes, size says {}",
            payload.len(),
            message.size
        )));
    }

    Ok(DecodedFrame {
        metadata: Some(FrameMetadata {
            device: message.device,
            sequence: message.sequence,
            timestamp: message.timestamp,
        }),
        payload,
    })
}

fn read_array<const N: usize>(data: &[u8], pos: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[pos..pos + N]);
    out
}
