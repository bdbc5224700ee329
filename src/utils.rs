//! Helpers for working with raw assembly data.
//!
//! CIP transfers assembly data little-endian. These helpers convert between
//! the byte image of an assembly and 16-bit words, and format bytes for log
//! output.
//!
//! # Example
//!
//! ```
//! use eip_bridge::utils::{bytes_to_words, format_hex_bytes};
//!
//! let data = [0x34, 0x12, 0x05];
//!
//! assert_eq!(bytes_to_words(&data), vec![0x1234, 0x0005]);
//! assert_eq!(format_hex_bytes(&data), "34 12 05");
//! ```

use std::fmt::Write;

/// Converts a byte image into little-endian 16-bit words.
///
/// An odd trailing byte becomes the low byte of a final word.
///
/// # Example
///
/// ```
/// use eip_bridge::utils::bytes_to_words;
///
/// assert_eq!(bytes_to_words(&[0x01, 0x02, 0x03, 0x04]), vec![0x0201, 0x0403]);
/// assert_eq!(bytes_to_words(&[0xFF]), vec![0x00FF]);
/// ```
pub fn bytes_to_words(data: &[u8]) -> Vec<u16> {
    data.chunks(2)
        .map(|chunk| match chunk {
            [lo, hi] => u16::from_le_bytes([*lo, *hi]),
            [lo] => u16::from(*lo),
            _ => 0,
        })
        .collect()
}

/// Converts little-endian 16-bit words back into a byte image.
///
/// # Example
///
/// ```
/// use eip_bridge::utils::words_to_bytes;
///
/// assert_eq!(words_to_bytes(&[0x0201, 0x0403]), vec![0x01, 0x02, 0x03, 0x04]);
/// ```
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Formats bytes as space separated upper-case hex pairs.
///
/// # Example
///
/// ```
/// use eip_bridge::utils::format_hex_bytes;
///
/// assert_eq!(format_hex_bytes(&[0x0A, 0xFF]), "0A FF");
/// assert_eq!(format_hex_bytes(&[]), "");
/// ```
pub fn format_hex_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// Formats at most `limit` bytes, appending the remaining count.
///
/// Used to keep per-datagram debug logs bounded for large assemblies.
///
/// # Example
///
/// ```
/// use eip_bridge::utils::format_hex_preview;
///
/// assert_eq!(format_hex_preview(&[1, 2, 3, 4], 2), "01 02 (+2 bytes)");
/// assert_eq!(format_hex_preview(&[1, 2], 4), "01 02");
/// ```
pub fn format_hex_preview(data: &[u8], limit: usize) -> String {
    if data.len() <= limit {
        return format_hex_bytes(data);
    }
    format!(
        "{} (+{} bytes)",
        format_hex_bytes(&data[..limit]),
        data.len() - limit
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_words_even() {
        assert_eq!(bytes_to_words(&[0x34, 0x12, 0x78, 0x56]), vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_bytes_to_words_odd_tail() {
        assert_eq!(bytes_to_words(&[0x34, 0x12, 0xAB]), vec![0x1234, 0x00AB]);
    }

    #[test]
    fn test_bytes_to_words_empty() {
        assert!(bytes_to_words(&[]).is_empty());
    }

    #[test]
    fn test_words_to_bytes() {
        assert_eq!(words_to_bytes(&[0x1234]), vec![0x34, 0x12]);
    }

    #[test]
    fn test_format_hex_bytes() {
        assert_eq!(format_hex_bytes(&[0x00, 0x01, 0xAB]), "00 01 AB");
    }

    #[test]
    fn test_format_hex_preview_truncates() {
        let data = [0u8; 10];
        assert_eq!(format_hex_preview(&data, 3), "00 00 00 (+7 bytes)");
    }
}
