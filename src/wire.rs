//! Wire format encoding and decoding.
//!
//! Every packet travels as:
//! ```text
//! ┌────────────┬──────────────────┐
//! │ Length     │ Payload          │
//! │ 4 bytes    │ `length` bytes   │
//! │ int32 LE   │ opaque           │
//! └────────────┴──────────────────┘
//! ```
//!
//! The length prefix is a signed 32-bit integer in little-endian byte order.
//! Zero is a legal length and carries no payload bytes. A negative length, or
//! a length above the configured maximum, is a protocol violation.

use crate::error::{Result, WireboxError};

/// Size of the length prefix in bytes (fixed, exactly 4).
pub const PREFIX_SIZE: usize = 4;

/// Encode a packet length to its wire form (little-endian).
#[inline]
pub fn encode_prefix(length: i32) -> [u8; PREFIX_SIZE] {
    length.to_le_bytes()
}

/// Decode a packet length from its wire form (little-endian).
#[inline]
pub fn decode_prefix(buf: [u8; PREFIX_SIZE]) -> i32 {
    i32::from_le_bytes(buf)
}

/// Validate a peer-declared payload length.
///
/// `max_payload_size == 0` means "no limit". Zero-length packets are always
/// accepted.
pub fn validate_length(length: i32, max_payload_size: usize) -> Result<()> {
    if length < 0 {
        return Err(WireboxError::Protocol(format!(
            "negative packet length {}",
            length
        )));
    }
    if max_payload_size != 0 && length as usize > max_payload_size {
        return Err(WireboxError::Protocol(format!(
            "packet length {} exceeds maximum {}",
            length, max_payload_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_roundtrip() {
        for length in [0, 1, 255, 0x0102_0304, i32::MAX] {
            assert_eq!(decode_prefix(encode_prefix(length)), length);
        }
    }

    #[test]
    fn test_prefix_little_endian_byte_order() {
        let bytes = encode_prefix(0x0102_0304);
        assert_eq!(bytes, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_prefix_size_is_exactly_4() {
        assert_eq!(PREFIX_SIZE, 4);
        assert_eq!(encode_prefix(0).len(), 4);
    }

    #[test]
    fn test_validate_zero_length_accepted() {
        assert!(validate_length(0, 0).is_ok());
        assert!(validate_length(0, 16).is_ok());
    }

    #[test]
    fn test_validate_negative_length_rejected() {
        let result = validate_length(-1, 0);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("negative packet length"));
    }

    #[test]
    fn test_validate_over_maximum_rejected() {
        let result = validate_length(101, 100);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_zero_maximum_means_unlimited() {
        assert!(validate_length(i32::MAX, 0).is_ok());
    }

    #[test]
    fn test_validate_at_maximum_accepted() {
        assert!(validate_length(100, 100).is_ok());
    }
}
