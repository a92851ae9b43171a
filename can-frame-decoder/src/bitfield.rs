//! Bit field codec
//!
//! Extracts and assembles integers inside CAN payloads given a start bit, a
//! length, a byte order and a signedness. All functions are pure.

use crate::types::{DecoderError, Result};
use serde::{Deserialize, Serialize};

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Number of bytes a field occupies when counted from byte 0
pub fn required_bytes(start_bit: usize, length: usize) -> usize {
    (start_bit + length + 7) / 8
}

/// Extract a raw integer from `data`.
///
/// Fails with [`DecoderError::InsufficientData`] when the field reaches past the
/// end of `data`, and with [`DecoderError::InvalidSignalDefinition`] when the
/// length is outside 1..=64. Unsigned 64-bit fields wrap into `i64`.
pub fn extract(
    data: &[u8],
    start_bit: usize,
    length: usize,
    byte_order: ByteOrder,
    signed: bool,
) -> Result<i64> {
    check_length(length)?;

    let required = required_bytes(start_bit, length);
    if required > data.len() {
        return Err(DecoderError::InsufficientData {
            required,
            available: data.len(),
        });
    }

    let raw = match byte_order {
        ByteOrder::LittleEndian => extract_little_endian(data, start_bit, length),
        ByteOrder::BigEndian => extract_big_endian(data, start_bit, length),
    };

    Ok(if signed {
        sign_extend(raw, length)
    } else {
        raw as i64
    })
}

/// Write the low `length` bits of `raw` into `data` with the same layout
/// [`extract`] reads. Bits outside the field are left untouched.
pub fn insert(
    data: &mut [u8],
    start_bit: usize,
    length: usize,
    byte_order: ByteOrder,
    raw: i64,
) -> Result<()> {
    check_length(length)?;

    let required = required_bytes(start_bit, length);
    if required > data.len() {
        return Err(DecoderError::InsufficientData {
            required,
            available: data.len(),
        });
    }

    let raw = raw as u64;
    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let (bit_in_byte, value_bit) = match byte_order {
            ByteOrder::LittleEndian => (bit_pos % 8, i),
            ByteOrder::BigEndian => (7 - (bit_pos % 8), length - 1 - i),
        };

        let mask = 1u8 << bit_in_byte;
        if (raw >> value_bit) & 0x01 == 1 {
            data[byte_idx] |= mask;
        } else {
            data[byte_idx] &= !mask;
        }
    }

    Ok(())
}

fn check_length(length: usize) -> Result<()> {
    if length == 0 || length > 64 {
        return Err(DecoderError::InvalidSignalDefinition(format!(
            "bit length {} is outside 1..=64",
            length
        )));
    }
    Ok(())
}

/// Little-endian (Intel): result bit `i` comes from frame bit `start_bit + i`,
/// bits counted LSB-first within each byte.
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;

    for i in 0..length {
        let bit_pos = start_bit + i;
        let bit_value = (data[bit_pos / 8] >> (bit_pos % 8)) & 0x01;
        result |= (bit_value as u64) << i;
    }

    result
}

/// Big-endian (Motorola): bit 0 is the MSB of byte 0 and the first bit read
/// becomes the MSB of the result.
fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;

    for i in 0..length {
        let bit_pos = start_bit + i;
        let bit_in_byte = 7 - (bit_pos % 8);
        let bit_value = (data[bit_pos / 8] >> bit_in_byte) & 0x01;
        result |= (bit_value as u64) << (length - 1 - i);
    }

    result
}

/// Sign-extend a value from N bits to 64 bits (subtracts 2^N when bit N-1 is set)
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_unsigned() {
        let value = extract(&[0x42], 0, 8, ByteOrder::LittleEndian, false).unwrap();
        assert_eq!(value, 66);
    }

    #[test]
    fn test_single_byte_signed() {
        let value = extract(&[0xFF], 0, 8, ByteOrder::LittleEndian, true).unwrap();
        assert_eq!(value, -1);
    }

    #[test]
    fn test_big_endian_word() {
        let value = extract(&[0x12, 0x34], 0, 16, ByteOrder::BigEndian, false).unwrap();
        assert_eq!(value, 0x1234);
    }

    #[test]
    fn test_little_endian_cross_byte() {
        let data = [0xAB, 0xCD, 0xEF, 0x12];
        let value = extract(&data, 0, 16, ByteOrder::LittleEndian, false).unwrap();
        assert_eq!(value, 0xCDAB);
    }

    #[test]
    fn test_little_endian_unaligned_nibble() {
        // bits 4..8 of 0xAB are 0xA
        let value = extract(&[0xAB], 4, 4, ByteOrder::LittleEndian, false).unwrap();
        assert_eq!(value, 0xA);
    }

    #[test]
    fn test_sign_extend_16bit() {
        let value = extract(&[0x00, 0x80], 0, 16, ByteOrder::LittleEndian, true).unwrap();
        assert_eq!(value, -32768);

        let value = extract(&[0xFF, 0x7F], 0, 16, ByteOrder::LittleEndian, true).unwrap();
        assert_eq!(value, 32767);
    }

    #[test]
    fn test_insufficient_data() {
        let err = extract(&[0x01], 4, 8, ByteOrder::LittleEndian, false).unwrap_err();
        match err {
            DecoderError::InsufficientData { required, available } => {
                assert_eq!(required, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(extract(&[], 0, 1, ByteOrder::BigEndian, false).is_err());
    }

    #[test]
    fn test_invalid_length() {
        assert!(matches!(
            extract(&[0; 8], 0, 0, ByteOrder::LittleEndian, false),
            Err(DecoderError::InvalidSignalDefinition(_))
        ));
        assert!(matches!(
            extract(&[0; 16], 0, 65, ByteOrder::LittleEndian, false),
            Err(DecoderError::InvalidSignalDefinition(_))
        ));
    }

    #[test]
    fn test_full_width_fields() {
        let data = [0xFF; 8];
        assert_eq!(extract(&data, 0, 64, ByteOrder::LittleEndian, true).unwrap(), -1);
        assert_eq!(extract(&data, 0, 64, ByteOrder::BigEndian, false).unwrap(), -1);
    }

    #[test]
    fn test_insert_preserves_neighbours() {
        let mut data = [0xFF, 0xFF];
        insert(&mut data, 4, 8, ByteOrder::LittleEndian, 0).unwrap();
        assert_eq!(data, [0x0F, 0xF0]);

        let mut data = [0x00, 0x00];
        insert(&mut data, 0, 16, ByteOrder::BigEndian, 0x1234).unwrap();
        assert_eq!(data, [0x12, 0x34]);
    }

    #[test]
    fn test_insert_then_extract_signed() {
        let mut data = [0u8; 8];
        insert(&mut data, 12, 10, ByteOrder::LittleEndian, -5).unwrap();
        assert_eq!(extract(&data, 12, 10, ByteOrder::LittleEndian, true).unwrap(), -5);

        insert(&mut data, 40, 12, ByteOrder::BigEndian, -300).unwrap();
        assert_eq!(extract(&data, 40, 12, ByteOrder::BigEndian, true).unwrap(), -300);
    }

    #[test]
    fn test_insert_insufficient_data() {
        let mut data = [0u8; 1];
        assert!(insert(&mut data, 0, 9, ByteOrder::LittleEndian, 1).is_err());
    }
}
