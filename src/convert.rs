//! Converters - string/int/bool/bytes primitives
//!
//! Integers are carried as `i128`, which covers every signed and unsigned
//! width the engine serializes (up to 16 bytes).

use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

pub const MAX_INT_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "big" | "be" | "big_endian" => Some(Self::Big),
            "little" | "le" | "little_endian" => Some(Self::Little),
            _ => None,
        }
    }
}

/// Parse a decimal, `0x` hex or `0b` binary integer. Underscores are ignored.
pub fn parse_int(text: &str) -> Result<i128, ConvertError> {
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let cleaned: String = body.chars().filter(|c| *c != '_').collect();
    let lower = cleaned.to_ascii_lowercase();

    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        u128::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u128::from_str_radix(bin, 2).ok()
    } else if !lower.is_empty() && lower.chars().all(|c| c.is_ascii_digit()) {
        lower.parse::<u128>().ok()
    } else {
        None
    };

    let magnitude = parsed.ok_or_else(|| ConvertError::InvalidInt(text.to_string()))?;
    if negative {
        if magnitude > i128::MAX as u128 + 1 {
            return Err(ConvertError::InvalidInt(text.to_string()));
        }
        Ok((magnitude as i128).wrapping_neg())
    } else {
        i128::try_from(magnitude).map_err(|_| ConvertError::InvalidInt(text.to_string()))
    }
}

pub fn parse_bool(text: &str) -> Result<bool, ConvertError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConvertError::InvalidBool(text.to_string())),
    }
}

/// Parse hex text such as `DEADBEEF`, `de ad be ef` or `0xdeadbeef`.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, ConvertError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let cleaned: String = body
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '_')
        .collect();
    hex::decode(&cleaned).map_err(|_| ConvertError::InvalidHex(text.to_string()))
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Range of values representable in `size` bytes.
pub fn int_bounds(size: usize, signed: bool) -> Result<(i128, i128), ConvertError> {
    if size == 0 || size > MAX_INT_BYTES {
        return Err(ConvertError::TooWide(size));
    }
    let bits = size as u32 * 8;
    Ok(if signed {
        if bits == 128 {
            (i128::MIN, i128::MAX)
        } else {
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        }
    } else if bits >= 127 {
        // i128 cannot hold the full unsigned 16-byte range
        (0, i128::MAX)
    } else {
        (0, (1i128 << bits) - 1)
    })
}

/// Serialize an integer into exactly `size` bytes, erroring rather than wrapping.
pub fn int_to_bytes(
    value: i128,
    size: usize,
    signed: bool,
    order: ByteOrder,
) -> Result<Vec<u8>, ConvertError> {
    let (min, max) = int_bounds(size, signed)?;
    if value < min || value > max {
        return Err(ConvertError::Overflow { value, size, signed });
    }
    let full = value.to_le_bytes();
    let mut out = full[..size].to_vec();
    if order == ByteOrder::Big {
        out.reverse();
    }
    Ok(out)
}

pub fn bytes_to_int(bytes: &[u8], signed: bool, order: ByteOrder) -> Result<i128, ConvertError> {
    if bytes.len() > MAX_INT_BYTES {
        return Err(ConvertError::TooWide(bytes.len()));
    }
    if bytes.is_empty() {
        return Ok(0);
    }
    let mut le = bytes.to_vec();
    if order == ByteOrder::Big {
        le.reverse();
    }
    let negative = signed && le[le.len() - 1] & 0x80 != 0;
    let mut full = if negative { [0xFFu8; 16] } else { [0u8; 16] };
    full[..le.len()].copy_from_slice(&le);
    let value = i128::from_le_bytes(full);
    if !signed && value < 0 {
        // 16-byte unsigned values beyond i128::MAX
        return Err(ConvertError::TooWide(bytes.len()));
    }
    Ok(value)
}

/// Big-endian bytes-to-int used by formula coercions. Leading zeros are
/// stripped so long zero-padded sequences still convert.
pub fn be_bytes_to_uint(bytes: &[u8]) -> Result<i128, ConvertError> {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes_to_int(&bytes[first..], false, ByteOrder::Big)
}

/// Minimal big-endian representation of a non-negative integer (at least one byte).
pub fn uint_to_min_be_bytes(value: i128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

/// Fit `value` into `size` bytes with the pad byte. Over-long input is an
/// error, never truncated.
pub fn pad_to(value: &[u8], size: usize, pad: u8, align_end: bool) -> Result<Vec<u8>, ConvertError> {
    if value.len() > size {
        return Err(ConvertError::TooLong {
            actual: value.len(),
            size,
        });
    }
    let fill = vec![pad; size - value.len()];
    Ok(if align_end {
        [fill.as_slice(), value].concat()
    } else {
        [value, fill.as_slice()].concat()
    })
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_forms() {
        assert_eq!(parse_int("42").unwrap(), 42);
        assert_eq!(parse_int("0x2A").unwrap(), 42);
        assert_eq!(parse_int("0b101010").unwrap(), 42);
        assert_eq!(parse_int("-0x10").unwrap(), -16);
        assert_eq!(parse_int("1_000").unwrap(), 1000);
        assert!(parse_int("12abc").is_err());
        assert!(parse_int("").is_err());
    }

    #[test]
    fn test_parse_bool_case_insensitive() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("False").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("DE AD be ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex_bytes("0x0102").unwrap(), vec![1, 2]);
        assert!(parse_hex_bytes("abc").is_err());
    }

    #[test]
    fn test_every_representable_value_round_trips() {
        for size in 1..=2usize {
            for signed in [false, true] {
                let (min, max) = int_bounds(size, signed).unwrap();
                for order in [ByteOrder::Big, ByteOrder::Little] {
                    for v in min..=max {
                        let bytes = int_to_bytes(v, size, signed, order).unwrap();
                        assert_eq!(bytes.len(), size);
                        assert_eq!(bytes_to_int(&bytes, signed, order).unwrap(), v);
                    }
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_never_wraps() {
        assert!(matches!(
            int_to_bytes(256, 1, false, ByteOrder::Little),
            Err(ConvertError::Overflow { .. })
        ));
        assert!(int_to_bytes(-1, 4, false, ByteOrder::Little).is_err());
        assert!(int_to_bytes(128, 1, true, ByteOrder::Little).is_err());
        assert_eq!(int_to_bytes(-128, 1, true, ByteOrder::Little).unwrap(), vec![0x80]);
    }

    #[test]
    fn test_byte_order() {
        assert_eq!(int_to_bytes(0x1234, 2, false, ByteOrder::Big).unwrap(), vec![0x12, 0x34]);
        assert_eq!(int_to_bytes(0x1234, 2, false, ByteOrder::Little).unwrap(), vec![0x34, 0x12]);
    }

    #[test]
    fn test_pad_to() {
        assert_eq!(pad_to(&[1, 2], 4, 0xFF, false).unwrap(), vec![1, 2, 0xFF, 0xFF]);
        assert_eq!(pad_to(&[1, 2], 4, 0x00, true).unwrap(), vec![0, 0, 1, 2]);
        assert!(pad_to(&[1, 2, 3], 2, 0, false).is_err());
    }

    #[test]
    fn test_be_coercion_strips_leading_zeros() {
        let mut long = vec![0u8; 20];
        long[19] = 5;
        assert_eq!(be_bytes_to_uint(&long).unwrap(), 5);
        assert_eq!(uint_to_min_be_bytes(0x0102), vec![1, 2]);
        assert_eq!(uint_to_min_be_bytes(0), vec![0]);
    }
}
