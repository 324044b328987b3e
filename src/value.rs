//! Dynamic values produced by formulas and held by nodes.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::convert::{self, be_bytes_to_uint, uint_to_min_be_bytes};
use crate::error::ConvertError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int(i128),
    Bool(bool),
    Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
    Str(String),
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Bytes(_) => "bytes",
            Self::Str(_) => "string",
        }
    }

    pub fn as_int(&self) -> Result<i128, ConvertError> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::Bool(b) => Ok(i128::from(*b)),
            Self::Bytes(b) => be_bytes_to_uint(b),
            Self::Str(s) => convert::parse_int(s),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ConvertError> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Int(v) => Ok(*v != 0),
            Self::Bytes(b) => Ok(b.iter().any(|x| *x != 0)),
            Self::Str(s) => convert::parse_bool(s),
        }
    }

    /// Truthiness for conditions: unlike `as_bool`, strings are true when non-empty
    /// unless they spell a boolean.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Str(s) => convert::parse_bool(s).unwrap_or(!s.is_empty()),
            other => other.as_bool().unwrap_or(false),
        }
    }

    pub fn as_bytes(&self) -> Result<Vec<u8>, ConvertError> {
        match self {
            Self::Bytes(b) => Ok(b.clone()),
            Self::Str(s) => Ok(s.as_bytes().to_vec()),
            Self::Bool(b) => Ok(vec![u8::from(*b)]),
            Self::Int(v) if *v >= 0 => Ok(uint_to_min_be_bytes(*v)),
            Self::Int(_) => Err(ConvertError::Incompatible {
                from: "negative int",
                to: "bytes",
            }),
        }
    }

    pub fn as_string(&self) -> Result<String, ConvertError> {
        match self {
            Self::Str(s) => Ok(s.clone()),
            Self::Bytes(b) => String::from_utf8(b.clone()).map_err(|_| ConvertError::InvalidUtf8),
            Self::Int(v) => Ok(v.to_string()),
            Self::Bool(b) => Ok(b.to_string()),
        }
    }

    /// Compare two values after coercing them to a common type:
    /// bytes vs int compares as big-endian integers, bytes vs string as UTF-8.
    pub fn compare(&self, other: &Self) -> Result<Ordering, ConvertError> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Ok(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Ok(a.cmp(b)),
            (Self::Bytes(_), Self::Str(b)) => Ok(self.as_string()?.as_str().cmp(b.as_str())),
            (Self::Str(a), Self::Bytes(_)) => Ok(a.as_str().cmp(other.as_string()?.as_str())),
            // Non-numeric text against a number never compares equal
            (Self::Str(s), _) | (_, Self::Str(s))
                if convert::parse_int(s).is_err() && convert::parse_bool(s).is_err() =>
            {
                Err(ConvertError::Incompatible {
                    from: "string",
                    to: "int",
                })
            }
            _ => Ok(self.as_int()?.cmp(&other.as_int()?)),
        }
    }

    pub fn loosely_equals(&self, other: &Self) -> bool {
        matches!(self.compare(other), Ok(Ordering::Equal))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i128> for Value {
    fn from(v: i128) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_int_coercion_is_big_endian() {
        let bytes = Value::Bytes(vec![0x01, 0x00]);
        assert_eq!(bytes.as_int().unwrap(), 256);
        assert!(bytes.loosely_equals(&Value::Int(256)));
    }

    #[test]
    fn test_bytes_string_coercion_is_utf8() {
        let bytes = Value::Bytes(b"abc".to_vec());
        assert!(bytes.loosely_equals(&Value::Str("abc".into())));
        assert!(!bytes.loosely_equals(&Value::Str("abd".into())));
    }

    #[test]
    fn test_string_vs_int_mismatch_is_not_equal() {
        assert!(!Value::Str("abc".into()).loosely_equals(&Value::Int(0)));
        assert!(Value::Str("0x10".into()).loosely_equals(&Value::Int(16)));
    }

    #[test]
    fn test_serde_bytes_as_hex() {
        let json = serde_json::to_string(&Value::Bytes(vec![0xab, 0x01])).unwrap();
        assert_eq!(json, r#"{"type":"bytes","value":"ab01"}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Bytes(vec![0xab, 0x01]));
    }
}
