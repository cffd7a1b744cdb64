//! Byte/word order for multi-byte register values
//!
//! Uses ABCD notation where A is the most significant byte. For the 32-bit
//! value `0x12345678`:
//! - `ABCD`: [0x12, 0x34, 0x56, 0x78]
//! - `DCBA`: [0x78, 0x56, 0x34, 0x12]
//! - `CDAB`: [0x56, 0x78, 0x12, 0x34] (common on Modbus PLCs)
//! - `BADC`: [0x34, 0x12, 0x78, 0x56]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Byte/word order used by a driver's wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ByteOrder {
    /// Big-endian, network order
    #[default]
    Abcd,
    /// Little-endian
    Dcba,
    /// Big-endian words, swapped
    Cdab,
    /// Little-endian words, swapped
    Badc,
}

impl ByteOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abcd => "ABCD",
            Self::Dcba => "DCBA",
            Self::Cdab => "CDAB",
            Self::Badc => "BADC",
        }
    }

    /// Reorder big-endian value bytes to wire order (and back).
    ///
    /// Every permutation here is its own inverse, so the same call serves
    /// both encoding and decoding.
    pub fn permute_2(&self, b: [u8; 2]) -> [u8; 2] {
        match self {
            Self::Abcd | Self::Cdab => b,
            Self::Dcba | Self::Badc => [b[1], b[0]],
        }
    }

    /// See [`ByteOrder::permute_2`].
    pub fn permute_4(&self, b: [u8; 4]) -> [u8; 4] {
        match self {
            Self::Abcd => b,
            Self::Dcba => [b[3], b[2], b[1], b[0]],
            Self::Cdab => [b[2], b[3], b[0], b[1]],
            Self::Badc => [b[1], b[0], b[3], b[2]],
        }
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['-', '_'], "");
        match normalized.as_str() {
            "ABCD" | "BE" | "BIGENDIAN" | "AB" => Ok(Self::Abcd),
            "DCBA" | "LE" | "LITTLEENDIAN" | "BA" => Ok(Self::Dcba),
            "CDAB" | "BIGENDIANSWAP" => Ok(Self::Cdab),
            "BADC" | "LITTLEENDIANSWAP" => Ok(Self::Badc),
            _ => Err(format!("unknown byte order '{}'", s)),
        }
    }
}

impl TryFrom<String> for ByteOrder {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ByteOrder> for String {
    fn from(value: ByteOrder) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permute_4_layouts() {
        let be = 0x1234_5678u32.to_be_bytes();
        assert_eq!(ByteOrder::Abcd.permute_4(be), [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(ByteOrder::Dcba.permute_4(be), [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(ByteOrder::Cdab.permute_4(be), [0x56, 0x78, 0x12, 0x34]);
        assert_eq!(ByteOrder::Badc.permute_4(be), [0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("abcd".parse::<ByteOrder>().unwrap(), ByteOrder::Abcd);
        assert_eq!("CD-AB".parse::<ByteOrder>().unwrap(), ByteOrder::Cdab);
        assert_eq!("little_endian".parse::<ByteOrder>().unwrap(), ByteOrder::Dcba);
        assert!("XYZW".parse::<ByteOrder>().is_err());
    }
}
