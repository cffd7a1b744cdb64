//! Point decoder
//!
//! Stateless conversion between raw register/byte payloads and typed point
//! values. Bit 0 is the least significant bit of a byte. Multi-byte values
//! honour the driver's [`ByteOrder`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::byte_order::ByteOrder;
use crate::error::{CommError, Result};

/// Point data type with a fixed wire length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    Bool,
    Byte,
    SByte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float,
}

impl DataType {
    /// Bytes read from the buffer for this type; a bit occupies its byte.
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Bool | Self::Byte | Self::SByte => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float => 4,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "Bool",
            Self::Byte => "Byte",
            Self::SByte => "SByte",
            Self::Int16 => "Int16",
            Self::UInt16 => "UInt16",
            Self::Int32 => "Int32",
            Self::UInt32 => "UInt32",
            Self::Float => "Float",
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bool" | "bit" | "boolean" => Ok(Self::Bool),
            "byte" | "uint8" | "u8" => Ok(Self::Byte),
            "sbyte" | "int8" | "i8" => Ok(Self::SByte),
            "int16" | "short" | "i16" => Ok(Self::Int16),
            "uint16" | "word" | "ushort" | "u16" => Ok(Self::UInt16),
            "int32" | "int" | "dint" | "i32" => Ok(Self::Int32),
            "uint32" | "dword" | "uint" | "u32" => Ok(Self::UInt32),
            "float" | "float32" | "real" | "f32" => Ok(Self::Float),
            other => Err(format!("unknown data type '{}'", other)),
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded point value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypedValue {
    Bool(bool),
    Byte(u8),
    SByte(i8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float(f32),
}

impl TypedValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Byte(_) => DataType::Byte,
            Self::SByte(_) => DataType::SByte,
            Self::Int16(_) => DataType::Int16,
            Self::UInt16(_) => DataType::UInt16,
            Self::Int32(_) => DataType::Int32,
            Self::UInt32(_) => DataType::UInt32,
            Self::Float(_) => DataType::Float,
        }
    }

    /// Numeric view used for deadband and alarm limits; `true` is 1.0
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            },
            Self::Byte(v) => f64::from(v),
            Self::SByte(v) => f64::from(v),
            Self::Int16(v) => f64::from(v),
            Self::UInt16(v) => f64::from(v),
            Self::Int32(v) => f64::from(v),
            Self::UInt32(v) => f64::from(v),
            Self::Float(v) => f64::from(v),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", u8::from(*v)),
            Self::Byte(v) => write!(f, "{}", v),
            Self::SByte(v) => write!(f, "{}", v),
            Self::Int16(v) => write!(f, "{}", v),
            Self::UInt16(v) => write!(f, "{}", v),
            Self::Int32(v) => write!(f, "{}", v),
            Self::UInt32(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Extract a typed value from `buffer` at `byte_offset`.
///
/// `bit` is only consulted for [`DataType::Bool`] and must be in 0..=7.
pub fn decode(
    buffer: &[u8],
    byte_offset: usize,
    bit: u8,
    data_type: DataType,
    order: ByteOrder,
) -> Result<TypedValue> {
    if data_type.is_bool() && bit > 7 {
        return Err(CommError::OutOfRange { bit });
    }

    let needed = byte_offset.saturating_add(data_type.byte_len());
    if buffer.len() < needed {
        return Err(CommError::BufferTooShort {
            needed,
            actual: buffer.len(),
        });
    }
    let raw = &buffer[byte_offset..needed];

    let value = match data_type {
        DataType::Bool => TypedValue::Bool((raw[0] >> bit) & 1 == 1),
        DataType::Byte => TypedValue::Byte(raw[0]),
        DataType::SByte => TypedValue::SByte(raw[0] as i8),
        DataType::Int16 => TypedValue::Int16(i16::from_be_bytes(order.permute_2([raw[0], raw[1]]))),
        DataType::UInt16 => {
            TypedValue::UInt16(u16::from_be_bytes(order.permute_2([raw[0], raw[1]])))
        },
        DataType::Int32 => TypedValue::Int32(i32::from_be_bytes(order.permute_4(word4(raw)))),
        DataType::UInt32 => TypedValue::UInt32(u32::from_be_bytes(order.permute_4(word4(raw)))),
        DataType::Float => TypedValue::Float(f32::from_be_bytes(order.permute_4(word4(raw)))),
    };
    Ok(value)
}

/// Encode a value to its wire bytes; exact inverse of [`decode`].
///
/// A boolean encodes to a single byte with bit 0 set or clear.
pub fn encode(value: &TypedValue, order: ByteOrder) -> Vec<u8> {
    match *value {
        TypedValue::Bool(v) => vec![u8::from(v)],
        TypedValue::Byte(v) => vec![v],
        TypedValue::SByte(v) => vec![v as u8],
        TypedValue::Int16(v) => order.permute_2(v.to_be_bytes()).to_vec(),
        TypedValue::UInt16(v) => order.permute_2(v.to_be_bytes()).to_vec(),
        TypedValue::Int32(v) => order.permute_4(v.to_be_bytes()).to_vec(),
        TypedValue::UInt32(v) => order.permute_4(v.to_be_bytes()).to_vec(),
        TypedValue::Float(v) => order.permute_4(v.to_be_bytes()).to_vec(),
    }
}

/// Set or clear one bit of a byte
pub fn set_bit(byte: u8, bit: u8, value: bool) -> Result<u8> {
    if bit > 7 {
        return Err(CommError::OutOfRange { bit });
    }
    Ok(if value {
        byte | (1 << bit)
    } else {
        byte & !(1 << bit)
    })
}

fn word4(raw: &[u8]) -> [u8; 4] {
    [raw[0], raw[1], raw[2], raw[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: [ByteOrder; 4] = [
        ByteOrder::Abcd,
        ByteOrder::Dcba,
        ByteOrder::Cdab,
        ByteOrder::Badc,
    ];

    #[test]
    fn test_bool_extracts_every_bit() {
        for b in 0..=255u8 {
            for bit in 0..8u8 {
                let v = decode(&[b], 0, bit, DataType::Bool, ByteOrder::Abcd).unwrap();
                assert_eq!(v, TypedValue::Bool((b >> bit) & 1 == 1));
            }
        }
    }

    #[test]
    fn test_bit_index_out_of_range() {
        for bit in [8u8, 9, 15, 255] {
            let err = decode(&[0xFF], 0, bit, DataType::Bool, ByteOrder::Abcd).unwrap_err();
            assert_eq!(err, CommError::OutOfRange { bit });
        }
        // Checked before the buffer, so an empty buffer still reports the bit
        let err = decode(&[], 0, 8, DataType::Bool, ByteOrder::Abcd).unwrap_err();
        assert_eq!(err, CommError::OutOfRange { bit: 8 });
    }

    #[test]
    fn test_buffer_too_short() {
        let buf = [0u8; 5];
        let err = decode(&buf, 2, 0, DataType::Float, ByteOrder::Abcd).unwrap_err();
        assert_eq!(
            err,
            CommError::BufferTooShort {
                needed: 6,
                actual: 5
            }
        );
        assert!(matches!(
            decode(&buf, 5, 0, DataType::Bool, ByteOrder::Abcd),
            Err(CommError::BufferTooShort { .. })
        ));
        assert!(matches!(
            decode(&buf, usize::MAX, 0, DataType::Int16, ByteOrder::Abcd),
            Err(CommError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_round_trip_representative_values() {
        let values = [
            TypedValue::Bool(true),
            TypedValue::Bool(false),
            TypedValue::Byte(0),
            TypedValue::Byte(u8::MAX),
            TypedValue::SByte(i8::MIN),
            TypedValue::SByte(-1),
            TypedValue::Int16(i16::MIN),
            TypedValue::Int16(-1234),
            TypedValue::UInt16(u16::MAX),
            TypedValue::UInt16(0x1234),
            TypedValue::Int32(i32::MIN),
            TypedValue::Int32(-7),
            TypedValue::UInt32(u32::MAX),
            TypedValue::UInt32(0x1234_5678),
            TypedValue::Float(-273.15),
            TypedValue::Float(f32::MAX),
            TypedValue::Float(0.0),
        ];
        for order in ORDERS {
            for v in values {
                let bytes = encode(&v, order);
                assert_eq!(bytes.len(), v.data_type().byte_len());
                let back = decode(&bytes, 0, 0, v.data_type(), order).unwrap();
                assert_eq!(back, v, "order {order}");
            }
        }
    }

    #[test]
    fn test_decode_at_offset_with_word_swap() {
        // Float 1.0 = 0x3F800000, CDAB on the wire = 00 00 3F 80
        let buf = [0xAA, 0xBB, 0x00, 0x00, 0x3F, 0x80];
        let v = decode(&buf, 2, 0, DataType::Float, ByteOrder::Cdab).unwrap();
        assert_eq!(v, TypedValue::Float(1.0));
    }

    #[test]
    fn test_set_bit() {
        assert_eq!(set_bit(0b0000_0000, 3, true).unwrap(), 0b0000_1000);
        assert_eq!(set_bit(0b1111_1111, 0, false).unwrap(), 0b1111_1110);
        assert!(set_bit(0, 8, true).is_err());
    }

    #[test]
    fn test_data_type_aliases() {
        assert_eq!("real".parse::<DataType>().unwrap(), DataType::Float);
        assert_eq!("WORD".parse::<DataType>().unwrap(), DataType::UInt16);
        assert_eq!("bit".parse::<DataType>().unwrap(), DataType::Bool);
        assert!("double".parse::<DataType>().is_err());
    }
}
