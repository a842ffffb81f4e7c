//! Byte order of header fields and register stream values

use serde::{Deserialize, Serialize};

/// Byte order used by a protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    pub fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Endianness::Big => u16::from_be_bytes(bytes),
            Endianness::Little => u16::from_le_bytes(bytes),
        }
    }

    pub fn read_i16(self, bytes: [u8; 2]) -> i16 {
        match self {
            Endianness::Big => i16::from_be_bytes(bytes),
            Endianness::Little => i16::from_le_bytes(bytes),
        }
    }

    pub fn encode_u16(self, value: u16) -> [u8; 2] {
        match self {
            Endianness::Big => value.to_be_bytes(),
            Endianness::Little => value.to_le_bytes(),
        }
    }

    pub fn encode_i16(self, value: i16) -> [u8; 2] {
        match self {
            Endianness::Big => value.to_be_bytes(),
            Endianness::Little => value.to_le_bytes(),
        }
    }
}
