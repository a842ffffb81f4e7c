//! Frame header parsing
//!
//! The header is a fixed 5-byte segment in front of the compressed payload.
//! Two layouts have been deployed:
//!
//! ```text
//! Counted (dynamic generations)       Legacy (fixed 47-byte frames)
//! offset 0..2  sample_count  u16      offset 0  compression method (must be 0)
//! offset 2     register_count u8      offset 1  sample_count       u8
//! offset 3..5  compressed_size u16    offset 2  register_count     u8
//!                                     offset 3..5 compressed_size  u16 LE
//! ```
//!
//! Independently of the layout, fields are checked either against the open
//! ranges (1..=1000 samples, 1..=50 registers, 1..=10000 payload bytes) or
//! against one hard-coded expectation.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::protocol::{
    FIXED_COMPRESSED_SIZE, FIXED_REGISTER_COUNT, FIXED_SAMPLE_COUNT, HEADER_LEN,
    MAX_COMPRESSED_SIZE, MAX_REGISTER_COUNT, MAX_SAMPLE_COUNT,
};
use crate::types::{Endianness, FrameHeader, PayloadShape};
use crate::{Result, UplinkError};

/// Byte layout of the 5 header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderLayout {
    /// `u16 sample_count, u8 register_count, u16 compressed_size` in the given order
    Counted(Endianness),
    /// `u8 method, u8 sample_count, u8 register_count, u16 LE compressed_size`
    Legacy,
}

/// How parsed fields are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderValidation {
    /// Open ranges up to the protocol maxima
    Range,
    /// Each field must equal the given value
    Exact { sample_count: u16, register_count: u8, compressed_size: u16 },
}

impl HeaderValidation {
    /// Expectation of the first-generation firmware (5 readings × 10 registers, 40 bytes).
    pub const FIXED: HeaderValidation = HeaderValidation::Exact {
        sample_count: FIXED_SAMPLE_COUNT,
        register_count: FIXED_REGISTER_COUNT,
        compressed_size: FIXED_COMPRESSED_SIZE,
    };
}

/// Parser for the 5-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderParser {
    layout: HeaderLayout,
    validation: HeaderValidation,
}

impl HeaderParser {
    pub fn new(layout: HeaderLayout, validation: HeaderValidation) -> Self {
        Self { layout, validation }
    }

    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    /// Byte order of the stream values that follow this header.
    pub fn endianness(&self) -> Endianness {
        match self.layout {
            HeaderLayout::Counted(order) => order,
            HeaderLayout::Legacy => Endianness::Little,
        }
    }

    /// Parse and validate the first [`HEADER_LEN`] bytes of `bytes`.
    pub fn parse(&self, bytes: &[u8]) -> Result<FrameHeader> {
        let Some(header) = bytes.get(..HEADER_LEN) else {
            return Err(UplinkError::header_field(
                "header",
                bytes.len() as u32,
                format!("expected {} header bytes", HEADER_LEN),
            ));
        };

        let (sample_count, register_count, compressed_size) = match self.layout {
            HeaderLayout::Counted(order) => (
                order.read_u16([header[0], header[1]]),
                header[2],
                order.read_u16([header[3], header[4]]),
            ),
            HeaderLayout::Legacy => {
                if header[0] != 0 {
                    return Err(UplinkError::header_field(
                        "compression_method",
                        header[0] as u32,
                        "only method 0 (delta + run-length) is supported",
                    ));
                }
                (header[1] as u16, header[2], u16::from_le_bytes([header[3], header[4]]))
            }
        };

        trace!(
            "Header fields: samples={}, registers={}, compressed_size={}",
            sample_count, register_count, compressed_size
        );

        self.validate(sample_count, register_count, compressed_size)?;

        Ok(FrameHeader { shape: PayloadShape::Raw, sample_count, register_count, compressed_size })
    }

    fn validate(&self, sample_count: u16, register_count: u8, compressed_size: u16) -> Result<()> {
        match self.validation {
            HeaderValidation::Range => {
                if !(1..=MAX_SAMPLE_COUNT).contains(&sample_count) {
                    return Err(UplinkError::header_field(
                        "sample_count",
                        sample_count as u32,
                        format!("must be between 1 and {}", MAX_SAMPLE_COUNT),
                    ));
                }
                if !(1..=MAX_REGISTER_COUNT).contains(&register_count) {
                    return Err(UplinkError::header_field(
                        "register_count",
                        register_count as u32,
                        format!("must be between 1 and {}", MAX_REGISTER_COUNT),
                    ));
                }
                if !(1..=MAX_COMPRESSED_SIZE).contains(&compressed_size) {
                    return Err(UplinkError::header_field(
                        "compressed_size",
                        compressed_size as u32,
                        format!("must be between 1 and {}", MAX_COMPRESSED_SIZE),
                    ));
                }
            }
            HeaderValidation::Exact {
                sample_count: expected_samples,
                register_count: expected_registers,
                compressed_size: expected_size,
            } => {
                if sample_count != expected_samples {
                    return Err(UplinkError::header_field(
                        "sample_count",
                        sample_count as u32,
                        format!("expected exactly {}", expected_samples),
                    ));
                }
                if register_count != expected_registers {
                    return Err(UplinkError::header_field(
                        "register_count",
                        register_count as u32,
                        format!("expected exactly {}", expected_registers),
                    ));
                }
                if compressed_size != expected_size {
                    return Err(UplinkError::header_field(
                        "compressed_size",
                        compressed_size as u32,
                        format!("expected exactly {}", expected_size),
                    ));
                }
            }
        }
        Ok(())
    }
}
