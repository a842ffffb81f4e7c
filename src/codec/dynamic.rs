//! Variable-length frames of the current firmware
//!
//! ```text
//! metadata_flag: u8      0x00 raw samples, anything else aggregated (unsupported)
//! header: [u8; 5]        big-endian sample_count / register_count / compressed_size
//! payload                exactly compressed_size bytes of token streams
//! crc: u16 LE            over every preceding byte
//! ```

use std::ops::RangeInclusive;

use tracing::debug;

use super::{
    CrcVariant, DecodedFrame, Decompressor, FrameCodec, HeaderLayout, HeaderParser,
    HeaderValidation, ProtocolGeneration,
};
use crate::protocol::{DYNAMIC_MAX_FRAME_LEN, DYNAMIC_MIN_FRAME_LEN, HEADER_LEN, METADATA_LEN};
use crate::types::{Endianness, PayloadShape};
use crate::{Result, UplinkError};

/// Codec for the dynamic generations, parameterized by CRC algorithm.
#[derive(Debug, Clone, Copy)]
pub struct DynamicFrameCodec {
    crc: CrcVariant,
    parser: HeaderParser,
    decompressor: Decompressor,
}

impl DynamicFrameCodec {
    pub fn new(crc: CrcVariant) -> Self {
        Self {
            crc,
            parser: HeaderParser::new(HeaderLayout::Counted(Endianness::Big), HeaderValidation::Range),
            decompressor: Decompressor::new(Endianness::Big),
        }
    }

    pub fn crc(&self) -> CrcVariant {
        self.crc
    }
}

impl FrameCodec for DynamicFrameCodec {
    fn generation(&self) -> ProtocolGeneration {
        match self.crc {
            CrcVariant::Modbus => ProtocolGeneration::Dynamic,
            CrcVariant::Ccitt => ProtocolGeneration::DynamicCcitt,
        }
    }

    fn frame_bounds(&self) -> RangeInclusive<usize> {
        DYNAMIC_MIN_FRAME_LEN..=DYNAMIC_MAX_FRAME_LEN
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodedFrame> {
        self.check_length(frame)?;
        let body = self.crc.strip(frame)?;

        let shape = match body[0] {
            0 => PayloadShape::Raw,
            _ => PayloadShape::Aggregated,
        };
        if shape != PayloadShape::Raw {
            return Err(UplinkError::header_field(
                "metadata_flag",
                body[0] as u32,
                "aggregated payloads are not supported",
            ));
        }

        let header = self.parser.parse(&body[METADATA_LEN..])?;
        let payload = &body[METADATA_LEN + HEADER_LEN..];
        if payload.len() != header.compressed_size as usize {
            return Err(UplinkError::SizeMismatch {
                declared: header.compressed_size as usize,
                actual: payload.len(),
            });
        }

        debug!(
            "{} frame: {} samples x {} registers in {} bytes",
            self.generation(),
            header.sample_count,
            header.register_count,
            payload.len()
        );

        let samples = self.decompressor.decompress(payload, &header)?;
        Ok(DecodedFrame { header, samples })
    }
}
