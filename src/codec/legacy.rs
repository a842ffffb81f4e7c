//! First-generation fixed frames
//!
//! Every frame is exactly 47 bytes: a 5-byte legacy header announcing 5
//! readings of 10 registers in 40 bytes, the little-endian token streams, and
//! a CRC-16/MODBUS trailer.

use std::ops::RangeInclusive;

use tracing::debug;

use super::{
    CrcVariant, DecodedFrame, Decompressor, FrameCodec, HeaderLayout, HeaderParser,
    HeaderValidation, ProtocolGeneration,
};
use crate::protocol::{FIXED_FRAME_LEN, HEADER_LEN};
use crate::{Result, UplinkError};

#[derive(Debug, Clone, Copy)]
pub struct FixedFrameCodec {
    parser: HeaderParser,
    decompressor: Decompressor,
}

impl FixedFrameCodec {
    pub fn new() -> Self {
        let parser = HeaderParser::new(HeaderLayout::Legacy, HeaderValidation::FIXED);
        Self { parser, decompressor: Decompressor::new(parser.endianness()) }
    }
}

impl Default for FixedFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec for FixedFrameCodec {
    fn generation(&self) -> ProtocolGeneration {
        ProtocolGeneration::Fixed
    }

    fn frame_bounds(&self) -> RangeInclusive<usize> {
        FIXED_FRAME_LEN..=FIXED_FRAME_LEN
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodedFrame> {
        self.check_length(frame)?;
        let body = CrcVariant::Modbus.strip(frame)?;

        let header = self.parser.parse(body)?;
        let payload = &body[HEADER_LEN..];
        if payload.len() != header.compressed_size as usize {
            return Err(UplinkError::SizeMismatch {
                declared: header.compressed_size as usize,
                actual: payload.len(),
            });
        }

        debug!("fixed frame: {} readings of {} values", header.sample_count, header.register_count);

        let samples = self.decompressor.decompress(payload, &header)?;
        Ok(DecodedFrame { header, samples })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FrameBuilder;

    /// Ten constant registers, each `initial LE + RLE x4`.
    fn constant_frame(values: [u16; 10]) -> Vec<u8> {
        let mut frame = vec![0x00, 0x05, 0x0A, 0x28, 0x00];
        for value in values {
            frame.extend_from_slice(&value.to_le_bytes());
            frame.extend_from_slice(&[0x00, 0x04]);
        }
        CrcVariant::Modbus.append(&mut frame);
        frame
    }

    #[test]
    fn decodes_constant_readings() {
        let values = [2308, 12, 5000, 3500, 3480, 40, 38, 452, 60, 1800];
        let frame = constant_frame(values);
        assert_eq!(frame.len(), 47);

        let decoded = FixedFrameCodec::new().decode(&frame).unwrap();
        assert_eq!(decoded.samples.sample_count(), 5);
        for row in decoded.samples.rows() {
            assert_eq!(row, &values);
        }
    }

    #[test]
    fn any_other_length_is_malformed() {
        for length in [0, 46, 48, 100] {
            let err = FixedFrameCodec::new().decode(&vec![0u8; length]).unwrap_err();
            assert!(matches!(err, UplinkError::MalformedFrame { min: 47, max: 47, .. }));
        }
    }

    #[test]
    fn header_must_match_fixed_shape() {
        let mut frame = constant_frame([1; 10]);
        frame[1] = 6;
        let len = frame.len();
        frame.truncate(len - 2);
        CrcVariant::Modbus.append(&mut frame);

        assert!(matches!(
            FixedFrameCodec::new().decode(&frame),
            Err(UplinkError::HeaderValidationFailure { field: "sample_count", .. })
        ));
    }

    #[test]
    fn builder_emits_fixed_layout() {
        let columns: Vec<Vec<u16>> = (0..10).map(|register| vec![register * 100; 5]).collect();
        let frame = FrameBuilder::new(ProtocolGeneration::Fixed).columns(columns.clone()).build();
        assert_eq!(frame, constant_frame([0, 100, 200, 300, 400, 500, 600, 700, 800, 900]));

        let decoded = FixedFrameCodec::new().decode(&frame).unwrap();
        assert_eq!(decoded.samples, crate::SampleMatrix::from_columns(&columns).unwrap());
    }
}
