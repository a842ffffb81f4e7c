//! Delta + run-length sample decompression
//!
//! The payload holds one token stream per register, registers in declaration
//! order. Each stream starts with the register's first value and continues
//! with tokens until `sample_count` values exist for that register:
//!
//! ```text
//! initial: u16                      first sample, becomes `current`
//! 0x00 run: u8                      repeat `current` up to `run` times
//! 0x01 delta: i16                   current = current + delta (mod 2^16), emit
//! ```
//!
//! A run never spills into the next register: repeats beyond the remaining
//! sample slots are dropped. Producing fewer than `sample_count` values is an
//! error; streams are never padded.

use tracing::{trace, warn};

use crate::protocol::{TOKEN_DELTA, TOKEN_RLE};
use crate::types::{Endianness, FrameHeader, SampleMatrix};
use crate::{Result, UplinkError};

/// Decoder for the per-register token streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decompressor {
    endianness: Endianness,
}

impl Decompressor {
    pub fn new(endianness: Endianness) -> Self {
        Self { endianness }
    }

    /// Decode `payload` into a row-major matrix of the header's shape.
    pub fn decompress(&self, payload: &[u8], header: &FrameHeader) -> Result<SampleMatrix> {
        let sample_count = header.sample_count as usize;
        let register_count = header.register_count as usize;
        if sample_count == 0 {
            return Err(UplinkError::header_field("sample_count", 0, "nothing to decode"));
        }
        if register_count == 0 {
            return Err(UplinkError::header_field("register_count", 0, "nothing to decode"));
        }

        let mut cursor = Cursor { data: payload, offset: 0 };
        let mut columns = Vec::with_capacity(register_count);

        for register in 0..register_count {
            columns.push(self.decode_register(&mut cursor, register, sample_count)?);
        }

        if cursor.remaining() > 0 {
            warn!(
                "Ignoring {} trailing payload bytes after {} registers",
                cursor.remaining(),
                register_count
            );
        }

        // Every column holds exactly `sample_count >= 1` values here
        SampleMatrix::from_columns(&columns).ok_or_else(|| {
            UplinkError::header_field(
                "sample_count",
                header.sample_count as u32,
                "register columns differ in length",
            )
        })
    }

    fn decode_register(
        &self,
        cursor: &mut Cursor<'_>,
        register: usize,
        sample_count: usize,
    ) -> Result<Vec<u16>> {
        let truncated = |produced: usize| UplinkError::DecodeTruncation {
            register,
            produced,
            expected: sample_count,
        };

        let mut values = Vec::with_capacity(sample_count);
        let mut current = self.endianness.read_u16(cursor.take2().ok_or_else(|| truncated(0))?);
        values.push(current);
        trace!("Register {}: initial value {}", register, current);

        while values.len() < sample_count {
            let offset = cursor.offset;
            let Some(flag) = cursor.take1() else {
                return Err(truncated(values.len()));
            };

            match flag {
                TOKEN_RLE => {
                    let run = cursor.take1().ok_or_else(|| truncated(values.len()))? as usize;
                    let repeats = run.min(sample_count - values.len());
                    values.extend(std::iter::repeat_n(current, repeats));
                    trace!("Register {}: repeat {} x{}", register, current, repeats);
                }
                TOKEN_DELTA => {
                    let delta =
                        self.endianness.read_i16(cursor.take2().ok_or_else(|| truncated(values.len()))?);
                    current = current.wrapping_add_signed(delta);
                    values.push(current);
                    trace!("Register {}: delta {} -> {}", register, delta, current);
                }
                other => {
                    return Err(UplinkError::UnknownToken { flag: other, register, offset });
                }
            }
        }

        Ok(values)
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take1(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.offset)?;
        self.offset += 1;
        Some(byte)
    }

    fn take2(&mut self) -> Option<[u8; 2]> {
        let bytes = self.data.get(self.offset..self.offset + 2)?;
        self.offset += 2;
        Some([bytes[0], bytes[1]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::encode_register;
    use crate::types::PayloadShape;
    use proptest::prelude::*;

    fn header(sample_count: u16, register_count: u8, payload: &[u8]) -> FrameHeader {
        FrameHeader {
            shape: PayloadShape::Raw,
            sample_count,
            register_count,
            compressed_size: payload.len() as u16,
        }
    }

    fn big() -> Decompressor {
        Decompressor::new(Endianness::Big)
    }

    #[test]
    fn empty_shape_is_a_header_error() {
        let payload = [0x00, 0x0A];
        let err = big().decompress(&payload, &header(0, 1, &payload)).unwrap_err();
        assert!(matches!(err, UplinkError::HeaderValidationFailure { field: "sample_count", .. }));

        let err = big().decompress(&payload, &header(1, 0, &payload)).unwrap_err();
        assert!(matches!(err, UplinkError::HeaderValidationFailure { field: "register_count", .. }));
    }

    #[test]
    fn delta_then_run_then_delta() {
        // 10, +5 -> 15, repeat x2, +5 -> 20
        let register0 = [0x00, 0x0A, 0x01, 0x00, 0x05, 0x00, 0x02, 0x01, 0x00, 0x05];
        // 7, repeat x4
        let register1 = [0x00, 0x07, 0x00, 0x04];
        let payload = [&register0[..], &register1[..]].concat();

        let matrix = big().decompress(&payload, &header(5, 2, &payload)).unwrap();
        assert_eq!(matrix.column(0), vec![10, 15, 15, 15, 20]);
        assert_eq!(matrix.as_slice(), &[10, 7, 15, 7, 15, 7, 15, 7, 20, 7]);
    }

    #[test]
    fn seven_byte_stream_is_truncated() {
        // 10, +5, repeat x2 gives only four of five samples
        let stream = [0x00, 0x0A, 0x01, 0x00, 0x05, 0x00, 0x02];
        let err = big().decompress(&stream, &header(5, 1, &stream)).unwrap_err();
        assert!(matches!(
            err,
            UplinkError::DecodeTruncation { register: 0, produced: 4, expected: 5 }
        ));
    }

    #[test]
    fn run_is_capped_at_remaining_slots() {
        // A run of 255 must not consume the second register's samples
        let payload = [0x00, 0x01, 0x00, 0xFF, 0x00, 0x02, 0x00, 0x02];
        let matrix = big().decompress(&payload, &header(3, 2, &payload)).unwrap();
        assert_eq!(matrix.column(0), vec![1, 1, 1]);
        assert_eq!(matrix.column(1), vec![2, 2, 2]);
    }

    #[test]
    fn delta_wraps_modulo_u16() {
        let payload = [0xFF, 0xFF, 0x01, 0x00, 0x02, 0x01, 0xFF, 0xFD];
        let matrix = big().decompress(&payload, &header(3, 1, &payload)).unwrap();
        assert_eq!(matrix.column(0), vec![0xFFFF, 0x0001, 0xFFFE]);
    }

    #[test]
    fn unknown_flag_reports_position() {
        let payload = [0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x07, 0x00];
        let err = big().decompress(&payload, &header(3, 2, &payload)).unwrap_err();
        assert!(matches!(err, UplinkError::UnknownToken { flag: 0x07, register: 1, offset: 6 }));
    }

    #[test]
    fn truncated_operands_are_rejected() {
        let missing_run = [0x00, 0x01, 0x00];
        assert!(matches!(
            big().decompress(&missing_run, &header(2, 1, &missing_run)),
            Err(UplinkError::DecodeTruncation { produced: 1, .. })
        ));

        let short_delta = [0x00, 0x01, 0x01, 0x00];
        assert!(matches!(
            big().decompress(&short_delta, &header(2, 1, &short_delta)),
            Err(UplinkError::DecodeTruncation { produced: 1, .. })
        ));

        let missing_initial = [0x00];
        assert!(matches!(
            big().decompress(&missing_initial, &header(1, 1, &missing_initial)),
            Err(UplinkError::DecodeTruncation { produced: 0, .. })
        ));
    }

    #[test]
    fn little_endian_streams() {
        // 0x0102 little-endian, delta -2
        let payload = [0x02, 0x01, 0x01, 0xFE, 0xFF];
        let matrix =
            Decompressor::new(Endianness::Little).decompress(&payload, &header(2, 1, &payload)).unwrap();
        assert_eq!(matrix.column(0), vec![0x0102, 0x0100]);
    }

    #[test]
    fn zero_length_run_is_legal() {
        let payload = [0x00, 0x05, 0x00, 0x00, 0x01, 0x00, 0x01];
        let matrix = big().decompress(&payload, &header(2, 1, &payload)).unwrap();
        assert_eq!(matrix.column(0), vec![5, 6]);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let payload = [0x00, 0x05, 0x00, 0x01, 0xAA, 0xBB];
        let matrix = big().decompress(&payload, &header(2, 1, &payload)).unwrap();
        assert_eq!(matrix.column(0), vec![5, 5]);
    }

    prop_compose! {
        fn arb_register_set()(
            sample_count in 1usize..60,
            register_count in 1usize..8
        )(
            columns in prop::collection::vec(
                // Small alphabet so runs appear often
                prop::collection::vec(prop_oneof![Just(0u16), Just(1u16), any::<u16>()], sample_count),
                register_count
            )
        ) -> Vec<Vec<u16>> {
            columns
        }
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            columns in arb_register_set(),
            little in any::<bool>()
        ) {
            let order = if little { Endianness::Little } else { Endianness::Big };
            let payload: Vec<u8> =
                columns.iter().flat_map(|column| encode_register(column, order)).collect();
            let header = FrameHeader {
                shape: PayloadShape::Raw,
                sample_count: columns[0].len() as u16,
                register_count: columns.len() as u8,
                compressed_size: payload.len() as u16,
            };

            let matrix = Decompressor::new(order).decompress(&payload, &header).unwrap();
            let expected = SampleMatrix::from_columns(&columns).unwrap();
            prop_assert_eq!(matrix, expected);
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(
            payload in prop::collection::vec(any::<u8>(), 0..200),
            sample_count in 1u16..50,
            register_count in 1u8..6
        ) {
            let header = FrameHeader {
                shape: PayloadShape::Raw,
                sample_count,
                register_count,
                compressed_size: payload.len() as u16,
            };
            if let Ok(matrix) = big().decompress(&payload, &header) {
                prop_assert_eq!(matrix.len(), header.value_count());
            }
        }
    }
}
