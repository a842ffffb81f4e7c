//! CRC-16 frame integrity check
//!
//! Every frame ends with a little-endian CRC-16 over all preceding bytes. Two
//! algorithms have shipped in device firmware:
//!
//! | Variant | Poly | Reflected | Init | Catalog name |
//! |---|---|---|---|---|
//! | [`CrcVariant::Modbus`] | 0x8005 (0xA001 reflected) | yes | 0xFFFF | CRC-16/MODBUS |
//! | [`CrcVariant::Ccitt`] | 0x1021 | no | 0xFFFF | CRC-16/IBM-3740 (CCITT-FALSE) |

use crc::{CRC_16_IBM_3740, CRC_16_MODBUS, Crc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::protocol::CRC_LEN;
use crate::{Result, UplinkError};

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
const CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16 algorithm used by a protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrcVariant {
    Modbus,
    Ccitt,
}

impl CrcVariant {
    /// Catalog name, used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            CrcVariant::Modbus => "CRC-16/MODBUS",
            CrcVariant::Ccitt => "CRC-16/CCITT",
        }
    }

    pub fn checksum(self, data: &[u8]) -> u16 {
        match self {
            CrcVariant::Modbus => MODBUS.checksum(data),
            CrcVariant::Ccitt => CCITT.checksum(data),
        }
    }

    /// Check the trailing little-endian CRC of `frame`.
    ///
    /// Frames shorter than the checksum itself never verify.
    pub fn verify(self, frame: &[u8]) -> bool {
        let Some((body, trailer)) = split_trailer(frame) else {
            return false;
        };
        let received = u16::from_le_bytes(trailer);
        let calculated = self.checksum(body);
        trace!(
            "{} received={:#06x} calculated={:#06x}",
            self.name(),
            received,
            calculated
        );
        received == calculated
    }

    /// Verify `frame` and return the bytes covered by the checksum.
    pub fn strip<'a>(self, frame: &'a [u8]) -> Result<&'a [u8]> {
        if !self.verify(frame) {
            debug!("{} mismatch on {} byte frame", self.name(), frame.len());
            return Err(UplinkError::IntegrityFailure { algorithm: self.name() });
        }
        Ok(&frame[..frame.len() - CRC_LEN])
    }

    /// Append the little-endian checksum of `body`.
    pub fn append(self, body: &mut Vec<u8>) {
        let crc = self.checksum(body);
        body.extend_from_slice(&crc.to_le_bytes());
    }
}

fn split_trailer(frame: &[u8]) -> Option<(&[u8], [u8; 2])> {
    let split = frame.len().checked_sub(CRC_LEN)?;
    let (body, trailer) = frame.split_at(split);
    Some((body, [trailer[0], trailer[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Bitwise MODBUS reference (poly 0xA001, reflected, init 0xFFFF).
    fn modbus_reference(data: &[u8]) -> u16 {
        let mut crc = 0xFFFFu16;
        for byte in data {
            crc ^= *byte as u16;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
            }
        }
        crc
    }

    /// Bitwise CCITT reference (poly 0x1021, non-reflected, init 0xFFFF).
    fn ccitt_reference(data: &[u8]) -> u16 {
        let mut crc = 0xFFFFu16;
        for byte in data {
            crc ^= (*byte as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
            }
        }
        crc
    }

    #[test]
    fn catalog_check_values() {
        assert_eq!(CrcVariant::Modbus.checksum(b"123456789"), 0x4B37);
        assert_eq!(CrcVariant::Ccitt.checksum(b"123456789"), 0x29B1);
    }

    #[test]
    fn short_frames_never_verify() {
        assert!(!CrcVariant::Modbus.verify(&[]));
        assert!(!CrcVariant::Modbus.verify(&[0xFF]));
        assert!(CrcVariant::Modbus.strip(&[0x01]).is_err());
    }

    #[test]
    fn empty_body_checksum_is_init_value() {
        assert!(CrcVariant::Modbus.verify(&[0xFF, 0xFF]));
        assert!(CrcVariant::Ccitt.verify(&[0xFF, 0xFF]));
    }

    #[test]
    fn single_bit_flips_are_always_detected() {
        // Exhaustive over every bit of a small frame, CRC bytes included
        for variant in [CrcVariant::Modbus, CrcVariant::Ccitt] {
            let mut frame = vec![0x00, 0x00, 0x05, 0x0A, 0x00, 0x28, 0x09, 0x1C, 0x00, 0x04];
            variant.append(&mut frame);
            assert!(variant.verify(&frame));

            for byte in 0..frame.len() {
                for bit in 0..8 {
                    let mut mutated = frame.clone();
                    mutated[byte] ^= 1 << bit;
                    assert!(
                        !variant.verify(&mutated),
                        "{} missed flip of bit {} in byte {}",
                        variant.name(),
                        bit,
                        byte
                    );
                }
            }
        }
    }

    #[test]
    fn variants_disagree_on_the_same_frame() {
        let mut frame = b"uplink".to_vec();
        CrcVariant::Modbus.append(&mut frame);
        assert!(CrcVariant::Modbus.strip(&frame).is_ok());
        let err = CrcVariant::Ccitt.strip(&frame).unwrap_err();
        assert!(matches!(err, UplinkError::IntegrityFailure { algorithm: "CRC-16/CCITT" }));
    }

    proptest! {
        #[test]
        fn prop_matches_bitwise_reference(data in prop::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(CrcVariant::Modbus.checksum(&data), modbus_reference(&data));
            prop_assert_eq!(CrcVariant::Ccitt.checksum(&data), ccitt_reference(&data));
        }

        #[test]
        fn prop_single_bit_mutation_rejected(
            data in prop::collection::vec(any::<u8>(), 1..64),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8
        ) {
            let mut frame = data.clone();
            CrcVariant::Modbus.append(&mut frame);
            let index = position.index(frame.len());
            frame[index] ^= 1 << bit;
            prop_assert!(!CrcVariant::Modbus.verify(&frame));
        }

        #[test]
        fn prop_strip_returns_body(data in prop::collection::vec(any::<u8>(), 0..128)) {
            let mut frame = data.clone();
            CrcVariant::Ccitt.append(&mut frame);
            let body = CrcVariant::Ccitt.strip(&frame).unwrap();
            prop_assert_eq!(body, &data[..]);
        }
    }
}
