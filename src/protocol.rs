//! Protocol constants shared with the device firmware.
//!
//! These values are compiled into the device and are not runtime
//! configuration. Changing any of them requires a coordinated firmware release.

/// Pre-shared secret. The AES key is `SHA-256(UPLOAD_PSK)` and the MAC key is the raw secret.
pub const UPLOAD_PSK: &str = "ColdPlay@EcoWatt2025";

/// Nonce value accepted by the fixed replay policy.
pub const FIXED_NONCE: u64 = 12345;

/// Value of the `Encryption` request header for encrypted uplinks.
pub const ENCRYPTION_SCHEME: &str = "aes-256-cbc";

/// Only accepted request content type for uplinks.
pub const UPLINK_CONTENT_TYPE: &str = "application/octet-stream";

/// Initialization vector prefix of an encrypted body.
pub const IV_LEN: usize = 16;

/// AES block size.
pub const CIPHER_BLOCK_LEN: usize = 16;

/// Trailing CRC-16 bytes.
pub const CRC_LEN: usize = 2;

/// Sample count / register count / compressed size header.
pub const HEADER_LEN: usize = 5;

/// Leading payload-shape byte of the dynamic generation.
pub const METADATA_LEN: usize = 1;

pub const MAX_SAMPLE_COUNT: u16 = 1000;
pub const MAX_REGISTER_COUNT: u8 = 50;
pub const MAX_COMPRESSED_SIZE: u16 = 10_000;

/// Smallest dynamic frame: metadata + header + one payload byte + CRC.
pub const DYNAMIC_MIN_FRAME_LEN: usize = METADATA_LEN + HEADER_LEN + 1 + CRC_LEN;

/// Largest dynamic frame: metadata + header + maximum payload + CRC.
pub const DYNAMIC_MAX_FRAME_LEN: usize =
    METADATA_LEN + HEADER_LEN + MAX_COMPRESSED_SIZE as usize + CRC_LEN;

/// First-generation frames are always 5 readings of 10 registers in 40 payload bytes.
pub const FIXED_FRAME_LEN: usize = 47;
pub const FIXED_SAMPLE_COUNT: u16 = 5;
pub const FIXED_REGISTER_COUNT: u8 = 10;
pub const FIXED_COMPRESSED_SIZE: u16 = 40;

/// Token flags of the compressed register stream.
pub const TOKEN_RLE: u8 = 0x00;
pub const TOKEN_DELTA: u8 = 0x01;

/// Register names of the inverter register map, in uplink order.
pub const REGISTER_NAMES: [&str; 10] = [
    "vac1",
    "iac1",
    "fac1",
    "vpv1",
    "vpv2",
    "ipv1",
    "ipv2",
    "temperature",
    "export_power",
    "output_power",
];

/// Divisors converting raw register values to engineering units.
pub const DEFAULT_GAINS: [f64; 10] = [10.0, 10.0, 100.0, 10.0, 10.0, 10.0, 10.0, 10.0, 1.0, 1.0];

/// Register names a configuration update may select.
pub const CONFIGURABLE_REGISTERS: [&str; 14] = [
    "voltage",
    "current",
    "frequency",
    "temperature",
    "power",
    "vac1",
    "iac1",
    "fac1",
    "vpv1",
    "vpv2",
    "ipv1",
    "ipv2",
    "export_power",
    "output_power",
];

/// Bounds for configurable intervals, in seconds.
pub const MIN_INTERVAL_SECS: u32 = 1;
pub const MAX_INTERVAL_SECS: u32 = 3600;

/// Register-write commands set the export power percentage.
pub const WRITE_TARGET_REGISTER: &str = "export_power";
pub const MAX_WRITE_VALUE: u16 = 100;
