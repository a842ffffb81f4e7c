//! Frame header types

use serde::{Deserialize, Serialize};

/// Shape of the samples carried by a frame.
///
/// Only raw per-poll samples are decoded; aggregated payloads are announced
/// by newer firmware but have no server-side decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadShape {
    Raw,
    Aggregated,
}

/// Validated header of one uplink frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Payload shape (always `Raw` once validated)
    pub shape: PayloadShape,
    /// Samples per register (1..=1000)
    pub sample_count: u16,
    /// Registers per sample (1..=50)
    pub register_count: u8,
    /// Bytes of compressed payload following the header (1..=10000)
    pub compressed_size: u16,
}

impl FrameHeader {
    /// Number of values the decompressor must produce.
    pub fn value_count(&self) -> usize {
        self.sample_count as usize * self.register_count as usize
    }
}
