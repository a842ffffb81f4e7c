//! Uplink frame decoding and piggybacked command delivery for
//! intermittently-connected energy monitors.
//!
//! The device cannot be reached directly. It periodically uploads a compact,
//! optionally encrypted binary frame of register samples, and every
//! device-bound instruction (configuration change, register write, firmware
//! job) rides back in the response to one of those uploads.
//!
//! # Features
//!
//! - **Frame codecs**: dynamic and legacy fixed-size frames, CRC-16 MODBUS or CCITT
//! - **Envelope security**: AES-256-CBC bodies, HMAC-SHA256 signatures, pluggable replay guard
//! - **Delta + run-length decompression** into a row-major [`SampleMatrix`]
//! - **Command queues**: one in-flight item per kind, conditional status transitions
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use uplink_relay::codec::ProtocolGeneration;
//! use uplink_relay::queue::{ConfigUpdate, MemoryCommandStore};
//! use uplink_relay::storage::MemoryReadingSink;
//! use uplink_relay::uplink::UplinkService;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> uplink_relay::Result<()> {
//! let service = UplinkService::new(
//!     ProtocolGeneration::Dynamic,
//!     Arc::new(MemoryReadingSink::new()),
//!     Arc::new(MemoryCommandStore::new()),
//! );
//! service.configs().enqueue(ConfigUpdate { upload_interval: Some(60), ..Default::default() }).await?;
//! // The next successful uplink carries `config_update` in its response
//! # Ok(())
//! # }
//! ```

// Core types and error handling
mod error;
pub mod protocol;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Decoding and envelope security
pub mod codec;
pub mod security;

// Delivery and persistence
pub mod config;
pub mod queue;
pub mod storage;
pub mod uplink;

// Core exports
pub use error::*;
pub use types::*;

pub use codec::{DecodedFrame, FrameCodec, ProtocolGeneration};
pub use config::{IngestConfig, ReplayPolicy};
pub use uplink::{UplinkRequest, UplinkResponse, UplinkService};
