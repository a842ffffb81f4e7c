//! Core types for decoded uplink data.
//!
//! - [`Endianness`] selects the byte order of multi-byte header fields and stream values
//! - [`FrameHeader`] is the validated header of one uplink frame
//! - [`SampleMatrix`] holds the decompressed `sample_count × register_count` readings
//!
//! ```rust
//! use uplink_relay::types::{SampleMatrix};
//!
//! let matrix = SampleMatrix::from_columns(&[vec![10, 15, 20], vec![7, 7, 7]]).unwrap();
//! assert_eq!(matrix.as_slice(), &[10, 7, 15, 7, 20, 7]);
//! assert_eq!(matrix.row(1), &[15, 7]);
//! ```

mod endianness;
mod header;
mod samples;

pub use endianness::Endianness;
pub use header::{FrameHeader, PayloadShape};
pub use samples::SampleMatrix;
