//! Error types for uplink processing.
//!
//! Every failure the relay can produce is a variant of [`UplinkError`]. The
//! variants follow the order in which an uplink is processed, so the first
//! failing stage determines the error a device sees:
//!
//! - **Envelope**: content type, frame size bounds
//! - **Authentication**: replay guard and MAC verification
//! - **Confidentiality**: cipher and padding failures ([`CipherError`])
//! - **Integrity**: CRC mismatch
//! - **Decode**: header range checks, payload size, token stream errors
//! - **Persistence**: reading sink and command store failures
//!
//! Decode-stage errors are terminal for the request and map to a 4xx status
//! with a reason string; persistence errors are downgraded by the orchestrator
//! to an advisory field in the response.
//!
//! ```rust
//! use uplink_relay::UplinkError;
//!
//! let error = UplinkError::header_field("register_count", 51, "must be between 1 and 50");
//! assert_eq!(error.status_code(), 400);
//! assert!(!error.is_retryable());
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::security::cipher::CipherError;

/// Result type alias for uplink operations.
pub type Result<T, E = UplinkError> = std::result::Result<T, E>;

/// Main error type for uplink operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UplinkError {
    #[error("Invalid frame size: {length} bytes (accepted range {min}..={max})")]
    MalformedFrame { length: usize, min: usize, max: usize },

    #[error("Content-Type must be application/octet-stream, received '{content_type}'")]
    UnsupportedContentType { content_type: String },

    #[error("CRC validation failed ({algorithm})")]
    IntegrityFailure { algorithm: &'static str },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailure { reason: String },

    #[error("Decryption failed: {0}")]
    DecryptionFailure(#[from] CipherError),

    #[error("Header field '{field}' rejected (value {value}): {details}")]
    HeaderValidationFailure { field: &'static str, value: u32, details: String },

    #[error("Payload size mismatch: header declares {declared} bytes, frame carries {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("Truncated stream in register {register}: produced {produced} of {expected} samples")]
    DecodeTruncation { register: usize, produced: usize, expected: usize },

    #[error("Unknown token flag {flag:#04x} in register {register} at offset {offset}")]
    UnknownToken { flag: u8, register: usize, offset: usize },

    #[error("Persistence unavailable: {context}")]
    PersistenceUnavailable {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Nonce store error: {path}")]
    NonceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {context}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl UplinkError {
    /// Returns whether the same request may succeed if sent again unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            UplinkError::PersistenceUnavailable { .. } => true,
            UplinkError::NonceFile { .. } => true,
            UplinkError::MalformedFrame { .. }
            | UplinkError::UnsupportedContentType { .. }
            | UplinkError::IntegrityFailure { .. }
            | UplinkError::AuthenticationFailure { .. }
            | UplinkError::DecryptionFailure(_)
            | UplinkError::HeaderValidationFailure { .. }
            | UplinkError::SizeMismatch { .. }
            | UplinkError::DecodeTruncation { .. }
            | UplinkError::UnknownToken { .. }
            | UplinkError::InvalidCommand { .. }
            | UplinkError::Config { .. }
            | UplinkError::Json { .. } => false,
        }
    }

    /// HTTP status the outer routing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            UplinkError::AuthenticationFailure { .. } => 401,
            UplinkError::UnsupportedContentType { .. } => 415,
            UplinkError::PersistenceUnavailable { .. } => 503,
            UplinkError::NonceFile { .. } | UplinkError::Config { .. } => 500,
            UplinkError::MalformedFrame { .. }
            | UplinkError::IntegrityFailure { .. }
            | UplinkError::DecryptionFailure(_)
            | UplinkError::HeaderValidationFailure { .. }
            | UplinkError::SizeMismatch { .. }
            | UplinkError::DecodeTruncation { .. }
            | UplinkError::UnknownToken { .. }
            | UplinkError::InvalidCommand { .. }
            | UplinkError::Json { .. } => 400,
        }
    }

    /// Whether this error was caused by the request content rather than the server.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Helper constructor for authentication failures.
    pub fn authentication(reason: impl Into<String>) -> Self {
        UplinkError::AuthenticationFailure { reason: reason.into() }
    }

    /// Helper constructor for header range violations.
    pub fn header_field(field: &'static str, value: u32, details: impl Into<String>) -> Self {
        UplinkError::HeaderValidationFailure { field, value, details: details.into() }
    }

    /// Helper constructor for persistence failures without an underlying error.
    pub fn persistence(context: impl Into<String>) -> Self {
        UplinkError::PersistenceUnavailable { context: context.into(), source: None }
    }

    /// Helper constructor for persistence failures with source.
    pub fn persistence_with_source(
        context: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        UplinkError::PersistenceUnavailable { context: context.into(), source: Some(source) }
    }

    /// Helper constructor for rejected administrative commands.
    pub fn invalid_command(reason: impl Into<String>) -> Self {
        UplinkError::InvalidCommand { reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        UplinkError::Config { reason: reason.into() }
    }

    /// Helper constructor for JSON (de)serialization failures.
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        UplinkError::Json { context: context.into(), source }
    }
}
