//! Message authentication of uplink bodies
//!
//! The device signs the standard Base64 encoding of the raw request body
//! with HMAC-SHA256 keyed by the pre-shared secret and sends the digest as
//! lowercase hex.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::protocol::UPLOAD_PSK;
use crate::{Result, UplinkError};

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex HMAC-SHA256 of `base64(body)` under `key`.
pub fn generate_mac(key: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| UplinkError::authentication("MAC key rejected"))?;
    mac.update(STANDARD.encode(body).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compare two MAC strings without branching on their content.
///
/// Strings of different length are unequal immediately. Otherwise every
/// byte pair is XOR-accumulated and the result inspected once at the end.
pub fn verify_mac(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let diff = received.bytes().zip(expected.bytes()).fold(0u8, |acc, (a, b)| acc | (a ^ b));
    diff == 0
}

/// Authenticator for bodies signed with one key.
#[derive(Clone)]
pub struct MacAuthenticator {
    key: Vec<u8>,
}

impl MacAuthenticator {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn from_psk() -> Self {
        Self::new(UPLOAD_PSK.as_bytes())
    }

    pub fn sign(&self, body: &[u8]) -> Result<String> {
        generate_mac(&self.key, body)
    }

    /// Check `received` against the MAC of `body`.
    pub fn authenticate(&self, body: &[u8], received: &str) -> Result<()> {
        let expected = self.sign(body)?;
        if verify_mac(received, &expected) {
            Ok(())
        } else {
            Err(UplinkError::authentication("MAC verification failed"))
        }
    }
}

impl std::fmt::Debug for MacAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacAuthenticator").finish_non_exhaustive()
    }
}
