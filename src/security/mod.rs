//! Confidentiality and authentication of encrypted uplinks.
//!
//! An encrypted uplink is checked in a fixed order before its frame is
//! decoded: replay guard on the `Nonce` header, MAC over the raw body, then
//! AES-256-CBC decryption. Nothing decrypted is trusted before the MAC passes.

pub mod cipher;
pub mod mac;
pub mod nonce_store;
pub mod replay;

pub use cipher::{BodyCipher, CipherError, derive_key};
pub use mac::{MacAuthenticator, generate_mac, verify_mac};
pub use nonce_store::{FileNonceStore, MemoryNonceStore, NonceStore};
pub use replay::{CounterNonceGuard, FixedNonceGuard, ReplayGuard, ReplayVerdict};
