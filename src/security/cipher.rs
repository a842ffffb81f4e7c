//! AES-256-CBC body decryption
//!
//! An encrypted uplink body is `IV (16) ‖ ciphertext`. The key is the SHA-256
//! digest of the pre-shared secret. PKCS#7 padding is removed by hand so that
//! malformed padding surfaces as [`CipherError::InvalidPadding`] instead of
//! a truncated plaintext.

use aes::Aes256;
use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::trace;

use crate::protocol::{CIPHER_BLOCK_LEN, IV_LEN, UPLOAD_PSK};

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Failures of the confidentiality layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CipherError {
    #[error("payload too short: {len} bytes, need at least {IV_LEN} for the IV")]
    PayloadTooShort { len: usize },

    #[error("ciphertext length {len} is not a non-zero multiple of {CIPHER_BLOCK_LEN}")]
    UnalignedCiphertext { len: usize },

    #[error("invalid padding")]
    InvalidPadding,

    #[error("unsupported encryption scheme '{scheme}'")]
    UnsupportedScheme { scheme: String },
}

/// 32-byte AES key derived from `secret`.
pub fn derive_key(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Decryptor bound to one key.
#[derive(Clone)]
pub struct BodyCipher {
    key: [u8; 32],
}

impl BodyCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Cipher keyed with the device pre-shared secret.
    pub fn from_psk() -> Self {
        Self::new(derive_key(UPLOAD_PSK))
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Decrypt `IV ‖ ciphertext` and strip PKCS#7 padding.
    pub fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>, CipherError> {
        if body.len() < IV_LEN {
            return Err(CipherError::PayloadTooShort { len: body.len() });
        }
        let (iv, ciphertext) = body.split_at(IV_LEN);
        if ciphertext.is_empty() || ciphertext.len() % CIPHER_BLOCK_LEN != 0 {
            return Err(CipherError::UnalignedCiphertext { len: ciphertext.len() });
        }

        let decryptor = Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|_| CipherError::PayloadTooShort { len: body.len() })?;
        let mut plaintext = decryptor
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CipherError::UnalignedCiphertext { len: ciphertext.len() })?;

        let unpadded = unpad(&plaintext)?;
        trace!("Decrypted {} ciphertext bytes into {} plaintext bytes", ciphertext.len(), unpadded);
        plaintext.truncate(unpadded);
        Ok(plaintext)
    }
}

impl std::fmt::Debug for BodyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyCipher").finish_non_exhaustive()
    }
}

/// Length of `block` without its PKCS#7 padding.
fn unpad(block: &[u8]) -> Result<usize, CipherError> {
    let Some(&pad) = block.last() else {
        return Err(CipherError::InvalidPadding);
    };
    let pad_len = pad as usize;
    if pad_len == 0 || pad_len > CIPHER_BLOCK_LEN || pad_len > block.len() {
        return Err(CipherError::InvalidPadding);
    }
    if block[block.len() - pad_len..].iter().any(|&byte| byte != pad) {
        return Err(CipherError::InvalidPadding);
    }
    Ok(block.len() - pad_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{encrypt_blocks, encrypt_body};

    const IV: [u8; 16] = [7; 16];

    #[test]
    fn key_is_sha256_of_secret() {
        let key = derive_key("abc");
        assert_eq!(
            hex::encode(key),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(BodyCipher::from_psk().key(), &derive_key(UPLOAD_PSK));
    }

    #[test]
    fn decrypts_what_the_device_encrypts() {
        let cipher = BodyCipher::from_psk();
        for len in [0, 1, 15, 16, 17, 47] {
            let plaintext: Vec<u8> = (0..len as u8).collect();
            let body = encrypt_body(&plaintext, IV);
            assert_eq!(body.len() % 16, 0);
            assert_eq!(cipher.decrypt(&body).unwrap(), plaintext);
        }
    }

    #[test]
    fn short_and_unaligned_bodies() {
        let cipher = BodyCipher::from_psk();
        assert_eq!(cipher.decrypt(&[0; 15]), Err(CipherError::PayloadTooShort { len: 15 }));
        assert_eq!(cipher.decrypt(&[0; 16]), Err(CipherError::UnalignedCiphertext { len: 0 }));
        assert_eq!(cipher.decrypt(&[0; 40]), Err(CipherError::UnalignedCiphertext { len: 24 }));
    }

    #[test]
    fn inconsistent_padding_is_rejected_after_decryption() {
        // Last byte claims 5 pad bytes, the others disagree
        let mut block = [0xAB; 16];
        block[15] = 5;
        let body = encrypt_blocks(&block, IV);
        assert_eq!(BodyCipher::from_psk().decrypt(&body), Err(CipherError::InvalidPadding));
    }

    #[test]
    fn wrong_key_never_yields_the_plaintext() {
        let body = encrypt_body(b"forty-seven byte frame", IV);
        let other = BodyCipher::new(derive_key("not the device secret"));
        assert_ne!(other.decrypt(&body), Ok(b"forty-seven byte frame".to_vec()));
    }

    #[test]
    fn padding_rules() {
        let mut block = [0u8; 16];
        block[15] = 0;
        assert_eq!(unpad(&block), Err(CipherError::InvalidPadding));

        block[15] = 17;
        assert_eq!(unpad(&block), Err(CipherError::InvalidPadding));

        block[12..].copy_from_slice(&[4, 3, 4, 4]);
        assert_eq!(unpad(&block), Err(CipherError::InvalidPadding));

        block[12..].copy_from_slice(&[4, 4, 4, 4]);
        assert_eq!(unpad(&block), Ok(12));

        assert_eq!(unpad(&[16; 16]), Ok(0));
        assert_eq!(unpad(&[]), Err(CipherError::InvalidPadding));
    }
}
