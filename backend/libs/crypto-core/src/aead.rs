//! AEAD sealing and opening with AES-GCM.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};

use crate::{CryptoError, Result};

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
}

impl AeadAlgorithm {
    pub fn key_len(&self) -> usize {
        match self {
            AeadAlgorithm::Aes128Gcm => 16,
            AeadAlgorithm::Aes256Gcm => 32,
        }
    }
}

/// Encrypt `plaintext` with the given 12-byte nonce and associated data.
///
/// Returns ciphertext with the 16-byte GCM tag appended.
pub fn aead_seal(
    alg: AeadAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidLength);
    }
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    match alg {
        AeadAlgorithm::Aes128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            cipher
                .encrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::InvalidCiphertext)
        }
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            cipher
                .encrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::InvalidCiphertext)
        }
    }
}

/// Decrypt and authenticate a ciphertext produced by [`aead_seal`].
pub fn aead_open(
    alg: AeadAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidLength);
    }
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    match alg {
        AeadAlgorithm::Aes128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            cipher
                .decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::InvalidCiphertext)
        }
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            cipher
                .decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::InvalidCiphertext)
        }
    }
}
