//! Digests and HMAC over the approved SHA-2 family.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::{CryptoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }
}

/// Compute a digest of `input` with the selected algorithm.
pub fn digest(alg: DigestAlgorithm, input: &[u8]) -> Vec<u8> {
    match alg {
        DigestAlgorithm::Sha256 => Sha256::digest(input).to_vec(),
        DigestAlgorithm::Sha384 => Sha384::digest(input).to_vec(),
        DigestAlgorithm::Sha512 => Sha512::digest(input).to_vec(),
    }
}

/// Compute SHA-256 of input bytes.
pub fn sha256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// Compute an HMAC tag over `input` with the selected hash.
///
/// HMAC accepts keys of any length, so the only failure is an internal one
/// that cannot occur in practice; it is still surfaced as `InvalidKey`
/// rather than panicking.
pub fn hmac_sign(alg: DigestAlgorithm, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    match alg {
        DigestAlgorithm::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            mac.update(input);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        DigestAlgorithm::Sha384 => {
            let mut mac =
                Hmac::<Sha384>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            mac.update(input);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        DigestAlgorithm::Sha512 => {
            let mut mac =
                Hmac::<Sha512>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            mac.update(input);
            Ok(mac.finalize().into_bytes().to_vec())
        }
    }
}

/// Verify an HMAC tag in constant time.
pub fn hmac_verify(alg: DigestAlgorithm, key: &[u8], input: &[u8], tag: &[u8]) -> Result<()> {
    match alg {
        DigestAlgorithm::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            mac.update(input);
            mac.verify_slice(tag).map_err(|_| CryptoError::VerifyFailed)
        }
        DigestAlgorithm::Sha384 => {
            let mut mac =
                Hmac::<Sha384>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            mac.update(input);
            mac.verify_slice(tag).map_err(|_| CryptoError::VerifyFailed)
        }
        DigestAlgorithm::Sha512 => {
            let mut mac =
                Hmac::<Sha512>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
            mac.update(input);
            mac.verify_slice(tag).map_err(|_| CryptoError::VerifyFailed)
        }
    }
}
