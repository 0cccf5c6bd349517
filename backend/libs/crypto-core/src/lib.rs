//! Approved-algorithm crypto primitives shared by all Keystone components.
//!
//! Every operation exposed here is restricted to the platform's approved
//! algorithm set; callers cannot supply custom curves, custom digests, or
//! disable verification. All failures are typed, none panic on adversarial
//! input.

use rand::RngCore;

pub mod aead;
pub mod asym;
pub mod digest;
pub mod kdf;

pub use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    InvalidKey,

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("unsupported algorithm: {0}")]
    AlgorithmUnsupported(String),

    #[error("verification failed")]
    VerifyFailed,

    #[error("invalid length")]
    InvalidLength,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Fill a new buffer with `n` bytes from the OS CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Fixed-size random array from the OS CSPRNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Constant-time byte comparison.
///
/// Inputs of different lengths compare unequal without leaking where they
/// diverge.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
