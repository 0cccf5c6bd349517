//! JOSE layer: JWK/JWKS handling, signed JWTs, and compact JWE.
//!
//! Signature algorithms ride on `jsonwebtoken`; encryption is built from the
//! same RustCrypto primitives `crypto-core` uses. Public-key material crosses
//! this crate as JWKs, private material as PKCS#8 PEM.

pub mod alg;
pub mod jwe;
pub mod jwk;
pub mod jwt;

pub use alg::SignatureAlgorithm;
pub use jwk::{Jwk, JwkSet};
pub use jwt::{build_jwt, parse_jwt, Claims, Expectations};

/// Default clock-skew tolerance applied to `exp`/`nbf` checks.
pub const DEFAULT_LEEWAY_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum JoseError {
    #[error("malformed token")]
    Malformed,

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("issuer mismatch")]
    IssuerMismatch,

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("unsupported algorithm: {0}")]
    AlgorithmUnsupported(String),

    #[error("algorithm confusion rejected")]
    AlgorithmConfusion,

    #[error("no usable key for kid")]
    KeyNotFound,

    #[error("invalid key material")]
    InvalidKey,

    #[error("decryption failed")]
    DecryptionFailed,
}

pub type Result<T> = std::result::Result<T, JoseError>;
