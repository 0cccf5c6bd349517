//! Signature algorithm registry.

use serde::{Deserialize, Serialize};

use crate::{JoseError, Result};

/// JWS signature algorithms accepted by the platform.
///
/// `ES512` is part of the registry so configuration can name it uniformly,
/// but it maps to `AlgorithmUnsupported` at use sites (no vetted P-521
/// backend in the stack). `none` is not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    RS256,
    RS384,
    RS512,
    PS256,
    PS384,
    PS512,
    ES256,
    ES384,
    ES512,
    EdDSA,
    HS256,
    HS384,
    HS512,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RS256 => "RS256",
            SignatureAlgorithm::RS384 => "RS384",
            SignatureAlgorithm::RS512 => "RS512",
            SignatureAlgorithm::PS256 => "PS256",
            SignatureAlgorithm::PS384 => "PS384",
            SignatureAlgorithm::PS512 => "PS512",
            SignatureAlgorithm::ES256 => "ES256",
            SignatureAlgorithm::ES384 => "ES384",
            SignatureAlgorithm::ES512 => "ES512",
            SignatureAlgorithm::EdDSA => "EdDSA",
            SignatureAlgorithm::HS256 => "HS256",
            SignatureAlgorithm::HS384 => "HS384",
            SignatureAlgorithm::HS512 => "HS512",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "RS256" => Ok(SignatureAlgorithm::RS256),
            "RS384" => Ok(SignatureAlgorithm::RS384),
            "RS512" => Ok(SignatureAlgorithm::RS512),
            "PS256" => Ok(SignatureAlgorithm::PS256),
            "PS384" => Ok(SignatureAlgorithm::PS384),
            "PS512" => Ok(SignatureAlgorithm::PS512),
            "ES256" => Ok(SignatureAlgorithm::ES256),
            "ES384" => Ok(SignatureAlgorithm::ES384),
            "ES512" => Ok(SignatureAlgorithm::ES512),
            "EdDSA" => Ok(SignatureAlgorithm::EdDSA),
            "HS256" => Ok(SignatureAlgorithm::HS256),
            "HS384" => Ok(SignatureAlgorithm::HS384),
            "HS512" => Ok(SignatureAlgorithm::HS512),
            other => Err(JoseError::AlgorithmUnsupported(other.to_string())),
        }
    }

    /// True for the HMAC family.
    pub fn is_symmetric(&self) -> bool {
        matches!(
            self,
            SignatureAlgorithm::HS256 | SignatureAlgorithm::HS384 | SignatureAlgorithm::HS512
        )
    }

    /// Key type expected to carry this algorithm, as a JWK `kty` value.
    pub fn expected_kty(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RS256
            | SignatureAlgorithm::RS384
            | SignatureAlgorithm::RS512
            | SignatureAlgorithm::PS256
            | SignatureAlgorithm::PS384
            | SignatureAlgorithm::PS512 => "RSA",
            SignatureAlgorithm::ES256 | SignatureAlgorithm::ES384 | SignatureAlgorithm::ES512 => {
                "EC"
            }
            SignatureAlgorithm::EdDSA => "OKP",
            SignatureAlgorithm::HS256 | SignatureAlgorithm::HS384 | SignatureAlgorithm::HS512 => {
                "oct"
            }
        }
    }

    pub fn to_jsonwebtoken(&self) -> Result<jsonwebtoken::Algorithm> {
        use jsonwebtoken::Algorithm;

        match self {
            SignatureAlgorithm::RS256 => Ok(Algorithm::RS256),
            SignatureAlgorithm::RS384 => Ok(Algorithm::RS384),
            SignatureAlgorithm::RS512 => Ok(Algorithm::RS512),
            SignatureAlgorithm::PS256 => Ok(Algorithm::PS256),
            SignatureAlgorithm::PS384 => Ok(Algorithm::PS384),
            SignatureAlgorithm::PS512 => Ok(Algorithm::PS512),
            SignatureAlgorithm::ES256 => Ok(Algorithm::ES256),
            SignatureAlgorithm::ES384 => Ok(Algorithm::ES384),
            SignatureAlgorithm::ES512 => {
                Err(JoseError::AlgorithmUnsupported("ES512".to_string()))
            }
            SignatureAlgorithm::EdDSA => Ok(Algorithm::EdDSA),
            SignatureAlgorithm::HS256 => Ok(Algorithm::HS256),
            SignatureAlgorithm::HS384 => Ok(Algorithm::HS384),
            SignatureAlgorithm::HS512 => Ok(Algorithm::HS512),
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
