//! JWK and JWKS types. Public keys only; private material never leaves the
//! barrier as a JWK.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::alg::SignatureAlgorithm;
use crate::{JoseError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    pub kid: String,
    // RSA
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    // EC / OKP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl Jwk {
    /// Build a signing-use JWK from an SPKI public key PEM.
    pub fn from_public_key_pem(
        kid: &str,
        alg: SignatureAlgorithm,
        public_key_pem: &str,
    ) -> Result<Self> {
        let mut jwk = Jwk {
            kty: alg.expected_kty().to_string(),
            use_: Some("sig".to_string()),
            alg: Some(alg.as_str().to_string()),
            kid: kid.to_string(),
            n: None,
            e: None,
            crv: None,
            x: None,
            y: None,
        };

        match alg {
            SignatureAlgorithm::RS256
            | SignatureAlgorithm::RS384
            | SignatureAlgorithm::RS512
            | SignatureAlgorithm::PS256
            | SignatureAlgorithm::PS384
            | SignatureAlgorithm::PS512 => {
                use rsa::pkcs8::DecodePublicKey;
                use rsa::traits::PublicKeyParts;

                let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                    .map_err(|_| JoseError::InvalidKey)?;
                jwk.n = Some(URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()));
                jwk.e = Some(URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()));
            }
            SignatureAlgorithm::ES256 => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                use p256::pkcs8::DecodePublicKey;

                let key = p256::PublicKey::from_public_key_pem(public_key_pem)
                    .map_err(|_| JoseError::InvalidKey)?;
                let point = key.to_encoded_point(false);
                jwk.crv = Some("P-256".to_string());
                jwk.x = Some(URL_SAFE_NO_PAD.encode(point.x().ok_or(JoseError::InvalidKey)?));
                jwk.y = Some(URL_SAFE_NO_PAD.encode(point.y().ok_or(JoseError::InvalidKey)?));
            }
            SignatureAlgorithm::ES384 => {
                use p384::elliptic_curve::sec1::ToEncodedPoint;
                use p384::pkcs8::DecodePublicKey;

                let key = p384::PublicKey::from_public_key_pem(public_key_pem)
                    .map_err(|_| JoseError::InvalidKey)?;
                let point = key.to_encoded_point(false);
                jwk.crv = Some("P-384".to_string());
                jwk.x = Some(URL_SAFE_NO_PAD.encode(point.x().ok_or(JoseError::InvalidKey)?));
                jwk.y = Some(URL_SAFE_NO_PAD.encode(point.y().ok_or(JoseError::InvalidKey)?));
            }
            SignatureAlgorithm::ES512 => {
                return Err(JoseError::AlgorithmUnsupported("ES512".to_string()))
            }
            SignatureAlgorithm::EdDSA => {
                use ed25519_dalek::pkcs8::DecodePublicKey;

                let key = ed25519_dalek::VerifyingKey::from_public_key_pem(public_key_pem)
                    .map_err(|_| JoseError::InvalidKey)?;
                jwk.crv = Some("Ed25519".to_string());
                jwk.x = Some(URL_SAFE_NO_PAD.encode(key.as_bytes()));
            }
            SignatureAlgorithm::HS256 | SignatureAlgorithm::HS384 | SignatureAlgorithm::HS512 => {
                // Symmetric keys are never published.
                return Err(JoseError::InvalidKey);
            }
        }

        Ok(jwk)
    }

    /// Declared algorithm, when present and recognized.
    pub fn algorithm(&self) -> Option<SignatureAlgorithm> {
        self.alg
            .as_deref()
            .and_then(|a| SignatureAlgorithm::parse(a).ok())
    }

    /// Convert to a `jsonwebtoken` decoding key.
    pub fn to_decoding_key(&self) -> Result<jsonwebtoken::DecodingKey> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self.n.as_deref().ok_or(JoseError::InvalidKey)?;
                let e = self.e.as_deref().ok_or(JoseError::InvalidKey)?;
                jsonwebtoken::DecodingKey::from_rsa_components(n, e)
                    .map_err(|_| JoseError::InvalidKey)
            }
            "EC" => {
                let x = self.x.as_deref().ok_or(JoseError::InvalidKey)?;
                let y = self.y.as_deref().ok_or(JoseError::InvalidKey)?;
                jsonwebtoken::DecodingKey::from_ec_components(x, y)
                    .map_err(|_| JoseError::InvalidKey)
            }
            "OKP" => {
                let x = self.x.as_deref().ok_or(JoseError::InvalidKey)?;
                jsonwebtoken::DecodingKey::from_ed_components(x).map_err(|_| JoseError::InvalidKey)
            }
            _ => Err(JoseError::InvalidKey),
        }
    }
}

/// Published key set (`/.well-known/jwks.json` shape).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}
