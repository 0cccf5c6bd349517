//! Signed JWT build and parse.
//!
//! Parsing always verifies the signature, `exp`, and `nbf`, plus expected
//! issuer/audience when configured. `alg: none` is unrepresentable and an
//! asymmetric JWK can never be used as an HMAC secret.

use serde::{Deserialize, Serialize};

use crate::alg::SignatureAlgorithm;
use crate::jwk::JwkSet;
use crate::{JoseError, Result, DEFAULT_LEEWAY_SECS};

/// Registered + platform claims. Unknown claims are preserved in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    // OIDC
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    // Profile claims selected by scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Private key material for signing.
pub enum SigningKeyMaterial<'a> {
    /// PKCS#8 PEM (RSA, EC, Ed25519).
    Pem(&'a str),
    /// Raw HMAC secret.
    Secret(&'a [u8]),
}

/// Verification expectations for [`parse_jwt`].
#[derive(Debug, Clone)]
pub struct Expectations {
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub leeway_secs: u64,
}

impl Default for Expectations {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: None,
            leeway_secs: DEFAULT_LEEWAY_SECS,
        }
    }
}

/// Build a compact signed JWT.
pub fn build_jwt(
    alg: SignatureAlgorithm,
    kid: Option<&str>,
    claims: &Claims,
    key: &SigningKeyMaterial<'_>,
) -> Result<String> {
    let jwt_alg = alg.to_jsonwebtoken()?;

    let encoding_key = match (key, alg.is_symmetric()) {
        (SigningKeyMaterial::Secret(secret), true) => {
            jsonwebtoken::EncodingKey::from_secret(secret)
        }
        (SigningKeyMaterial::Pem(pem), false) => match alg {
            SignatureAlgorithm::RS256
            | SignatureAlgorithm::RS384
            | SignatureAlgorithm::RS512
            | SignatureAlgorithm::PS256
            | SignatureAlgorithm::PS384
            | SignatureAlgorithm::PS512 => jsonwebtoken::EncodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|_| JoseError::InvalidKey)?,
            SignatureAlgorithm::ES256 | SignatureAlgorithm::ES384 => {
                jsonwebtoken::EncodingKey::from_ec_pem(pem.as_bytes())
                    .map_err(|_| JoseError::InvalidKey)?
            }
            SignatureAlgorithm::EdDSA => jsonwebtoken::EncodingKey::from_ed_pem(pem.as_bytes())
                .map_err(|_| JoseError::InvalidKey)?,
            _ => return Err(JoseError::AlgorithmUnsupported(alg.as_str().to_string())),
        },
        // Pem with HS or Secret with asymmetric: caller confusion, refuse.
        _ => return Err(JoseError::AlgorithmConfusion),
    };

    let mut header = jsonwebtoken::Header::new(jwt_alg);
    header.kid = kid.map(str::to_string);

    jsonwebtoken::encode(&header, claims, &encoding_key).map_err(|_| JoseError::InvalidKey)
}

/// Parse and verify an asymmetrically signed JWT against a public key set.
///
/// Key selection is by `kid` when the header carries one; otherwise every key
/// whose type matches the header algorithm is tried. HMAC-family headers are
/// rejected outright: a public JWK is never a MAC secret.
pub fn parse_jwt(token: &str, keys: &JwkSet, expect: &Expectations) -> Result<Claims> {
    let header = jsonwebtoken::decode_header(token).map_err(|_| JoseError::Malformed)?;
    let alg = alg_from_jsonwebtoken(header.alg)?;

    if alg.is_symmetric() {
        return Err(JoseError::AlgorithmConfusion);
    }

    let candidates: Vec<&crate::jwk::Jwk> = match header.kid.as_deref() {
        Some(kid) => keys.find(kid).into_iter().collect(),
        None => keys
            .keys
            .iter()
            .filter(|k| k.kty == alg.expected_kty())
            .collect(),
    };
    if candidates.is_empty() {
        return Err(JoseError::KeyNotFound);
    }

    let mut last_err = JoseError::SignatureInvalid;
    for jwk in candidates {
        if jwk.kty != alg.expected_kty() {
            return Err(JoseError::AlgorithmConfusion);
        }
        if let Some(declared) = jwk.algorithm() {
            if declared != alg {
                last_err = JoseError::SignatureInvalid;
                continue;
            }
        }
        let decoding_key = jwk.to_decoding_key()?;
        match decode_with(token, alg, &decoding_key, expect) {
            Ok(claims) => return Ok(claims),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Parse and verify an HMAC-signed JWT (client assertions).
pub fn parse_jwt_hs(token: &str, secret: &[u8], expect: &Expectations) -> Result<Claims> {
    let header = jsonwebtoken::decode_header(token).map_err(|_| JoseError::Malformed)?;
    let alg = alg_from_jsonwebtoken(header.alg)?;
    if !alg.is_symmetric() {
        return Err(JoseError::AlgorithmConfusion);
    }
    let key = jsonwebtoken::DecodingKey::from_secret(secret);
    decode_with(token, alg, &key, expect)
}

fn alg_from_jsonwebtoken(alg: jsonwebtoken::Algorithm) -> Result<SignatureAlgorithm> {
    use jsonwebtoken::Algorithm;

    Ok(match alg {
        Algorithm::RS256 => SignatureAlgorithm::RS256,
        Algorithm::RS384 => SignatureAlgorithm::RS384,
        Algorithm::RS512 => SignatureAlgorithm::RS512,
        Algorithm::PS256 => SignatureAlgorithm::PS256,
        Algorithm::PS384 => SignatureAlgorithm::PS384,
        Algorithm::PS512 => SignatureAlgorithm::PS512,
        Algorithm::ES256 => SignatureAlgorithm::ES256,
        Algorithm::ES384 => SignatureAlgorithm::ES384,
        Algorithm::EdDSA => SignatureAlgorithm::EdDSA,
        Algorithm::HS256 => SignatureAlgorithm::HS256,
        Algorithm::HS384 => SignatureAlgorithm::HS384,
        Algorithm::HS512 => SignatureAlgorithm::HS512,
    })
}

fn decode_with(
    token: &str,
    alg: SignatureAlgorithm,
    key: &jsonwebtoken::DecodingKey,
    expect: &Expectations,
) -> Result<Claims> {
    let mut validation = jsonwebtoken::Validation::new(alg.to_jsonwebtoken()?);
    validation.leeway = expect.leeway_secs;
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.set_required_spec_claims(&["exp"]);
    match &expect.issuer {
        Some(iss) => validation.set_issuer(&[iss]),
        None => validation.iss = None,
    }
    match &expect.audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }

    jsonwebtoken::decode::<Claims>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| map_jwt_error(&e))
}

fn map_jwt_error(err: &jsonwebtoken::errors::Error) -> JoseError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => JoseError::Expired,
        ErrorKind::ImmatureSignature => JoseError::NotYetValid,
        ErrorKind::InvalidIssuer => JoseError::IssuerMismatch,
        ErrorKind::InvalidAudience => JoseError::AudienceMismatch,
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            JoseError::AlgorithmConfusion
        }
        ErrorKind::InvalidSignature => JoseError::SignatureInvalid,
        ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) | ErrorKind::InvalidToken => {
            JoseError::Malformed
        }
        _ => JoseError::SignatureInvalid,
    }
}
