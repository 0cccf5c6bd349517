//! JWT signing keys, persisted with their private half sealed by the
//! barrier.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningKeyStatus {
    Current,
    VerifyOnly,
    Retired,
}

impl SigningKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningKeyStatus::Current => "current",
            SigningKeyStatus::VerifyOnly => "verify_only",
            SigningKeyStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "current" => Some(SigningKeyStatus::Current),
            "verify_only" => Some(SigningKeyStatus::VerifyOnly),
            "retired" => Some(SigningKeyStatus::Retired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SigningKey {
    /// Doubles as the JWS `kid`.
    pub id: String,
    pub algorithm: String,
    pub public_key_pem: String,
    /// Barrier content-tier envelope of the PKCS#8 private key.
    pub private_key_enc: String,
    pub status: String,
    pub created_at: i64,
    pub rotated_at: Option<i64>,
    pub retired_at: Option<i64>,
}

impl SigningKey {
    pub fn status_(&self) -> Option<SigningKeyStatus> {
        SigningKeyStatus::parse(&self.status)
    }

    /// Retired keys no longer verify anything.
    pub fn usable_for_verify(&self) -> bool {
        matches!(
            self.status_(),
            Some(SigningKeyStatus::Current) | Some(SigningKeyStatus::VerifyOnly)
        )
    }
}
