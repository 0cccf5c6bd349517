use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::db::DbError;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Platform error taxonomy.
///
/// Variants group into client-input, state, auth, integrity, transient, and
/// permanent classes; the class decides the externally visible OAuth code and
/// HTTP status. Internal detail never reaches a response body.
#[derive(Debug, Error)]
pub enum ServiceError {
    // Client input
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid grant")]
    InvalidGrant,

    #[error("client authentication failed")]
    InvalidClient,

    #[error("invalid scope")]
    InvalidScope,

    #[error("unsupported grant type")]
    UnsupportedGrantType,

    #[error("client not authorized for this grant")]
    UnauthorizedClient,

    // State
    #[error("expired")]
    Expired,

    #[error("revoked")]
    Revoked,

    #[error("already used")]
    AlreadyUsed,

    #[error("conflict")]
    Conflict,

    // Auth
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    // Integrity
    #[error("barrier is sealed")]
    Sealed,

    #[error("integrity check failed")]
    IntegrityFailed,

    #[error("key not found")]
    KeyNotFound,

    // Transient
    #[error("temporarily unavailable")]
    Unavailable,

    #[error("request timed out")]
    Timeout,

    // Permanent
    #[error("not found")]
    NotFound,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl ServiceError {
    /// OAuth error code for the response body. The code set is closed.
    pub fn oauth_code(&self) -> &'static str {
        match self {
            ServiceError::InvalidRequest(_) | ServiceError::NotFound => "invalid_request",
            ServiceError::InvalidClient | ServiceError::Unauthenticated => "invalid_client",
            ServiceError::InvalidGrant
            | ServiceError::Expired
            | ServiceError::Revoked
            | ServiceError::AlreadyUsed
            | ServiceError::Conflict => "invalid_grant",
            ServiceError::UnauthorizedClient | ServiceError::Forbidden => "unauthorized_client",
            ServiceError::UnsupportedGrantType => "unsupported_grant_type",
            ServiceError::InvalidScope => "invalid_scope",
            ServiceError::Internal(_) | ServiceError::ConfigInvalid(_) => "server_error",
            ServiceError::Sealed
            | ServiceError::IntegrityFailed
            | ServiceError::KeyNotFound
            | ServiceError::Unavailable
            | ServiceError::Timeout => "temporarily_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidRequest(_)
            | ServiceError::InvalidGrant
            | ServiceError::InvalidScope
            | ServiceError::UnsupportedGrantType
            | ServiceError::UnauthorizedClient
            | ServiceError::Expired
            | ServiceError::Revoked
            | ServiceError::AlreadyUsed
            | ServiceError::Conflict => StatusCode::BAD_REQUEST,
            ServiceError::InvalidClient | ServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::Sealed
            | ServiceError::IntegrityFailed
            | ServiceError::KeyNotFound
            | ServiceError::Unavailable
            | ServiceError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Internal(_) | ServiceError::ConfigInvalid(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Human-readable description safe for the wire. Internal variants get a
    /// generic message; the real cause stays in the logs.
    fn public_description(&self) -> Option<String> {
        match self {
            ServiceError::InvalidRequest(msg) => Some(msg.clone()),
            ServiceError::Sealed => Some("service is sealed".to_string()),
            ServiceError::Internal(_) | ServiceError::ConfigInvalid(_) => None,
            ServiceError::Unavailable | ServiceError::Timeout => None,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match &self {
            ServiceError::Internal(msg) | ServiceError::ConfigInvalid(msg) => {
                tracing::error!(error = %msg, "internal error");
            }
            ServiceError::IntegrityFailed => {
                tracing::error!("integrity failure surfaced to handler");
            }
            other => {
                tracing::debug!(error = %other, "request failed");
            }
        }

        let body = ErrorBody {
            error: self.oauth_code(),
            error_description: self.public_description(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<DbError> for ServiceError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => ServiceError::NotFound,
            DbError::Conflict => ServiceError::Conflict,
            DbError::Serialization | DbError::Transient(_) => ServiceError::Unavailable,
            DbError::Permanent(msg) => ServiceError::Internal(msg),
        }
    }
}

impl From<crypto_core::CryptoError> for ServiceError {
    fn from(err: crypto_core::CryptoError) -> Self {
        use crypto_core::CryptoError;

        match err {
            CryptoError::AlgorithmUnsupported(alg) => {
                ServiceError::InvalidRequest(format!("unsupported algorithm: {alg}"))
            }
            CryptoError::VerifyFailed => ServiceError::InvalidGrant,
            other => {
                tracing::error!(error = %other, "crypto primitive failure");
                ServiceError::Internal("crypto failure".to_string())
            }
        }
    }
}

impl From<jose_core::JoseError> for ServiceError {
    fn from(err: jose_core::JoseError) -> Self {
        use jose_core::JoseError;

        match err {
            JoseError::Expired => ServiceError::Expired,
            JoseError::AlgorithmUnsupported(alg) => {
                ServiceError::InvalidRequest(format!("unsupported algorithm: {alg}"))
            }
            JoseError::Malformed
            | JoseError::SignatureInvalid
            | JoseError::NotYetValid
            | JoseError::IssuerMismatch
            | JoseError::AudienceMismatch
            | JoseError::AlgorithmConfusion
            | JoseError::KeyNotFound
            | JoseError::InvalidKey
            | JoseError::DecryptionFailed => ServiceError::Unauthenticated,
        }
    }
}

impl From<crate::barrier::BarrierError> for ServiceError {
    fn from(err: crate::barrier::BarrierError) -> Self {
        use crate::barrier::BarrierError;

        match err {
            BarrierError::Sealed => ServiceError::Sealed,
            BarrierError::IntegrityFailed => ServiceError::IntegrityFailed,
            BarrierError::KeyNotFound => ServiceError::KeyNotFound,
            BarrierError::AlgorithmUnsupported(alg) => {
                ServiceError::InvalidRequest(format!("unsupported algorithm: {alg}"))
            }
            BarrierError::RotationInProgress => ServiceError::Unavailable,
            BarrierError::InvalidShare | BarrierError::AlreadyInitialized => {
                ServiceError::InvalidRequest(err.to_string())
            }
            BarrierError::Db(db) => ServiceError::from(db),
            BarrierError::Crypto(c) => ServiceError::from(c),
        }
    }
}
