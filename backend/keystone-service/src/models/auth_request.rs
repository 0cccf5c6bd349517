//! Authorization request model: the durable record backing the
//! authorize, login, consent, code, exchange flow.

/// Lifecycle state, derived from the persisted fields so a crash mid-flow
/// resumes exactly where the last durable write left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequestState {
    Pending,
    Authenticated,
    Consented,
    CodeIssued,
    Exchanged,
    Expired,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthorizationRequest {
    pub id: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    /// PKCE challenge, base64url-nopad SHA-256 of the verifier. The verifier
    /// itself is never stored.
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub nonce: Option<String>,
    pub code: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub consent_id: Option<String>,
    pub auth_time: Option<i64>,
    pub used: bool,
    pub used_at: Option<i64>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl AuthorizationRequest {
    pub fn state_at(&self, now: i64) -> AuthRequestState {
        if self.used {
            return AuthRequestState::Exchanged;
        }
        if now > self.expires_at {
            return AuthRequestState::Expired;
        }
        if self.code.is_some() {
            return AuthRequestState::CodeIssued;
        }
        if self.consent_id.is_some() {
            return AuthRequestState::Consented;
        }
        if self.user_id.is_some() {
            return AuthRequestState::Authenticated;
        }
        AuthRequestState::Pending
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}
