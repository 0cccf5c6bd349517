//! Token record model.
//!
//! Access and ID tokens are JWTs; their row exists for revocation and
//! introspection. Refresh tokens are opaque and stored as a SHA-256 hash
//! with a parent reference forming the rotation chain.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Access,
    Refresh,
    Id,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::Id => "id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "access" => Some(TokenType::Access),
            "refresh" => Some(TokenType::Refresh),
            "id" => Some(TokenType::Id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Token {
    /// `jti` for JWTs; random UUID for refresh tokens.
    pub id: String,
    pub token_type: String,
    pub client_id: String,
    /// Null for `client_credentials` grants.
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Authorization request that produced this token, when any; replayed
    /// codes cascade revocation through this link.
    pub auth_request_id: Option<String>,
    pub scope: String,
    /// SHA-256 of the opaque refresh token value (refresh only).
    pub token_hash: Option<String>,
    /// Parent refresh token in the rotation chain.
    pub parent_id: Option<String>,
    /// Signing key the JWT was bound to (access/id only).
    pub signing_key_id: Option<String>,
    pub issued_at: i64,
    pub expires_at: i64,
    pub revoked_at: Option<i64>,
}

impl Token {
    pub fn type_(&self) -> Option<TokenType> {
        TokenType::parse(&self.token_type)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    pub fn is_active(&self, now: i64) -> bool {
        !self.is_revoked() && !self.is_expired(now)
    }
}
