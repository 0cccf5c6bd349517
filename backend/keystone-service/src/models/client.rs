//! OAuth client registration model.

use serde::{Deserialize, Serialize};

use super::{parse_json_list, to_json_list};

/// Grant types a client may use at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    ClientCredentials,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
            GrantType::ClientCredentials => "client_credentials",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authorization_code" => Some(GrantType::AuthorizationCode),
            "refresh_token" => Some(GrantType::RefreshToken),
            "client_credentials" => Some(GrantType::ClientCredentials),
            _ => None,
        }
    }
}

/// Registered token-endpoint authentication method. Each client declares
/// exactly one; dispatch is by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenEndpointAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    ClientSecretJwt,
    PrivateKeyJwt,
    TlsClientAuth,
    SelfSignedTlsClientAuth,
}

impl TokenEndpointAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenEndpointAuthMethod::ClientSecretBasic => "client_secret_basic",
            TokenEndpointAuthMethod::ClientSecretPost => "client_secret_post",
            TokenEndpointAuthMethod::ClientSecretJwt => "client_secret_jwt",
            TokenEndpointAuthMethod::PrivateKeyJwt => "private_key_jwt",
            TokenEndpointAuthMethod::TlsClientAuth => "tls_client_auth",
            TokenEndpointAuthMethod::SelfSignedTlsClientAuth => "self_signed_tls_client_auth",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_secret_basic" => Some(TokenEndpointAuthMethod::ClientSecretBasic),
            "client_secret_post" => Some(TokenEndpointAuthMethod::ClientSecretPost),
            "client_secret_jwt" => Some(TokenEndpointAuthMethod::ClientSecretJwt),
            "private_key_jwt" => Some(TokenEndpointAuthMethod::PrivateKeyJwt),
            "tls_client_auth" => Some(TokenEndpointAuthMethod::TlsClientAuth),
            "self_signed_tls_client_auth" => Some(TokenEndpointAuthMethod::SelfSignedTlsClientAuth),
            _ => None,
        }
    }
}

/// OAuth client row. `client_id` is immutable; credentials are owned
/// exclusively by this record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Client {
    pub id: String,
    pub client_id: String,
    pub client_name: String,
    pub tenant_id: String,
    /// JSON array of exact-match redirect URIs; at least one entry.
    pub redirect_uris: String,
    /// JSON array of grant type names.
    pub grant_types: String,
    pub token_endpoint_auth_method: String,
    /// PBKDF2-HMAC-SHA256 record, `pbkdf2-sha256$<iters>$<salt>$<hash>`.
    pub hashed_client_secret: Option<String>,
    /// Legacy plaintext secret; hashed and nulled by the first-start
    /// migration pass.
    pub client_secret: Option<String>,
    /// Barrier-encrypted secret copy, present only for `client_secret_jwt`
    /// clients (HMAC verification needs the raw secret).
    pub client_secret_enc: Option<String>,
    /// Registered JWKS for `private_key_jwt` clients (JSON).
    pub client_jwks: Option<String>,
    /// Expected subject DN for `tls_client_auth`.
    pub tls_subject_dn: Option<String>,
    /// Expected subject key identifier (hex) for mTLS methods.
    pub tls_ski: Option<String>,
    /// JSON array of scopes the client may request.
    pub scopes_allowed: String,
    pub is_confidential: bool,
    pub access_token_lifetime_secs: i64,
    pub refresh_token_lifetime_secs: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Client {
    pub fn redirect_uri_list(&self) -> Vec<String> {
        parse_json_list(&self.redirect_uris)
    }

    pub fn grant_type_list(&self) -> Vec<GrantType> {
        parse_json_list(&self.grant_types)
            .iter()
            .filter_map(|g| GrantType::parse(g))
            .collect()
    }

    pub fn scopes_allowed_list(&self) -> Vec<String> {
        parse_json_list(&self.scopes_allowed)
    }

    pub fn auth_method(&self) -> Option<TokenEndpointAuthMethod> {
        TokenEndpointAuthMethod::parse(&self.token_endpoint_auth_method)
    }

    /// Exact-match redirect URI comparison; no wildcard or prefix logic.
    pub fn allows_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uri_list().iter().any(|u| u == uri)
    }

    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_type_list().contains(&grant)
    }

    /// Every requested scope token must be individually allowed.
    pub fn allows_scope(&self, scope: &str) -> bool {
        let allowed = self.scopes_allowed_list();
        scope
            .split_whitespace()
            .all(|s| allowed.iter().any(|a| a == s))
    }

    pub fn set_redirect_uris(&mut self, uris: &[String]) {
        self.redirect_uris = to_json_list(uris);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Client {
        Client {
            id: "id".into(),
            client_id: "client-1".into(),
            client_name: "Test".into(),
            tenant_id: "tenant-1".into(),
            redirect_uris: to_json_list(&["https://rp/cb".to_string()]),
            grant_types: to_json_list(&[
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ]),
            token_endpoint_auth_method: "client_secret_basic".into(),
            hashed_client_secret: None,
            client_secret: None,
            client_secret_enc: None,
            client_jwks: None,
            tls_subject_dn: None,
            tls_ski: None,
            scopes_allowed: to_json_list(&["openid".to_string(), "profile".to_string()]),
            is_confidential: true,
            access_token_lifetime_secs: 3600,
            refresh_token_lifetime_secs: 86400,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_redirect_uri_exact_match_only() {
        let client = sample();
        assert!(client.allows_redirect_uri("https://rp/cb"));
        assert!(!client.allows_redirect_uri("https://rp/cb/"));
        assert!(!client.allows_redirect_uri("https://rp/cb?x=1"));
        assert!(!client.allows_redirect_uri("https://rp"));
    }

    #[test]
    fn test_grant_gating() {
        let client = sample();
        assert!(client.allows_grant(GrantType::AuthorizationCode));
        assert!(!client.allows_grant(GrantType::ClientCredentials));
    }

    #[test]
    fn test_scope_gating() {
        let client = sample();
        assert!(client.allows_scope("openid"));
        assert!(client.allows_scope("openid profile"));
        assert!(!client.allows_scope("openid admin"));
    }

    #[test]
    fn test_auth_method_round_trip() {
        for m in [
            "client_secret_basic",
            "client_secret_post",
            "client_secret_jwt",
            "private_key_jwt",
            "tls_client_auth",
            "self_signed_tls_client_auth",
        ] {
            assert_eq!(TokenEndpointAuthMethod::parse(m).unwrap().as_str(), m);
        }
        assert!(TokenEndpointAuthMethod::parse("none").is_none());
    }
}
