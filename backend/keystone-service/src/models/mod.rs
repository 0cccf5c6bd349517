/// Data models for identity, tokens, and key management
pub mod audit;
pub mod auth_request;
pub mod barrier_key;
pub mod client;
pub mod consent;
pub mod key_pool;
pub mod session;
pub mod signing_key;
pub mod tenant;
pub mod token;
pub mod user;

pub use audit::AuditEvent;
pub use auth_request::{AuthRequestState, AuthorizationRequest};
pub use barrier_key::{BarrierKeyRecord, KeyTier};
pub use client::{Client, GrantType, TokenEndpointAuthMethod};
pub use consent::ConsentDecision;
pub use key_pool::{KeyPool, KeyPoolOp, MaterialKey, MaterialKeyStatus, PoolAlgorithm};
pub use session::Session;
pub use signing_key::{SigningKey, SigningKeyStatus};
pub use tenant::Tenant;
pub use token::{Token, TokenType};
pub use user::User;

/// Parse a JSON-array TEXT column into strings. Malformed content yields an
/// empty list rather than an error; writers only ever store valid JSON.
pub fn parse_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Serialize a list for a JSON-array TEXT column.
pub fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Canonical scope form: tokens sorted and deduplicated, space-joined.
pub fn canonical_scope(scope: &str) -> String {
    let mut parts: Vec<&str> = scope.split_whitespace().collect();
    parts.sort_unstable();
    parts.dedup();
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_list_round_trip() {
        let items = vec!["a".to_string(), "b".to_string()];
        assert_eq!(parse_json_list(&to_json_list(&items)), items);
    }

    #[test]
    fn test_json_list_tolerates_garbage() {
        assert!(parse_json_list("not json").is_empty());
    }

    #[test]
    fn test_canonical_scope_sorts_and_dedupes() {
        assert_eq!(canonical_scope("profile openid openid email"), "email openid profile");
        assert_eq!(canonical_scope(""), "");
        assert_eq!(canonical_scope("  openid  "), "openid");
    }
}
