/// Client authentication at the token endpoint
///
/// Each client declares exactly one `token_endpoint_auth_method`; dispatch
/// is by that tag. Every failure maps to `invalid_client` and emits one
/// audit event carrying the client id, never the presented secret or
/// assertion.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use once_cell::sync::Lazy;

use jose_core::{Expectations, JwkSet};

use crate::clock::{nanos_to_secs, now_nanos, secs_to_nanos};
use crate::db;
use crate::error::{Result, ServiceError};
use crate::models::{Client, TokenEndpointAuthMethod};
use crate::security::password;
use crate::security::revocation::{extract_identity, RevocationStatus};
use crate::services::audit;
use crate::AppState;

pub const ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Maximum client-assertion lifetime (RFC-recommended short window).
const ASSERTION_MAX_LIFETIME_SECS: i64 = 300;

/// Burn target so unknown client ids cost the same as a wrong secret.
static DUMMY_RECORD: Lazy<String> =
    Lazy::new(|| password::hash_password("timing-equalizer").unwrap_or_default());

/// Credentials as presented on a token-endpoint request.
#[derive(Debug, Default)]
pub struct ClientCredentials {
    /// Decoded HTTP Basic pair.
    pub basic: Option<(String, String)>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion: Option<String>,
    pub client_assertion_type: Option<String>,
    /// Peer certificate chain from the TLS acceptor, leaf first.
    pub peer_chain_der: Vec<Vec<u8>>,
}

impl ClientCredentials {
    /// The client id this request claims to be, before verification.
    fn claimed_client_id(&self) -> Option<String> {
        if let Some((user, _)) = &self.basic {
            return Some(user.clone());
        }
        if let Some(id) = &self.client_id {
            return Some(id.clone());
        }
        self.client_assertion
            .as_deref()
            .and_then(|jwt| unverified_claim(jwt, "iss"))
    }
}

/// Authenticate the caller, returning the verified client registration.
pub async fn authenticate(state: &AppState, creds: &ClientCredentials) -> Result<Client> {
    let claimed = match creds.claimed_client_id() {
        Some(claimed) => claimed,
        None => {
            audit::emit(
                &state.pool,
                "client:unknown",
                "client.auth",
                audit::OUTCOME_DENIED,
                &[],
                serde_json::json!({"reason": "no_client_id"}),
            )
            .await;
            return Err(ServiceError::InvalidClient);
        }
    };

    let client = match db::clients::get_by_client_id(&state.pool, &claimed).await {
        Ok(client) => client,
        Err(db::DbError::NotFound) => {
            // Equalize timing with the secret-verification path.
            let _ = verify_secret_blocking("unknown", DUMMY_RECORD.clone()).await;
            deny(state, &claimed, "unknown_client").await;
            return Err(ServiceError::InvalidClient);
        }
        Err(err) => return Err(err.into()),
    };

    // Public clients hold no credential; possession of the PKCE verifier is
    // their proof at the grant layer.
    if !client.is_confidential {
        return Ok(client);
    }

    let method = client.auth_method().ok_or_else(|| {
        ServiceError::ConfigInvalid(format!(
            "client {} has unknown auth method",
            client.client_id
        ))
    })?;

    let outcome = match method {
        TokenEndpointAuthMethod::ClientSecretBasic => {
            let presented = creds
                .basic
                .as_ref()
                .filter(|(user, _)| user == &client.client_id)
                .map(|(_, secret)| secret.clone());
            verify_stored_secret(&client, presented).await
        }
        TokenEndpointAuthMethod::ClientSecretPost => {
            verify_stored_secret(&client, creds.client_secret.clone()).await
        }
        TokenEndpointAuthMethod::ClientSecretJwt => {
            verify_secret_jwt(state, &client, creds).await
        }
        TokenEndpointAuthMethod::PrivateKeyJwt => {
            verify_private_key_jwt(state, &client, creds).await
        }
        TokenEndpointAuthMethod::TlsClientAuth => {
            verify_mtls(state, &client, creds, true).await
        }
        TokenEndpointAuthMethod::SelfSignedTlsClientAuth => {
            verify_mtls(state, &client, creds, false).await
        }
    };

    match outcome {
        Ok(()) => Ok(client),
        Err(reason) => {
            deny(state, &client.client_id, reason).await;
            Err(ServiceError::InvalidClient)
        }
    }
}

async fn deny(state: &AppState, client_id: &str, reason: &str) {
    audit::emit(
        &state.pool,
        &format!("client:{client_id}"),
        "client.auth",
        audit::OUTCOME_DENIED,
        &[],
        serde_json::json!({ "reason": reason }),
    )
    .await;
}

async fn verify_secret_blocking(secret: &str, record: String) -> bool {
    let secret = secret.to_string();
    tokio::task::spawn_blocking(move || password::verify_password(&secret, &record))
        .await
        .unwrap_or(false)
}

async fn verify_stored_secret(
    client: &Client,
    presented: Option<String>,
) -> std::result::Result<(), &'static str> {
    let record = client
        .hashed_client_secret
        .clone()
        .ok_or("no_secret_registered")?;
    let presented = presented.ok_or("missing_secret")?;
    if verify_secret_blocking(&presented, record).await {
        Ok(())
    } else {
        Err("bad_secret")
    }
}

/// Shared claim rules for both JWT assertion methods: `aud` is the token
/// endpoint URL, `iss = sub = client_id`, short `exp`, single-use `jti`.
async fn check_assertion_claims(
    state: &AppState,
    client: &Client,
    claims: &jose_core::Claims,
) -> std::result::Result<(), &'static str> {
    if claims.sub.as_deref() != Some(client.client_id.as_str()) {
        return Err("assertion_sub_mismatch");
    }
    let now_secs = nanos_to_secs(now_nanos());
    let exp = claims.exp.ok_or("assertion_without_exp")?;
    if exp > now_secs + ASSERTION_MAX_LIFETIME_SECS + state.settings.oauth.clock_skew_secs as i64 {
        return Err("assertion_lifetime_excessive");
    }
    let jti = claims.jti.as_deref().ok_or("assertion_without_jti")?;
    match db::client_jwt_replay::track(
        &state.pool,
        jti,
        &client.client_id,
        secs_to_nanos(exp) + secs_to_nanos(ASSERTION_MAX_LIFETIME_SECS),
    )
    .await
    {
        Ok(()) => Ok(()),
        Err(db::DbError::Conflict) => Err("assertion_replayed"),
        Err(_) => Err("assertion_tracking_failed"),
    }
}

fn assertion_of<'a>(
    creds: &'a ClientCredentials,
) -> std::result::Result<&'a str, &'static str> {
    if creds.client_assertion_type.as_deref() != Some(ASSERTION_TYPE_JWT_BEARER) {
        return Err("wrong_assertion_type");
    }
    creds
        .client_assertion
        .as_deref()
        .ok_or("missing_assertion")
}

async fn verify_secret_jwt(
    state: &AppState,
    client: &Client,
    creds: &ClientCredentials,
) -> std::result::Result<(), &'static str> {
    let assertion = assertion_of(creds)?;
    let sealed = client
        .client_secret_enc
        .as_deref()
        .ok_or("no_secret_registered")?;
    let secret = state
        .barrier
        .decrypt_content(client.id.as_bytes(), sealed)
        .await
        .map_err(|_| "secret_unsealable")?;

    let expect = Expectations {
        issuer: Some(client.client_id.clone()),
        audience: Some(state.settings.token_endpoint_url()),
        leeway_secs: state.settings.oauth.clock_skew_secs,
    };
    let claims =
        jose_core::jwt::parse_jwt_hs(assertion, &secret, &expect).map_err(|_| "bad_assertion")?;
    check_assertion_claims(state, client, &claims).await
}

async fn verify_private_key_jwt(
    state: &AppState,
    client: &Client,
    creds: &ClientCredentials,
) -> std::result::Result<(), &'static str> {
    let assertion = assertion_of(creds)?;
    let jwks: JwkSet = client
        .client_jwks
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .ok_or("no_jwks_registered")?;

    let expect = Expectations {
        issuer: Some(client.client_id.clone()),
        audience: Some(state.settings.token_endpoint_url()),
        leeway_secs: state.settings.oauth.clock_skew_secs,
    };
    let claims = jose_core::parse_jwt(assertion, &jwks, &expect).map_err(|_| "bad_assertion")?;
    check_assertion_claims(state, client, &claims).await
}

async fn verify_mtls(
    state: &AppState,
    client: &Client,
    creds: &ClientCredentials,
    check_revocation: bool,
) -> std::result::Result<(), &'static str> {
    let leaf = creds.peer_chain_der.first().ok_or("no_client_certificate")?;
    let identity = extract_identity(leaf).map_err(|_| "unparsable_certificate")?;

    let subject_match = client
        .tls_subject_dn
        .as_deref()
        .is_some_and(|dn| dn == identity.subject_dn);
    let ski_match = match (&client.tls_ski, &identity.ski_hex) {
        (Some(registered), Some(presented)) => registered.eq_ignore_ascii_case(presented),
        _ => false,
    };
    if !subject_match && !ski_match {
        return Err("certificate_mismatch");
    }

    if check_revocation {
        let issuer = creds.peer_chain_der.get(1).map(|der| der.as_slice());
        match state.revocation.check(leaf, issuer).await {
            RevocationStatus::Revoked => return Err("certificate_revoked"),
            RevocationStatus::Good => {}
            RevocationStatus::Unknown => {
                tracing::warn!(
                    client_id = %client.client_id,
                    "revocation status unknown for client certificate"
                );
            }
        }
    }
    Ok(())
}

/// Read one claim from a JWT payload without verifying. Used only to find
/// which client to load; every security decision happens after real
/// verification.
fn unverified_claim(jwt: &str, claim: &str) -> Option<String> {
    let payload = jwt.split('.').nth(1)?;
    let raw = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value.get(claim)?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::to_json_list;
    use crate::services::token::tests::{test_client, test_state};
    use jose_core::jwt::SigningKeyMaterial;
    use jose_core::SignatureAlgorithm;

    async fn seeded(
        method: &str,
        mutate: impl FnOnce(&mut Client),
    ) -> (crate::AppState, Client) {
        let state = test_state().await;
        let mut client = test_client("confidential-1");
        client.token_endpoint_auth_method = method.to_string();
        mutate(&mut client);
        db::clients::insert(&state.pool, &client).await.unwrap();
        (state, client)
    }

    fn assertion_claims(client_id: &str, aud: &str, jti: &str) -> jose_core::Claims {
        let now = nanos_to_secs(now_nanos());
        jose_core::Claims {
            iss: Some(client_id.to_string()),
            sub: Some(client_id.to_string()),
            aud: Some(aud.to_string()),
            exp: Some(now + 120),
            iat: Some(now),
            jti: Some(jti.to_string()),
            ..jose_core::Claims::default()
        }
    }

    #[tokio::test]
    async fn test_client_secret_basic() {
        let secret_record = password::hash_with_iterations("s3cret", 1_000).unwrap();
        let (state, _) = seeded("client_secret_basic", |c| {
            c.hashed_client_secret = Some(secret_record);
        })
        .await;

        let ok = ClientCredentials {
            basic: Some(("confidential-1".into(), "s3cret".into())),
            ..ClientCredentials::default()
        };
        authenticate(&state, &ok).await.unwrap();

        let wrong = ClientCredentials {
            basic: Some(("confidential-1".into(), "nope".into())),
            ..ClientCredentials::default()
        };
        assert!(matches!(
            authenticate(&state, &wrong).await.unwrap_err(),
            ServiceError::InvalidClient
        ));

        // Basic user must equal the claimed client id.
        let mismatched = ClientCredentials {
            basic: Some(("confidential-1".into(), "s3cret".into())),
            client_id: Some("confidential-1".into()),
            ..ClientCredentials::default()
        };
        authenticate(&state, &mismatched).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_secret_post() {
        let secret_record = password::hash_with_iterations("post-secret", 1_000).unwrap();
        let (state, _) = seeded("client_secret_post", |c| {
            c.hashed_client_secret = Some(secret_record);
        })
        .await;

        let ok = ClientCredentials {
            client_id: Some("confidential-1".into()),
            client_secret: Some("post-secret".into()),
            ..ClientCredentials::default()
        };
        authenticate(&state, &ok).await.unwrap();

        let missing = ClientCredentials {
            client_id: Some("confidential-1".into()),
            ..ClientCredentials::default()
        };
        assert!(authenticate(&state, &missing).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_client_rejected() {
        let state = test_state().await;
        let creds = ClientCredentials {
            client_id: Some("ghost".into()),
            client_secret: Some("whatever".into()),
            ..ClientCredentials::default()
        };
        assert!(matches!(
            authenticate(&state, &creds).await.unwrap_err(),
            ServiceError::InvalidClient
        ));
    }

    #[tokio::test]
    async fn test_client_secret_jwt_with_replay_detection() {
        let state = test_state().await;
        let secret = b"assertion-hmac-secret-assertion-hmac".to_vec();

        let mut client = test_client("confidential-1");
        client.token_endpoint_auth_method = "client_secret_jwt".into();
        client.client_secret_enc = Some(
            state
                .barrier
                .encrypt_content(client.id.as_bytes(), &secret)
                .await
                .unwrap(),
        );
        db::clients::insert(&state.pool, &client).await.unwrap();

        let aud = state.settings.token_endpoint_url();
        let claims = assertion_claims("confidential-1", &aud, "jti-once");
        let assertion = jose_core::build_jwt(
            SignatureAlgorithm::HS256,
            None,
            &claims,
            &SigningKeyMaterial::Secret(&secret),
        )
        .unwrap();

        let creds = ClientCredentials {
            client_assertion: Some(assertion.clone()),
            client_assertion_type: Some(ASSERTION_TYPE_JWT_BEARER.into()),
            ..ClientCredentials::default()
        };
        authenticate(&state, &creds).await.unwrap();

        // Same jti again: replay.
        assert!(matches!(
            authenticate(&state, &creds).await.unwrap_err(),
            ServiceError::InvalidClient
        ));
    }

    #[tokio::test]
    async fn test_client_secret_jwt_rejects_wrong_audience_and_long_exp() {
        let state = test_state().await;
        let secret = b"assertion-hmac-secret-assertion-hmac".to_vec();
        let mut client = test_client("confidential-1");
        client.token_endpoint_auth_method = "client_secret_jwt".into();
        client.client_secret_enc = Some(
            state
                .barrier
                .encrypt_content(client.id.as_bytes(), &secret)
                .await
                .unwrap(),
        );
        db::clients::insert(&state.pool, &client).await.unwrap();

        let wrong_aud = assertion_claims("confidential-1", "https://other/token", "jti-1");
        let assertion = jose_core::build_jwt(
            SignatureAlgorithm::HS256,
            None,
            &wrong_aud,
            &SigningKeyMaterial::Secret(&secret),
        )
        .unwrap();
        let creds = ClientCredentials {
            client_assertion: Some(assertion),
            client_assertion_type: Some(ASSERTION_TYPE_JWT_BEARER.into()),
            ..ClientCredentials::default()
        };
        assert!(authenticate(&state, &creds).await.is_err());

        let mut long = assertion_claims(
            "confidential-1",
            &state.settings.token_endpoint_url(),
            "jti-2",
        );
        long.exp = Some(nanos_to_secs(now_nanos()) + 3600);
        let assertion = jose_core::build_jwt(
            SignatureAlgorithm::HS256,
            None,
            &long,
            &SigningKeyMaterial::Secret(&secret),
        )
        .unwrap();
        let creds = ClientCredentials {
            client_assertion: Some(assertion),
            client_assertion_type: Some(ASSERTION_TYPE_JWT_BEARER.into()),
            ..ClientCredentials::default()
        };
        assert!(authenticate(&state, &creds).await.is_err());
    }

    #[tokio::test]
    async fn test_private_key_jwt() {
        let keypair = crypto_core::asym::generate_keypair(crypto_core::asym::KeyAlgorithm::Ed25519)
            .unwrap();
        let jwk = jose_core::Jwk::from_public_key_pem(
            "client-key-1",
            SignatureAlgorithm::EdDSA,
            &keypair.public_key_pem,
        )
        .unwrap();
        let jwks = serde_json::to_string(&JwkSet { keys: vec![jwk] }).unwrap();

        let (state, _) = seeded("private_key_jwt", |c| {
            c.client_jwks = Some(jwks);
        })
        .await;

        let claims = assertion_claims(
            "confidential-1",
            &state.settings.token_endpoint_url(),
            "pk-jti-1",
        );
        let assertion = jose_core::build_jwt(
            SignatureAlgorithm::EdDSA,
            Some("client-key-1"),
            &claims,
            &SigningKeyMaterial::Pem(&keypair.private_key_pem),
        )
        .unwrap();

        let creds = ClientCredentials {
            client_assertion: Some(assertion),
            client_assertion_type: Some(ASSERTION_TYPE_JWT_BEARER.into()),
            ..ClientCredentials::default()
        };
        authenticate(&state, &creds).await.unwrap();

        // A different key does not verify.
        let other = crypto_core::asym::generate_keypair(crypto_core::asym::KeyAlgorithm::Ed25519)
            .unwrap();
        let claims = assertion_claims(
            "confidential-1",
            &state.settings.token_endpoint_url(),
            "pk-jti-2",
        );
        let forged = jose_core::build_jwt(
            SignatureAlgorithm::EdDSA,
            Some("client-key-1"),
            &claims,
            &SigningKeyMaterial::Pem(&other.private_key_pem),
        )
        .unwrap();
        let creds = ClientCredentials {
            client_assertion: Some(forged),
            client_assertion_type: Some(ASSERTION_TYPE_JWT_BEARER.into()),
            ..ClientCredentials::default()
        };
        assert!(authenticate(&state, &creds).await.is_err());
    }

    #[tokio::test]
    async fn test_self_signed_mtls_subject_match() {
        let mut params = rcgen::CertificateParams::default();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "mtls-client");
        let cert = rcgen::Certificate::from_params(params).unwrap();
        let der = cert.serialize_der().unwrap();
        let expected_dn = extract_identity(&der).unwrap().subject_dn;

        let (state, _) = seeded("self_signed_tls_client_auth", |c| {
            c.tls_subject_dn = Some(expected_dn);
        })
        .await;

        let ok = ClientCredentials {
            client_id: Some("confidential-1".into()),
            peer_chain_der: vec![der],
            ..ClientCredentials::default()
        };
        authenticate(&state, &ok).await.unwrap();

        // No certificate presented at all.
        let missing = ClientCredentials {
            client_id: Some("confidential-1".into()),
            ..ClientCredentials::default()
        };
        assert!(authenticate(&state, &missing).await.is_err());

        // A different certificate's subject does not match.
        let mut other_params = rcgen::CertificateParams::default();
        other_params.distinguished_name = rcgen::DistinguishedName::new();
        other_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "impostor");
        let other = rcgen::Certificate::from_params(other_params).unwrap();
        let wrong = ClientCredentials {
            client_id: Some("confidential-1".into()),
            peer_chain_der: vec![other.serialize_der().unwrap()],
            ..ClientCredentials::default()
        };
        assert!(authenticate(&state, &wrong).await.is_err());
    }

    #[tokio::test]
    async fn test_public_client_needs_no_credential() {
        let (state, _) = seeded("client_secret_basic", |c| {
            c.is_confidential = false;
        })
        .await;
        let creds = ClientCredentials {
            client_id: Some("confidential-1".into()),
            ..ClientCredentials::default()
        };
        authenticate(&state, &creds).await.unwrap();
    }
}
