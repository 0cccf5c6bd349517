//! Token service: issuance, validation, introspection, revocation, and
//! refresh rotation.
//!
//! Access and ID tokens are JWTs signed by the keystore's current key;
//! refresh tokens are opaque 256-bit values persisted only as SHA-256
//! hashes. Rotation revokes the parent and mints the pair in one
//! transaction; reuse of a rotated parent revokes the whole chain.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use sqlx::AnyConnection;
use uuid::Uuid;

use jose_core::jwt::SigningKeyMaterial;
use jose_core::{Claims, Expectations};

use crate::clock::{nanos_to_secs, now_nanos, secs_to_nanos};
use crate::db;
use crate::error::{Result, ServiceError};
use crate::models::{Client, Token, TokenType, User};
use crate::services::audit;
use crate::AppState;

/// Token endpoint response shape (RFC 6749 §5.1).
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

/// Introspection response shape (RFC 7662).
#[derive(Debug, Clone, Serialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            sub: None,
            token_type: None,
            exp: None,
            iat: None,
            jti: None,
        }
    }
}

/// Inputs shared by the issuance paths.
pub struct IssueContext<'a> {
    pub client: &'a Client,
    pub user: Option<&'a User>,
    pub scope: &'a str,
    pub session_id: Option<&'a str>,
    pub auth_request_id: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub auth_time: Option<i64>,
}

fn sha256_hex(input: &[u8]) -> String {
    hex::encode(crypto_core::digest::sha256(input))
}

/// Issue the full grant response: access token, refresh token when the
/// client may use the `refresh_token` grant, ID token when `openid` was
/// granted to a user. All rows land on the supplied connection so the
/// caller's transaction owns atomicity.
pub async fn issue_grant(
    state: &AppState,
    ctx: &IssueContext<'_>,
    conn: &mut AnyConnection,
) -> Result<TokenResponse> {
    let (access_token, _jti) = issue_access(state, ctx, None, conn).await?;

    let refresh_token = if ctx
        .client
        .allows_grant(crate::models::GrantType::RefreshToken)
    {
        Some(issue_refresh(ctx, None, conn).await?)
    } else {
        None
    };

    let id_token = match ctx.user {
        Some(user) if ctx.scope.split_whitespace().any(|s| s == "openid") => {
            Some(issue_id_token(state, ctx, user, conn).await?)
        }
        _ => None,
    };

    state.telemetry.record_metric("tokens.issued", 1.0);
    Ok(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: ctx.client.access_token_lifetime_secs,
        refresh_token,
        id_token,
        scope: ctx.scope.to_string(),
    })
}

/// Issue a signed access token and persist its record.
pub async fn issue_access(
    state: &AppState,
    ctx: &IssueContext<'_>,
    parent_id: Option<&str>,
    conn: &mut AnyConnection,
) -> Result<(String, String)> {
    let (kid, algorithm, private_pem) = state.keystore.current_signer().await?;

    let now = now_nanos();
    let expires_at = now + secs_to_nanos(ctx.client.access_token_lifetime_secs);
    let jti = Uuid::now_v7().to_string();

    let sub = match ctx.user {
        Some(user) => user.id.clone(),
        None => ctx.client.client_id.clone(),
    };

    let mut claims = Claims {
        iss: Some(state.settings.issuer.clone()),
        sub: Some(sub),
        aud: Some(ctx.client.client_id.clone()),
        exp: Some(nanos_to_secs(expires_at)),
        iat: Some(nanos_to_secs(now)),
        jti: Some(jti.clone()),
        scope: Some(ctx.scope.to_string()),
        client_id: Some(ctx.client.client_id.clone()),
        token_type: Some("access".to_string()),
        ..Claims::default()
    };
    claims.extra.insert(
        "tenant".to_string(),
        serde_json::Value::String(ctx.client.tenant_id.clone()),
    );

    let jwt = jose_core::build_jwt(
        algorithm,
        Some(&kid),
        &claims,
        &SigningKeyMaterial::Pem(&private_pem),
    )?;

    let row = Token {
        id: jti.clone(),
        token_type: TokenType::Access.as_str().to_string(),
        client_id: ctx.client.client_id.clone(),
        user_id: ctx.user.map(|u| u.id.clone()),
        session_id: ctx.session_id.map(str::to_string),
        auth_request_id: ctx.auth_request_id.map(str::to_string),
        scope: ctx.scope.to_string(),
        token_hash: None,
        parent_id: parent_id.map(str::to_string),
        signing_key_id: Some(kid),
        issued_at: now,
        expires_at,
        revoked_at: None,
    };
    db::tokens::insert(conn, &row).await?;

    Ok((jwt, jti))
}

/// Issue an opaque refresh token. The plaintext is returned exactly once;
/// only its hash is stored.
pub async fn issue_refresh(
    ctx: &IssueContext<'_>,
    parent_id: Option<&str>,
    conn: &mut AnyConnection,
) -> Result<String> {
    let now = now_nanos();
    let plaintext = URL_SAFE_NO_PAD.encode(crypto_core::random_bytes(32));

    let row = Token {
        id: Uuid::now_v7().to_string(),
        token_type: TokenType::Refresh.as_str().to_string(),
        client_id: ctx.client.client_id.clone(),
        user_id: ctx.user.map(|u| u.id.clone()),
        session_id: ctx.session_id.map(str::to_string),
        auth_request_id: ctx.auth_request_id.map(str::to_string),
        scope: ctx.scope.to_string(),
        token_hash: Some(sha256_hex(plaintext.as_bytes())),
        parent_id: parent_id.map(str::to_string),
        signing_key_id: None,
        issued_at: now,
        expires_at: now + secs_to_nanos(ctx.client.refresh_token_lifetime_secs),
        revoked_at: None,
    };
    db::tokens::insert(conn, &row).await?;

    Ok(plaintext)
}

/// Issue an OIDC ID token with profile claims selected by scope.
pub async fn issue_id_token(
    state: &AppState,
    ctx: &IssueContext<'_>,
    user: &User,
    conn: &mut AnyConnection,
) -> Result<String> {
    let (kid, algorithm, private_pem) = state.keystore.current_signer().await?;

    let now = now_nanos();
    let expires_at = now + secs_to_nanos(ctx.client.access_token_lifetime_secs);
    let jti = Uuid::now_v7().to_string();
    let scopes: Vec<&str> = ctx.scope.split_whitespace().collect();

    let claims = Claims {
        iss: Some(state.settings.issuer.clone()),
        sub: Some(user.id.clone()),
        aud: Some(ctx.client.client_id.clone()),
        exp: Some(nanos_to_secs(expires_at)),
        iat: Some(nanos_to_secs(now)),
        jti: Some(jti.clone()),
        token_type: Some("id".to_string()),
        nonce: ctx.nonce.map(str::to_string),
        auth_time: ctx.auth_time.map(nanos_to_secs),
        preferred_username: scopes
            .contains(&"profile")
            .then(|| user.username.clone()),
        name: scopes.contains(&"profile").then(|| user.display_name()),
        email: scopes.contains(&"email").then(|| user.email.clone()),
        email_verified: scopes.contains(&"email").then_some(user.email_verified),
        ..Claims::default()
    };

    let jwt = jose_core::build_jwt(
        algorithm,
        Some(&kid),
        &claims,
        &SigningKeyMaterial::Pem(&private_pem),
    )?;

    let row = Token {
        id: jti,
        token_type: TokenType::Id.as_str().to_string(),
        client_id: ctx.client.client_id.clone(),
        user_id: Some(user.id.clone()),
        session_id: ctx.session_id.map(str::to_string),
        auth_request_id: ctx.auth_request_id.map(str::to_string),
        scope: ctx.scope.to_string(),
        token_hash: None,
        parent_id: None,
        signing_key_id: Some(kid),
        issued_at: now,
        expires_at,
        revoked_at: None,
    };
    db::tokens::insert(conn, &row).await?;

    Ok(jwt)
}

/// Validate a bearer access token: signature, expiry, issuer, revocation.
pub async fn validate_access(state: &AppState, token: &str) -> Result<(Claims, Token)> {
    let jwks = state.keystore.jwks().await?;
    let expect = Expectations {
        issuer: Some(state.settings.issuer.clone()),
        audience: None,
        leeway_secs: state.settings.oauth.clock_skew_secs,
    };
    let claims = jose_core::parse_jwt(token, &jwks, &expect)?;

    if claims.token_type.as_deref() != Some("access") {
        return Err(ServiceError::Unauthenticated);
    }
    let jti = claims.jti.as_deref().ok_or(ServiceError::Unauthenticated)?;

    let row = match db::tokens::get(&state.pool, jti).await {
        Ok(row) => row,
        Err(db::DbError::NotFound) => return Err(ServiceError::Unauthenticated),
        Err(err) => return Err(err.into()),
    };
    if row.is_revoked() {
        return Err(ServiceError::Revoked);
    }
    Ok((claims, row))
}

/// RFC 7662 introspection. Unknown, expired, malformed, and revoked tokens
/// are all simply inactive.
pub async fn introspect(state: &AppState, token: &str) -> Result<IntrospectionResponse> {
    let now = now_nanos();

    // JWT path first (access / ID tokens).
    if token.matches('.').count() == 2 {
        let jwks = state.keystore.jwks().await?;
        let expect = Expectations {
            issuer: Some(state.settings.issuer.clone()),
            audience: None,
            leeway_secs: state.settings.oauth.clock_skew_secs,
        };
        return Ok(match jose_core::parse_jwt(token, &jwks, &expect) {
            Ok(claims) => {
                let jti = claims.jti.clone().unwrap_or_default();
                match db::tokens::get(&state.pool, &jti).await {
                    Ok(row) if row.is_active(now) => IntrospectionResponse {
                        active: true,
                        scope: claims.scope,
                        client_id: claims.client_id,
                        sub: claims.sub,
                        token_type: claims.token_type,
                        exp: claims.exp,
                        iat: claims.iat,
                        jti: Some(jti),
                    },
                    _ => IntrospectionResponse::inactive(),
                }
            }
            Err(_) => IntrospectionResponse::inactive(),
        });
    }

    // Opaque refresh token path.
    match db::tokens::get_by_hash_pool(&state.pool, &sha256_hex(token.as_bytes())).await {
        Ok(row) if row.is_active(now) => Ok(IntrospectionResponse {
            active: true,
            scope: Some(row.scope.clone()),
            client_id: Some(row.client_id.clone()),
            sub: row.user_id.clone(),
            token_type: Some(row.token_type.clone()),
            exp: Some(nanos_to_secs(row.expires_at)),
            iat: Some(nanos_to_secs(row.issued_at)),
            jti: Some(row.id),
        }),
        Ok(_) => Ok(IntrospectionResponse::inactive()),
        Err(db::DbError::NotFound) => Ok(IntrospectionResponse::inactive()),
        Err(err) => Err(err.into()),
    }
}

/// RFC 7009 revocation: idempotent, succeeds for unknown tokens. Revoking a
/// refresh token takes its whole descendant chain with it.
pub async fn revoke(state: &AppState, token: &str) -> Result<()> {
    let now = now_nanos();

    if token.matches('.').count() == 2 {
        let jwks = state.keystore.jwks().await?;
        let expect = Expectations {
            issuer: None,
            audience: None,
            // Expired-but-authentic tokens must still resolve to their row;
            // only the signature gates revocation.
            leeway_secs: 1_000_000_000,
        };
        if let Ok(claims) = jose_core::parse_jwt(token, &jwks, &expect) {
            if let Some(jti) = claims.jti.as_deref() {
                db::tokens::revoke(&state.pool, jti, now).await?;
                state.telemetry.record_metric("tokens.revoked", 1.0);
            }
        }
        return Ok(());
    }

    match db::tokens::get_by_hash_pool(&state.pool, &sha256_hex(token.as_bytes())).await {
        Ok(row) => {
            let revoked = db::tokens::revoke_chain_pool(&state.pool, &row.id, now).await?;
            state.telemetry.record_metric("tokens.revoked", revoked as f64);
            Ok(())
        }
        Err(db::DbError::NotFound) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Rotate a refresh token: revoke the parent and issue a fresh pair in one
/// transaction. A second use of the rotated parent is a hard
/// `invalid_grant` and revokes the entire chain.
pub async fn rotate_refresh(
    state: &AppState,
    client: &Client,
    refresh_plain: &str,
) -> Result<TokenResponse> {
    let now = now_nanos();
    let hash = sha256_hex(refresh_plain.as_bytes());

    let parent = match db::tokens::get_by_hash_pool(&state.pool, &hash).await {
        Ok(parent) => parent,
        Err(db::DbError::NotFound) => return Err(ServiceError::InvalidGrant),
        Err(err) => return Err(err.into()),
    };

    if parent.type_() != Some(TokenType::Refresh) || parent.client_id != client.client_id {
        return Err(ServiceError::InvalidGrant);
    }
    if parent.is_expired(now) {
        return Err(ServiceError::Expired);
    }

    let user = match parent.user_id.as_deref() {
        Some(user_id) => Some(db::users::get_by_id(&state.pool, user_id).await?),
        None => None,
    };

    // Parent revocation and child issuance share one transaction; the
    // conditional revocation doubles as the reuse detector.
    let mut tx = state.pool.begin().await.map_err(db::DbError::from)?;
    if !db::tokens::revoke_if_active(&mut tx, &parent.id, now).await? {
        // Reuse of an already-rotated token: kill the whole chain.
        drop(tx);
        let revoked = db::tokens::revoke_chain_pool(&state.pool, &parent.id, now).await?;
        audit::emit(
            &state.pool,
            &format!("client:{}", client.client_id),
            "token.refresh_reuse",
            audit::OUTCOME_DENIED,
            &[parent.id.as_str()],
            serde_json::json!({ "chain_revoked": revoked }),
        )
        .await;
        return Err(ServiceError::InvalidGrant);
    }

    let ctx = IssueContext {
        client,
        user: user.as_ref(),
        scope: &parent.scope,
        session_id: parent.session_id.as_deref(),
        auth_request_id: parent.auth_request_id.as_deref(),
        nonce: None,
        auth_time: None,
    };

    let (access_token, _) = issue_access(state, &ctx, Some(&parent.id), &mut tx).await?;
    let refresh_token = issue_refresh(&ctx, Some(&parent.id), &mut tx).await?;

    tx.commit().await.map_err(db::DbError::from)?;

    state.telemetry.record_metric("tokens.rotated", 1.0);
    Ok(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: client.access_token_lifetime_secs,
        refresh_token: Some(refresh_token),
        id_token: None,
        scope: parent.scope,
    })
}
