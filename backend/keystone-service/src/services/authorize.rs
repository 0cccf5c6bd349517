//! Authorization code flow state machine.
//!
//! Pending → Authenticated → Consented → CodeIssued → Exchanged | Expired,
//! every transition a durable write, so a crash mid-flow resumes from the
//! persisted request on the next browser hit. PKCE is S256-only and the
//! verifier is never stored.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use uuid::Uuid;

use crate::clock::{now_nanos, secs_to_nanos};
use crate::db;
use crate::error::{Result, ServiceError};
use crate::models::{
    canonical_scope, AuthorizationRequest, Client, ConsentDecision, GrantType, Session,
};
use crate::security::pkce;
use crate::services::{audit, token};
use crate::AppState;

/// Raw `/authorize` query parameters.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AuthorizeParams {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
}

/// Resolve and validate the client and redirect URI, the only failures
/// that must never redirect (the URI is unverified until this passes).
pub async fn resolve_client(
    state: &AppState,
    params: &AuthorizeParams,
) -> Result<(Client, String)> {
    let client_id = params
        .client_id
        .as_deref()
        .ok_or_else(|| ServiceError::InvalidRequest("client_id is required".into()))?;
    let client = match db::clients::get_by_client_id(&state.pool, client_id).await {
        Ok(client) => client,
        Err(db::DbError::NotFound) => return Err(ServiceError::InvalidClient),
        Err(err) => return Err(err.into()),
    };

    let redirect_uri = params
        .redirect_uri
        .as_deref()
        .ok_or_else(|| ServiceError::InvalidRequest("redirect_uri is required".into()))?;
    if !client.allows_redirect_uri(redirect_uri) {
        return Err(ServiceError::InvalidRequest("redirect_uri not registered".into()));
    }
    Ok((client, redirect_uri.to_string()))
}

/// Validate an incoming authorize request and persist it as Pending.
pub async fn begin(state: &AppState, params: &AuthorizeParams) -> Result<AuthorizationRequest> {
    let (client, redirect_uri) = resolve_client(state, params).await?;
    let redirect_uri = redirect_uri.as_str();

    if params.response_type.as_deref() != Some("code") {
        return Err(ServiceError::InvalidRequest(
            "only response_type=code is supported".into(),
        ));
    }
    if !client.allows_grant(GrantType::AuthorizationCode) {
        return Err(ServiceError::UnauthorizedClient);
    }

    let scope = canonical_scope(params.scope.as_deref().unwrap_or_default());
    if scope.is_empty() || !client.allows_scope(&scope) {
        return Err(ServiceError::InvalidScope);
    }

    // PKCE is mandatory and S256-only; `plain` is rejected outright.
    match params.code_challenge_method.as_deref() {
        Some("S256") => {}
        Some(_) | None => {
            return Err(ServiceError::InvalidRequest(
                "code_challenge_method must be S256".into(),
            ))
        }
    }
    let code_challenge = params
        .code_challenge
        .as_deref()
        .filter(|c| pkce::is_valid_challenge(c))
        .ok_or_else(|| ServiceError::InvalidRequest("invalid code_challenge".into()))?;

    let now = now_nanos();
    let request = AuthorizationRequest {
        id: Uuid::now_v7().to_string(),
        client_id: client.client_id.clone(),
        redirect_uri: redirect_uri.to_string(),
        scope,
        state: params.state.clone().unwrap_or_default(),
        code_challenge: code_challenge.to_string(),
        code_challenge_method: "S256".to_string(),
        nonce: params.nonce.clone(),
        code: None,
        user_id: None,
        session_id: None,
        consent_id: None,
        auth_time: None,
        used: false,
        used_at: None,
        created_at: now,
        expires_at: now + secs_to_nanos(state.settings.oauth.code_ttl_secs),
    };
    db::auth_requests::insert(&state.pool, &request).await?;
    Ok(request)
}

/// Load a live (unexpired, unconsumed) request by id.
pub async fn get_live(state: &AppState, request_id: &str) -> Result<AuthorizationRequest> {
    let request = match db::auth_requests::get(&state.pool, request_id).await {
        Ok(request) => request,
        Err(db::DbError::NotFound) => {
            return Err(ServiceError::InvalidRequest("unknown request".into()))
        }
        Err(err) => return Err(err.into()),
    };
    if request.used {
        return Err(ServiceError::AlreadyUsed);
    }
    if request.is_expired(now_nanos()) {
        return Err(ServiceError::Expired);
    }
    Ok(request)
}

/// Password login against a pending request: verify credentials, mint a
/// session, bind the user (Pending → Authenticated).
pub async fn login(
    state: &AppState,
    request_id: &str,
    username: &str,
    password: &str,
) -> Result<(Session, AuthorizationRequest)> {
    get_live(state, request_id).await?;

    let user = match db::users::get_by_username(&state.pool, username).await {
        Ok(user) => user,
        Err(db::DbError::NotFound) => {
            // Burn comparable time so unknown users are not distinguishable
            // by response latency.
            let _ = crate::security::password::verify_password(password, "");
            audit::emit(
                &state.pool,
                &format!("user:{username}"),
                "auth.login",
                audit::OUTCOME_DENIED,
                &[request_id],
                serde_json::json!({"reason": "unknown_user"}),
            )
            .await;
            return Err(ServiceError::Unauthenticated);
        }
        Err(err) => return Err(err.into()),
    };

    let password = password.to_string();
    let record = user.hashed_password.clone();
    let verified = tokio::task::spawn_blocking(move || {
        crate::security::password::verify_password(&password, &record)
    })
    .await
    .map_err(|_| ServiceError::Internal("password verification task failed".into()))?;

    if !verified {
        audit::emit(
            &state.pool,
            &format!("user:{}", user.id),
            "auth.login",
            audit::OUTCOME_DENIED,
            &[request_id],
            serde_json::json!({"reason": "bad_password"}),
        )
        .await;
        return Err(ServiceError::Unauthenticated);
    }

    let session =
        crate::services::session::create(&state.pool, &state.settings.session, &user.id).await?;
    db::auth_requests::bind_user(&state.pool, request_id, &user.id, &session.id, now_nanos())
        .await?;

    audit::emit(
        &state.pool,
        &format!("user:{}", user.id),
        "auth.login",
        audit::OUTCOME_SUCCESS,
        &[request_id],
        serde_json::json!({}),
    )
    .await;
    state.telemetry.record_metric("logins.succeeded", 1.0);
    let request = db::auth_requests::get(&state.pool, request_id).await?;
    Ok((session, request))
}

/// Attach an already-authenticated browser session to a pending request.
pub async fn adopt_session(
    state: &AppState,
    request_id: &str,
    session: &Session,
) -> Result<AuthorizationRequest> {
    get_live(state, request_id).await?;
    db::auth_requests::bind_user(
        &state.pool,
        request_id,
        &session.user_id,
        &session.id,
        now_nanos(),
    )
    .await?;
    db::auth_requests::get(&state.pool, request_id)
        .await
        .map_err(Into::into)
}

/// Valid prior consent covering the requested scope, if any: the
/// auto-advance path that skips the consent UI turn.
pub async fn existing_consent(
    state: &AppState,
    request: &AuthorizationRequest,
) -> Result<Option<ConsentDecision>> {
    let user_id = match request.user_id.as_deref() {
        Some(user_id) => user_id,
        None => return Ok(None),
    };
    db::consents::find_covering(
        &state.pool,
        user_id,
        &request.client_id,
        &request.scope,
        now_nanos(),
    )
    .await
    .map_err(Into::into)
}

/// Consent approval (Authenticated → Consented → CodeIssued). Returns the
/// full redirect URL carrying `code` and the verbatim `state`.
pub async fn grant_consent(state: &AppState, request_id: &str) -> Result<String> {
    let request = get_live(state, request_id).await?;
    let user_id = request
        .user_id
        .as_deref()
        .ok_or(ServiceError::Unauthenticated)?;

    let now = now_nanos();
    let consent = ConsentDecision {
        id: Uuid::now_v7().to_string(),
        user_id: user_id.to_string(),
        client_id: request.client_id.clone(),
        scope: request.scope.clone(),
        granted_at: now,
        expires_at: now + secs_to_nanos(state.settings.oauth.consent_ttl_secs),
    };
    db::consents::upsert(&state.pool, &consent).await?;
    db::auth_requests::bind_consent(&state.pool, request_id, &consent.id).await?;

    issue_code(state, &request).await
}

/// Auto-advance with a previously granted consent (no UI turn).
pub async fn advance_with_consent(
    state: &AppState,
    request: &AuthorizationRequest,
    consent: &ConsentDecision,
) -> Result<String> {
    db::auth_requests::bind_consent(&state.pool, &request.id, &consent.id).await?;
    issue_code(state, request).await
}

/// Consent denial: terminal for the request, error redirect for the client.
pub async fn deny_consent(state: &AppState, request_id: &str) -> Result<String> {
    let request = get_live(state, request_id).await?;
    let mut conn = state.pool.acquire().await.map_err(db::DbError::from)?;
    db::auth_requests::mark_used(&mut conn, &request.id, now_nanos()).await?;

    Ok(error_redirect(
        &request.redirect_uri,
        "invalid_request",
        "consent was denied",
        &request.state,
    ))
}

async fn issue_code(state: &AppState, request: &AuthorizationRequest) -> Result<String> {
    // 32-byte random code (Consented → CodeIssued).
    let code = URL_SAFE_NO_PAD.encode(crypto_core::random_bytes(32));
    db::auth_requests::set_code(&state.pool, &request.id, &code).await?;

    let mut url = url::Url::parse(&request.redirect_uri)
        .map_err(|_| ServiceError::InvalidRequest("invalid redirect_uri".into()))?;
    url.query_pairs_mut()
        .append_pair("code", &code)
        .append_pair("state", &request.state);
    Ok(url.to_string())
}

/// Build an error redirect carrying `error` and `error_description` and
/// never internal detail.
pub fn error_redirect(redirect_uri: &str, error: &str, description: &str, state: &str) -> String {
    let mut url = match url::Url::parse(redirect_uri) {
        Ok(url) => url,
        Err(_) => return redirect_uri.to_string(),
    };
    url.query_pairs_mut()
        .append_pair("error", error)
        .append_pair("error_description", description)
        .append_pair("state", state);
    url.to_string()
}

/// Token endpoint code exchange (CodeIssued → Exchanged).
///
/// Single-use enforcement rides on the conditional `used = FALSE` update;
/// marking the code used and issuing the tokens share one transaction, so a
/// cancellation mid-way rolls the flag back with the tokens. Replay revokes
/// every token the code ever produced. PKCE failure consumes the code.
pub async fn exchange_code(
    state: &AppState,
    client: &Client,
    code: &str,
    code_verifier: Option<&str>,
    redirect_uri: Option<&str>,
) -> Result<token::TokenResponse> {
    let now = now_nanos();

    let request = match db::auth_requests::get_by_code(&state.pool, code).await {
        Ok(request) => request,
        Err(db::DbError::NotFound) => return Err(ServiceError::InvalidGrant),
        Err(err) => return Err(err.into()),
    };

    if request.client_id != client.client_id {
        return Err(ServiceError::InvalidGrant);
    }
    if request.is_expired(now) {
        return Err(ServiceError::Expired);
    }
    if request.used {
        // Replay is a hard signal: revoke everything this code produced.
        let revoked =
            db::tokens::revoke_by_auth_request(&state.pool, &request.id, now).await?;
        audit::emit(
            &state.pool,
            &format!("client:{}", client.client_id),
            "token.code_replay",
            audit::OUTCOME_DENIED,
            &[request.id.as_str()],
            serde_json::json!({ "tokens_revoked": revoked }),
        )
        .await;
        return Err(ServiceError::AlreadyUsed);
    }
    if redirect_uri != Some(request.redirect_uri.as_str()) {
        return Err(ServiceError::InvalidGrant);
    }

    let verifier_ok = code_verifier
        .map(|v| pkce::verify_s256(v, &request.code_challenge))
        .unwrap_or(false);
    if !verifier_ok {
        // The code is consumed even on PKCE failure.
        let mut conn = state.pool.acquire().await.map_err(db::DbError::from)?;
        db::auth_requests::mark_used(&mut conn, &request.id, now).await?;
        drop(conn);
        audit::emit(
            &state.pool,
            &format!("client:{}", client.client_id),
            "token.pkce_mismatch",
            audit::OUTCOME_DENIED,
            &[request.id.as_str()],
            serde_json::json!({}),
        )
        .await;
        return Err(ServiceError::InvalidGrant);
    }

    let user_id = request.user_id.as_deref().ok_or(ServiceError::InvalidGrant)?;
    let user = db::users::get_by_id(&state.pool, user_id).await?;

    // Consume-and-issue share one transaction: a cancellation mid-way rolls
    // the used flag back together with the token rows.
    let mut tx = state.pool.begin().await.map_err(db::DbError::from)?;
    if !db::auth_requests::mark_used(&mut tx, &request.id, now).await? {
        // Lost the race to a concurrent exchange.
        drop(tx);
        let revoked =
            db::tokens::revoke_by_auth_request(&state.pool, &request.id, now).await?;
        audit::emit(
            &state.pool,
            &format!("client:{}", client.client_id),
            "token.code_replay",
            audit::OUTCOME_DENIED,
            &[request.id.as_str()],
            serde_json::json!({ "tokens_revoked": revoked }),
        )
        .await;
        return Err(ServiceError::AlreadyUsed);
    }

    let ctx = token::IssueContext {
        client,
        user: Some(&user),
        scope: &request.scope,
        session_id: request.session_id.as_deref(),
        auth_request_id: Some(&request.id),
        nonce: request.nonce.as_deref(),
        auth_time: request.auth_time,
    };
    let response = token::issue_grant(state, &ctx, &mut tx).await?;

    tx.commit().await.map_err(db::DbError::from)?;

    audit::emit(
        &state.pool,
        &format!("client:{}", client.client_id),
        "token.issue",
        audit::OUTCOME_SUCCESS,
        &[request.id.as_str()],
        serde_json::json!({ "grant_type": "authorization_code" }),
    )
    .await;
    state.telemetry.record_metric("codes.exchanged", 1.0);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::token::tests::{test_client, test_state, test_user};

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    fn params(client_id: &str) -> AuthorizeParams {
        AuthorizeParams {
            response_type: Some("code".into()),
            client_id: Some(client_id.into()),
            redirect_uri: Some("https://rp/cb".into()),
            scope: Some("openid".into()),
            state: Some("abc".into()),
            code_challenge: Some(CHALLENGE.into()),
            code_challenge_method: Some("S256".into()),
            nonce: None,
        }
    }

    async fn seeded_state() -> (crate::AppState, crate::models::Client, crate::models::User) {
        let state = test_state().await;
        let client = test_client("client-1");
        db::clients::insert(&state.pool, &client).await.unwrap();
        let mut user = test_user("alice");
        user.hashed_password =
            crate::security::password::hash_with_iterations("password123", 1_000).unwrap();
        db::users::insert(&state.pool, &user).await.unwrap();
        (state, client, user)
    }

    /// Drive the browser side of the flow and return the issued code.
    async fn obtain_code(state: &crate::AppState, client: &crate::models::Client) -> String {
        let request = begin(state, &params(&client.client_id)).await.unwrap();
        let (_session, _) = login(state, &request.id, "alice", "password123")
            .await
            .unwrap();
        let redirect = grant_consent(state, &request.id).await.unwrap();

        let url = url::Url::parse(&redirect).unwrap();
        assert_eq!(
            url.query_pairs()
                .find(|(k, _)| k == "state")
                .unwrap()
                .1
                .as_ref(),
            "abc"
        );
        url.query_pairs()
            .find(|(k, _)| k == "code")
            .unwrap()
            .1
            .into_owned()
    }

    #[tokio::test]
    async fn test_begin_validations() {
        let (state, client, _) = seeded_state().await;

        let mut bad = params(&client.client_id);
        bad.response_type = Some("id_token".into());
        assert!(matches!(
            begin(&state, &bad).await.unwrap_err(),
            ServiceError::InvalidRequest(_)
        ));

        let mut plain = params(&client.client_id);
        plain.code_challenge_method = Some("plain".into());
        assert!(begin(&state, &plain).await.is_err());

        let mut wrong_uri = params(&client.client_id);
        wrong_uri.redirect_uri = Some("https://rp/other".into());
        assert!(begin(&state, &wrong_uri).await.is_err());

        let mut wide_scope = params(&client.client_id);
        wide_scope.scope = Some("openid admin".into());
        assert!(matches!(
            begin(&state, &wide_scope).await.unwrap_err(),
            ServiceError::InvalidScope
        ));

        let mut ghost = params("ghost");
        ghost.client_id = Some("ghost".into());
        assert!(matches!(
            begin(&state, &ghost).await.unwrap_err(),
            ServiceError::InvalidClient
        ));
    }

    #[tokio::test]
    async fn test_happy_path_code_exchange() {
        let (state, client, user) = seeded_state().await;
        let code = obtain_code(&state, &client).await;
        // 32 random bytes, base64url.
        assert_eq!(code.len(), 43);

        let response = exchange_code(
            &state,
            &client,
            &code,
            Some(VERIFIER),
            Some("https://rp/cb"),
        )
        .await
        .unwrap();

        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.scope, "openid");
        assert!(response.refresh_token.is_some());
        assert!(response.id_token.is_some());

        let (claims, _) = token::validate_access(&state, &response.access_token)
            .await
            .unwrap();
        // The real authenticated user propagates into the token.
        assert_eq!(claims.sub.as_deref(), Some(user.id.as_str()));
    }

    #[tokio::test]
    async fn test_code_reuse_revokes_issued_tokens() {
        let (state, client, _) = seeded_state().await;
        let code = obtain_code(&state, &client).await;

        let response = exchange_code(
            &state,
            &client,
            &code,
            Some(VERIFIER),
            Some("https://rp/cb"),
        )
        .await
        .unwrap();

        let err = exchange_code(
            &state,
            &client,
            &code,
            Some(VERIFIER),
            Some("https://rp/cb"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.oauth_code(), "invalid_grant");

        // Tokens from the first exchange are gone.
        assert!(matches!(
            token::validate_access(&state, &response.access_token)
                .await
                .unwrap_err(),
            ServiceError::Revoked
        ));
        assert!(!token::introspect(&state, response.refresh_token.as_ref().unwrap())
            .await
            .unwrap()
            .active);
    }

    #[tokio::test]
    async fn test_pkce_mismatch_consumes_code() {
        let (state, client, _) = seeded_state().await;
        let code = obtain_code(&state, &client).await;

        let err = exchange_code(
            &state,
            &client,
            &code,
            Some("wrong-wrong-wrong-wrong-wrong-wrong-wrong-wrong"),
            Some("https://rp/cb"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.oauth_code(), "invalid_grant");

        // The right verifier no longer helps; the code is spent.
        let err = exchange_code(
            &state,
            &client,
            &code,
            Some(VERIFIER),
            Some("https://rp/cb"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.oauth_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_redirect_uri_must_match_exchange() {
        let (state, client, _) = seeded_state().await;
        let code = obtain_code(&state, &client).await;
        let err = exchange_code(
            &state,
            &client,
            &code,
            Some(VERIFIER),
            Some("https://rp/cb2"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.oauth_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_wrong_password_denied() {
        let (state, client, _) = seeded_state().await;
        let request = begin(&state, &params(&client.client_id)).await.unwrap();
        assert!(matches!(
            login(&state, &request.id, "alice", "nope").await.unwrap_err(),
            ServiceError::Unauthenticated
        ));
        assert!(matches!(
            login(&state, &request.id, "nobody", "nope").await.unwrap_err(),
            ServiceError::Unauthenticated
        ));
    }

    #[tokio::test]
    async fn test_consent_auto_advance() {
        let (state, client, _) = seeded_state().await;

        // First round records consent.
        let code = obtain_code(&state, &client).await;
        exchange_code(&state, &client, &code, Some(VERIFIER), Some("https://rp/cb"))
            .await
            .unwrap();

        // Second round: existing consent covers the scope, no UI turn.
        let request = begin(&state, &params(&client.client_id)).await.unwrap();
        let (session, _) = login(&state, &request.id, "alice", "password123")
            .await
            .unwrap();
        let request = adopt_session(&state, &request.id, &session).await.unwrap();
        let consent = existing_consent(&state, &request)
            .await
            .unwrap()
            .expect("consent should exist");
        let redirect = advance_with_consent(&state, &request, &consent)
            .await
            .unwrap();
        assert!(redirect.contains("code="));
    }

    #[tokio::test]
    async fn test_expired_request_rejected() {
        let (state, client, _) = seeded_state().await;
        let mut request = begin(&state, &params(&client.client_id)).await.unwrap();
        // Force expiry in the store.
        sqlx::query("UPDATE authorization_requests SET expires_at = 1 WHERE id = $1")
            .bind(&request.id)
            .execute(&state.pool)
            .await
            .unwrap();
        request.expires_at = 1;

        assert!(matches!(
            get_live(&state, &request.id).await.unwrap_err(),
            ServiceError::Expired
        ));
    }

    #[tokio::test]
    async fn test_deny_consent_redirects_with_error_only() {
        let (state, client, _) = seeded_state().await;
        let request = begin(&state, &params(&client.client_id)).await.unwrap();
        login(&state, &request.id, "alice", "password123").await.unwrap();

        let redirect = deny_consent(&state, &request.id).await.unwrap();
        assert!(redirect.starts_with("https://rp/cb?"));
        assert!(redirect.contains("error="));
        assert!(!redirect.contains("code="));
        // Terminal: the request cannot continue.
        assert!(get_live(&state, &request.id).await.is_err());
    }
}
