//! `/service` group: token endpoint, introspection, revocation, userinfo,
//! KMS operations, and the discovery documents.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};
use crate::models::GrantType;
use crate::security::client_auth::{self, ClientCredentials};
use crate::services::{audit, authorize, kms, token};
use crate::AppState;

use super::middleware::{seal_gate, service_rate_limit, PeerCerts};

pub fn service_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/oauth2/v1/token", post(token_endpoint))
        .route("/oauth2/v1/introspect", post(introspect_endpoint))
        .route("/oauth2/v1/revoke", post(revoke_endpoint))
        .route("/oidc/v1/userinfo", get(userinfo))
        .route("/kms/v1/pools", post(kms_create_pool).get(kms_list_pools))
        .route("/kms/v1/pools/:name/rotate", post(kms_rotate))
        .route("/kms/v1/pools/:name/retire", post(kms_retire))
        .route("/kms/v1/pools/:name/encrypt", post(kms_encrypt))
        .route("/kms/v1/pools/:name/sign", post(kms_sign))
        .route("/kms/v1/decrypt", post(kms_decrypt))
        .route("/kms/v1/verify", post(kms_verify))
        .layer(from_fn_with_state(state.clone(), service_rate_limit))
        .layer(from_fn_with_state(state, seal_gate))
}

/// Decode an HTTP Basic Authorization header.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, secret) = text.split_once(':')?;
    Some((user.to_string(), secret.to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Result<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or(ServiceError::Unauthenticated)
}

fn credentials_from(
    headers: &HeaderMap,
    peer_certs: Option<&PeerCerts>,
    form: &TokenForm,
) -> ClientCredentials {
    ClientCredentials {
        basic: basic_credentials(headers),
        client_id: form.client_id.clone(),
        client_secret: form.client_secret.clone(),
        client_assertion: form.client_assertion.clone(),
        client_assertion_type: form.client_assertion_type.clone(),
        peer_chain_der: peer_certs
            .map(|certs| certs.0.as_ref().clone())
            .unwrap_or_default(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenForm {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion: Option<String>,
    pub client_assertion_type: Option<String>,
}

/// `POST /oauth2/v1/token`: the three supported grants behind client
/// authentication.
async fn token_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer_certs: Option<Extension<PeerCerts>>,
    axum::Form(form): axum::Form<TokenForm>,
) -> Result<Json<token::TokenResponse>> {
    let creds = credentials_from(&headers, peer_certs.as_deref(), &form);
    let client = client_auth::authenticate(&state, &creds).await?;

    match form.grant_type.as_deref() {
        Some("authorization_code") => {
            if !client.allows_grant(GrantType::AuthorizationCode) {
                return Err(ServiceError::UnauthorizedClient);
            }
            let code = form
                .code
                .as_deref()
                .ok_or_else(|| ServiceError::InvalidRequest("code is required".into()))?;
            let response = authorize::exchange_code(
                &state,
                &client,
                code,
                form.code_verifier.as_deref(),
                form.redirect_uri.as_deref(),
            )
            .await?;
            Ok(Json(response))
        }
        Some("refresh_token") => {
            if !client.allows_grant(GrantType::RefreshToken) {
                return Err(ServiceError::UnauthorizedClient);
            }
            let refresh = form
                .refresh_token
                .as_deref()
                .ok_or_else(|| ServiceError::InvalidRequest("refresh_token is required".into()))?;
            let response = token::rotate_refresh(&state, &client, refresh).await?;
            audit::emit(
                &state.pool,
                &format!("client:{}", client.client_id),
                "token.issue",
                audit::OUTCOME_SUCCESS,
                &[],
                serde_json::json!({ "grant_type": "refresh_token" }),
            )
            .await;
            Ok(Json(response))
        }
        Some("client_credentials") => {
            if !client.allows_grant(GrantType::ClientCredentials) {
                return Err(ServiceError::UnauthorizedClient);
            }
            if !client.is_confidential {
                return Err(ServiceError::UnauthorizedClient);
            }
            let scope = crate::models::canonical_scope(form.scope.as_deref().unwrap_or_default());
            if !scope.is_empty() && !client.allows_scope(&scope) {
                return Err(ServiceError::InvalidScope);
            }
            let ctx = token::IssueContext {
                client: &client,
                user: None,
                scope: &scope,
                session_id: None,
                auth_request_id: None,
                nonce: None,
                auth_time: None,
            };
            let mut conn = state.pool.acquire().await.map_err(crate::db::DbError::from)?;
            let response = token::issue_grant(&state, &ctx, &mut conn).await?;
            audit::emit(
                &state.pool,
                &format!("client:{}", client.client_id),
                "token.issue",
                audit::OUTCOME_SUCCESS,
                &[],
                serde_json::json!({ "grant_type": "client_credentials" }),
            )
            .await;
            Ok(Json(response))
        }
        _ => Err(ServiceError::UnsupportedGrantType),
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenIntrospectionForm {
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion: Option<String>,
    pub client_assertion_type: Option<String>,
}

impl TokenIntrospectionForm {
    fn as_token_form(&self) -> TokenForm {
        TokenForm {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            client_assertion: self.client_assertion.clone(),
            client_assertion_type: self.client_assertion_type.clone(),
            ..TokenForm::default()
        }
    }
}

/// `POST /oauth2/v1/introspect` (RFC 7662), caller authenticates as a
/// client.
async fn introspect_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer_certs: Option<Extension<PeerCerts>>,
    axum::Form(form): axum::Form<TokenIntrospectionForm>,
) -> Result<Json<token::IntrospectionResponse>> {
    let creds = credentials_from(&headers, peer_certs.as_deref(), &form.as_token_form());
    client_auth::authenticate(&state, &creds).await?;

    let Some(token_value) = form.token.as_deref() else {
        return Ok(Json(token::IntrospectionResponse::inactive()));
    };
    Ok(Json(token::introspect(&state, token_value).await?))
}

/// `POST /oauth2/v1/revoke` (RFC 7009): 200 even for unknown tokens.
async fn revoke_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer_certs: Option<Extension<PeerCerts>>,
    axum::Form(form): axum::Form<TokenIntrospectionForm>,
) -> Result<Json<serde_json::Value>> {
    let creds = credentials_from(&headers, peer_certs.as_deref(), &form.as_token_form());
    let client = client_auth::authenticate(&state, &creds).await?;

    if let Some(token_value) = form.token.as_deref() {
        token::revoke(&state, token_value).await?;
        audit::emit(
            &state.pool,
            &format!("client:{}", client.client_id),
            "token.revoke",
            audit::OUTCOME_SUCCESS,
            &[],
            serde_json::json!({}),
        )
        .await;
    }
    Ok(Json(serde_json::json!({})))
}

/// `GET /oidc/v1/userinfo`: claims selected by the access token's scope.
async fn userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let bearer = bearer_token(&headers)?;
    let (claims, row) = token::validate_access(&state, &bearer).await?;

    let scopes: Vec<&str> = claims.scope.as_deref().unwrap_or_default().split_whitespace().collect();
    if !scopes.contains(&"openid") {
        return Err(ServiceError::Forbidden);
    }
    let user_id = row.user_id.as_deref().ok_or(ServiceError::Forbidden)?;
    let user = crate::db::users::get_by_id(&state.pool, user_id).await?;

    let mut body = serde_json::json!({ "sub": user.id });
    if scopes.contains(&"profile") {
        body["preferred_username"] = serde_json::json!(user.username);
        body["name"] = serde_json::json!(user.display_name());
    }
    if scopes.contains(&"email") {
        body["email"] = serde_json::json!(user.email);
        body["email_verified"] = serde_json::json!(user.email_verified);
    }
    Ok(Json(body))
}

/// `GET /.well-known/openid-configuration`.
pub async fn discovery(State(state): State<AppState>) -> Json<serde_json::Value> {
    let issuer = state.settings.issuer.trim_end_matches('/').to_string();
    Json(serde_json::json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/oauth2/v1/authorize"),
        "token_endpoint": format!("{issuer}/oauth2/v1/token"),
        "introspection_endpoint": format!("{issuer}/oauth2/v1/introspect"),
        "revocation_endpoint": format!("{issuer}/oauth2/v1/revoke"),
        "userinfo_endpoint": format!("{issuer}/oidc/v1/userinfo"),
        "end_session_endpoint": format!("{issuer}/oidc/v1/logout"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token", "client_credentials"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": [
            "client_secret_basic",
            "client_secret_post",
            "client_secret_jwt",
            "private_key_jwt",
            "tls_client_auth",
            "self_signed_tls_client_auth"
        ],
        "id_token_signing_alg_values_supported": [state.settings.signing.algorithm],
        "subject_types_supported": ["public"],
        "scopes_supported": ["openid", "profile", "email"],
    }))
}

/// `GET /.well-known/jwks.json`: public signing keys only.
pub async fn jwks(State(state): State<AppState>) -> Result<Json<jose_core::JwkSet>> {
    Ok(Json(state.keystore.jwks().await?))
}

// ---------------------------------------------------------------------------
// KMS surface
// ---------------------------------------------------------------------------

async fn kms_caller(state: &AppState, headers: &HeaderMap) -> Result<kms::KmsCaller> {
    let bearer = bearer_token(headers)?;
    let (claims, _row) = token::validate_access(state, &bearer).await?;
    let tenant_id = claims
        .extra
        .get("tenant")
        .and_then(|v| v.as_str())
        .ok_or(ServiceError::Forbidden)?
        .to_string();
    let scopes = claims
        .scope
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    Ok(kms::KmsCaller { tenant_id, scopes })
}

#[derive(Debug, Deserialize)]
struct CreatePoolRequest {
    name: String,
    algorithm: String,
    #[serde(default)]
    allowed_ops: Vec<String>,
    rotation_policy: Option<String>,
}

#[derive(Debug, Serialize)]
struct PoolView {
    name: String,
    algorithm: String,
    allowed_ops: Vec<String>,
    rotation_policy: String,
    created_at: String,
}

impl From<crate::models::KeyPool> for PoolView {
    fn from(pool: crate::models::KeyPool) -> Self {
        Self {
            name: pool.name.clone(),
            algorithm: pool.algorithm.clone(),
            allowed_ops: crate::models::parse_json_list(&pool.allowed_ops),
            rotation_policy: pool.rotation_policy.clone(),
            created_at: crate::clock::nanos_to_rfc3339(pool.created_at),
        }
    }
}

async fn kms_create_pool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreatePoolRequest>,
) -> Result<Json<PoolView>> {
    let caller = kms_caller(&state, &headers).await?;
    let pool = kms::create_pool(
        &state,
        &caller,
        &body.name,
        &body.algorithm,
        &body.allowed_ops,
        body.rotation_policy.as_deref().unwrap_or("decrypt_only"),
    )
    .await?;
    Ok(Json(pool.into()))
}

async fn kms_list_pools(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PoolView>>> {
    let caller = kms_caller(&state, &headers).await?;
    let pools = kms::list_pools(&state, &caller).await?;
    Ok(Json(pools.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Serialize)]
struct RotateResponse {
    key_id: String,
    version: i64,
}

async fn kms_rotate(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RotateResponse>> {
    let caller = kms_caller(&state, &headers).await?;
    let material = kms::rotate(&state, &caller, &name).await?;
    Ok(Json(RotateResponse {
        key_id: material.id,
        version: material.version,
    }))
}

#[derive(Debug, Deserialize)]
struct RetireRequest {
    version: i64,
}

async fn kms_retire(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RetireRequest>,
) -> Result<Json<serde_json::Value>> {
    let caller = kms_caller(&state, &headers).await?;
    kms::retire(&state, &caller, &name, body.version).await?;
    Ok(Json(serde_json::json!({ "retired": body.version })))
}

#[derive(Debug, Deserialize)]
struct EncryptRequest {
    /// base64url plaintext.
    plaintext: String,
    #[serde(default)]
    aad: Option<String>,
}

async fn kms_encrypt(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<EncryptRequest>,
) -> Result<Json<serde_json::Value>> {
    let caller = kms_caller(&state, &headers).await?;
    let plaintext = URL_SAFE_NO_PAD
        .decode(&body.plaintext)
        .map_err(|_| ServiceError::InvalidRequest("plaintext must be base64url".into()))?;
    let aad = body.aad.unwrap_or_default();
    let ciphertext = kms::encrypt(&state, &caller, &name, aad.as_bytes(), &plaintext).await?;
    Ok(Json(serde_json::json!({ "ciphertext": ciphertext })))
}

#[derive(Debug, Deserialize)]
struct DecryptRequest {
    ciphertext: String,
    #[serde(default)]
    aad: Option<String>,
}

async fn kms_decrypt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DecryptRequest>,
) -> Result<Json<serde_json::Value>> {
    let caller = kms_caller(&state, &headers).await?;
    let aad = body.aad.unwrap_or_default();
    let plaintext = kms::decrypt(&state, &caller, aad.as_bytes(), &body.ciphertext).await?;
    Ok(Json(
        serde_json::json!({ "plaintext": URL_SAFE_NO_PAD.encode(plaintext) }),
    ))
}

#[derive(Debug, Deserialize)]
struct SignRequest {
    /// base64url message.
    message: String,
}

async fn kms_sign(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SignRequest>,
) -> Result<Json<kms::SignatureOut>> {
    let caller = kms_caller(&state, &headers).await?;
    let message = URL_SAFE_NO_PAD
        .decode(&body.message)
        .map_err(|_| ServiceError::InvalidRequest("message must be base64url".into()))?;
    Ok(Json(kms::sign(&state, &caller, &name, &message).await?))
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    message: String,
    signature: String,
}

async fn kms_verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<serde_json::Value>> {
    let caller = kms_caller(&state, &headers).await?;
    let message = URL_SAFE_NO_PAD
        .decode(&body.message)
        .map_err(|_| ServiceError::InvalidRequest("message must be base64url".into()))?;
    let valid = kms::verify(&state, &caller, &message, &body.signature).await?;
    Ok(Json(serde_json::json!({ "valid": valid })))
}
