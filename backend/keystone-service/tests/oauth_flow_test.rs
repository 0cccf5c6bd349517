//! End-to-end OAuth/OIDC flows through the public router: authorization
//! code with PKCE, code replay, refresh rotation reuse, PKCE mismatch, and
//! sealed-service behavior.

mod common;

use axum::http::StatusCode;
use common::*;
use keystone_service::db;

// RFC 7636 appendix B pair.
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

fn authorize_uri() -> String {
    format!(
        "/oauth2/v1/authorize?response_type=code&client_id={CLIENT_ID}\
         &redirect_uri=https%3A%2F%2Frp%2Fcb&scope=openid&state=abc\
         &code_challenge={CHALLENGE}&code_challenge_method=S256"
    )
}

/// Drive authorize → login → consent and return the callback redirect URL.
async fn browser_obtain_callback(app: &TestApp) -> String {
    // Authorize creates the request and bounces to login.
    let response = send(&app.public, get(&authorize_uri())).await;
    assert_status(&response, StatusCode::FOUND);
    let login_url = location(&response);
    assert!(login_url.starts_with("/browser/oidc/v1/login?request_id="));
    let request_id = login_url.split('=').nth(1).unwrap().to_string();

    // Login form sets the double-submit CSRF cookie.
    let response = send(&app.public, get(&login_url)).await;
    assert_status(&response, StatusCode::OK);
    let login_csrf = set_cookie_value(&response, "keystone_login_csrf").expect("login csrf");

    // Submit credentials; session cookie is set and we land on consent.
    let response = send(
        &app.public,
        form_post_with(
            "/browser/oidc/v1/login",
            &[
                ("request_id", request_id.as_str()),
                ("username", USERNAME),
                ("password", PASSWORD),
                ("csrf_token", login_csrf.as_str()),
            ],
            &[("cookie", &format!("keystone_login_csrf={login_csrf}"))],
        ),
    )
    .await;
    assert_status(&response, StatusCode::FOUND);
    let session_cookie = set_cookie_value(&response, "keystone_session").expect("session cookie");
    let consent_url = location(&response);
    assert!(consent_url.starts_with("/browser/oidc/v1/consent"));

    // The consent CSRF token is the session's token.
    let session = db::sessions::get(&app.state.pool, &session_cookie)
        .await
        .expect("session row");

    let response = send(
        &app.public,
        form_post_with(
            "/browser/oidc/v1/consent",
            &[
                ("request_id", request_id.as_str()),
                ("csrf_token", session.csrf_token.as_str()),
                ("action", "approve"),
            ],
            &[("cookie", &format!("keystone_session={session_cookie}"))],
        ),
    )
    .await;
    assert_status(&response, StatusCode::FOUND);
    location(&response)
}

async fn exchange(
    app: &TestApp,
    code: &str,
    verifier: &str,
) -> (StatusCode, serde_json::Value) {
    let auth = basic_auth(CLIENT_ID, CLIENT_SECRET);
    let response = send(
        &app.public,
        form_post_with(
            "/oauth2/v1/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", "https://rp/cb"),
                ("code_verifier", verifier),
            ],
            &[("authorization", &auth)],
        ),
    )
    .await;
    let status = response.status();
    (status, body_json(response).await)
}

#[tokio::test]
async fn test_happy_path_authorization_code_with_pkce() {
    let app = spawn_app().await;

    let callback = browser_obtain_callback(&app).await;
    assert!(callback.starts_with("https://rp/cb?"));
    // state echoed byte-for-byte, code is 32 random bytes base64url.
    assert_eq!(query_param(&callback, "state").as_deref(), Some("abc"));
    let code = query_param(&callback, "code").expect("code");
    assert_eq!(code.len(), 43);

    let (status, body) = exchange(&app, &code, VERIFIER).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 3600);
    assert_eq!(body["scope"], "openid");
    let access_token = body["access_token"].as_str().unwrap();
    assert_eq!(access_token.matches('.').count(), 2);
    assert_eq!(body["id_token"].as_str().unwrap().matches('.').count(), 2);
    assert!(body["refresh_token"].as_str().is_some());

    // The issued access token passes userinfo with the real user identity.
    let response = send(
        &app.public,
        axum::http::Request::builder()
            .method("GET")
            .uri("/oidc/v1/userinfo")
            .header("authorization", format!("Bearer {access_token}"))
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await;
    assert_status(&response, StatusCode::OK);
    let userinfo = body_json(response).await;
    assert!(userinfo["sub"].as_str().is_some());
}

#[tokio::test]
async fn test_code_reuse_is_invalid_grant_and_revokes_tokens() {
    let app = spawn_app().await;
    let callback = browser_obtain_callback(&app).await;
    let code = query_param(&callback, "code").unwrap();

    let (status, body) = exchange(&app, &code, VERIFIER).await;
    assert_eq!(status, StatusCode::OK);
    let access_token = body["access_token"].as_str().unwrap().to_string();

    // Replay the exchange.
    let (status, body) = exchange(&app, &code, VERIFIER).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");

    // Tokens issued from the replayed code are revoked.
    let auth = basic_auth(CLIENT_ID, CLIENT_SECRET);
    let response = send(
        &app.public,
        form_post_with(
            "/oauth2/v1/introspect",
            &[("token", access_token.as_str())],
            &[("authorization", &auth)],
        ),
    )
    .await;
    let introspection = body_json(response).await;
    assert_eq!(introspection["active"], false);
}

#[tokio::test]
async fn test_refresh_rotation_reuse_revokes_chain() {
    let app = spawn_app().await;
    let callback = browser_obtain_callback(&app).await;
    let code = query_param(&callback, "code").unwrap();
    let (_, body) = exchange(&app, &code, VERIFIER).await;
    let r1 = body["refresh_token"].as_str().unwrap().to_string();

    let auth = basic_auth(CLIENT_ID, CLIENT_SECRET);
    let rotate = |token: String| {
        let auth = auth.clone();
        let public = app.public.clone();
        async move {
            let response = send(
                &public,
                form_post_with(
                    "/oauth2/v1/token",
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", token.as_str()),
                    ],
                    &[("authorization", &auth)],
                ),
            )
            .await;
            let status = response.status();
            (status, body_json(response).await)
        }
    };

    // r1 → r2.
    let (status, body) = rotate(r1.clone()).await;
    assert_eq!(status, StatusCode::OK);
    let r2 = body["refresh_token"].as_str().unwrap().to_string();

    // Reusing r1 is a hard invalid_grant...
    let (status, body) = rotate(r1).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");

    // ...and the whole chain including r2 is dead.
    let (status, body) = rotate(r2).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_pkce_mismatch_consumes_code() {
    let app = spawn_app().await;
    let callback = browser_obtain_callback(&app).await;
    let code = query_param(&callback, "code").unwrap();

    let (status, body) =
        exchange(&app, &code, "wrong-wrong-wrong-wrong-wrong-wrong-wrong-wrong").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");

    // The code was consumed by the failed attempt.
    let (status, body) = exchange(&app, &code, VERIFIER).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_sealed_service_returns_503() {
    let app = spawn_sealed().await;
    let response = send(
        &app.public,
        form_post("/oauth2/v1/token", &[("grant_type", "client_credentials")]),
    )
    .await;
    assert_status(&response, StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"], "temporarily_unavailable");

    // Browser group is gated the same way.
    let response = send(&app.public, get(&authorize_uri())).await;
    assert_status(&response, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_second_authorize_skips_login_and_consent() {
    let app = spawn_app().await;

    // First round establishes session + consent.
    let callback = browser_obtain_callback(&app).await;
    let code = query_param(&callback, "code").unwrap();
    exchange(&app, &code, VERIFIER).await;

    // Fish the session cookie back out of the store for the second round.
    let sessions: Vec<(String,)> = sqlx::query_as("SELECT id FROM sessions")
        .fetch_all(&app.state.pool)
        .await
        .unwrap();
    let session_cookie = format!("keystone_session={}", sessions[0].0);

    // Second authorize with the live session: straight to the callback.
    let response = send(
        &app.public,
        get_with_cookie(&authorize_uri(), &session_cookie),
    )
    .await;
    assert_status(&response, StatusCode::FOUND);
    let redirect = location(&response);
    assert!(redirect.starts_with("https://rp/cb?"), "got {redirect}");
    assert!(query_param(&redirect, "code").is_some());
}

#[tokio::test]
async fn test_authorize_rejects_plain_pkce_via_redirect() {
    let app = spawn_app().await;
    let uri = format!(
        "/oauth2/v1/authorize?response_type=code&client_id={CLIENT_ID}\
         &redirect_uri=https%3A%2F%2Frp%2Fcb&scope=openid&state=xyz\
         &code_challenge={CHALLENGE}&code_challenge_method=plain"
    );
    let response = send(&app.public, get(&uri)).await;
    assert_status(&response, StatusCode::FOUND);
    let redirect = location(&response);
    assert!(redirect.starts_with("https://rp/cb?"));
    assert_eq!(
        query_param(&redirect, "error").as_deref(),
        Some("invalid_request")
    );
    assert_eq!(query_param(&redirect, "state").as_deref(), Some("xyz"));
}

#[tokio::test]
async fn test_authorize_unknown_redirect_uri_never_redirects() {
    let app = spawn_app().await;
    let uri = format!(
        "/oauth2/v1/authorize?response_type=code&client_id={CLIENT_ID}\
         &redirect_uri=https%3A%2F%2Fevil%2Fcb&scope=openid&state=abc\
         &code_challenge={CHALLENGE}&code_challenge_method=S256"
    );
    let response = send(&app.public, get(&uri)).await;
    assert_status(&response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_token_endpoint_rejects_bad_client_secret() {
    let app = spawn_app().await;
    let auth = basic_auth(CLIENT_ID, "wrong-secret");
    let response = send(
        &app.public,
        form_post_with(
            "/oauth2/v1/token",
            &[("grant_type", "client_credentials")],
            &[("authorization", &auth)],
        ),
    )
    .await;
    assert_status(&response, StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid_client");
}

#[tokio::test]
async fn test_unsupported_grant_type() {
    let app = spawn_app().await;
    let auth = basic_auth(CLIENT_ID, CLIENT_SECRET);
    let response = send(
        &app.public,
        form_post_with(
            "/oauth2/v1/token",
            &[("grant_type", "password")],
            &[("authorization", &auth)],
        ),
    )
    .await;
    assert_status(&response, StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn test_discovery_and_jwks() {
    let app = spawn_app().await;

    let response = send(&app.public, get("/.well-known/openid-configuration")).await;
    assert_status(&response, StatusCode::OK);
    let discovery = body_json(response).await;
    assert_eq!(discovery["issuer"], "https://idp.test");
    assert_eq!(discovery["response_types_supported"][0], "code");
    assert_eq!(discovery["code_challenge_methods_supported"][0], "S256");

    let response = send(&app.public, get("/.well-known/jwks.json")).await;
    assert_status(&response, StatusCode::OK);
    let jwks = body_json(response).await;
    let keys = jwks["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["use"], "sig");
    // Public JWKS never carries private parameters.
    assert!(keys[0].get("d").is_none());
}

#[tokio::test]
async fn test_revocation_endpoint_is_idempotent_and_tolerant() {
    let app = spawn_app().await;
    let callback = browser_obtain_callback(&app).await;
    let code = query_param(&callback, "code").unwrap();
    let (_, body) = exchange(&app, &code, VERIFIER).await;
    let refresh = body["refresh_token"].as_str().unwrap();

    let auth = basic_auth(CLIENT_ID, CLIENT_SECRET);
    for token in [refresh, "completely-unknown-token", refresh] {
        let response = send(
            &app.public,
            form_post_with(
                "/oauth2/v1/revoke",
                &[("token", token)],
                &[("authorization", &auth)],
            ),
        )
        .await;
        assert_status(&response, StatusCode::OK);
    }

    let response = send(
        &app.public,
        form_post_with(
            "/oauth2/v1/introspect",
            &[("token", refresh)],
            &[("authorization", &auth)],
        ),
    )
    .await;
    assert_eq!(body_json(response).await["active"], false);
}
