//! Shared harness for integration tests: a fully wired app over an
//! in-memory SQLite database, driven through the real routers.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tower::ServiceExt;

use keystone_service::barrier::Barrier;
use keystone_service::config::Settings;
use keystone_service::models::{to_json_list, Client, User};
use keystone_service::security::password;
use keystone_service::services::keystore::SigningKeystore;
use keystone_service::telemetry::NoopSink;
use keystone_service::{db, http, AppState};

pub const CLIENT_ID: &str = "web-client";
pub const CLIENT_SECRET: &str = "test-secret";
pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "correct horse battery";
pub const ADMIN_TOKEN: &str = "test-admin-token";

pub struct TestApp {
    pub state: AppState,
    pub public: Router,
    pub admin: Router,
}

/// Bring up a sealed app: migrated database, routers, no barrier
/// initialization yet.
pub async fn spawn_sealed() -> TestApp {
    let mut settings = Settings::default();
    settings.issuer = "https://idp.test".to_string();
    settings.database.url = "sqlite::memory:".to_string();
    settings.session.secure_cookies = false;
    settings.admin_listener.token = Some(ADMIN_TOKEN.to_string());

    let pool = db_pool::connect(&settings.database.pool_config())
        .await
        .expect("test pool");
    db::run_migrations(&pool).await.expect("migrations");

    let barrier = Arc::new(Barrier::new(pool.clone(), 5, 3));
    let keystore = Arc::new(SigningKeystore::new(
        pool.clone(),
        barrier.clone(),
        jose_core::SignatureAlgorithm::ES256,
    ));

    let (state, _shutdown_rx) = AppState::new(
        Arc::new(settings),
        pool,
        barrier,
        keystore,
        Arc::new(NoopSink),
    );

    TestApp {
        public: http::public_router(state.clone()),
        admin: http::admin_router(state.clone()),
        state,
    }
}

/// Bring up an unsealed app with a seeded client and user.
pub async fn spawn_app() -> TestApp {
    let app = spawn_sealed().await;
    app.state.barrier.initialize().await.expect("initialize");
    app.state.keystore.load().await.expect("keystore");
    seed_client(&app.state).await;
    seed_user(&app.state).await;
    app
}

pub async fn seed_client(state: &AppState) -> Client {
    let client = Client {
        id: uuid::Uuid::now_v7().to_string(),
        client_id: CLIENT_ID.to_string(),
        client_name: "Integration Test Client".into(),
        tenant_id: "tenant-1".into(),
        redirect_uris: to_json_list(&["https://rp/cb".to_string()]),
        grant_types: to_json_list(&[
            "authorization_code".to_string(),
            "refresh_token".to_string(),
            "client_credentials".to_string(),
        ]),
        token_endpoint_auth_method: "client_secret_basic".into(),
        hashed_client_secret: Some(
            password::hash_with_iterations(CLIENT_SECRET, 1_000).unwrap(),
        ),
        client_secret: None,
        client_secret_enc: None,
        client_jwks: None,
        tls_subject_dn: None,
        tls_ski: None,
        scopes_allowed: to_json_list(&[
            "openid".to_string(),
            "profile".to_string(),
            "email".to_string(),
            "kms:admin".to_string(),
            "kms:encrypt".to_string(),
            "kms:decrypt".to_string(),
            "kms:sign".to_string(),
            "kms:verify".to_string(),
            "kms:rotate".to_string(),
            "kms:retire".to_string(),
        ]),
        is_confidential: true,
        access_token_lifetime_secs: 3600,
        refresh_token_lifetime_secs: 86400,
        created_at: 1,
        updated_at: 1,
    };
    db::clients::insert(&state.pool, &client).await.unwrap();
    client
}

pub async fn seed_user(state: &AppState) -> User {
    let user = User {
        id: uuid::Uuid::now_v7().to_string(),
        username: USERNAME.to_string(),
        hashed_password: password::hash_with_iterations(PASSWORD, 1_000).unwrap(),
        email: "alice@example.com".into(),
        email_verified: true,
        attributes: r#"{"name":"Alice Example"}"#.into(),
        created_at: 1,
        updated_at: 1,
    };
    db::users::insert(&state.pool, &user).await.unwrap();
    user
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.expect("infallible")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn get_with_cookie(uri: &str, cookie: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap()
}

pub fn form_post(uri: &str, pairs: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(encode_form(pairs)))
        .unwrap()
}

pub fn form_post_with(
    uri: &str,
    pairs: &[(&str, &str)],
    headers: &[(&str, &str)],
) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(encode_form(pairs))).unwrap()
}

pub fn json_post(uri: &str, body: serde_json::Value, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn encode_form(pairs: &[(&str, &str)]) -> String {
    serde_urlencoded::to_string(pairs).unwrap()
}

pub fn basic_auth(client_id: &str, secret: &str) -> String {
    format!(
        "Basic {}",
        BASE64_STANDARD.encode(format!("{client_id}:{secret}"))
    )
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub fn set_cookie_value(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let (key, rest) = cookie.split_once('=')?;
            (key == name).then(|| rest.split(';').next().unwrap_or_default().to_string())
        })
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn assert_status(response: &Response<Body>, expected: StatusCode) {
    assert_eq!(response.status(), expected, "unexpected status");
}
