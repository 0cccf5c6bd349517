//! `/browser` group: authorize entry, login and consent forms, logout.
//!
//! State-changing posts require a CSRF token: the session token once a
//! session exists, a double-submit cookie for the pre-session login form.
//! All redirects are 302 with exact, pre-validated targets.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::error::ServiceError;
use crate::models::Session;
use crate::services::{authorize, session};
use crate::AppState;

use super::middleware::{browser_rate_limit, browser_security_headers, seal_gate};

pub const SESSION_COOKIE: &str = "keystone_session";
const LOGIN_CSRF_COOKIE: &str = "keystone_login_csrf";

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/oauth2/v1/authorize", get(authorize_endpoint))
        .route("/oidc/v1/login", get(login_form).post(login_submit))
        .route("/oidc/v1/consent", get(consent_form).post(consent_submit))
        .route("/oidc/v1/logout", post(logout))
        .layer(from_fn(browser_security_headers))
        .layer(from_fn_with_state(state.clone(), browser_rate_limit))
        .layer(from_fn_with_state(state, seal_gate))
}

// ---------------------------------------------------------------------------
// Cookies
// ---------------------------------------------------------------------------

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn build_cookie(name: &str, value: &str, secure: bool, max_age_secs: Option<i64>) -> HeaderValue {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    if let Some(max_age) = max_age_secs {
        cookie.push_str(&format!("; Max-Age={max_age}"));
    }
    HeaderValue::from_str(&cookie).unwrap_or(HeaderValue::from_static(""))
}

/// 302 redirect (the OAuth flows specify Found, not See Other).
fn found(location: &str) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

fn found_with_cookie(location: &str, cookie: HeaderValue) -> Response {
    let mut response = found(location);
    response.headers_mut().append(header::SET_COOKIE, cookie);
    response
}

async fn current_session(state: &AppState, headers: &HeaderMap) -> Option<Session> {
    let session_id = cookie_value(headers, SESSION_COOKIE)?;
    session::get_live(&state.pool, &state.settings.session, &session_id)
        .await
        .ok()
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

// ---------------------------------------------------------------------------
// Authorize
// ---------------------------------------------------------------------------

/// `GET /oauth2/v1/authorize`: create the request and send the browser to
/// login, or auto-advance across a live session and prior consent.
async fn authorize_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<authorize::AuthorizeParams>,
) -> Response {
    // Client and redirect URI must validate before anything may redirect.
    let (_client, redirect_uri) = match authorize::resolve_client(&state, &params).await {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response(),
    };

    let request = match authorize::begin(&state, &params).await {
        Ok(request) => request,
        Err(err) => {
            let description = err.to_string();
            return found(&authorize::error_redirect(
                &redirect_uri,
                err.oauth_code(),
                &description,
                params.state.as_deref().unwrap_or_default(),
            ));
        }
    };

    // A live session skips the login turn; covered consent skips consent.
    if let Some(live) = current_session(&state, &headers).await {
        if let Ok(request) = authorize::adopt_session(&state, &request.id, &live).await {
            match authorize::existing_consent(&state, &request).await {
                Ok(Some(consent)) => {
                    match authorize::advance_with_consent(&state, &request, &consent).await {
                        Ok(url) => return found(&url),
                        Err(err) => return err.into_response(),
                    }
                }
                _ => {
                    return found(&format!(
                        "/browser/oidc/v1/consent?request_id={}",
                        request.id
                    ))
                }
            }
        }
    }

    found(&format!("/browser/oidc/v1/login?request_id={}", request.id))
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RequestIdQuery {
    request_id: String,
}

async fn login_form(
    State(state): State<AppState>,
    Query(query): Query<RequestIdQuery>,
) -> Response {
    if let Err(err) = authorize::get_live(&state, &query.request_id).await {
        return err.into_response();
    }

    // Pre-session CSRF: double-submit cookie bound to this form render.
    let csrf = URL_SAFE_NO_PAD.encode(crypto_core::random_bytes(32));
    let body = format!(
        r#"<!DOCTYPE html>
<html><head><title>Sign in</title></head><body>
<h1>Sign in</h1>
<form method="post" action="/browser/oidc/v1/login">
  <input type="hidden" name="request_id" value="{request_id}">
  <input type="hidden" name="csrf_token" value="{csrf}">
  <label>Username <input name="username" autocomplete="username"></label>
  <label>Password <input name="password" type="password" autocomplete="current-password"></label>
  <button type="submit">Sign in</button>
</form>
</body></html>"#,
        request_id = html_escape(&query.request_id),
        csrf = csrf,
    );

    let mut response = Html(body).into_response();
    response.headers_mut().append(
        header::SET_COOKIE,
        build_cookie(
            LOGIN_CSRF_COOKIE,
            &csrf,
            state.settings.session.secure_cookies,
            Some(600),
        ),
    );
    response
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    request_id: String,
    username: String,
    password: String,
    csrf_token: String,
}

async fn login_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Form(form): axum::Form<LoginForm>,
) -> Response {
    let cookie_csrf = cookie_value(&headers, LOGIN_CSRF_COOKIE).unwrap_or_default();
    if !crypto_core::constant_time_eq(cookie_csrf.as_bytes(), form.csrf_token.as_bytes()) {
        return ServiceError::Forbidden.into_response();
    }

    let (live, request) =
        match authorize::login(&state, &form.request_id, &form.username, &form.password).await {
            Ok(result) => result,
            Err(err) => return err.into_response(),
        };

    let session_cookie = build_cookie(
        SESSION_COOKIE,
        &live.id,
        state.settings.session.secure_cookies,
        None,
    );

    // Existing consent advances straight to the callback.
    match authorize::existing_consent(&state, &request).await {
        Ok(Some(consent)) => {
            match authorize::advance_with_consent(&state, &request, &consent).await {
                Ok(url) => found_with_cookie(&url, session_cookie),
                Err(err) => err.into_response(),
            }
        }
        _ => found_with_cookie(
            &format!("/browser/oidc/v1/consent?request_id={}", request.id),
            session_cookie,
        ),
    }
}

// ---------------------------------------------------------------------------
// Consent
// ---------------------------------------------------------------------------

async fn consent_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RequestIdQuery>,
) -> Response {
    let request = match authorize::get_live(&state, &query.request_id).await {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let Some(live) = current_session(&state, &headers).await else {
        return found(&format!(
            "/browser/oidc/v1/login?request_id={}",
            query.request_id
        ));
    };

    let scope_items: String = request
        .scope
        .split_whitespace()
        .map(|scope| format!("<li>{}</li>", html_escape(scope)))
        .collect();
    let body = format!(
        r#"<!DOCTYPE html>
<html><head><title>Consent</title></head><body>
<h1>Authorize {client}</h1>
<p>The application requests access to:</p>
<ul>{scopes}</ul>
<form method="post" action="/browser/oidc/v1/consent">
  <input type="hidden" name="request_id" value="{request_id}">
  <input type="hidden" name="csrf_token" value="{csrf}">
  <button type="submit" name="action" value="approve">Approve</button>
  <button type="submit" name="action" value="deny">Deny</button>
</form>
</body></html>"#,
        client = html_escape(&request.client_id),
        scopes = scope_items,
        request_id = html_escape(&request.id),
        csrf = html_escape(&live.csrf_token),
    );
    Html(body).into_response()
}

#[derive(Debug, Deserialize)]
struct ConsentForm {
    request_id: String,
    csrf_token: String,
    action: String,
}

async fn consent_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Form(form): axum::Form<ConsentForm>,
) -> Response {
    let Some(live) = current_session(&state, &headers).await else {
        return ServiceError::Unauthenticated.into_response();
    };
    if session::check_csrf(&live, &form.csrf_token).is_err() {
        return ServiceError::Forbidden.into_response();
    }
    // The deciding session must be the one that authenticated the request.
    match authorize::get_live(&state, &form.request_id).await {
        Ok(request) if request.user_id.as_deref() == Some(live.user_id.as_str()) => {}
        Ok(_) => return ServiceError::Forbidden.into_response(),
        Err(err) => return err.into_response(),
    }

    let result = if form.action == "approve" {
        authorize::grant_consent(&state, &form.request_id).await
    } else {
        authorize::deny_consent(&state, &form.request_id).await
    };
    match result {
        Ok(url) => found(&url),
        Err(err) => err.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Logout
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogoutForm {
    csrf_token: String,
    client_id: Option<String>,
    post_logout_redirect_uri: Option<String>,
}

/// `POST /oidc/v1/logout`: revoke the session and its chained tokens,
/// clear the cookie, and 302 to a validated post-logout URI.
async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Form(form): axum::Form<LogoutForm>,
) -> Response {
    let Some(live) = current_session(&state, &headers).await else {
        return ServiceError::Unauthenticated.into_response();
    };
    if session::check_csrf(&live, &form.csrf_token).is_err() {
        return ServiceError::Forbidden.into_response();
    }

    if let Err(err) = session::revoke_with_tokens(&state.pool, &live.id).await {
        return err.into_response();
    }
    crate::services::audit::emit(
        &state.pool,
        &format!("user:{}", live.user_id),
        "session.logout",
        crate::services::audit::OUTCOME_SUCCESS,
        &[],
        serde_json::json!({}),
    )
    .await;

    let clear = build_cookie(
        SESSION_COOKIE,
        "",
        state.settings.session.secure_cookies,
        Some(0),
    );

    // Post-logout target must be registered for the named client; anything
    // else lands on a neutral page.
    if let (Some(client_id), Some(target)) = (&form.client_id, &form.post_logout_redirect_uri) {
        if let Ok(client) = crate::db::clients::get_by_client_id(&state.pool, client_id).await {
            if client.allows_redirect_uri(target) {
                return found_with_cookie(target, clear);
            }
        }
        return ServiceError::InvalidRequest("post_logout_redirect_uri not registered".into())
            .into_response();
    }

    let mut response =
        Html("<!DOCTYPE html><html><body><h1>Signed out</h1></body></html>").into_response();
    response.headers_mut().append(header::SET_COOKIE, clear);
    response
}
