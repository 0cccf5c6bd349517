//! `/admin` group, loopback-only listener: health, shutdown, unseal, and
//! key management. Everything except the health probes requires the admin
//! credential.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::clock::now_nanos;
use crate::error::{Result, ServiceError};
use crate::models::KeyTier;
use crate::security::password;
use crate::services::audit;
use crate::state::ShutdownReason;
use crate::AppState;

use super::middleware::ClientAddr;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/livez", get(livez))
        .route("/admin/readyz", get(readyz))
        .route("/admin/shutdown", post(shutdown))
        .route("/admin/unseal/init", post(unseal_init))
        .route("/admin/unseal/share", post(unseal_share))
        .route("/admin/unseal/status", get(unseal_status))
        .route("/admin/seal", post(seal))
        .route("/admin/keys", get(list_keys))
        .route("/admin/keys/rotate", post(rotate_keys))
        .route("/admin/clients/:client_id/secret", post(rotate_client_secret))
        .layer(from_fn_with_state(state, admin_auth))
}

/// Loopback + admin-token gate. Health probes pass without credentials;
/// everything else needs the configured token, compared in constant time.
async fn admin_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(addr) = request.extensions().get::<ClientAddr>() {
        if !addr.0.ip().is_loopback() {
            return (StatusCode::FORBIDDEN, "loopback only").into_response();
        }
    }

    let path = request.uri().path();
    if path == "/admin/livez" || path == "/admin/readyz" {
        return next.run(request).await;
    }

    let Some(expected) = state.settings.admin_listener.token.as_deref() else {
        tracing::warn!("admin token not configured; refusing admin request");
        return (StatusCode::FORBIDDEN, "admin token not configured").into_response();
    };

    let presented = request
        .headers()
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !crypto_core::constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return (StatusCode::UNAUTHORIZED, "invalid admin token").into_response();
    }

    next.run(request).await
}

/// Process liveness: 200 whenever the event loop runs, sealed or not.
async fn livez() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness: 503 until the barrier is unsealed.
async fn readyz(State(state): State<AppState>) -> Response {
    if state.barrier.is_unsealed().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "temporarily_unavailable",
                "error_description": "sealed"
            })),
        )
            .into_response()
    }
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    audit::emit(
        &state.pool,
        "admin",
        "process.shutdown",
        audit::OUTCOME_SUCCESS,
        &[],
        serde_json::json!({}),
    )
    .await;
    state.request_shutdown(ShutdownReason::Clean);
    (StatusCode::OK, Json(serde_json::json!({ "shutting_down": true })))
}

/// First-start initialization: returns the unseal shares exactly once.
async fn unseal_init(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let shares = state.barrier.initialize().await?;
    state.keystore.load().await?;
    audit::emit(
        &state.pool,
        "admin",
        "barrier.initialize",
        audit::OUTCOME_SUCCESS,
        &[],
        serde_json::json!({ "shares": shares.len() }),
    )
    .await;
    Ok(Json(serde_json::json!({
        "shares": shares,
        "threshold": state.settings.unseal.threshold,
    })))
}

#[derive(Debug, Deserialize)]
struct ShareBody {
    share: String,
}

/// Submit one unseal share; on reaching the threshold the barrier verifies
/// and unseals, and the keystore loads.
async fn unseal_share(
    State(state): State<AppState>,
    Json(body): Json<ShareBody>,
) -> Result<Json<serde_json::Value>> {
    let status = state.barrier.submit_share(&body.share).await.map_err(|err| {
        if matches!(err, crate::barrier::BarrierError::IntegrityFailed) {
            state.request_shutdown(ShutdownReason::Integrity);
        }
        ServiceError::from(err)
    })?;

    if status.state == "unsealed" {
        state.keystore.load().await?;
        state.telemetry.record_metric("barrier.unsealed", 1.0);
        audit::emit(
            &state.pool,
            "admin",
            "barrier.unseal",
            audit::OUTCOME_SUCCESS,
            &[],
            serde_json::json!({}),
        )
        .await;
    }
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

async fn unseal_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.barrier.status().await;
    Json(serde_json::to_value(status).unwrap_or_default())
}

/// Operator seal: zeroize the keyring and stop serving crypto.
async fn seal(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    state.keystore.unload().await;
    state.barrier.seal().await;
    state.telemetry.record_metric("barrier.sealed", 1.0);
    audit::emit(
        &state.pool,
        "admin",
        "barrier.seal",
        audit::OUTCOME_SUCCESS,
        &[],
        serde_json::json!({}),
    )
    .await;
    Ok(Json(serde_json::json!({ "sealed": true })))
}

/// Loaded barrier keys plus the JWT signing set. Key material never leaves
/// the barrier; this is ids and states only.
async fn list_keys(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let barrier_keys: Vec<serde_json::Value> = state
        .barrier
        .loaded_key_ids()
        .await?
        .into_iter()
        .map(|(id, tier, current)| {
            serde_json::json!({ "id": id, "tier": tier, "current": current })
        })
        .collect();
    let jwks = state.keystore.jwks().await?;
    Ok(Json(serde_json::json!({
        "barrier": barrier_keys,
        "signing": jwks,
    })))
}

#[derive(Debug, Deserialize)]
struct RotateBody {
    /// `signing`, `root`, `intermediate`, or `content`.
    target: String,
}

async fn rotate_keys(
    State(state): State<AppState>,
    Json(body): Json<RotateBody>,
) -> Result<Json<serde_json::Value>> {
    let rotated = match body.target.as_str() {
        "signing" => state.keystore.rotate().await?,
        "root" => state.barrier.rotate(KeyTier::Root).await?,
        "intermediate" => state.barrier.rotate(KeyTier::Intermediate).await?,
        "content" => state.barrier.rotate(KeyTier::Content).await?,
        other => {
            return Err(ServiceError::InvalidRequest(format!(
                "unknown rotation target: {other}"
            )))
        }
    };
    audit::emit(
        &state.pool,
        "admin",
        "keys.rotate",
        audit::OUTCOME_SUCCESS,
        &[rotated.as_str()],
        serde_json::json!({ "target": body.target }),
    )
    .await;
    Ok(Json(serde_json::json!({ "rotated": rotated })))
}

#[derive(Debug, Deserialize)]
struct RotateSecretBody {
    new_secret: String,
}

/// Admin path for client secret rotation: store the PBKDF2 record, plus a
/// barrier-sealed copy for `client_secret_jwt` clients.
async fn rotate_client_secret(
    State(state): State<AppState>,
    axum::extract::Path(client_id): axum::extract::Path<String>,
    Json(body): Json<RotateSecretBody>,
) -> Result<Json<serde_json::Value>> {
    let client = match crate::db::clients::get_by_client_id(&state.pool, &client_id).await {
        Ok(client) => client,
        Err(crate::db::DbError::NotFound) => return Err(ServiceError::NotFound),
        Err(err) => return Err(err.into()),
    };

    let secret = body.new_secret.clone();
    let hashed = tokio::task::spawn_blocking(move || password::hash_password(&secret))
        .await
        .map_err(|_| ServiceError::Internal("hashing task failed".into()))??;

    let encrypted_copy = if client.token_endpoint_auth_method == "client_secret_jwt" {
        Some(
            state
                .barrier
                .encrypt_content(client.id.as_bytes(), body.new_secret.as_bytes())
                .await?,
        )
    } else {
        None
    };

    crate::db::clients::rotate_secret(
        &state.pool,
        &client_id,
        &hashed,
        encrypted_copy.as_deref(),
        now_nanos(),
    )
    .await?;

    audit::emit(
        &state.pool,
        "admin",
        "client.secret_rotate",
        audit::OUTCOME_SUCCESS,
        &[client_id.as_str()],
        serde_json::json!({}),
    )
    .await;
    Ok(Json(serde_json::json!({ "rotated": client_id })))
}
