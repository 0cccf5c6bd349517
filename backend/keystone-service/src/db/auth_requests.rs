/// Authorization request database operations
///
/// Transitions are durable: each step of the authorize flow is one UPDATE
/// and the single-use consumption is a conditional UPDATE whose row count
/// decides the winner under concurrency.
use sqlx::{AnyConnection, AnyPool};

use super::{DbError, Result};
use crate::models::AuthorizationRequest;

const REQUEST_COLUMNS: &str = "id, client_id, redirect_uri, scope, state, code_challenge, \
     code_challenge_method, nonce, code, user_id, session_id, consent_id, auth_time, used, \
     used_at, created_at, expires_at";

pub async fn insert(pool: &AnyPool, request: &AuthorizationRequest) -> Result<()> {
    sqlx::query(
        "INSERT INTO authorization_requests (id, client_id, redirect_uri, scope, state, \
         code_challenge, code_challenge_method, nonce, code, user_id, session_id, consent_id, \
         auth_time, used, used_at, created_at, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
    )
    .bind(&request.id)
    .bind(&request.client_id)
    .bind(&request.redirect_uri)
    .bind(&request.scope)
    .bind(&request.state)
    .bind(&request.code_challenge)
    .bind(&request.code_challenge_method)
    .bind(&request.nonce)
    .bind(&request.code)
    .bind(&request.user_id)
    .bind(&request.session_id)
    .bind(&request.consent_id)
    .bind(request.auth_time)
    .bind(request.used)
    .bind(request.used_at)
    .bind(request.created_at)
    .bind(request.expires_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get(pool: &AnyPool, id: &str) -> Result<AuthorizationRequest> {
    let query = format!("SELECT {REQUEST_COLUMNS} FROM authorization_requests WHERE id = $1");
    sqlx::query_as::<_, AuthorizationRequest>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn get_by_code(pool: &AnyPool, code: &str) -> Result<AuthorizationRequest> {
    let query = format!("SELECT {REQUEST_COLUMNS} FROM authorization_requests WHERE code = $1");
    sqlx::query_as::<_, AuthorizationRequest>(&query)
        .bind(code)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Bind the authenticated user and their session (Pending → Authenticated).
pub async fn bind_user(
    pool: &AnyPool,
    id: &str,
    user_id: &str,
    session_id: &str,
    auth_time: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE authorization_requests SET user_id = $1, session_id = $2, auth_time = $3 \
         WHERE id = $4 AND used = FALSE",
    )
    .bind(user_id)
    .bind(session_id)
    .bind(auth_time)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Record the consent decision (Authenticated → Consented).
pub async fn bind_consent(pool: &AnyPool, id: &str, consent_id: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE authorization_requests SET consent_id = $1 WHERE id = $2 AND used = FALSE",
    )
    .bind(consent_id)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Store the issued code (Consented → CodeIssued). The partial unique index
/// on `code` turns a random collision into `Conflict`.
pub async fn set_code(pool: &AnyPool, id: &str, code: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE authorization_requests SET code = $1 WHERE id = $2 AND used = FALSE",
    )
    .bind(code)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Consume the code (CodeIssued → Exchanged). Conditional on `used = FALSE`;
/// exactly one of two concurrent exchanges observes a row change. Once set,
/// `used` never transitions back.
pub async fn mark_used(conn: &mut AnyConnection, id: &str, now: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE authorization_requests SET used = TRUE, used_at = $1 \
         WHERE id = $2 AND used = FALSE",
    )
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Drop expired, never-consumed requests in bounded batches.
pub async fn delete_expired(pool: &AnyPool, now: i64, limit: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM authorization_requests WHERE id IN \
         (SELECT id FROM authorization_requests WHERE expires_at < $1 AND used = FALSE LIMIT $2)",
    )
    .bind(now)
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
