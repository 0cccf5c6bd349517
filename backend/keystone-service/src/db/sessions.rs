/// Session database operations
use sqlx::AnyPool;

use super::{DbError, Result};
use crate::models::Session;

const SESSION_COLUMNS: &str =
    "id, user_id, created_at, last_seen_at, expires_at, active, csrf_token";

pub async fn insert(pool: &AnyPool, session: &Session) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (id, user_id, created_at, last_seen_at, expires_at, active, \
         csrf_token) VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&session.id)
    .bind(&session.user_id)
    .bind(session.created_at)
    .bind(session.last_seen_at)
    .bind(session.expires_at)
    .bind(session.active)
    .bind(&session.csrf_token)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get(pool: &AnyPool, id: &str) -> Result<Session> {
    let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
    sqlx::query_as::<_, Session>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Refresh `last_seen_at`, atomically re-checking liveness so a concurrent
/// touch can never extend a dead session. Returns false when the session was
/// inactive, absolutely expired, or already idle-expired.
pub async fn touch(
    pool: &AnyPool,
    id: &str,
    now: i64,
    idle_timeout_nanos: i64,
) -> Result<bool> {
    let min_last_seen = now.saturating_sub(idle_timeout_nanos);
    let result = sqlx::query(
        "UPDATE sessions SET last_seen_at = $1 \
         WHERE id = $2 AND active = TRUE AND expires_at > $1 AND last_seen_at >= $3",
    )
    .bind(now)
    .bind(id)
    .bind(min_last_seen)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Idempotent revocation.
pub async fn revoke(pool: &AnyPool, id: &str) -> Result<()> {
    sqlx::query("UPDATE sessions SET active = FALSE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Delete absolutely expired sessions, at most `limit` rows per sweep.
pub async fn sweep_expired(pool: &AnyPool, now: i64, limit: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM sessions WHERE id IN \
         (SELECT id FROM sessions WHERE expires_at < $1 LIMIT $2)",
    )
    .bind(now)
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
