/// Client-assertion replay tracking
///
/// One row per seen `jti`; the primary key turns a replay into `Conflict`,
/// which the token endpoint reports as `invalid_client`.
use sqlx::AnyPool;

use super::{DbError, Result};

/// Record a jti. Returns `Conflict` when it was already seen.
pub async fn track(
    pool: &AnyPool,
    jti: &str,
    client_id: &str,
    expires_at: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO client_jwt_replay (jti, client_id, expires_at) VALUES ($1, $2, $3)",
    )
    .bind(jti)
    .bind(client_id)
    .bind(expires_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_expired(pool: &AnyPool, now: i64, limit: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM client_jwt_replay WHERE jti IN \
         (SELECT jti FROM client_jwt_replay WHERE expires_at < $1 LIMIT $2)",
    )
    .bind(now)
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
