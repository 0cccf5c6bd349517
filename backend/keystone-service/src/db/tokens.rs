/// Token database operations
///
/// Refresh rotation and reuse detection build on two primitives here: a
/// conditional single-revocation (`revoke_if_active`) whose row count says
/// who got there first, and a recursive chain revocation used when reuse is
/// detected.
use sqlx::{AnyConnection, AnyPool};

use super::{DbError, Result};
use crate::models::Token;

const TOKEN_COLUMNS: &str = "id, token_type, client_id, user_id, session_id, auth_request_id, \
     scope, token_hash, parent_id, signing_key_id, issued_at, expires_at, revoked_at";

pub async fn insert(conn: &mut AnyConnection, token: &Token) -> Result<()> {
    sqlx::query(
        "INSERT INTO tokens (id, token_type, client_id, user_id, session_id, auth_request_id, \
         scope, token_hash, parent_id, signing_key_id, issued_at, expires_at, revoked_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(&token.id)
    .bind(&token.token_type)
    .bind(&token.client_id)
    .bind(&token.user_id)
    .bind(&token.session_id)
    .bind(&token.auth_request_id)
    .bind(&token.scope)
    .bind(&token.token_hash)
    .bind(&token.parent_id)
    .bind(&token.signing_key_id)
    .bind(token.issued_at)
    .bind(token.expires_at)
    .bind(token.revoked_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn insert_pool(pool: &AnyPool, token: &Token) -> Result<()> {
    let mut conn = pool.acquire().await?;
    insert(&mut conn, token).await
}

pub async fn get(pool: &AnyPool, id: &str) -> Result<Token> {
    let query = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = $1");
    sqlx::query_as::<_, Token>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Look up a refresh token by the SHA-256 of its opaque value.
pub async fn get_by_hash(conn: &mut AnyConnection, token_hash: &str) -> Result<Token> {
    let query = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE token_hash = $1");
    sqlx::query_as::<_, Token>(&query)
        .bind(token_hash)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn get_by_hash_pool(pool: &AnyPool, token_hash: &str) -> Result<Token> {
    let mut conn = pool.acquire().await?;
    get_by_hash(&mut conn, token_hash).await
}

/// Revoke exactly once. Returns true when this call performed the
/// revocation, false when the token was already revoked (the reuse signal
/// during rotation).
pub async fn revoke_if_active(conn: &mut AnyConnection, id: &str, now: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tokens SET revoked_at = $1 WHERE id = $2 AND revoked_at IS NULL",
    )
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Idempotent revocation of a single token.
pub async fn revoke(pool: &AnyPool, id: &str, now: i64) -> Result<()> {
    let mut conn = pool.acquire().await?;
    revoke_if_active(&mut conn, id, now).await?;
    Ok(())
}

/// Revoke a token and every descendant in its rotation chain.
pub async fn revoke_chain(conn: &mut AnyConnection, root_id: &str, now: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tokens SET revoked_at = $1 WHERE revoked_at IS NULL AND id IN ( \
           WITH RECURSIVE chain(id) AS ( \
             SELECT id FROM tokens WHERE id = $2 \
             UNION ALL \
             SELECT t.id FROM tokens t JOIN chain c ON t.parent_id = c.id \
           ) SELECT id FROM chain)",
    )
    .bind(now)
    .bind(root_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn revoke_chain_pool(pool: &AnyPool, root_id: &str, now: i64) -> Result<u64> {
    let mut conn = pool.acquire().await?;
    revoke_chain(&mut conn, root_id, now).await
}

/// Revoke every token minted from one authorization request (code-replay
/// containment).
pub async fn revoke_by_auth_request(pool: &AnyPool, request_id: &str, now: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tokens SET revoked_at = $1 \
         WHERE auth_request_id = $2 AND revoked_at IS NULL",
    )
    .bind(now)
    .bind(request_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Session logout cascades revocation over the session's tokens without
/// deleting the rows.
pub async fn revoke_by_session(pool: &AnyPool, session_id: &str, now: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tokens SET revoked_at = $1 WHERE session_id = $2 AND revoked_at IS NULL",
    )
    .bind(now)
    .bind(session_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Latest expiry among tokens bound to a signing key; the rotation job keeps
/// the key verify-only until this instant passes.
pub async fn max_expiry_for_signing_key(pool: &AnyPool, key_id: &str) -> Result<Option<i64>> {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT MAX(expires_at) FROM tokens WHERE signing_key_id = $1",
    )
    .bind(key_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

pub async fn delete_expired(pool: &AnyPool, cutoff: i64, limit: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM tokens WHERE id IN \
         (SELECT id FROM tokens WHERE expires_at < $1 LIMIT $2)",
    )
    .bind(cutoff)
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_util::test_pool;

    pub(crate) fn sample_token(id: &str, parent: Option<&str>) -> Token {
        Token {
            id: id.to_string(),
            token_type: "refresh".into(),
            client_id: "c1".into(),
            user_id: Some("u1".into()),
            session_id: None,
            auth_request_id: None,
            scope: "openid".into(),
            token_hash: Some(format!("hash-{id}")),
            parent_id: parent.map(str::to_string),
            signing_key_id: None,
            issued_at: 0,
            expires_at: 1_000_000,
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_get_and_hash_lookup() {
        let pool = test_pool().await;
        insert_pool(&pool, &sample_token("t1", None)).await.unwrap();
        assert_eq!(get(&pool, "t1").await.unwrap().id, "t1");
        assert_eq!(
            get_by_hash_pool(&pool, "hash-t1").await.unwrap().id,
            "t1"
        );
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let pool = test_pool().await;
        insert_pool(&pool, &sample_token("t1", None)).await.unwrap();

        revoke(&pool, "t1", 10).await.unwrap();
        revoke(&pool, "t1", 99).await.unwrap();
        // First revocation wins; second call changes nothing.
        assert_eq!(get(&pool, "t1").await.unwrap().revoked_at, Some(10));
    }

    #[tokio::test]
    async fn test_revoke_if_active_reports_prior_revocation() {
        let pool = test_pool().await;
        insert_pool(&pool, &sample_token("t1", None)).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        assert!(revoke_if_active(&mut conn, "t1", 10).await.unwrap());
        assert!(!revoke_if_active(&mut conn, "t1", 20).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_chain_reaches_descendants() {
        let pool = test_pool().await;
        insert_pool(&pool, &sample_token("r1", None)).await.unwrap();
        insert_pool(&pool, &sample_token("r2", Some("r1"))).await.unwrap();
        insert_pool(&pool, &sample_token("r3", Some("r2"))).await.unwrap();
        insert_pool(&pool, &sample_token("other", None)).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let revoked = revoke_chain(&mut conn, "r1", 42).await.unwrap();
        assert_eq!(revoked, 3);
        assert!(get(&pool, "r3").await.unwrap().is_revoked());
        assert!(!get(&pool, "other").await.unwrap().is_revoked());
    }

    #[tokio::test]
    async fn test_revoke_by_auth_request() {
        let pool = test_pool().await;
        let mut a = sample_token("a", None);
        a.auth_request_id = Some("req-1".into());
        a.token_hash = Some("ha".into());
        let mut b = sample_token("b", None);
        b.auth_request_id = Some("req-1".into());
        b.token_hash = Some("hb".into());
        insert_pool(&pool, &a).await.unwrap();
        insert_pool(&pool, &b).await.unwrap();

        assert_eq!(revoke_by_auth_request(&pool, "req-1", 7).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_max_expiry_for_signing_key() {
        let pool = test_pool().await;
        let mut t = sample_token("t1", None);
        t.signing_key_id = Some("k1".into());
        t.expires_at = 500;
        insert_pool(&pool, &t).await.unwrap();

        assert_eq!(
            max_expiry_for_signing_key(&pool, "k1").await.unwrap(),
            Some(500)
        );
        assert_eq!(max_expiry_for_signing_key(&pool, "nope").await.unwrap(), None);
    }
}
