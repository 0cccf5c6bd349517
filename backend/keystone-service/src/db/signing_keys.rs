/// JWT signing key database operations
use sqlx::AnyPool;

use super::{DbError, Result};
use crate::models::SigningKey;

const KEY_COLUMNS: &str =
    "id, algorithm, public_key_pem, private_key_enc, status, created_at, rotated_at, retired_at";

pub async fn insert(pool: &AnyPool, key: &SigningKey) -> Result<()> {
    sqlx::query(
        "INSERT INTO signing_keys (id, algorithm, public_key_pem, private_key_enc, status, \
         created_at, rotated_at, retired_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&key.id)
    .bind(&key.algorithm)
    .bind(&key.public_key_pem)
    .bind(&key.private_key_enc)
    .bind(&key.status)
    .bind(key.created_at)
    .bind(key.rotated_at)
    .bind(key.retired_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get(pool: &AnyPool, id: &str) -> Result<SigningKey> {
    let query = format!("SELECT {KEY_COLUMNS} FROM signing_keys WHERE id = $1");
    sqlx::query_as::<_, SigningKey>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn get_current(pool: &AnyPool) -> Result<Option<SigningKey>> {
    let query = format!(
        "SELECT {KEY_COLUMNS} FROM signing_keys WHERE status = 'current' \
         ORDER BY created_at DESC LIMIT 1"
    );
    Ok(sqlx::query_as::<_, SigningKey>(&query)
        .fetch_optional(pool)
        .await?)
}

/// Current and verify-only keys, newest first: the verification set.
pub async fn list_usable(pool: &AnyPool) -> Result<Vec<SigningKey>> {
    let query = format!(
        "SELECT {KEY_COLUMNS} FROM signing_keys \
         WHERE status IN ('current', 'verify_only') ORDER BY created_at DESC"
    );
    Ok(sqlx::query_as::<_, SigningKey>(&query)
        .fetch_all(pool)
        .await?)
}

/// Demote the current key to verify-only (rotation step one).
pub async fn demote_current(pool: &AnyPool, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE signing_keys SET status = 'verify_only', rotated_at = $1 \
         WHERE status = 'current'",
    )
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn retire(pool: &AnyPool, id: &str, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE signing_keys SET status = 'retired', retired_at = $1 WHERE id = $2",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::test_pool;

    pub(crate) fn sample_key(id: &str, status: &str) -> SigningKey {
        SigningKey {
            id: id.to_string(),
            algorithm: "ES256".into(),
            public_key_pem: "-----BEGIN PUBLIC KEY-----".into(),
            private_key_enc: "sealed".into(),
            status: status.to_string(),
            created_at: 1,
            rotated_at: None,
            retired_at: None,
        }
    }

    #[tokio::test]
    async fn test_rotation_demotes_current() {
        let pool = test_pool().await;
        insert(&pool, &sample_key("k1", "current")).await.unwrap();

        demote_current(&pool, 10).await.unwrap();
        let mut k2 = sample_key("k2", "current");
        k2.created_at = 2;
        insert(&pool, &k2).await.unwrap();

        let current = get_current(&pool).await.unwrap().unwrap();
        assert_eq!(current.id, "k2");

        let usable = list_usable(&pool).await.unwrap();
        assert_eq!(usable.len(), 2);
    }

    #[tokio::test]
    async fn test_retired_keys_drop_out_of_usable_set() {
        let pool = test_pool().await;
        insert(&pool, &sample_key("k1", "verify_only")).await.unwrap();
        retire(&pool, "k1", 99).await.unwrap();
        assert!(list_usable(&pool).await.unwrap().is_empty());
        assert_eq!(get(&pool, "k1").await.unwrap().status, "retired");
    }
}
