/// Barrier key record database operations
use sqlx::AnyPool;

use super::{DbError, Result};
use crate::models::BarrierKeyRecord;

const RECORD_COLUMNS: &str =
    "id, tier, algorithm, ciphertext, parent_key_id, hmac, status, created_at, rotated_at";

pub async fn insert(pool: &AnyPool, record: &BarrierKeyRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO barrier_keys (id, tier, algorithm, ciphertext, parent_key_id, hmac, \
         status, created_at, rotated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&record.id)
    .bind(&record.tier)
    .bind(&record.algorithm)
    .bind(&record.ciphertext)
    .bind(&record.parent_key_id)
    .bind(&record.hmac)
    .bind(&record.status)
    .bind(record.created_at)
    .bind(record.rotated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get(pool: &AnyPool, id: &str) -> Result<BarrierKeyRecord> {
    let query = format!("SELECT {RECORD_COLUMNS} FROM barrier_keys WHERE id = $1");
    sqlx::query_as::<_, BarrierKeyRecord>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// All records of a tier, oldest first so parents load before children.
pub async fn list_tier(pool: &AnyPool, tier: &str) -> Result<Vec<BarrierKeyRecord>> {
    let query = format!(
        "SELECT {RECORD_COLUMNS} FROM barrier_keys WHERE tier = $1 ORDER BY created_at ASC"
    );
    Ok(sqlx::query_as::<_, BarrierKeyRecord>(&query)
        .bind(tier)
        .fetch_all(pool)
        .await?)
}

pub async fn any_exist(pool: &AnyPool) -> Result<bool> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM barrier_keys")
        .fetch_one(pool)
        .await?;
    Ok(row.0 > 0)
}

/// Demote the tier's current record (rotation step one).
pub async fn demote_current(pool: &AnyPool, tier: &str, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE barrier_keys SET status = 'superseded', rotated_at = $1 \
         WHERE tier = $2 AND status = 'current'",
    )
    .bind(now)
    .bind(tier)
    .execute(pool)
    .await?;

    Ok(())
}

/// Demote the tier's current record and insert its successor in one
/// transaction, so a crash can never leave the tier without a current key.
pub async fn rotate_record(pool: &AnyPool, record: &BarrierKeyRecord, now: i64) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE barrier_keys SET status = 'superseded', rotated_at = $1 \
         WHERE tier = $2 AND status = 'current'",
    )
    .bind(now)
    .bind(&record.tier)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO barrier_keys (id, tier, algorithm, ciphertext, parent_key_id, hmac, \
         status, created_at, rotated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&record.id)
    .bind(&record.tier)
    .bind(&record.algorithm)
    .bind(&record.ciphertext)
    .bind(&record.parent_key_id)
    .bind(&record.hmac)
    .bind(&record.status)
    .bind(record.created_at)
    .bind(record.rotated_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn set_status(pool: &AnyPool, id: &str, status: &str, now: i64) -> Result<()> {
    let result = sqlx::query(
        "UPDATE barrier_keys SET status = $1, rotated_at = $2 WHERE id = $3",
    )
    .bind(status)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
