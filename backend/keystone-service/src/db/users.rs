/// User database operations
use sqlx::AnyPool;

use super::{DbError, Result};
use crate::models::User;

const USER_COLUMNS: &str =
    "id, username, hashed_password, email, email_verified, attributes, created_at, updated_at";

pub async fn insert(pool: &AnyPool, user: &User) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, username, hashed_password, email, email_verified, attributes, \
         created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&user.id)
    .bind(&user.username)
    .bind(&user.hashed_password)
    .bind(&user.email)
    .bind(user.email_verified)
    .bind(&user.attributes)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_by_id(pool: &AnyPool, id: &str) -> Result<User> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    sqlx::query_as::<_, User>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn get_by_username(pool: &AnyPool, username: &str) -> Result<User> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
    sqlx::query_as::<_, User>(&query)
        .bind(username)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn update_password(pool: &AnyPool, id: &str, hashed: &str, now: i64) -> Result<()> {
    let result = sqlx::query(
        "UPDATE users SET hashed_password = $1, updated_at = $2 WHERE id = $3",
    )
    .bind(hashed)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
