/// Client registration database operations
use sqlx::AnyPool;

use super::{DbError, Result};
use crate::models::Client;

const CLIENT_COLUMNS: &str = "id, client_id, client_name, tenant_id, redirect_uris, grant_types, \
     token_endpoint_auth_method, hashed_client_secret, client_secret, client_secret_enc, \
     client_jwks, tls_subject_dn, tls_ski, scopes_allowed, is_confidential, \
     access_token_lifetime_secs, refresh_token_lifetime_secs, created_at, updated_at";

pub async fn insert(pool: &AnyPool, client: &Client) -> Result<()> {
    sqlx::query(
        "INSERT INTO clients (id, client_id, client_name, tenant_id, redirect_uris, grant_types, \
         token_endpoint_auth_method, hashed_client_secret, client_secret, client_secret_enc, \
         client_jwks, tls_subject_dn, tls_ski, scopes_allowed, is_confidential, \
         access_token_lifetime_secs, refresh_token_lifetime_secs, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
    )
    .bind(&client.id)
    .bind(&client.client_id)
    .bind(&client.client_name)
    .bind(&client.tenant_id)
    .bind(&client.redirect_uris)
    .bind(&client.grant_types)
    .bind(&client.token_endpoint_auth_method)
    .bind(&client.hashed_client_secret)
    .bind(&client.client_secret)
    .bind(&client.client_secret_enc)
    .bind(&client.client_jwks)
    .bind(&client.tls_subject_dn)
    .bind(&client.tls_ski)
    .bind(&client.scopes_allowed)
    .bind(client.is_confidential)
    .bind(client.access_token_lifetime_secs)
    .bind(client.refresh_token_lifetime_secs)
    .bind(client.created_at)
    .bind(client.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_by_client_id(pool: &AnyPool, client_id: &str) -> Result<Client> {
    let query = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE client_id = $1");
    sqlx::query_as::<_, Client>(&query)
        .bind(client_id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Clients still carrying a legacy plaintext secret, for the first-start
/// hashing pass. Returns `(id, secret, token_endpoint_auth_method)`.
pub async fn list_with_legacy_secret(
    pool: &AnyPool,
) -> Result<Vec<(String, String, String)>> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT id, client_secret, token_endpoint_auth_method FROM clients \
         WHERE client_secret IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Replace a legacy plaintext secret with its PBKDF2 record. The plaintext
/// column is nulled in the same statement.
pub async fn store_hashed_secret(
    pool: &AnyPool,
    id: &str,
    hashed: &str,
    encrypted_copy: Option<&str>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE clients SET hashed_client_secret = $1, client_secret = NULL, \
         client_secret_enc = $2, updated_at = $3 WHERE id = $4",
    )
    .bind(hashed)
    .bind(encrypted_copy)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Admin-path secret rotation.
pub async fn rotate_secret(
    pool: &AnyPool,
    client_id: &str,
    hashed: &str,
    encrypted_copy: Option<&str>,
    now: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE clients SET hashed_client_secret = $1, client_secret_enc = $2, updated_at = $3 \
         WHERE client_id = $4",
    )
    .bind(hashed)
    .bind(encrypted_copy)
    .bind(now)
    .bind(client_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
