/// Tenant database operations
use sqlx::AnyPool;

use super::{DbError, Result};
use crate::models::Tenant;

pub async fn insert(pool: &AnyPool, tenant: &Tenant) -> Result<()> {
    sqlx::query("INSERT INTO tenants (id, name, created_at) VALUES ($1, $2, $3)")
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(tenant.created_at)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn get(pool: &AnyPool, id: &str) -> Result<Tenant> {
    sqlx::query_as::<_, Tenant>("SELECT id, name, created_at FROM tenants WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}
