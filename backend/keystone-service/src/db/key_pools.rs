/// KMS key pool and material key database operations
use sqlx::AnyPool;

use super::{DbError, Result};
use crate::models::{KeyPool, MaterialKey};

const POOL_COLUMNS: &str =
    "id, tenant_id, name, algorithm, allowed_ops, rotation_policy, created_at, updated_at";
const MATERIAL_COLUMNS: &str =
    "id, pool_id, version, algorithm, material_enc, public_key_pem, status, created_at, retired_at";

pub async fn insert_pool(pool: &AnyPool, key_pool: &KeyPool) -> Result<()> {
    sqlx::query(
        "INSERT INTO key_pools (id, tenant_id, name, algorithm, allowed_ops, rotation_policy, \
         created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&key_pool.id)
    .bind(&key_pool.tenant_id)
    .bind(&key_pool.name)
    .bind(&key_pool.algorithm)
    .bind(&key_pool.allowed_ops)
    .bind(&key_pool.rotation_policy)
    .bind(key_pool.created_at)
    .bind(key_pool.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Pool lookup is always tenant-scoped; there is no cross-tenant path.
pub async fn get_pool(pool: &AnyPool, tenant_id: &str, name: &str) -> Result<KeyPool> {
    let query = format!("SELECT {POOL_COLUMNS} FROM key_pools WHERE tenant_id = $1 AND name = $2");
    sqlx::query_as::<_, KeyPool>(&query)
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn get_pool_by_id(pool: &AnyPool, id: &str) -> Result<KeyPool> {
    let query = format!("SELECT {POOL_COLUMNS} FROM key_pools WHERE id = $1");
    sqlx::query_as::<_, KeyPool>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn list_pools(pool: &AnyPool, tenant_id: &str) -> Result<Vec<KeyPool>> {
    let query = format!(
        "SELECT {POOL_COLUMNS} FROM key_pools WHERE tenant_id = $1 ORDER BY name ASC"
    );
    Ok(sqlx::query_as::<_, KeyPool>(&query)
        .bind(tenant_id)
        .fetch_all(pool)
        .await?)
}

pub async fn insert_material(pool: &AnyPool, material: &MaterialKey) -> Result<()> {
    sqlx::query(
        "INSERT INTO material_keys (id, pool_id, version, algorithm, material_enc, \
         public_key_pem, status, created_at, retired_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&material.id)
    .bind(&material.pool_id)
    .bind(material.version)
    .bind(&material.algorithm)
    .bind(&material.material_enc)
    .bind(&material.public_key_pem)
    .bind(&material.status)
    .bind(material.created_at)
    .bind(material.retired_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_material(pool: &AnyPool, id: &str) -> Result<MaterialKey> {
    let query = format!("SELECT {MATERIAL_COLUMNS} FROM material_keys WHERE id = $1");
    sqlx::query_as::<_, MaterialKey>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn current_material(pool: &AnyPool, pool_id: &str) -> Result<MaterialKey> {
    let query = format!(
        "SELECT {MATERIAL_COLUMNS} FROM material_keys \
         WHERE pool_id = $1 AND status = 'current'"
    );
    sqlx::query_as::<_, MaterialKey>(&query)
        .bind(pool_id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn list_materials(pool: &AnyPool, pool_id: &str) -> Result<Vec<MaterialKey>> {
    let query = format!(
        "SELECT {MATERIAL_COLUMNS} FROM material_keys WHERE pool_id = $1 ORDER BY version ASC"
    );
    Ok(sqlx::query_as::<_, MaterialKey>(&query)
        .bind(pool_id)
        .fetch_all(pool)
        .await?)
}

pub async fn next_version(pool: &AnyPool, pool_id: &str) -> Result<i64> {
    let row: (Option<i64>,) =
        sqlx::query_as("SELECT MAX(version) FROM material_keys WHERE pool_id = $1")
            .bind(pool_id)
            .fetch_one(pool)
            .await?;
    Ok(row.0.unwrap_or(0) + 1)
}

/// Demote the pool's current version ahead of inserting its successor. The
/// caller runs both steps inside one transaction via [`rotate_material`].
pub async fn rotate_material(pool: &AnyPool, new_material: &MaterialKey) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE material_keys SET status = 'superseded' \
         WHERE pool_id = $1 AND status = 'current'",
    )
    .bind(&new_material.pool_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO material_keys (id, pool_id, version, algorithm, material_enc, \
         public_key_pem, status, created_at, retired_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&new_material.id)
    .bind(&new_material.pool_id)
    .bind(new_material.version)
    .bind(&new_material.algorithm)
    .bind(&new_material.material_enc)
    .bind(&new_material.public_key_pem)
    .bind(&new_material.status)
    .bind(new_material.created_at)
    .bind(new_material.retired_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Mark a version retired or inert. The current version cannot be retired.
pub async fn set_material_status(
    pool: &AnyPool,
    pool_id: &str,
    version: i64,
    status: &str,
    now: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE material_keys SET status = $1, retired_at = $2 \
         WHERE pool_id = $3 AND version = $4 AND status <> 'current'",
    )
    .bind(status)
    .bind(now)
    .bind(pool_id)
    .bind(version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::test_pool;
    use crate::models::to_json_list;

    pub(crate) fn sample_pool(tenant: &str, name: &str) -> KeyPool {
        KeyPool {
            id: uuid::Uuid::now_v7().to_string(),
            tenant_id: tenant.to_string(),
            name: name.to_string(),
            algorithm: "AES-256-GCM".into(),
            allowed_ops: to_json_list(&[
                "encrypt".to_string(),
                "decrypt".to_string(),
                "rotate".to_string(),
            ]),
            rotation_policy: "decrypt_only".into(),
            created_at: 1,
            updated_at: 1,
        }
    }

    pub(crate) fn sample_material(pool_id: &str, version: i64, status: &str) -> MaterialKey {
        MaterialKey {
            id: uuid::Uuid::now_v7().to_string(),
            pool_id: pool_id.to_string(),
            version,
            algorithm: "AES-256-GCM".into(),
            material_enc: "sealed".into(),
            public_key_pem: None,
            status: status.to_string(),
            created_at: version,
            retired_at: None,
        }
    }

    #[tokio::test]
    async fn test_tenant_scoping() {
        let pool = test_pool().await;
        insert_pool(&pool, &sample_pool("tenant-a", "shared-name")).await.unwrap();
        insert_pool(&pool, &sample_pool("tenant-b", "shared-name")).await.unwrap();

        assert!(get_pool(&pool, "tenant-a", "shared-name").await.is_ok());
        assert!(matches!(
            get_pool(&pool, "tenant-c", "shared-name").await.unwrap_err(),
            DbError::NotFound
        ));
        assert_eq!(list_pools(&pool, "tenant-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_single_current_version_enforced() {
        let pool = test_pool().await;
        let kp = sample_pool("t", "p");
        insert_pool(&pool, &kp).await.unwrap();
        insert_material(&pool, &sample_material(&kp.id, 1, "current")).await.unwrap();

        // Direct second current violates the partial unique index.
        assert!(matches!(
            insert_material(&pool, &sample_material(&kp.id, 2, "current"))
                .await
                .unwrap_err(),
            DbError::Conflict
        ));

        // Rotation demotes then inserts atomically.
        rotate_material(&pool, &sample_material(&kp.id, 2, "current")).await.unwrap();
        let current = current_material(&pool, &kp.id).await.unwrap();
        assert_eq!(current.version, 2);

        let all = list_materials(&pool, &kp.id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, "superseded");
    }

    #[tokio::test]
    async fn test_current_version_cannot_be_retired() {
        let pool = test_pool().await;
        let kp = sample_pool("t", "p");
        insert_pool(&pool, &kp).await.unwrap();
        insert_material(&pool, &sample_material(&kp.id, 1, "current")).await.unwrap();

        assert!(set_material_status(&pool, &kp.id, 1, "retired", 9).await.is_err());

        rotate_material(&pool, &sample_material(&kp.id, 2, "current")).await.unwrap();
        set_material_status(&pool, &kp.id, 1, "retired", 9).await.unwrap();
    }

    #[tokio::test]
    async fn test_next_version_monotonic() {
        let pool = test_pool().await;
        let kp = sample_pool("t", "p");
        insert_pool(&pool, &kp).await.unwrap();
        assert_eq!(next_version(&pool, &kp.id).await.unwrap(), 1);
        insert_material(&pool, &sample_material(&kp.id, 1, "current")).await.unwrap();
        assert_eq!(next_version(&pool, &kp.id).await.unwrap(), 2);
    }
}
