//! Tenant registry. KMS pools and clients are tenant-scoped; every pool
//! query carries the tenant discriminator.

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}
