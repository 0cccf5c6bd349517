/// Audit event database operations. Insert-only; rows are never updated or
/// deleted.
use sqlx::AnyPool;

use super::Result;
use crate::models::AuditEvent;

pub async fn insert(pool: &AnyPool, event: &AuditEvent) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_events (id, ts, actor, kind, outcome, resource_ids, details) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&event.id)
    .bind(event.ts)
    .bind(&event.actor)
    .bind(&event.kind)
    .bind(&event.outcome)
    .bind(&event.resource_ids)
    .bind(&event.details)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn count_by_kind(pool: &AnyPool, kind: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_events WHERE kind = $1")
        .bind(kind)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}
