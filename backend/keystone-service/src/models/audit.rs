//! Append-only audit events.

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: String,
    pub ts: i64,
    /// `client:<id>`, `user:<id>`, `admin`, or `system`.
    pub actor: String,
    pub kind: String,
    /// `success` or `denied`.
    pub outcome: String,
    /// JSON array of involved resource ids.
    pub resource_ids: String,
    /// JSON object of structured detail; never contains secrets.
    pub details: String,
}
