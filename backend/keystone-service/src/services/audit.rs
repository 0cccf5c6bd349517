//! Audit event emission.
//!
//! One event per denied authentication or token operation, one INFO event
//! per success; details never carry secrets. Persistence failures are
//! logged and swallowed so auditing cannot take down the flow it observes.

use sqlx::AnyPool;
use uuid::Uuid;

use crate::clock::now_nanos;
use crate::models::AuditEvent;

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_DENIED: &str = "denied";

pub async fn emit(
    pool: &AnyPool,
    actor: &str,
    kind: &str,
    outcome: &str,
    resource_ids: &[&str],
    details: serde_json::Value,
) {
    let event = AuditEvent {
        id: Uuid::now_v7().to_string(),
        ts: now_nanos(),
        actor: actor.to_string(),
        kind: kind.to_string(),
        outcome: outcome.to_string(),
        resource_ids: serde_json::to_string(resource_ids).unwrap_or_else(|_| "[]".into()),
        details: details.to_string(),
    };

    if outcome == OUTCOME_DENIED {
        tracing::warn!(actor, kind, "audit: denied");
    } else {
        tracing::info!(actor, kind, "audit: success");
    }

    if let Err(err) = crate::db::audit::insert(pool, &event).await {
        tracing::warn!(error = %err, kind, "failed to persist audit event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::test_pool;

    #[tokio::test]
    async fn test_emit_persists_event() {
        let pool = test_pool().await;
        emit(
            &pool,
            "client:abc",
            "token.issue",
            OUTCOME_SUCCESS,
            &["token-1"],
            serde_json::json!({"grant_type": "authorization_code"}),
        )
        .await;

        assert_eq!(
            crate::db::audit::count_by_kind(&pool, "token.issue").await.unwrap(),
            1
        );
    }
}
