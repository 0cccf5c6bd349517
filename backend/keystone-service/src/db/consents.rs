/// Consent decision database operations
use sqlx::AnyPool;

use super::Result;
use crate::models::ConsentDecision;

const CONSENT_COLUMNS: &str = "id, user_id, client_id, scope, granted_at, expires_at";

/// Store a decision, replacing any prior record for the exact same
/// (user, client, scope). The delete-then-insert pair runs in one
/// transaction so the "at most one non-expired record" invariant holds.
pub async fn upsert(pool: &AnyPool, consent: &ConsentDecision) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM consent_decisions WHERE user_id = $1 AND client_id = $2 AND scope = $3",
    )
    .bind(&consent.user_id)
    .bind(&consent.client_id)
    .bind(&consent.scope)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO consent_decisions (id, user_id, client_id, scope, granted_at, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&consent.id)
    .bind(&consent.user_id)
    .bind(&consent.client_id)
    .bind(&consent.scope)
    .bind(consent.granted_at)
    .bind(consent.expires_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Any non-expired consent for (user, client) whose scope covers
/// `requested_scope`, for the auto-advance path.
pub async fn find_covering(
    pool: &AnyPool,
    user_id: &str,
    client_id: &str,
    requested_scope: &str,
    now: i64,
) -> Result<Option<ConsentDecision>> {
    let query = format!(
        "SELECT {CONSENT_COLUMNS} FROM consent_decisions \
         WHERE user_id = $1 AND client_id = $2 AND expires_at > $3"
    );
    let decisions = sqlx::query_as::<_, ConsentDecision>(&query)
        .bind(user_id)
        .bind(client_id)
        .bind(now)
        .fetch_all(pool)
        .await?;

    Ok(decisions
        .into_iter()
        .find(|c| c.covers(requested_scope)))
}

pub async fn delete_expired(pool: &AnyPool, now: i64, limit: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM consent_decisions WHERE id IN \
         (SELECT id FROM consent_decisions WHERE expires_at < $1 LIMIT $2)",
    )
    .bind(now)
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::test_pool;
    use crate::models::canonical_scope;

    fn sample(scope: &str, expires_at: i64) -> ConsentDecision {
        ConsentDecision {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: "u1".into(),
            client_id: "c1".into(),
            scope: canonical_scope(scope),
            granted_at: 1,
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_scope() {
        let pool = test_pool().await;
        upsert(&pool, &sample("openid profile", 100)).await.unwrap();
        upsert(&pool, &sample("openid profile", 200)).await.unwrap();

        let found = find_covering(&pool, "u1", "c1", "openid", 50)
            .await
            .unwrap()
            .expect("consent present");
        assert_eq!(found.expires_at, 200);
    }

    #[tokio::test]
    async fn test_covering_requires_scope_superset() {
        let pool = test_pool().await;
        upsert(&pool, &sample("openid", 100)).await.unwrap();

        assert!(find_covering(&pool, "u1", "c1", "openid", 50)
            .await
            .unwrap()
            .is_some());
        assert!(find_covering(&pool, "u1", "c1", "openid email", 50)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_consent_not_returned() {
        let pool = test_pool().await;
        upsert(&pool, &sample("openid", 100)).await.unwrap();
        assert!(find_covering(&pool, "u1", "c1", "openid", 150)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_expired_bounded() {
        let pool = test_pool().await;
        for i in 0..5 {
            let mut c = sample("openid", 10);
            c.client_id = format!("client-{i}");
            upsert(&pool, &c).await.unwrap();
        }
        assert_eq!(delete_expired(&pool, 100, 3).await.unwrap(), 3);
        assert_eq!(delete_expired(&pool, 100, 3).await.unwrap(), 2);
    }
}
