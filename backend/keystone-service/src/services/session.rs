//! Session manager.
//!
//! Sessions are server-side rows keyed by an opaque 256-bit cookie value;
//! the cookie never carries claims. CSRF tokens are minted per session and
//! checked on every state-changing `/browser` request.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sqlx::AnyPool;

use crate::clock::{now_nanos, secs_to_nanos};
use crate::config::SessionSettings;
use crate::db;
use crate::error::{Result, ServiceError};
use crate::models::Session;

/// Create a session for a just-authenticated user.
pub async fn create(pool: &AnyPool, settings: &SessionSettings, user_id: &str) -> Result<Session> {
    let now = now_nanos();
    let session = Session {
        id: URL_SAFE_NO_PAD.encode(crypto_core::random_bytes(32)),
        user_id: user_id.to_string(),
        created_at: now,
        last_seen_at: now,
        expires_at: now + secs_to_nanos(settings.absolute_timeout_secs),
        active: true,
        csrf_token: URL_SAFE_NO_PAD.encode(crypto_core::random_bytes(32)),
    };
    db::sessions::insert(pool, &session).await?;
    Ok(session)
}

/// Resolve a live session and slide its idle window. Expired or revoked
/// sessions surface as `Expired`; unknown ids as `Unauthenticated`.
pub async fn get_live(
    pool: &AnyPool,
    settings: &SessionSettings,
    session_id: &str,
) -> Result<Session> {
    let now = now_nanos();
    let idle = secs_to_nanos(settings.idle_timeout_secs);

    let touched = db::sessions::touch(pool, session_id, now, idle).await?;
    if !touched {
        // Distinguish unknown from dead for logging; both deny access.
        return match db::sessions::get(pool, session_id).await {
            Ok(_) => Err(ServiceError::Expired),
            Err(db::DbError::NotFound) => Err(ServiceError::Unauthenticated),
            Err(err) => Err(err.into()),
        };
    }
    Ok(db::sessions::get(pool, session_id).await?)
}

/// Validate a CSRF token for a state-changing browser request.
pub fn check_csrf(session: &Session, presented: &str) -> Result<()> {
    if crypto_core::constant_time_eq(session.csrf_token.as_bytes(), presented.as_bytes()) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden)
    }
}

/// Revoke the session and cascade revocation over its tokens. Token rows
/// stay in place; only their revocation marker changes.
pub async fn revoke_with_tokens(pool: &AnyPool, session_id: &str) -> Result<u64> {
    let now = now_nanos();
    db::sessions::revoke(pool, session_id).await?;
    Ok(db::tokens::revoke_by_session(pool, session_id, now).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::test_pool;

    fn settings() -> SessionSettings {
        SessionSettings {
            idle_timeout_secs: 60,
            absolute_timeout_secs: 3600,
            sweep_interval_secs: 60,
            sweep_batch_limit: 100,
            secure_cookies: false,
        }
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let pool = test_pool().await;
        let session = create(&pool, &settings(), "user-1").await.unwrap();
        // Opaque 256-bit values, base64url.
        assert_eq!(session.id.len(), 43);
        assert_eq!(session.csrf_token.len(), 43);

        let live = get_live(&pool, &settings(), &session.id).await.unwrap();
        assert_eq!(live.user_id, "user-1");
    }

    #[tokio::test]
    async fn test_unknown_session_unauthenticated() {
        let pool = test_pool().await;
        assert!(matches!(
            get_live(&pool, &settings(), "nope").await.unwrap_err(),
            ServiceError::Unauthenticated
        ));
    }

    #[tokio::test]
    async fn test_revoked_session_reports_expired() {
        let pool = test_pool().await;
        let session = create(&pool, &settings(), "user-1").await.unwrap();
        revoke_with_tokens(&pool, &session.id).await.unwrap();
        assert!(matches!(
            get_live(&pool, &settings(), &session.id).await.unwrap_err(),
            ServiceError::Expired
        ));
    }

    #[tokio::test]
    async fn test_csrf_mismatch_forbidden() {
        let pool = test_pool().await;
        let session = create(&pool, &settings(), "user-1").await.unwrap();
        assert!(check_csrf(&session, &session.csrf_token).is_ok());
        assert!(matches!(
            check_csrf(&session, "forged").unwrap_err(),
            ServiceError::Forbidden
        ));
    }

    #[tokio::test]
    async fn test_logout_cascades_token_revocation() {
        let pool = test_pool().await;
        let session = create(&pool, &settings(), "user-1").await.unwrap();

        let mut token = crate::db::tokens::tests::sample_token("t1", None);
        token.session_id = Some(session.id.clone());
        crate::db::tokens::insert_pool(&pool, &token).await.unwrap();

        let revoked = revoke_with_tokens(&pool, &session.id).await.unwrap();
        assert_eq!(revoked, 1);
        assert!(crate::db::tokens::get(&pool, "t1").await.unwrap().is_revoked());
    }
}
