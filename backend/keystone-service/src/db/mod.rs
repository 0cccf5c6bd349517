/// Database repositories (dual PostgreSQL/SQLite)
///
/// Every query is written in the portable subset both dialects execute
/// identically: `$N` placeholders, TEXT/BIGINT/BOOLEAN columns, clock values
/// always bound from Rust, no RETURNING. Multi-row mutations run inside a
/// transaction; the single-use and rotation paths rely on conditional
/// updates for their ordering guarantees.
pub mod audit;
pub mod auth_requests;
pub mod barrier_keys;
pub mod client_jwt_replay;
pub mod clients;
pub mod consents;
pub mod key_pools;
pub mod sessions;
pub mod signing_keys;
pub mod tenants;
pub mod tokens;
pub mod users;

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use sqlx::AnyPool;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("row not found")]
    NotFound,

    #[error("uniqueness conflict")]
    Conflict,

    #[error("serialization failure")]
    Serialization,

    #[error("transient database error: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Permanent(String),
}

impl DbError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Serialization | DbError::Transient(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    DbError::Conflict
                } else if db.code().as_deref() == Some("40001") {
                    // PostgreSQL serialization_failure
                    DbError::Serialization
                } else if db.message().contains("database is locked") {
                    // SQLite busy contention
                    DbError::Transient(db.message().to_string())
                } else {
                    DbError::Permanent(db.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DbError::Transient(err.to_string())
            }
            _ => DbError::Permanent(err.to_string()),
        }
    }
}

/// Retry a transaction-boundary operation once on a retryable failure with
/// jittered backoff. This is the only place retries happen; everything else
/// bubbles up.
pub async fn with_retry<T, F, Fut>(f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Err(err) if err.is_retryable() => {
            let backoff_ms = rand::thread_rng().gen_range(25..100);
            tracing::debug!(error = %err, backoff_ms, "retrying transient database failure");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            f().await
        }
        other => other,
    }
}

/// Apply pending migrations. Template migrations (tenancy/user/session base
/// tables) live in the 0001+ range, domain migrations in 1001+; both apply
/// to the same database in one pass.
pub async fn run_migrations(pool: &AnyPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| DbError::Permanent(e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_util {
    use sqlx::AnyPool;

    /// Fresh in-memory SQLite database with all migrations applied.
    pub async fn test_pool() -> AnyPool {
        let config = db_pool::DbConfig {
            database_url: "sqlite::memory:".to_string(),
            ..db_pool::DbConfig::default()
        };
        let pool = db_pool::connect(&config).await.expect("test pool");
        super::run_migrations(&pool).await.expect("migrations");
        pool
    }
}
