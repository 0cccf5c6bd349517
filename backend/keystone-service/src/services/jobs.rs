//! Background maintenance jobs.
//!
//! Each job runs on its own tokio interval task, so a job is mutually
//! exclusive with itself by construction. Jobs idle while the barrier is
//! sealed and resume after unseal.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::clock::{now_nanos, secs_to_nanos};
use crate::db;
use crate::AppState;

/// Expired token rows are kept this long after expiry for introspection
/// and audit trails, then deleted.
const TOKEN_RETENTION_SECS: i64 = 30 * 24 * 60 * 60;

pub fn spawn_all(state: &AppState) -> Vec<JoinHandle<()>> {
    vec![
        spawn_session_sweeper(state.clone()),
        spawn_expiry_sweeper(state.clone()),
        spawn_signing_key_rotation(state.clone()),
    ]
}

/// Delete absolutely expired sessions in bounded batches.
fn spawn_session_sweeper(state: AppState) -> JoinHandle<()> {
    let interval_secs = state.settings.session.sweep_interval_secs.max(1);
    let batch = state.settings.session.sweep_batch_limit;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match db::sessions::sweep_expired(&state.pool, now_nanos(), batch).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "session sweep"),
                Err(err) => tracing::warn!(error = %err, "session sweep failed"),
            }
        }
    })
}

/// Drop expired authorization requests, consents, replay-tracking rows, and
/// long-expired token rows.
fn spawn_expiry_sweeper(state: AppState) -> JoinHandle<()> {
    let batch = state.settings.session.sweep_batch_limit;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now = now_nanos();

            if let Err(err) = db::auth_requests::delete_expired(&state.pool, now, batch).await {
                tracing::warn!(error = %err, "authorization request sweep failed");
            }
            if let Err(err) = db::consents::delete_expired(&state.pool, now, batch).await {
                tracing::warn!(error = %err, "consent sweep failed");
            }
            if let Err(err) = db::client_jwt_replay::delete_expired(&state.pool, now, batch).await
            {
                tracing::warn!(error = %err, "assertion replay sweep failed");
            }
            let cutoff = now - secs_to_nanos(TOKEN_RETENTION_SECS);
            if let Err(err) = db::tokens::delete_expired(&state.pool, cutoff, batch).await {
                tracing::warn!(error = %err, "token retention sweep failed");
            }
        }
    })
}

/// Rotate the JWT signing key on its configured cadence and retire
/// verify-only keys once every token bound to them has expired.
fn spawn_signing_key_rotation(state: AppState) -> JoinHandle<()> {
    let interval_secs = state.settings.signing.rotation_interval_secs.max(60);
    let retire_after = secs_to_nanos(state.settings.signing.retire_after_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup does not
        // rotate a freshly created key.
        interval.tick().await;
        loop {
            interval.tick().await;
            if !state.barrier.is_unsealed().await {
                continue;
            }
            match state.keystore.rotate().await {
                Ok(kid) => tracing::info!(kid = %kid, "signing key rotated"),
                Err(err) => tracing::warn!(error = %err, "signing key rotation failed"),
            }
            match state.keystore.retire_exhausted(retire_after).await {
                Ok(0) => {}
                Ok(retired) => tracing::info!(retired, "signing keys retired"),
                Err(err) => tracing::warn!(error = %err, "signing key retirement failed"),
            }
        }
    })
}
